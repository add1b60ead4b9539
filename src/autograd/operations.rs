use std::rc::Rc;

use ndarray::prelude::*;
use ndarray::Zip;

use super::{DescentError, Origin, Tensor, TensorBuilder};

/// The differentiable operations a graph can be built from. Each variant
/// knows how to compute its output and how to map an out-gradient back onto
/// each of its inputs.
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    /// `x·Wᵗ + b` for a batch of rows `x` (`[batch, in]`), weights `W`
    /// (`[out, in]`) and biases `b` (`[out]`).
    Linear,
    RectifiedLinearUnit,
    LogSoftmax { axis: usize },
    /// Mean over the batch of `−log p[i, targets[i]]`.
    NegativeLogLikelihood { targets: Vec<usize> },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Linear => "Linear",
            Operation::RectifiedLinearUnit => "RectifiedLinearUnit",
            Operation::LogSoftmax { .. } => "LogSoftmax",
            Operation::NegativeLogLikelihood { .. } => "NegativeLogLikelihood",
        }
    }

    fn arity(&self) -> usize {
        match self {
            Operation::Linear => 3,
            _ => 1,
        }
    }

    fn check_arity(&self, count: usize) -> Result<(), DescentError> {
        if count != self.arity() {
            return Err(DescentError::usage(format!(
                "{} takes {} inputs, got {}",
                self.name(),
                self.arity(),
                count
            )));
        }
        Ok(())
    }

    pub fn forward(&self, inputs: Vec<Rc<Tensor>>) -> Result<Rc<Tensor>, DescentError> {
        self.check_arity(inputs.len())?;
        let array = {
            let arrays = inputs.iter().map(|t| t.borrow_array()).collect::<Vec<_>>();
            match self {
                Operation::Linear => linear(&arrays[0], &arrays[1], &arrays[2])?,
                Operation::RectifiedLinearUnit => arrays[0].mapv(|x| if x > 0. { x } else { 0. }),
                Operation::LogSoftmax { axis } => log_softmax(&arrays[0], *axis)?,
                Operation::NegativeLogLikelihood { targets } => {
                    negative_log_likelihood(&arrays[0], targets)?
                }
            }
        };
        let requires_gradient = inputs.iter().any(|t| t.requires_gradient());
        let origin = Origin {
            operation: self.clone(),
            parents: inputs,
        };
        Ok(Rc::new(
            TensorBuilder::new(array)
                .requires_gradient(requires_gradient)
                .origin(origin)
                .build(),
        ))
    }

    /// Gradients with respect to each of `args`, in order, given the gradient
    /// with respect to this operation's output.
    pub fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        args: &[Rc<Tensor>],
    ) -> Result<Vec<ArrayD<f32>>, DescentError> {
        self.check_arity(args.len())?;
        let arrays = args.iter().map(|t| t.borrow_array()).collect::<Vec<_>>();
        match self {
            Operation::Linear => {
                let x = as_matrix("Linear", &arrays[0])?;
                let weights = as_matrix("Linear", &arrays[1])?;
                let out_gradient = as_matrix("Linear", out_gradient)?;
                if out_gradient.dim() != (x.nrows(), weights.nrows()) {
                    return Err(DescentError::shape(
                        "Linear",
                        format!(
                            "out-gradient has shape {:?}, expected {:?}",
                            out_gradient.shape(),
                            [x.nrows(), weights.nrows()]
                        ),
                    ));
                }
                // dx = g·W, dW = gᵗ·x, db = column sums of g
                Ok(vec![
                    out_gradient.dot(&weights).into_dyn(),
                    out_gradient.t().dot(&x).into_dyn(),
                    out_gradient.sum_axis(Axis(0)).into_dyn(),
                ])
            }
            Operation::RectifiedLinearUnit => {
                check_same_shape("RectifiedLinearUnit", &arrays[0], out_gradient)?;
                let mut gradient = Array::zeros(arrays[0].raw_dim());
                azip!((g in &mut gradient, &o in out_gradient, &a in &*arrays[0]) if a > 0. { *g = o });
                Ok(vec![gradient])
            }
            Operation::LogSoftmax { axis } => {
                check_same_shape("LogSoftmax", &arrays[0], out_gradient)?;
                // The output isn't reachable from its own origin; recompute it.
                let log_probabilities = log_softmax(&arrays[0], *axis)?;
                // d/dx_j Σ_i g_i·(x_i − log Σ_k exp(x_k)) = g_j − softmax(x)_j · Σ_i g_i
                let mut gradient = out_gradient.clone();
                Zip::from(gradient.lanes_mut(Axis(*axis)))
                    .and(log_probabilities.lanes(Axis(*axis)))
                    .for_each(|mut g, log_p| {
                        let total = g.sum();
                        Zip::from(&mut g)
                            .and(&log_p)
                            .for_each(|g_j, &log_p_j| *g_j -= log_p_j.exp() * total);
                    });
                Ok(vec![gradient])
            }
            Operation::NegativeLogLikelihood { targets } => {
                let log_probabilities = as_matrix("NegativeLogLikelihood", &arrays[0])?;
                check_targets(log_probabilities.dim(), targets)?;
                let mut upstream = out_gradient.iter();
                let upstream = match (upstream.next(), upstream.next()) {
                    (Some(&g), None) => g,
                    _ => {
                        return Err(DescentError::shape(
                            "NegativeLogLikelihood",
                            format!(
                                "out-gradient of a loss must have one element, got shape {:?}",
                                out_gradient.shape()
                            ),
                        ))
                    }
                };
                let batch_size = targets.len() as f32;
                let mut gradient = Array2::zeros(log_probabilities.raw_dim());
                for (i, &target) in targets.iter().enumerate() {
                    gradient[[i, target]] = -upstream / batch_size;
                }
                Ok(vec![gradient.into_dyn()])
            }
        }
    }
}

fn as_matrix<'a>(
    operation: &'static str,
    array: &'a ArrayD<f32>,
) -> Result<ArrayView2<'a, f32>, DescentError> {
    array.view().into_dimensionality::<Ix2>().map_err(|_| {
        DescentError::shape(
            operation,
            format!("expected a matrix, got shape {:?}", array.shape()),
        )
    })
}

fn check_same_shape(
    operation: &'static str,
    input: &ArrayD<f32>,
    out_gradient: &ArrayD<f32>,
) -> Result<(), DescentError> {
    if input.shape() != out_gradient.shape() {
        return Err(DescentError::shape(
            operation,
            format!(
                "out-gradient has shape {:?}, but input has shape {:?}",
                out_gradient.shape(),
                input.shape()
            ),
        ));
    }
    Ok(())
}

fn check_targets(
    (batch_size, class_count): (usize, usize),
    targets: &[usize],
) -> Result<(), DescentError> {
    if batch_size == 0 {
        return Err(DescentError::shape(
            "NegativeLogLikelihood",
            "the mean loss of an empty batch is undefined",
        ));
    }
    if targets.len() != batch_size {
        return Err(DescentError::shape(
            "NegativeLogLikelihood",
            format!(
                "{} targets for a batch of {} rows",
                targets.len(),
                batch_size
            ),
        ));
    }
    if let Some(&index) = targets.iter().find(|&&target| target >= class_count) {
        return Err(DescentError::Index { index, class_count });
    }
    Ok(())
}

fn linear(
    input: &ArrayD<f32>,
    weights: &ArrayD<f32>,
    biases: &ArrayD<f32>,
) -> Result<ArrayD<f32>, DescentError> {
    let x = as_matrix("Linear", input)?;
    let weights = as_matrix("Linear", weights)?;
    let biases = biases
        .view()
        .into_dimensionality::<Ix1>()
        .map_err(|_| {
            DescentError::shape(
                "Linear",
                format!("expected a bias vector, got shape {:?}", biases.shape()),
            )
        })?;
    if x.ncols() != weights.ncols() {
        return Err(DescentError::shape(
            "Linear",
            format!(
                "input rows have {} features, but the weights expect {}",
                x.ncols(),
                weights.ncols()
            ),
        ));
    }
    if biases.len() != weights.nrows() {
        return Err(DescentError::shape(
            "Linear",
            format!(
                "{} biases for {} outputs",
                biases.len(),
                weights.nrows()
            ),
        ));
    }
    Ok((x.dot(&weights.t()) + &biases).into_dyn())
}

fn negative_log_likelihood(
    log_probabilities: &ArrayD<f32>,
    targets: &[usize],
) -> Result<ArrayD<f32>, DescentError> {
    let log_probabilities = as_matrix("NegativeLogLikelihood", log_probabilities)?;
    check_targets(log_probabilities.dim(), targets)?;
    let total: f32 = targets
        .iter()
        .enumerate()
        .map(|(i, &target)| -log_probabilities[[i, target]])
        .sum();
    Ok(array![total / targets.len() as f32].into_dyn())
}

/// `x − log Σ exp(x)` along `axis`, shifting each lane by its maximum first
/// so that large logits don't overflow.
pub fn log_softmax(x: &ArrayD<f32>, axis: usize) -> Result<ArrayD<f32>, DescentError> {
    if axis >= x.ndim() {
        return Err(DescentError::shape(
            "LogSoftmax",
            format!("axis {} out of range for shape {:?}", axis, x.shape()),
        ));
    }
    let mut output = x.clone();
    for mut lane in output.lanes_mut(Axis(axis)) {
        let maximum = lane.fold(f32::NEG_INFINITY, |m, &x_i| m.max(x_i));
        let log_normalizer = lane
            .iter()
            .map(|&x_i| (x_i - maximum).exp())
            .sum::<f32>()
            .ln()
            + maximum;
        lane.mapv_inplace(|x_i| x_i - log_normalizer);
    }
    Ok(output)
}

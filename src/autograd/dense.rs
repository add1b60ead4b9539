use std::rc::Rc;

use log::debug;
use ndarray::prelude::*;
use ndarray_rand::RandomExt;
use rand::{thread_rng, Rng};
use rand_distr::Uniform;

use super::operations::Operation;
use super::{DescentError, Parameterized, Tensor, TensorBuilder};

pub struct Linear {
    identifier: String,
    weights: Rc<Tensor>,
    biases: Rc<Tensor>,
}

impl Linear {
    pub fn from_weights(identifier: &str, weights: ArrayD<f32>, biases: ArrayD<f32>) -> Linear {
        Linear {
            identifier: identifier.to_owned(),
            weights: Rc::new(
                TensorBuilder::new(weights)
                    .requires_gradient(true)
                    .identifier(&format!("{}_weights", identifier))
                    .build(),
            ),
            biases: Rc::new(
                TensorBuilder::new(biases)
                    .requires_gradient(true)
                    .identifier(&format!("{}_biases", identifier))
                    .build(),
            ),
        }
    }

    /// Weights and biases drawn uniformly from `±1/√in`.
    pub fn new_using<R: Rng + ?Sized>(
        identifier: &str,
        in_dimensionality: usize,
        out_dimensionality: usize,
        rng: &mut R,
    ) -> Linear {
        let k = 1. / (in_dimensionality as f32);
        let weights = Array::random_using(
            (out_dimensionality, in_dimensionality),
            Uniform::new(-k.sqrt(), k.sqrt()),
            rng,
        )
        .into_dyn();
        let biases =
            Array::random_using((out_dimensionality,), Uniform::new(-k.sqrt(), k.sqrt()), rng)
                .into_dyn();

        debug!(
            "creating Linear layer {} with weights shape {:?} and biases shape {:?}",
            identifier,
            (out_dimensionality, in_dimensionality),
            (out_dimensionality,)
        );
        Self::from_weights(identifier, weights, biases)
    }

    pub fn in_dimensionality(&self) -> usize {
        self.weights.borrow_array().shape()[1]
    }

    pub fn out_dimensionality(&self) -> usize {
        self.weights.borrow_array().shape()[0]
    }

    pub fn forward(&self, input: Rc<Tensor>) -> Result<Rc<Tensor>, DescentError> {
        Operation::Linear.forward(vec![input, self.weights.clone(), self.biases.clone()])
    }
}

impl Parameterized for Linear {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn parameters(&self) -> Vec<Rc<Tensor>> {
        vec![self.weights.clone(), self.biases.clone()]
    }
}

/// Linear layers with rectified linear units between them, ending in a
/// log-softmax over the classes, so the output of `forward` is one row of
/// log-probabilities per input row.
pub struct MultiLayerPerceptron {
    identifier: String,
    layers: Vec<Linear>,
}

impl MultiLayerPerceptron {
    pub fn new(
        identifier: &str,
        layer_dimensionalities: &[usize],
    ) -> Result<Self, DescentError> {
        Self::new_using(identifier, layer_dimensionalities, &mut thread_rng())
    }

    pub fn new_using<R: Rng + ?Sized>(
        identifier: &str,
        layer_dimensionalities: &[usize],
        rng: &mut R,
    ) -> Result<Self, DescentError> {
        if layer_dimensionalities.len() < 2 {
            return Err(DescentError::usage(format!(
                "a perceptron needs at least input and output dimensionalities, got {:?}",
                layer_dimensionalities
            )));
        }
        if let Some(position) = layer_dimensionalities.iter().position(|&d| d == 0) {
            return Err(DescentError::usage(format!(
                "layer {} of {:?} has no units",
                position, layer_dimensionalities
            )));
        }
        let mut layers = Vec::new();
        for (i, window) in layer_dimensionalities.windows(2).enumerate() {
            let (in_dimensionality, out_dimensionality) = (window[0], window[1]);
            layers.push(Linear::new_using(
                &format!("{}_layer_{}", identifier, i),
                in_dimensionality,
                out_dimensionality,
                rng,
            ));
        }
        Ok(Self {
            identifier: identifier.to_owned(),
            layers,
        })
    }

    pub fn layer_dimensionalities(&self) -> Vec<usize> {
        let mut dimensionalities = Vec::with_capacity(self.layers.len() + 1);
        if let Some(first) = self.layers.first() {
            dimensionalities.push(first.in_dimensionality());
        }
        dimensionalities.extend(self.layers.iter().map(|layer| layer.out_dimensionality()));
        dimensionalities
    }

    pub fn forward(&self, input: Rc<Tensor>) -> Result<Rc<Tensor>, DescentError> {
        let mut x = input;
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward(x)?;
            if i < self.layers.len() - 1 {
                x = Operation::RectifiedLinearUnit.forward(vec![x])?;
            }
        }
        Operation::LogSoftmax { axis: 1 }.forward(vec![x])
    }
}

impl Parameterized for MultiLayerPerceptron {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn parameters(&self) -> Vec<Rc<Tensor>> {
        let mut parameters = Vec::new();
        for layer in &self.layers {
            parameters.extend(layer.parameters());
        }
        parameters
    }
}

//! Finite-difference gradients for checking backward rules in tests.

use std::rc::Rc;

use approx::assert_abs_diff_eq;
use ndarray::prelude::*;

use super::operations::Operation;
use super::{Tensor, TensorBuilder};

/// Central differences `(f(x + ε) − f(x − ε)) / 2ε`, one element at a time.
pub(crate) fn numerical_gradient<F>(f: F, point: &ArrayD<f32>, ε: f32) -> ArrayD<f32>
where
    F: Fn(&ArrayD<f32>) -> f64,
{
    let values = point.iter().copied().collect::<Vec<_>>();
    let mut partials = Vec::with_capacity(values.len());
    for i in 0..values.len() {
        let mut plus = values.clone();
        plus[i] += ε;
        let mut minus = values.clone();
        minus[i] -= ε;
        let f_plus = f(&ArrayD::from_shape_vec(point.raw_dim(), plus).expect("shape is unchanged"));
        let f_minus =
            f(&ArrayD::from_shape_vec(point.raw_dim(), minus).expect("shape is unchanged"));
        partials.push(((f_plus - f_minus) / (2. * ε as f64)) as f32);
    }
    ArrayD::from_shape_vec(point.raw_dim(), partials).expect("shape is unchanged")
}

fn tensors(arrays: &[ArrayD<f32>]) -> Vec<Rc<Tensor>> {
    arrays
        .iter()
        .map(|array| Rc::new(TensorBuilder::new(array.clone()).build()))
        .collect()
}

/// `Σ projection ⊙ operation(inputs)`, a scalar whose gradient with respect to
/// the operation's output is exactly `projection`.
fn projected_output(
    operation: &Operation,
    inputs: &[ArrayD<f32>],
    projection: &ArrayD<f32>,
) -> f64 {
    let output = operation
        .forward(tensors(inputs))
        .expect("operation should apply");
    let array = output.borrow_array();
    array
        .iter()
        .zip(projection.iter())
        .map(|(&y, &p)| y as f64 * p as f64)
        .sum()
}

/// Asserts that the operation's backward rule agrees with finite differences
/// for every input.
pub(crate) fn check_operation_gradients(
    operation: &Operation,
    inputs: &[ArrayD<f32>],
    projection: &ArrayD<f32>,
    tolerance: f32,
) {
    let parents = tensors(inputs);
    let analytic = operation
        .backward(projection, &parents)
        .expect("backward should apply");
    assert_eq!(analytic.len(), inputs.len());

    for (index, analytic_gradient) in analytic.iter().enumerate() {
        assert_eq!(analytic_gradient.shape(), inputs[index].shape());
        let numerical = numerical_gradient(
            |perturbed| {
                let mut perturbed_inputs = inputs.to_vec();
                perturbed_inputs[index] = perturbed.clone();
                projected_output(operation, &perturbed_inputs, projection)
            },
            &inputs[index],
            1e-2,
        );
        assert_abs_diff_eq!(*analytic_gradient, numerical, epsilon = tolerance);
    }
}

use std::rc::Rc;

use super::{DescentError, Tensor};

pub trait Optimizer {
    fn step(&mut self);
    fn step_count(&self) -> usize;
    fn unset_gradients(&self);
}

pub struct StochasticGradientDescentOptimizer {
    parameters: Vec<Rc<Tensor>>,
    learning_rate: f32,
    step_count: usize,
}

impl StochasticGradientDescentOptimizer {
    pub fn new(parameters: Vec<Rc<Tensor>>, learning_rate: f32) -> Result<Self, DescentError> {
        if !(learning_rate.is_finite() && learning_rate > 0.) {
            return Err(DescentError::usage(format!(
                "learning rate must be positive, got {}",
                learning_rate
            )));
        }
        Ok(Self {
            parameters,
            learning_rate,
            step_count: 0,
        })
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
}

impl Optimizer for StochasticGradientDescentOptimizer {
    /// `parameter -= learning_rate · gradient` in place. Parameters that
    /// didn't take part in the last backward pass have no gradient and are
    /// left alone.
    fn step(&mut self) {
        for parameter in &self.parameters {
            let gradient = parameter.gradient.borrow();
            if let Some(gradient) = gradient.as_ref() {
                let mut array = parameter.array.borrow_mut();
                *array -= &(self.learning_rate * gradient);
            }
        }
        self.step_count += 1;
    }

    fn step_count(&self) -> usize {
        self.step_count
    }

    fn unset_gradients(&self) {
        for parameter in &self.parameters {
            parameter.unset_gradient();
        }
    }
}

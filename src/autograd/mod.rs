use std::cell::{Ref, RefCell, RefMut};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::Mutex;

use lazy_static::lazy_static;
use ndarray::prelude::*;

use topological_sort::TopologicalSort;

pub mod dense;
pub mod error;
#[cfg(test)]
mod gradient_check;
pub mod operations;
pub mod optimization;
pub mod serialization;

pub use self::error::DescentError;
use self::operations::Operation;

lazy_static! {
    static ref COUNTER: Mutex<u64> = Mutex::new(0);
}

fn next_serial_number() -> u64 {
    // a poisoned counter still counts
    let mut num = COUNTER
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *num += 1;
    *num
}

/// A node of the computation graph. Graph identity is the serial number
/// assigned at construction; the identifier is a display and checkpoint name,
/// and two tensors may share one.
pub struct Tensor {
    serial_number: u64,
    identifier: String,
    array: RefCell<ArrayD<f32>>,
    requires_gradient: bool,
    gradient: RefCell<Option<ArrayD<f32>>>,
    origin: Option<Origin>,
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("identifier", &self.identifier)
            .field("array", &self.array)
            .field("requires_gradient", &self.requires_gradient)
            .field("gradient", &self.gradient)
            .field("operation", &self.origin().map(Origin::operation))
            .finish()
    }
}

impl Hash for Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.serial_number.hash(state);
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.serial_number == other.serial_number
    }
}

impl Eq for Tensor {}

impl Tensor {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn requires_gradient(&self) -> bool {
        self.requires_gradient
    }

    pub fn borrow_array(&self) -> Ref<ArrayD<f32>> {
        self.array.borrow()
    }

    pub fn borrow_array_mut(&self) -> RefMut<ArrayD<f32>> {
        self.array.borrow_mut()
    }

    pub fn borrow_gradient(&self) -> Ref<Option<ArrayD<f32>>> {
        self.gradient.borrow()
    }

    pub fn shape(&self) -> Vec<usize> {
        self.array.borrow().shape().to_vec()
    }

    /// The value of a single-element tensor, such as a loss.
    pub fn item(&self) -> Result<f32, DescentError> {
        let array = self.array.borrow();
        let mut elements = array.iter();
        match (elements.next(), elements.next()) {
            (Some(&value), None) => Ok(value),
            _ => Err(DescentError::usage(format!(
                "item() needs a single-element tensor, but {} has shape {:?}",
                self.identifier,
                array.shape()
            ))),
        }
    }

    pub fn origin(&self) -> Option<&Origin> {
        self.origin.as_ref()
    }

    fn unset_gradient(&self) {
        *self.gradient.borrow_mut() = None
    }

    fn accumulate_gradient(&self, contribution: &ArrayD<f32>) -> Result<(), DescentError> {
        if !self.requires_gradient {
            return Ok(());
        }
        if contribution.shape() != self.array.borrow().shape() {
            return Err(DescentError::shape(
                "gradient accumulation",
                format!(
                    "{} has shape {:?}, but its gradient has shape {:?}",
                    self.identifier,
                    self.array.borrow().shape(),
                    contribution.shape()
                ),
            ));
        }
        let mut gradient = self.gradient.borrow_mut();
        match gradient.as_mut() {
            Some(gradient) => *gradient += contribution,
            None => *gradient = Some(contribution.clone()),
        }
        Ok(())
    }
}

pub struct TensorBuilder {
    array: ArrayD<f32>,
    identifier: Option<String>,
    requires_gradient: bool,
    gradient: Option<ArrayD<f32>>,
    origin: Option<Origin>,
}

impl TensorBuilder {
    pub fn new(array: ArrayD<f32>) -> TensorBuilder {
        TensorBuilder {
            array,
            identifier: None,
            requires_gradient: true,
            gradient: None,
            origin: None,
        }
    }

    pub fn identifier(mut self, identifier: &str) -> TensorBuilder {
        self.identifier = Some(identifier.to_owned());
        self
    }

    pub fn requires_gradient(mut self, requires: bool) -> TensorBuilder {
        self.requires_gradient = requires;
        self
    }

    #[cfg(test)]
    fn gradient(mut self, gradient: ArrayD<f32>) -> TensorBuilder {
        self.gradient = Some(gradient);
        self
    }

    fn origin(mut self, origin: Origin) -> TensorBuilder {
        self.origin = Some(origin);
        self
    }

    pub fn build(self) -> Tensor {
        let serial_number = next_serial_number();
        Tensor {
            serial_number,
            array: RefCell::new(self.array),
            identifier: match self.identifier {
                Some(identifier) => identifier,
                None => format!("Tensor{}", serial_number),
            },
            requires_gradient: self.requires_gradient,
            gradient: RefCell::new(self.gradient),
            origin: self.origin,
        }
    }
}

/// How a tensor came to be: the operation that produced it and the inputs it
/// was applied to, in the order the operation expects them.
pub struct Origin {
    operation: Operation,
    parents: Vec<Rc<Tensor>>,
}

impl Origin {
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn parents(&self) -> &[Rc<Tensor>] {
        &self.parents
    }
}

pub trait Parameterized {
    fn identifier(&self) -> &str;
    fn parameters(&self) -> Vec<Rc<Tensor>>;

    fn parameter_count(&self) -> usize {
        self.parameters()
            .iter()
            .map(|parameter| parameter.borrow_array().len())
            .sum()
    }
}

fn register_parents(
    sorter: &mut TopologicalSort<Rc<Tensor>>,
    visited: &mut HashSet<u64>,
    child: &Rc<Tensor>,
) {
    if !visited.insert(child.serial_number) {
        return;
    }
    if let Some(origin) = &child.origin {
        for parent in &origin.parents {
            sorter.add_dependency(parent.clone(), child.clone());
            register_parents(sorter, visited, parent);
        }
    }
}

fn sorted_computation_graph(end: &Rc<Tensor>) -> Vec<Rc<Tensor>> {
    let mut sorter = TopologicalSort::new();
    let mut visited = HashSet::new();
    register_parents(&mut sorter, &mut visited, end);
    let mut sorted = sorter.collect::<Vec<_>>();
    // We actually want reverse-topological order
    sorted.reverse();
    sorted
}

/// Propagates the gradient of a single-element `culmination` back through the
/// graph that produced it, adding into the gradient buffer of every tensor
/// along the way that requires one.
///
/// Gradients accumulate: calling this twice without unsetting them in between
/// (see [`optimization::Optimizer::unset_gradients`]) counts both passes.
pub fn backprop(culmination: Rc<Tensor>) -> Result<(), DescentError> {
    if culmination.borrow_array().len() != 1 {
        return Err(DescentError::usage(format!(
            "can only backpropagate from a single-element tensor, but {} has shape {:?}",
            culmination.identifier,
            culmination.shape()
        )));
    }
    if culmination.origin.is_none() || !culmination.requires_gradient {
        return Ok(());
    }

    let mut gradients = HashMap::<u64, ArrayD<f32>>::new();
    gradients.insert(
        culmination.serial_number,
        Array::ones(culmination.borrow_array().raw_dim()),
    );
    for node in sorted_computation_graph(&culmination) {
        // Tensors that don't require gradient never get an entry.
        let Some(gradient) = gradients.remove(&node.serial_number) else {
            continue;
        };

        node.accumulate_gradient(&gradient)?;

        if let Some(origin) = &node.origin {
            let contributions = origin.operation.backward(&gradient, &origin.parents)?;
            for (parent, contribution) in origin.parents.iter().zip(contributions) {
                if !parent.requires_gradient {
                    continue;
                }
                match gradients.get_mut(&parent.serial_number) {
                    Some(pending) => {
                        if pending.shape() != contribution.shape() {
                            return Err(DescentError::shape(
                                origin.operation.name(),
                                format!(
                                    "gradient contributions to {} disagree: {:?} vs. {:?}",
                                    parent.identifier,
                                    pending.shape(),
                                    contribution.shape()
                                ),
                            ));
                        }
                        *pending += &contribution;
                    }
                    None => {
                        gradients.insert(parent.serial_number, contribution);
                    }
                }
            }
        }
    }
    Ok(())
}

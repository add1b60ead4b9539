use std::rc::Rc;
use std::time;

use log::{debug, info};
use ndarray::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::autograd::dense::MultiLayerPerceptron;
use crate::autograd::operations::Operation;
use crate::autograd::optimization::{Optimizer, StochasticGradientDescentOptimizer};
use crate::autograd::{backprop, DescentError, Parameterized, Tensor, TensorBuilder};
use crate::data::{Batch, Dataset};

pub struct TrainingConfiguration {
    pub layer_dimensionalities: Vec<usize>,
    pub learning_rate: f32,
    pub batch_size: usize,
    pub epoch_count: usize,
    pub seed: u64,
}

impl Default for TrainingConfiguration {
    fn default() -> Self {
        Self {
            layer_dimensionalities: vec![784, 128, 64, 10],
            learning_rate: 0.003,
            batch_size: 64,
            epoch_count: 5,
            seed: 0,
        }
    }
}

/// Where a training step is. Each batch runs
/// `ForwardPass → LossComputed → BackwardPass → Updated`, starting from `Idle`
/// (before the first batch of an epoch) or `Updated` (after the previous one).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrainingPhase {
    Idle,
    ForwardPass,
    LossComputed,
    BackwardPass,
    Updated,
}

pub struct Trainer {
    network: MultiLayerPerceptron,
    optimizer: StochasticGradientDescentOptimizer,
    configuration: TrainingConfiguration,
    phase: TrainingPhase,
    rng: StdRng,
}

impl Trainer {
    pub fn new(
        identifier: &str,
        configuration: TrainingConfiguration,
    ) -> Result<Self, DescentError> {
        let mut rng = StdRng::seed_from_u64(configuration.seed);
        let network = MultiLayerPerceptron::new_using(
            identifier,
            &configuration.layer_dimensionalities,
            &mut rng,
        )?;
        Self::from_network(network, configuration, rng)
    }

    fn from_network(
        network: MultiLayerPerceptron,
        configuration: TrainingConfiguration,
        rng: StdRng,
    ) -> Result<Self, DescentError> {
        let optimizer = StochasticGradientDescentOptimizer::new(
            network.parameters(),
            configuration.learning_rate,
        )?;
        info!(
            "network {} with layers {:?} has {} parameters, learning rate {}",
            network.identifier(),
            network.layer_dimensionalities(),
            network.parameter_count(),
            optimizer.learning_rate()
        );
        Ok(Self {
            network,
            optimizer,
            configuration,
            phase: TrainingPhase::Idle,
            rng,
        })
    }

    pub fn network(&self) -> &MultiLayerPerceptron {
        &self.network
    }

    pub fn phase(&self) -> TrainingPhase {
        self.phase
    }

    pub fn step_count(&self) -> usize {
        self.optimizer.step_count()
    }

    fn expect_phase(&self, allowed: &[TrainingPhase], action: &str) -> Result<(), DescentError> {
        if !allowed.contains(&self.phase) {
            return Err(DescentError::usage(format!(
                "cannot {} while in phase {:?} (expected one of {:?})",
                action, self.phase, allowed
            )));
        }
        Ok(())
    }

    /// Clears the previous step's gradients and runs the network over a batch
    /// of images, giving one row of log-probabilities per image.
    pub fn forward(&mut self, images: &Array2<f32>) -> Result<Rc<Tensor>, DescentError> {
        self.expect_phase(
            &[TrainingPhase::Idle, TrainingPhase::Updated],
            "run a forward pass",
        )?;
        self.optimizer.unset_gradients();
        let log_probabilities = self.network.forward(input_tensor(images))?;
        self.phase = TrainingPhase::ForwardPass;
        Ok(log_probabilities)
    }

    pub fn compute_loss(
        &mut self,
        log_probabilities: Rc<Tensor>,
        labels: &[usize],
    ) -> Result<Rc<Tensor>, DescentError> {
        self.expect_phase(&[TrainingPhase::ForwardPass], "compute a loss")?;
        let loss = Operation::NegativeLogLikelihood {
            targets: labels.to_vec(),
        }
        .forward(vec![log_probabilities])?;
        self.phase = TrainingPhase::LossComputed;
        Ok(loss)
    }

    pub fn backward(&mut self, loss: Rc<Tensor>) -> Result<(), DescentError> {
        self.expect_phase(&[TrainingPhase::LossComputed], "backpropagate")?;
        backprop(loss)?;
        self.phase = TrainingPhase::BackwardPass;
        Ok(())
    }

    pub fn update(&mut self) -> Result<(), DescentError> {
        self.expect_phase(&[TrainingPhase::BackwardPass], "update parameters")?;
        self.optimizer.step();
        self.phase = TrainingPhase::Updated;
        Ok(())
    }

    /// Abandons whatever step is in progress and returns to `Idle`. Gradients
    /// left by a partial step are cleared by the next `forward`.
    pub fn abort(&mut self) {
        if self.phase != TrainingPhase::Idle {
            debug!("abandoning step in phase {:?}", self.phase);
        }
        self.phase = TrainingPhase::Idle;
    }

    fn run_batch(&mut self, batch: &Batch) -> Result<f32, DescentError> {
        let log_probabilities = self.forward(&batch.images)?;
        let loss = self.compute_loss(log_probabilities, &batch.labels)?;
        let loss_value = loss.item()?;
        self.backward(loss)?;
        self.update()?;
        Ok(loss_value)
    }

    /// One full step over a batch, returning its loss. A failure abandons
    /// the batch and returns the trainer to `Idle`.
    pub fn train_batch(&mut self, batch: &Batch) -> Result<f32, DescentError> {
        let result = self.run_batch(batch);
        if result.is_err() {
            self.abort();
        }
        result
    }

    /// Mean batch loss over one shuffled pass through `dataset`.
    pub fn train_epoch(&mut self, dataset: &Dataset) -> Result<f32, DescentError> {
        let batches = dataset.batches(self.configuration.batch_size, &mut self.rng)?;
        if batches.is_empty() {
            return Err(DescentError::usage("cannot train on an empty dataset"));
        }
        let start_time = time::Instant::now();
        let mut running_loss = 0.;
        for batch in &batches {
            let loss = self.train_batch(batch)?;
            debug!("step {}: loss {}", self.optimizer.step_count(), loss);
            running_loss += loss;
        }
        self.abort();
        let mean_loss = running_loss / batches.len() as f32;
        info!(
            "epoch of {} batches took {:.1}s, mean loss: {}",
            batches.len(),
            start_time.elapsed().as_secs_f32(),
            mean_loss
        );
        Ok(mean_loss)
    }

    /// Runs the configured number of epochs, returning each epoch's mean loss.
    pub fn train(&mut self, dataset: &Dataset) -> Result<Vec<f32>, DescentError> {
        let mut epoch_losses = Vec::with_capacity(self.configuration.epoch_count);
        for epoch in 0..self.configuration.epoch_count {
            let mean_loss = self.train_epoch(dataset)?;
            info!("epoch {}: training loss {}", epoch + 1, mean_loss);
            epoch_losses.push(mean_loss);
        }
        Ok(epoch_losses)
    }

    /// Class probabilities, one row per image. The network works in log space
    /// throughout; this is the only place they're exponentiated.
    pub fn predict_probabilities(
        &self,
        images: &Array2<f32>,
    ) -> Result<Array2<f32>, DescentError> {
        let log_probabilities = self.network.forward(input_tensor(images))?;
        let probabilities = log_probabilities.borrow_array().mapv(f32::exp);
        probabilities
            .into_dimensionality::<Ix2>()
            .map_err(|_| DescentError::shape("predict", "network output should be a matrix"))
    }

    /// Fraction of `dataset` whose most probable class is the labeled one.
    pub fn accuracy(&self, dataset: &Dataset) -> Result<f32, DescentError> {
        if dataset.is_empty() {
            return Err(DescentError::usage("cannot score an empty dataset"));
        }
        let probabilities = self.predict_probabilities(dataset.images())?;
        let correct = probabilities
            .rows()
            .into_iter()
            .zip(dataset.labels())
            .filter(|(row, &label)| most_probable(row.view()) == label)
            .count();
        Ok(correct as f32 / dataset.len() as f32)
    }
}

fn input_tensor(images: &Array2<f32>) -> Rc<Tensor> {
    Rc::new(
        TensorBuilder::new(images.clone().into_dyn())
            .requires_gradient(false)
            .build(),
    )
}

pub fn most_probable(probabilities: ArrayView1<f32>) -> usize {
    probabilities
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, best_p), (i, &p)| {
            if p > best_p {
                (i, p)
            } else {
                (best, best_p)
            }
        })
        .0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn small_configuration(seed: u64) -> TrainingConfiguration {
        TrainingConfiguration {
            layer_dimensionalities: vec![12, 8, 6, 3],
            learning_rate: 0.1,
            batch_size: 8,
            epoch_count: 3,
            seed,
        }
    }

    #[test]
    fn test_default_configuration() {
        let configuration = TrainingConfiguration::default();
        assert_eq!(configuration.layer_dimensionalities, vec![784, 128, 64, 10]);
        assert!(configuration.learning_rate > 0.);
        assert!(configuration.batch_size > 0);
    }

    #[test]
    fn test_phases_advance_in_order() {
        let mut trainer = Trainer::new("phases", small_configuration(0)).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let dataset = Dataset::synthetic(8, 12, 3, &mut rng).unwrap();
        assert_eq!(trainer.phase(), TrainingPhase::Idle);

        let log_probabilities = trainer.forward(dataset.images()).unwrap();
        assert_eq!(trainer.phase(), TrainingPhase::ForwardPass);
        let loss = trainer
            .compute_loss(log_probabilities, dataset.labels())
            .unwrap();
        assert_eq!(trainer.phase(), TrainingPhase::LossComputed);
        trainer.backward(loss).unwrap();
        assert_eq!(trainer.phase(), TrainingPhase::BackwardPass);
        trainer.update().unwrap();
        assert_eq!(trainer.phase(), TrainingPhase::Updated);
        assert_eq!(trainer.step_count(), 1);

        // and straight on to the next batch
        trainer.forward(dataset.images()).unwrap();
        assert_eq!(trainer.phase(), TrainingPhase::ForwardPass);
    }

    #[test]
    fn test_update_before_backward_is_refused() {
        let mut trainer = Trainer::new("eager", small_configuration(0)).unwrap();
        assert!(matches!(trainer.update(), Err(DescentError::Usage(_))));

        let images = Array2::zeros((2, 12));
        let log_probabilities = trainer.forward(&images).unwrap();
        assert!(matches!(trainer.update(), Err(DescentError::Usage(_))));
        let loss = trainer.compute_loss(log_probabilities, &[0, 1]).unwrap();
        assert!(matches!(trainer.update(), Err(DescentError::Usage(_))));
        assert!(matches!(
            trainer.forward(&images),
            Err(DescentError::Usage(_))
        ));
        trainer.backward(loss).unwrap();
        trainer.update().unwrap();
    }

    #[test]
    fn test_abort_recovers_a_stuck_step() {
        let mut trainer = Trainer::new("abandoned", small_configuration(0)).unwrap();
        let images = Array2::zeros((2, 12));

        // a forward result dropped on the floor
        trainer.forward(&images).unwrap();
        assert!(matches!(
            trainer.forward(&images),
            Err(DescentError::Usage(_))
        ));
        trainer.abort();
        assert_eq!(trainer.phase(), TrainingPhase::Idle);

        // a loss that's never backpropagated
        let log_probabilities = trainer.forward(&images).unwrap();
        trainer.compute_loss(log_probabilities, &[2, 1]).unwrap();
        trainer.abort();
        assert_eq!(trainer.phase(), TrainingPhase::Idle);
        assert_eq!(trainer.step_count(), 0);

        let log_probabilities = trainer.forward(&images).unwrap();
        let loss = trainer.compute_loss(log_probabilities, &[2, 1]).unwrap();
        trainer.backward(loss).unwrap();
        trainer.update().unwrap();
        assert_eq!(trainer.step_count(), 1);
    }

    #[test]
    fn test_forward_clears_previous_gradients() {
        let mut trainer = Trainer::new("fresh", small_configuration(0)).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let dataset = Dataset::synthetic(8, 12, 3, &mut rng).unwrap();
        let batches = dataset.batches(8, &mut rng).unwrap();
        let batch = &batches[0];

        trainer.train_batch(batch).unwrap();
        let first_bias = trainer.network().parameters()[1].clone();
        assert!(first_bias.borrow_gradient().is_some());

        trainer.forward(&batch.images).unwrap();
        assert!(first_bias.borrow_gradient().is_none());
    }

    #[test]
    fn test_bad_batch_aborts_to_idle() {
        let mut trainer = Trainer::new("aborted", small_configuration(0)).unwrap();
        let parameters_before = trainer
            .network()
            .parameters()
            .iter()
            .map(|p| p.borrow_array().clone())
            .collect::<Vec<_>>();
        let batch = Batch {
            images: Array2::zeros((2, 12)),
            labels: vec![0, 7],
        };
        assert!(matches!(
            trainer.train_batch(&batch),
            Err(DescentError::Index {
                index: 7,
                class_count: 3
            })
        ));
        assert_eq!(trainer.phase(), TrainingPhase::Idle);
        for (before, after) in parameters_before.iter().zip(trainer.network().parameters()) {
            assert_eq!(*after.borrow_array(), *before);
        }
    }

    #[test]
    fn test_train_reports_mean_epoch_losses() {
        let mut trainer = Trainer::new("epochs", small_configuration(5)).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let dataset = Dataset::synthetic(20, 12, 3, &mut rng).unwrap();
        let losses = trainer.train(&dataset).unwrap();
        assert_eq!(losses.len(), 3);
        assert!(losses.iter().all(|loss| loss.is_finite() && *loss > 0.));
        // 20 samples in batches of 8 is 3 steps per epoch
        assert_eq!(trainer.step_count(), 9);
        assert_eq!(trainer.phase(), TrainingPhase::Idle);
    }

    #[test]
    fn test_predicted_probabilities_are_distributions() {
        let trainer = Trainer::new("predict", small_configuration(0)).unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        let dataset = Dataset::synthetic(5, 12, 3, &mut rng).unwrap();
        let probabilities = trainer.predict_probabilities(dataset.images()).unwrap();
        assert_eq!(probabilities.dim(), (5, 3));
        for row in probabilities.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-5);
        }
        let accuracy = trainer.accuracy(&dataset).unwrap();
        assert!((0.0..=1.0).contains(&accuracy));
    }

    #[test]
    fn test_most_probable() {
        assert_eq!(most_probable(array![0.1, 0.7, 0.2].view()), 1);
        assert_eq!(most_probable(array![0.5, 0.5].view()), 0);
    }

    #[test]
    fn test_convergence() {
        // The digit-classifier layout on one fixed synthetic batch. Individual
        // steps may go up; averaged over seeds, the loss after training should
        // be under the loss at initialization.
        let seeds = [11, 12, 13];
        let step_count = 15;
        let mut initial_total = 0.;
        let mut final_total = 0.;
        for seed in seeds {
            let mut rng = StdRng::seed_from_u64(seed);
            let dataset = Dataset::synthetic(16, 784, 10, &mut rng).unwrap();
            let batch = Batch {
                images: dataset.images().clone(),
                labels: dataset.labels().to_vec(),
            };
            let mut trainer = Trainer::new(
                "convergence",
                TrainingConfiguration {
                    learning_rate: 0.05,
                    batch_size: 16,
                    epoch_count: 1,
                    seed,
                    ..TrainingConfiguration::default()
                },
            )
            .unwrap();
            let losses = (0..step_count)
                .map(|_| trainer.train_batch(&batch).unwrap())
                .collect::<Vec<_>>();
            initial_total += losses[0];
            final_total += losses[step_count - 1];
        }
        let initial_mean = initial_total / seeds.len() as f32;
        let final_mean = final_total / seeds.len() as f32;
        assert!(
            final_mean < initial_mean,
            "mean loss went from {} to {}",
            initial_mean,
            final_mean
        );
    }
}

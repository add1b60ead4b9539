#![allow(mixed_script_confusables)]

use std::env;
use std::path::PathBuf;
use std::process;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::autograd::serialization::{checkpoint_filename, deserialize, serialize};
use crate::autograd::{DescentError, Parameterized};
use crate::data::{Dataset, MNIST_CLASS_COUNT};
use crate::training::{most_probable, Trainer, TrainingConfiguration};

mod autograd;
mod data;
mod training;

const SYNTHETIC_SAMPLE_COUNT: usize = 2048;

enum Source {
    Synthetic,
    Mnist(PathBuf),
}

fn run(source: Source, checkpoint: Option<PathBuf>) -> Result<(), DescentError> {
    let configuration = TrainingConfiguration::default();
    let (training_data, test_data) = match source {
        Source::Synthetic => {
            let mut rng = StdRng::seed_from_u64(configuration.seed);
            let input_dimensionality = configuration.layer_dimensionalities[0];
            let training_data = Dataset::synthetic(
                SYNTHETIC_SAMPLE_COUNT,
                input_dimensionality,
                MNIST_CLASS_COUNT,
                &mut rng,
            )?;
            let test_data = Dataset::synthetic(
                SYNTHETIC_SAMPLE_COUNT / 4,
                input_dimensionality,
                MNIST_CLASS_COUNT,
                &mut rng,
            )?;
            (training_data, test_data)
        }
        Source::Mnist(directory) => (
            Dataset::mnist_training(&directory)?,
            Dataset::mnist_test(&directory)?,
        ),
    };
    println!(
        "{} training samples, {} test samples, {} classes of {}-dimensional images",
        training_data.len(),
        test_data.len(),
        training_data.class_count(),
        training_data.input_dimensionality()
    );

    let mut trainer = Trainer::new("digits", configuration)?;
    println!("parameter count: {}", trainer.network().parameter_count());
    if let Some(checkpoint) = checkpoint {
        println!("loading weights from {:?}", checkpoint);
        deserialize(trainer.network(), &checkpoint)?;
    }
    println!("accuracy at initialization: {:.3}", trainer.accuracy(&test_data)?);

    for (epoch, loss) in trainer.train(&training_data)?.iter().enumerate() {
        println!("epoch {}: mean training loss {:.4}", epoch + 1, loss);
    }

    let checkpoint = checkpoint_filename(trainer.network(), "trained");
    serialize(trainer.network(), &checkpoint)?;
    println!("saved weights to {:?}", checkpoint);

    let sample = test_data.images().slice(ndarray::s![0..1, ..]).to_owned();
    let probabilities = trainer.predict_probabilities(&sample)?;
    let row = probabilities.row(0);
    println!(
        "first test sample (label {}): predicted {} with probabilities {:.3}",
        test_data.labels()[0],
        most_probable(row),
        row
    );
    println!("test accuracy: {:.3}", trainer.accuracy(&test_data)?);
    Ok(())
}

fn main() {
    env_logger::init();
    println!("Hello Descent world!");
    let args = env::args().collect::<Vec<_>>();

    let instructions = "pass `--synthetic` (the default) or `--mnist [IDX directory]`, \
        optionally with `--load [NPZ weight file]`";

    let mut source = Source::Synthetic;
    let mut checkpoint = None;
    let mut remaining = args.iter().skip(1);
    while let Some(flag) = remaining.next() {
        match flag.as_str() {
            "--synthetic" => source = Source::Synthetic,
            "--mnist" => match remaining.next() {
                Some(directory) => source = Source::Mnist(PathBuf::from(directory)),
                None => {
                    println!("{}", instructions);
                    return;
                }
            },
            "--load" => match remaining.next() {
                Some(path) => checkpoint = Some(PathBuf::from(path)),
                None => {
                    println!("{}", instructions);
                    return;
                }
            },
            _ => {
                println!("{}", instructions);
                return;
            }
        }
    }

    if let Err(error) = run(source, checkpoint) {
        eprintln!("error: {}", error);
        process::exit(1);
    }
}

use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use ndarray::prelude::*;
use ndarray_rand::RandomExt;
use rand::Rng;
use rand::seq::SliceRandom;
use rand_distr::{Normal, Uniform};

use crate::autograd::DescentError;

pub const MNIST_IMAGE_MAGIC: u32 = 2051;
pub const MNIST_LABEL_MAGIC: u32 = 2049;
pub const MNIST_CLASS_COUNT: usize = 10;

/// Images as rows of pixel intensities, each paired with a class label.
#[derive(Debug, Clone)]
pub struct Dataset {
    images: Array2<f32>,
    labels: Vec<usize>,
    class_count: usize,
}

#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Array2<f32>,
    pub labels: Vec<usize>,
}

impl Dataset {
    pub fn new(
        images: Array2<f32>,
        labels: Vec<usize>,
        class_count: usize,
    ) -> Result<Self, DescentError> {
        if images.nrows() != labels.len() {
            return Err(DescentError::shape(
                "Dataset",
                format!(
                    "{} images but {} labels",
                    images.nrows(),
                    labels.len()
                ),
            ));
        }
        if let Some(&index) = labels.iter().find(|&&label| label >= class_count) {
            return Err(DescentError::Index { index, class_count });
        }
        Ok(Self {
            images,
            labels,
            class_count,
        })
    }

    /// Noisy copies of one random prototype per class, clipped to `[-1, 1]`
    /// like normalized MNIST pixels.
    pub fn synthetic<R: Rng + ?Sized>(
        sample_count: usize,
        input_dimensionality: usize,
        class_count: usize,
        rng: &mut R,
    ) -> Result<Self, DescentError> {
        if class_count == 0 {
            return Err(DescentError::usage("a dataset needs at least one class"));
        }
        let prototypes: Array2<f32> = Array2::random_using(
            (class_count, input_dimensionality),
            Uniform::new(-1., 1.),
            rng,
        );
        let labels = (0..sample_count)
            .map(|_| rng.gen_range(0..class_count))
            .collect::<Vec<_>>();
        let noise: Array2<f32> = Array2::random_using(
            (sample_count, input_dimensionality),
            Normal::new(0., 0.3).map_err(|e| DescentError::usage(e.to_string()))?,
            rng,
        );
        let mut images = prototypes.select(Axis(0), &labels) + noise;
        images.mapv_inplace(|x| x.clamp(-1., 1.));
        Self::new(images, labels, class_count)
    }

    /// Reads a pair of local MNIST IDX files.
    pub fn from_idx_files(images_path: &Path, labels_path: &Path) -> Result<Self, DescentError> {
        let images = parse_idx_images(&fs::read(images_path)?)
            .map_err(|detail| dataset_error(images_path, detail))?;
        let labels = parse_idx_labels(&fs::read(labels_path)?)
            .map_err(|detail| dataset_error(labels_path, detail))?;
        info!(
            "read {} images from {:?} and {} labels from {:?}",
            images.nrows(),
            images_path,
            labels.len(),
            labels_path
        );
        Self::new(images, labels, MNIST_CLASS_COUNT)
    }

    /// The training half of an MNIST directory laid out the way the
    /// distribution unpacks.
    pub fn mnist_training(directory: &Path) -> Result<Self, DescentError> {
        Self::from_idx_files(
            &directory.join("train-images-idx3-ubyte"),
            &directory.join("train-labels-idx1-ubyte"),
        )
    }

    pub fn mnist_test(directory: &Path) -> Result<Self, DescentError> {
        Self::from_idx_files(
            &directory.join("t10k-images-idx3-ubyte"),
            &directory.join("t10k-labels-idx1-ubyte"),
        )
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn input_dimensionality(&self) -> usize {
        self.images.ncols()
    }

    pub fn class_count(&self) -> usize {
        self.class_count
    }

    pub fn images(&self) -> &Array2<f32> {
        &self.images
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// One pass over the dataset in shuffled order. Every call reshuffles, so
    /// an epoch can be restarted; the last batch is short when the dataset
    /// doesn't divide evenly.
    pub fn batches<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        rng: &mut R,
    ) -> Result<Vec<Batch>, DescentError> {
        if batch_size == 0 {
            return Err(DescentError::usage("batch size must be positive"));
        }
        let mut order = (0..self.len()).collect::<Vec<_>>();
        order.shuffle(rng);
        Ok(order
            .chunks(batch_size)
            .map(|indices| Batch {
                images: self.images.select(Axis(0), indices),
                labels: indices.iter().map(|&i| self.labels[i]).collect(),
            })
            .collect())
    }
}

fn dataset_error(path: &Path, detail: String) -> DescentError {
    DescentError::Dataset {
        path: PathBuf::from(path),
        detail,
    }
}

fn read_be_u32(data: &[u8], offset: &mut usize) -> Result<u32, String> {
    let bytes = data
        .get(*offset..*offset + 4)
        .ok_or_else(|| format!("header truncated at byte {}", *offset))?;
    *offset += 4;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// IDX image file: magic, count, rows, columns, then one byte per pixel.
/// Pixels are scaled to `[0, 1]` and then normalized with mean and standard
/// deviation ½, landing in `[-1, 1]`.
fn parse_idx_images(data: &[u8]) -> Result<Array2<f32>, String> {
    let mut offset = 0;
    let magic = read_be_u32(data, &mut offset)?;
    if magic != MNIST_IMAGE_MAGIC {
        return Err(format!(
            "expected image magic number {}, found {}",
            MNIST_IMAGE_MAGIC, magic
        ));
    }
    let count = read_be_u32(data, &mut offset)? as usize;
    let rows = read_be_u32(data, &mut offset)? as usize;
    let columns = read_be_u32(data, &mut offset)? as usize;
    let pixel_count = count
        .checked_mul(rows)
        .and_then(|n| n.checked_mul(columns))
        .ok_or_else(|| format!("{} images of {}×{} is too many pixels", count, rows, columns))?;
    let pixels = &data[offset..];
    if pixels.len() < pixel_count {
        return Err(format!(
            "expected {} pixel bytes after the header, found {}",
            pixel_count,
            pixels.len()
        ));
    }
    let pixels = &pixels[..pixel_count];
    let normalized = pixels
        .iter()
        .map(|&pixel| (pixel as f32 / 255. - 0.5) / 0.5)
        .collect::<Vec<_>>();
    Array2::from_shape_vec((count, rows * columns), normalized).map_err(|e| e.to_string())
}

fn parse_idx_labels(data: &[u8]) -> Result<Vec<usize>, String> {
    let mut offset = 0;
    let magic = read_be_u32(data, &mut offset)?;
    if magic != MNIST_LABEL_MAGIC {
        return Err(format!(
            "expected label magic number {}, found {}",
            MNIST_LABEL_MAGIC, magic
        ));
    }
    let count = read_be_u32(data, &mut offset)? as usize;
    let labels = &data[offset..];
    if labels.len() < count {
        return Err(format!(
            "expected {} label bytes after the header, found {}",
            count,
            labels.len()
        ));
    }
    Ok(labels[..count].iter().map(|&label| label as usize).collect())
}

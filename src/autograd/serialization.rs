use std::fs::File;
use std::path::{Path, PathBuf};

use log::info;
use ndarray::ArrayD;

use ndarray_npy::{NpzReader, NpzWriter};

use super::{DescentError, Parameterized};

pub fn checkpoint_filename(parameterized: &dyn Parameterized, specifier: &str) -> PathBuf {
    PathBuf::from(format!("{}-{}.npz", parameterized.identifier(), specifier))
}

/// Writes every parameter into an NPZ archive, keyed by the parameter's
/// identifier.
pub fn serialize(parameterized: &dyn Parameterized, path: &Path) -> Result<(), DescentError> {
    info!("serializing {} to {:?} ...", parameterized.identifier(), path);
    let mut npz_writer = NpzWriter::new(File::create(path)?);
    for parameter in parameterized.parameters() {
        npz_writer.add_array(parameter.identifier(), &*parameter.borrow_array())?;
    }
    npz_writer.finish()?;
    Ok(())
}

/// Overwrites every parameter's array, in place, with the array of the same
/// name from an archive written by [`serialize`]. Nothing is assigned unless
/// every array is present and has the right shape.
pub fn deserialize(parameterized: &dyn Parameterized, path: &Path) -> Result<(), DescentError> {
    info!("loading weights for {} from {:?}", parameterized.identifier(), path);
    let mut npz_reader = NpzReader::new(File::open(path)?)?;
    let parameters = parameterized.parameters();
    let mut arrays = Vec::with_capacity(parameters.len());
    for parameter in &parameters {
        let array: ArrayD<f32> = npz_reader.by_name(parameter.identifier())?;
        if array.shape() != parameter.borrow_array().shape() {
            return Err(DescentError::shape(
                "deserialize",
                format!(
                    "{} has shape {:?}, but the checkpoint holds {:?}",
                    parameter.identifier(),
                    parameter.shape(),
                    array.shape()
                ),
            ));
        }
        arrays.push(array);
    }
    for (parameter, array) in parameters.iter().zip(arrays) {
        *parameter.borrow_array_mut() = array;
    }
    Ok(())
}

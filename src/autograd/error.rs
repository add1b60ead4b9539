use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DescentError {
    #[error("shape mismatch in {operation}: {detail}")]
    Shape {
        operation: &'static str,
        detail: String,
    },

    #[error("class index {index} out of range for {class_count} classes")]
    Index { index: usize, class_count: usize },

    #[error("usage error: {0}")]
    Usage(String),

    #[error("malformed dataset file {path:?}: {detail}")]
    Dataset { path: PathBuf, detail: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("could not read checkpoint: {0}")]
    NpzRead(#[from] ndarray_npy::ReadNpzError),

    #[error("could not write checkpoint: {0}")]
    NpzWrite(#[from] ndarray_npy::WriteNpzError),
}

impl DescentError {
    pub(crate) fn shape(operation: &'static str, detail: impl Into<String>) -> Self {
        DescentError::Shape {
            operation,
            detail: detail.into(),
        }
    }

    pub(crate) fn usage(detail: impl Into<String>) -> Self {
        DescentError::Usage(detail.into())
    }
}

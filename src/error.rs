use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("dataset directory not found: {0}")]
    MissingDir(PathBuf),
    #[error("split file not found: {0}")]
    MissingSplit(PathBuf),
    #[error("image not found: {0}")]
    MissingImage(PathBuf),
    #[error("annotation {path}: {message}")]
    Xml { path: PathBuf, message: String },
    #[error("annotation {path}: unknown class '{name}'")]
    UnknownClass { path: PathBuf, name: String },
    #[error("image decode failed for {path}: {source}")]
    ImageDecode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

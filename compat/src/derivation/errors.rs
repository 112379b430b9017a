use thiserror::Error;

use crate::aterm;

/// Failures while reading or validating a derivation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DerivationError {
    #[error("parse error: {0}")]
    Parse(#[from] aterm::Error),
    #[error("trailing bytes after the Derive term")]
    TrailingBytes,
    #[error("no outputs defined")]
    NoOutputs,
    #[error("invalid output id: {0:?}")]
    InvalidOutputId(String),
    #[error("derivation declares command-line arguments")]
    UnexpectedArguments,
    #[error("empty platform field")]
    InvalidPlatform,
    #[error("empty builder field")]
    InvalidBuilder,
}

use thiserror::Error;

use nichts_compat::derivation::DerivationError;
use nichts_store::FsError;

/// Failures while preparing or finalizing a build.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("derivation {0} is not readable from the store")]
    MissingDerivation(String),
    #[error("missing dependency {0}")]
    MissingDependency(String),
    #[error("no program for builder {0}")]
    MissingBuilder(String),
    #[error(transparent)]
    Derivation(#[from] DerivationError),
    #[error(transparent)]
    Fs(#[from] FsError),
}

/// Failures surfaced synchronously by `realize`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RealizeError {
    #[error("invalid derivation: {0}")]
    InvalidDerivation(String),
    #[error("missing dependency {0}")]
    MissingDependency(String),
}

/// A session request refused by the build child policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("service denied")]
pub struct ServiceDenied;

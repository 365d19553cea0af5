use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::domain::CancelReason;

/// Fatal configuration problems. Always raised before any engine call.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("CARDINAL_NAMESPACE is not set; a namespace is required before touching containers")]
    MissingNamespace,

    #[error("service '{service}' requires '{key}' in the stack configuration")]
    MissingEnv { service: String, key: String },

    #[error("environment variable {var} must be set to build '{image}'")]
    MissingCredential { var: String, image: String },

    #[error("image '{0}' not found locally; build or pull it first")]
    ImageNotFound(String),

    #[error("dependency cycle detected at service '{0}'")]
    DependencyCycle(String),

    #[error("unknown service '{0}'")]
    UnknownService(String),

    #[error("loading stack configuration from {path:?}: {message}")]
    Load { path: PathBuf, message: String },
}

/// A single per-image or per-container failure inside a fan-out operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Failure {
    #[error("build {image}: {message}")]
    Build { image: String, message: String },

    #[error("pull {image}: {message}")]
    Pull { image: String, message: String },

    #[error("push {image}: {message}")]
    Push { image: String, message: String },

    #[error("container {container}: {message}")]
    Lifecycle { container: String, message: String },

    #[error("{target}: {reason}")]
    Cancelled { target: String, reason: CancelReason },
}

impl Failure {
    /// Image or container name the failure concerns.
    pub fn target(&self) -> &str {
        match self {
            Failure::Build { image, .. }
            | Failure::Pull { image, .. }
            | Failure::Push { image, .. } => image,
            Failure::Lifecycle { container, .. } => container,
            Failure::Cancelled { target, .. } => target,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Failure::Cancelled { .. })
    }
}

/// Every failure collected from one fan-out call. Empty means success.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AggregatedError {
    failures: Vec<Failure>,
}

impl AggregatedError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, failure: Failure) {
        self.failures.push(failure);
    }

    pub fn extend(&mut self, other: AggregatedError) {
        self.failures.extend(other.failures);
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }

    /// `Ok(())` when nothing failed.
    pub fn into_result(self) -> Result<(), Error> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregated(self))
        }
    }
}

impl fmt::Display for AggregatedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.failures.as_slice() {
            [] => write!(f, "no failures"),
            [only] => write!(f, "{only}"),
            many => {
                write!(f, "{} operations failed:", many.len())?;
                for failure in many {
                    write!(f, "\n  - {failure}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for AggregatedError {}

impl FromIterator<Failure> for AggregatedError {
    fn from_iter<I: IntoIterator<Item = Failure>>(iter: I) -> Self {
        Self {
            failures: iter.into_iter().collect(),
        }
    }
}

impl From<Failure> for AggregatedError {
    fn from(failure: Failure) -> Self {
        Self {
            failures: vec![failure],
        }
    }
}

/// Result of every public orchestration operation.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Aggregated(#[from] AggregatedError),
}

impl From<Failure> for Error {
    fn from(failure: Failure) -> Self {
        Error::Aggregated(failure.into())
    }
}

impl Error {
    /// Per-target failures, empty for configuration errors.
    pub fn failures(&self) -> &[Failure] {
        match self {
            Error::Config(_) => &[],
            Error::Aggregated(agg) => agg.failures(),
        }
    }

    pub fn as_config(&self) -> Option<&ConfigError> {
        match self {
            Error::Config(e) => Some(e),
            Error::Aggregated(_) => None,
        }
    }
}

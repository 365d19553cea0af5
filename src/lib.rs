pub mod cli;
pub mod domain;
pub mod error;
pub mod infra;
pub mod services;

// Make test_support available for integration tests
pub mod test_support;

pub use domain::{ContainerEngine, OperationContext, Service, ServiceKind};
pub use error::{AggregatedError, ConfigError, Error, Failure};
pub use infra::DockerEngine;
pub use services::{ImagePipeline, LifecycleController, ServiceRegistry, StartOptions};

mod container;
mod context;
pub mod progress;
mod service;
pub mod traits;

pub use container::{Container, ContainerHealthStatus, ContainerState, is_graceful_exit};
pub use context::{CancelReason, OperationContext};
pub use progress::{Icon, ProgressMessage, ProgressSink, ProgressState, PullProgress};
pub use service::{
    BuildSpec, ContainerConfig, HealthCheck, HostConfig, Mount, PortBinding, RestartPolicy,
    Service, ServiceKind, dependency_order, parse_duration,
};
pub use traits::{
    BuildLogFormat, BuildOutput, BuildRequest, ContainerEngine, EngineError, ExecOutput,
    RegistryAuth, TransferStatus,
};

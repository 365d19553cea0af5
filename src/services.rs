pub mod build_log;
pub mod lifecycle;
pub mod pipeline;
pub mod registry;

pub use build_log::{BuildLogDecoder, BuildLogEvent};
pub use lifecycle::{LifecycleController, StartOptions};
pub use pipeline::ImagePipeline;
pub use registry::ServiceRegistry;

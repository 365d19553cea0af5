use super::{Container, Service};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::fmt::Debug;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Daemon(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}

/// Wire format of a build response, fixed for the whole build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildLogFormat {
    /// Line-delimited JSON from the legacy builder.
    Classic,
    /// BuildKit vertex-graph progress records.
    Trace,
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Tag of the resulting image.
    pub image: String,
    /// Tar archive holding the Dockerfile and source tree.
    pub context: bytes::Bytes,
    pub target: Option<String>,
    pub args: BTreeMap<String, String>,
    /// Values the build may read but must not record, keyed by secret id.
    pub secrets: BTreeMap<String, String>,
}

/// Raw build response records plus the format they are encoded in.
pub struct BuildOutput<'a> {
    pub format: BuildLogFormat,
    pub records: BoxStream<'a, Result<Vec<u8>, EngineError>>,
}

/// One pull or push status record. Every field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferStatus {
    /// Layer ID the record refers to.
    pub id: Option<String>,
    pub status: Option<String>,
    pub current: Option<i64>,
    pub total: Option<i64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
    pub server: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: Option<i64>,
    /// Interleaved stdout and stderr.
    pub output: String,
}

/// Port to the container engine. One handle is created per invocation and
/// shared by reference with every component.
#[async_trait]
pub trait ContainerEngine: Send + Sync + Debug {
    /// Whether the image exists in the local image cache.
    async fn image_exists(&self, image: &str) -> Result<bool, EngineError>;

    /// Starts a build. Dropping the returned stream closes the response.
    fn build_image(&self, request: BuildRequest) -> Result<BuildOutput<'_>, EngineError>;

    fn pull_image(&self, image: &str) -> BoxStream<'_, Result<TransferStatus, EngineError>>;

    async fn tag_image(&self, source: &str, target: &str) -> Result<(), EngineError>;

    fn push_image(
        &self,
        image: &str,
        auth: &RegistryAuth,
    ) -> BoxStream<'_, Result<TransferStatus, EngineError>>;

    /// Creates the network unless it already exists.
    async fn ensure_network(&self, name: &str) -> Result<(), EngineError>;

    async fn remove_network(&self, name: &str) -> Result<(), EngineError>;

    /// State of a container; `NotCreated` when it does not exist.
    async fn inspect_container(&self, name: &str) -> Result<Container, EngineError>;

    async fn create_container(&self, service: &Service) -> Result<(), EngineError>;

    async fn start_container(&self, name: &str) -> Result<(), EngineError>;

    async fn stop_container(&self, name: &str) -> Result<(), EngineError>;

    async fn restart_container(&self, name: &str) -> Result<(), EngineError>;

    async fn remove_container(&self, name: &str, remove_volumes: bool) -> Result<(), EngineError>;

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError>;

    /// Blocks until the container exits and returns its exit code.
    async fn wait_container(&self, name: &str) -> Result<i64, EngineError>;

    async fn exec(&self, container: &str, command: &[String]) -> Result<ExecOutput, EngineError>;
}

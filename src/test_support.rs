use crate::domain::{
    BuildLogFormat, BuildOutput, BuildRequest, Container, ContainerEngine, ContainerHealthStatus,
    ContainerState, EngineError, ExecOutput, ProgressMessage, ProgressSink, RegistryAuth, Service,
    TransferStatus,
};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

#[derive(Debug, Clone)]
pub struct MockContainer {
    pub name: String,
    pub image: String,
    pub state: ContainerState,
    pub health: ContainerHealthStatus,
}

#[derive(Debug, Clone)]
struct BuildScript {
    format: BuildLogFormat,
    records: Vec<String>,
}

/// Decrements the open-stream counter when the stream owning it is dropped.
struct StreamGuard(Arc<AtomicUsize>);

impl StreamGuard {
    fn open(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory [`ContainerEngine`] that records every call as `op:target`.
#[derive(Debug, Default)]
pub struct MockEngine {
    images: RwLock<HashSet<String>>,
    containers: RwLock<HashMap<String, MockContainer>>,
    commands: RwLock<Vec<String>>,
    fail_on: RwLock<HashSet<String>>,
    pulls: RwLock<HashMap<String, Vec<TransferStatus>>>,
    builds: RwLock<HashMap<String, BuildScript>>,
    build_requests: RwLock<Vec<BuildRequest>>,
    hang: RwLock<HashSet<String>>,
    exit_codes: RwLock<HashMap<String, i64>>,
    exec_output: RwLock<HashMap<String, String>>,
    block_wait: RwLock<HashSet<String>>,
    open_streams: Arc<AtomicUsize>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_image(&self, image: &str) {
        self.images.write().unwrap().insert(image.to_string());
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.images.read().unwrap().contains(image)
    }

    pub fn add_container(&self, name: &str, image: &str, state: ContainerState) {
        self.containers.write().unwrap().insert(
            name.to_string(),
            MockContainer {
                name: name.to_string(),
                image: image.to_string(),
                state,
                health: ContainerHealthStatus::NotApplicable,
            },
        );
    }

    pub fn container(&self, name: &str) -> Option<MockContainer> {
        self.containers.read().unwrap().get(name).cloned()
    }

    pub fn get_state(&self, name: &str) -> Option<ContainerState> {
        self.container(name).map(|c| c.state)
    }

    pub fn set_health(&self, name: &str, health: ContainerHealthStatus) {
        if let Some(container) = self.containers.write().unwrap().get_mut(name) {
            container.health = health;
        }
    }

    /// Fails an operation (`stop`) or one operation on one target
    /// (`stop:ns-redis`).
    pub fn set_fail_on(&self, operation: &str) {
        self.fail_on.write().unwrap().insert(operation.to_string());
    }

    pub fn script_pull(&self, image: &str, records: Vec<TransferStatus>) {
        self.pulls.write().unwrap().insert(image.to_string(), records);
    }

    pub fn script_build(&self, image: &str, format: BuildLogFormat, records: &[&str]) {
        self.builds.write().unwrap().insert(
            image.to_string(),
            BuildScript {
                format,
                records: records.iter().map(|r| r.to_string()).collect(),
            },
        );
    }

    /// Every build request received, in order.
    pub fn build_requests(&self) -> Vec<BuildRequest> {
        self.build_requests.read().unwrap().clone()
    }

    /// Builds and transfers for `image` emit their scripted records and then
    /// never end.
    pub fn hang_on(&self, image: &str) {
        self.hang.write().unwrap().insert(image.to_string());
    }

    pub fn set_exit_code(&self, name: &str, code: i64) {
        self.exit_codes.write().unwrap().insert(name.to_string(), code);
    }

    /// `wait_container` on `name` never returns.
    pub fn block_wait(&self, name: &str) {
        self.block_wait.write().unwrap().insert(name.to_string());
    }

    pub fn set_exec_output(&self, name: &str, output: &str) {
        self.exec_output
            .write()
            .unwrap()
            .insert(name.to_string(), output.to_string());
    }

    pub fn get_commands(&self) -> Vec<String> {
        self.commands.read().unwrap().clone()
    }

    pub fn commands_starting_with(&self, prefix: &str) -> Vec<String> {
        self.get_commands()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    /// Response streams handed out and not yet dropped.
    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    fn record_command(&self, op: &str, target: &str) {
        self.commands.write().unwrap().push(format!("{op}:{target}"));
    }

    fn check_fail(&self, op: &str, target: &str) -> Result<(), EngineError> {
        let fail_on = self.fail_on.read().unwrap();
        if fail_on.contains(op) || fail_on.contains(&format!("{op}:{target}")) {
            return Err(EngineError::Daemon(format!("mock failure on: {op}:{target}")));
        }
        Ok(())
    }

    fn with_container<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut MockContainer) -> T,
    ) -> Result<T, EngineError> {
        self.containers
            .write()
            .unwrap()
            .get_mut(name)
            .map(f)
            .ok_or_else(|| EngineError::NotFound(format!("no such container: {name}")))
    }

    fn default_transfer(image: &str) -> Vec<TransferStatus> {
        let layer = |current| TransferStatus {
            id: Some(format!("{image}-layer")),
            status: Some("Downloading".into()),
            current: Some(current),
            total: Some(100),
            error: None,
        };
        vec![layer(30), layer(100)]
    }

    /// Scripted transfer stream. Adds `image` locally when `complete` and the
    /// stream runs to its end.
    fn transfer(
        &self,
        op: &str,
        image: &str,
        complete: bool,
    ) -> BoxStream<'_, Result<TransferStatus, EngineError>> {
        self.record_command(op, image);
        if let Err(e) = self.check_fail(op, image) {
            return stream::once(async move { Err(e) }).boxed();
        }

        let records = self
            .pulls
            .read()
            .unwrap()
            .get(image)
            .cloned()
            .unwrap_or_else(|| Self::default_transfer(image));
        let hang = self.hang.read().unwrap().contains(image);
        let guard = StreamGuard::open(&self.open_streams);
        let image = image.to_string();

        let head = stream::iter(records.into_iter().map(Ok));
        let tail: BoxStream<'_, Result<TransferStatus, EngineError>> = if hang {
            stream::pending().boxed()
        } else {
            stream::once(async move {
                if complete {
                    self.add_image(&image);
                }
            })
            .filter_map(|_| async { None })
            .boxed()
        };

        head.chain(tail)
            .map(move |item| {
                let _open = &guard;
                item
            })
            .boxed()
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        self.record_command("inspect_image", image);
        self.check_fail("inspect_image", image)?;
        Ok(self.has_image(image))
    }

    fn build_image(&self, request: BuildRequest) -> Result<BuildOutput<'_>, EngineError> {
        let image = request.image.clone();
        self.build_requests.write().unwrap().push(request);
        self.record_command("build", &image);
        self.check_fail("build", &image)?;

        let script = self
            .builds
            .read()
            .unwrap()
            .get(&image)
            .cloned()
            .unwrap_or_else(|| BuildScript {
                format: BuildLogFormat::Classic,
                records: vec![
                    r#"{"stream":"Step 1/1 : FROM scratch"}"#.to_string(),
                    r#"{"stream":"Successfully built 0123456789ab"}"#.to_string(),
                ],
            });
        let guard = StreamGuard::open(&self.open_streams);

        let head = stream::iter(
            script
                .records
                .into_iter()
                .map(|r| Ok::<_, EngineError>(r.into_bytes())),
        );
        let hang = self.hang.read().unwrap().contains(&image);
        let tail: BoxStream<'_, Result<Vec<u8>, EngineError>> = if hang {
            stream::pending().boxed()
        } else {
            stream::once(async move {
                self.add_image(&image);
            })
            .filter_map(|_| async { None })
            .boxed()
        };

        Ok(BuildOutput {
            format: script.format,
            records: head
                .chain(tail)
                .map(move |item| {
                    let _open = &guard;
                    item
                })
                .boxed(),
        })
    }

    fn pull_image(&self, image: &str) -> BoxStream<'_, Result<TransferStatus, EngineError>> {
        self.transfer("pull", image, true)
    }

    async fn tag_image(&self, source: &str, target: &str) -> Result<(), EngineError> {
        self.record_command("tag", &format!("{source}->{target}"));
        self.check_fail("tag", source)?;
        if !self.has_image(source) {
            return Err(EngineError::NotFound(format!("no such image: {source}")));
        }
        self.add_image(target);
        Ok(())
    }

    fn push_image(
        &self,
        image: &str,
        _auth: &RegistryAuth,
    ) -> BoxStream<'_, Result<TransferStatus, EngineError>> {
        self.transfer("push", image, false)
    }

    async fn ensure_network(&self, name: &str) -> Result<(), EngineError> {
        self.record_command("network", name);
        self.check_fail("network", name)
    }

    async fn remove_network(&self, name: &str) -> Result<(), EngineError> {
        self.record_command("remove_network", name);
        self.check_fail("remove_network", name)
    }

    async fn inspect_container(&self, name: &str) -> Result<Container, EngineError> {
        self.check_fail("inspect", name)?;
        Ok(match self.container(name) {
            Some(c) => {
                let mut container = Container::new(name, c.state);
                container.health = c.health;
                container
            }
            None => Container::not_created(name),
        })
    }

    async fn create_container(&self, service: &Service) -> Result<(), EngineError> {
        self.record_command("create", &service.name);
        self.check_fail("create", &service.name)?;
        if self.container(&service.name).is_some() {
            return Err(EngineError::Daemon(format!(
                "container name {} is already in use",
                service.name
            )));
        }
        self.add_container(&service.name, &service.image, ContainerState::Stopped);
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<(), EngineError> {
        self.record_command("start", name);
        self.check_fail("start", name)?;
        self.with_container(name, |c| c.state = ContainerState::Running)
    }

    async fn stop_container(&self, name: &str) -> Result<(), EngineError> {
        self.record_command("stop", name);
        self.check_fail("stop", name)?;
        self.with_container(name, |c| c.state = ContainerState::Stopped)
    }

    async fn restart_container(&self, name: &str) -> Result<(), EngineError> {
        self.record_command("restart", name);
        self.check_fail("restart", name)?;
        self.with_container(name, |c| c.state = ContainerState::Running)
    }

    async fn remove_container(&self, name: &str, remove_volumes: bool) -> Result<(), EngineError> {
        let op = if remove_volumes { "remove_with_volumes" } else { "remove" };
        self.record_command(op, name);
        self.check_fail("remove", name)?;
        self.containers
            .write()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(format!("no such container: {name}")))
    }

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        self.record_command("remove_volume", name);
        self.check_fail("remove_volume", name)
    }

    async fn wait_container(&self, name: &str) -> Result<i64, EngineError> {
        self.record_command("wait", name);
        self.check_fail("wait", name)?;
        if self.block_wait.read().unwrap().contains(name) {
            futures::future::pending::<()>().await;
        }
        let code = self.exit_codes.read().unwrap().get(name).copied().unwrap_or(0);
        self.with_container(name, |c| c.state = ContainerState::Stopped)?;
        Ok(code)
    }

    async fn exec(&self, container: &str, command: &[String]) -> Result<ExecOutput, EngineError> {
        self.record_command("exec", &format!("{container}:{}", command.join(" ")));
        self.check_fail("exec", container)?;
        Ok(ExecOutput {
            exit_code: Some(0),
            output: self
                .exec_output
                .read()
                .unwrap()
                .get(container)
                .cloned()
                .unwrap_or_default(),
        })
    }
}

/// [`ProgressSink`] that keeps every message.
#[derive(Debug, Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<ProgressMessage>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<ProgressMessage> {
        self.messages.lock().unwrap().clone()
    }

    /// Messages about one image, in delivery order.
    pub fn for_image(&self, name: &str) -> Vec<ProgressMessage> {
        self.messages()
            .into_iter()
            .filter(|m| m.name == name)
            .collect()
    }
}

impl ProgressSink for RecordingSink {
    fn send(&self, message: ProgressMessage) {
        self.messages.lock().unwrap().push(message);
    }
}

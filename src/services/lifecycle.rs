use crate::domain::{
    ContainerEngine, ContainerState, OperationContext, Service, dependency_order, is_graceful_exit,
};
use crate::error::{AggregatedError, Error, Failure};
use crate::infra::config::StackConfig;
use crate::services::pipeline::ImagePipeline;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Return once containers are up instead of waiting for them to exit.
    pub detach: bool,
    /// Rebuild every buildable image, not only missing ones.
    pub build: bool,
    /// In detached mode, how long to wait for containers to become ready.
    pub wait_timeout: Option<Duration>,
}

impl StartOptions {
    pub fn from_config(config: &StackConfig) -> Self {
        Self {
            detach: config.detach,
            build: config.build,
            wait_timeout: config.wait_timeout,
        }
    }
}

fn lifecycle(container: &str, message: impl ToString) -> Failure {
    Failure::Lifecycle {
        container: container.to_string(),
        message: message.to_string(),
    }
}

/// Keeps the Aggregated failures of `result` in `failures`; configuration
/// errors pass through.
fn absorb(result: Result<(), Error>, failures: &mut AggregatedError) -> Result<(), Error> {
    match result {
        Ok(()) => Ok(()),
        Err(Error::Aggregated(agg)) => {
            failures.extend(agg);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Start, stop, restart, purge and exec against the containers of a stack.
/// Every operation works on the dependency closure of the services it is
/// given.
#[derive(Debug, Clone)]
pub struct LifecycleController {
    engine: Arc<dyn ContainerEngine>,
    pipeline: ImagePipeline,
    options: StartOptions,
}

impl LifecycleController {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        pipeline: ImagePipeline,
        options: StartOptions,
    ) -> Self {
        Self {
            engine,
            pipeline,
            options,
        }
    }

    pub fn options(&self) -> &StartOptions {
        &self.options
    }

    /// Acquires images, brings every container up in dependency order, then
    /// either waits for readiness (detached) or for the containers to exit.
    pub async fn start(&self, ctx: &OperationContext, services: &[Service]) -> Result<(), Error> {
        let closure: Vec<Service> = dependency_order(services).into_iter().cloned().collect();
        if closure.is_empty() {
            return Ok(());
        }

        let mut failures = AggregatedError::new();
        let mut to_build = Vec::new();
        for svc in closure.iter().filter(|svc| svc.needs_build()) {
            if self.options.build {
                to_build.push(svc.clone());
                continue;
            }
            match self.engine.image_exists(&svc.image).await {
                Ok(true) => debug!("{} present, skipping build", svc.image),
                Ok(false) => to_build.push(svc.clone()),
                Err(e) => failures.push(Failure::Build {
                    image: svc.image.clone(),
                    message: e.to_string(),
                }),
            }
        }

        absorb(self.pipeline.build_all(ctx, &to_build).await, &mut failures)?;
        absorb(self.pipeline.pull_all(ctx, &closure).await, &mut failures)?;
        if !failures.is_empty() {
            return failures.into_result();
        }

        let rebuilt: HashSet<&str> = to_build.iter().map(|svc| svc.image.as_str()).collect();
        self.up(ctx, &closure, &rebuilt).await.into_result()?;

        if self.options.detach {
            match self.options.wait_timeout {
                Some(timeout) => self.wait_ready(ctx, &closure, timeout).await.into_result(),
                None => Ok(()),
            }
        } else {
            self.wait_exit(ctx, &closure).await
        }
    }

    async fn up(
        &self,
        ctx: &OperationContext,
        closure: &[Service],
        rebuilt: &HashSet<&str>,
    ) -> AggregatedError {
        let mut failures = AggregatedError::new();

        let mut networks = HashSet::new();
        for network in closure.iter().map(|svc| svc.host.network.as_str()) {
            if network.is_empty() || !networks.insert(network) {
                continue;
            }
            if let Err(e) = self.engine.ensure_network(network).await {
                failures.push(lifecycle(network, format!("creating network: {e}")));
                return failures;
            }
        }

        for svc in closure {
            if let Some(reason) = ctx.state() {
                failures.push(Failure::Cancelled {
                    target: svc.name.clone(),
                    reason,
                });
                continue;
            }
            if let Err(e) = self.up_one(svc, rebuilt.contains(svc.image.as_str())).await {
                failures.push(e);
            }
        }
        failures
    }

    async fn up_one(&self, svc: &Service, rebuilt: bool) -> Result<(), Failure> {
        let name = svc.name.as_str();
        let container = self
            .engine
            .inspect_container(name)
            .await
            .map_err(|e| lifecycle(name, e))?;

        match container.state {
            ContainerState::NotCreated => {
                info!("Creating {name}");
                self.engine
                    .create_container(svc)
                    .await
                    .map_err(|e| lifecycle(name, e))?;
            }
            _ if rebuilt => {
                info!("Recreating {name} from rebuilt image");
                self.engine
                    .remove_container(name, false)
                    .await
                    .map_err(|e| lifecycle(name, e))?;
                self.engine
                    .create_container(svc)
                    .await
                    .map_err(|e| lifecycle(name, e))?;
            }
            ContainerState::Running => {
                debug!("{name} already running");
                return Ok(());
            }
            ContainerState::Stopped => {}
        }

        info!("Starting {name}");
        self.engine
            .start_container(name)
            .await
            .map_err(|e| lifecycle(name, e))
    }

    async fn wait_ready(
        &self,
        ctx: &OperationContext,
        closure: &[Service],
        timeout: Duration,
    ) -> AggregatedError {
        let deadline = Instant::now() + timeout;
        let mut pending: Vec<&str> = closure.iter().map(|svc| svc.name.as_str()).collect();
        info!("Waiting up to {timeout:?} for {} container(s)", pending.len());

        loop {
            let mut still = Vec::new();
            for name in pending {
                match self.engine.inspect_container(name).await {
                    Ok(container) if container.is_ready() => debug!("{name} is ready"),
                    Ok(_) => still.push(name),
                    Err(e) => {
                        debug!("inspecting {name}: {e}");
                        still.push(name);
                    }
                }
            }
            pending = still;
            if pending.is_empty() {
                info!("All containers ready");
                return AggregatedError::new();
            }

            tokio::select! {
                reason = ctx.done() => {
                    return pending
                        .into_iter()
                        .map(|name| Failure::Cancelled { target: name.to_string(), reason })
                        .collect();
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return pending
                        .into_iter()
                        .map(|name| lifecycle(name, format!("not ready after {timeout:?}")))
                        .collect();
                }
                _ = tokio::time::sleep(READY_POLL_INTERVAL) => {}
            }
        }
    }

    /// Foreground mode: waits for every container to exit, recording each
    /// non-graceful exit as it happens. Cancellation stops the stack; exits
    /// seen before it are still reported.
    async fn wait_exit(&self, ctx: &OperationContext, closure: &[Service]) -> Result<(), Error> {
        let mut waits: FuturesUnordered<_> = closure
            .iter()
            .map(|svc| async move { (svc.name.as_str(), self.engine.wait_container(&svc.name).await) })
            .collect();

        let mut failures = AggregatedError::new();
        loop {
            let next = tokio::select! {
                reason = ctx.done() => Err(reason),
                next = waits.next() => Ok(next),
            };
            match next {
                Ok(None) => break,
                Ok(Some((name, Ok(code)))) if is_graceful_exit(code) => {
                    info!("{name} exited with code {code}")
                }
                Ok(Some((name, Ok(code)))) => {
                    warn!("{name} exited with code {code}");
                    failures.push(lifecycle(name, format!("exited with code {code}")));
                }
                Ok(Some((name, Err(e)))) => failures.push(lifecycle(name, e)),
                Err(reason) => {
                    info!("{reason}, stopping containers");
                    drop(waits);
                    self.stop_closure(closure).await;
                    break;
                }
            }
        }
        failures.into_result()
    }

    /// Stops running containers, dependents first. Failures are logged only.
    async fn stop_closure(&self, closure: &[Service]) {
        for svc in closure.iter().rev() {
            if let Err(failure) = self.stop_one(&svc.name).await {
                warn!("{failure}");
            }
        }
    }

    async fn stop_one(&self, name: &str) -> Result<(), Failure> {
        let container = self
            .engine
            .inspect_container(name)
            .await
            .map_err(|e| lifecycle(name, e))?;
        if !container.is_running() {
            debug!("{name} not running, skipping stop");
            return Ok(());
        }

        info!("Stopping {name}");
        self.engine
            .stop_container(name)
            .await
            .map_err(|e| lifecycle(name, e))
    }

    /// Gracefully stops every running container, dependents first. Volumes are
    /// kept.
    pub async fn stop(&self, ctx: &OperationContext, services: &[Service]) -> Result<(), Error> {
        let closure = dependency_order(services);
        let mut failures = AggregatedError::new();
        for svc in closure.into_iter().rev() {
            if let Some(reason) = ctx.state() {
                failures.push(Failure::Cancelled {
                    target: svc.name.clone(),
                    reason,
                });
                continue;
            }
            if let Err(failure) = self.stop_one(&svc.name).await {
                failures.push(failure);
            }
        }
        failures.into_result()
    }

    /// With `build` set, a full stop and start. Otherwise each container is
    /// restarted in place and nothing is rebuilt.
    pub async fn restart(&self, ctx: &OperationContext, services: &[Service]) -> Result<(), Error> {
        if self.options.build {
            self.stop(ctx, services).await?;
            return self.start(ctx, services).await;
        }

        let mut failures = AggregatedError::new();
        for svc in dependency_order(services) {
            let name = svc.name.as_str();
            if let Some(reason) = ctx.state() {
                failures.push(Failure::Cancelled {
                    target: name.to_string(),
                    reason,
                });
                continue;
            }
            match self.engine.inspect_container(name).await {
                Ok(container) if container.state == ContainerState::NotCreated => {
                    failures.push(lifecycle(name, "not created"));
                }
                Ok(_) => {
                    info!("Restarting {name}");
                    if let Err(e) = self.engine.restart_container(name).await {
                        failures.push(lifecycle(name, e));
                    }
                }
                Err(e) => failures.push(lifecycle(name, e)),
            }
        }
        failures.into_result()
    }

    /// Stops and removes every container with its volumes, then the stack's
    /// networks. Irreversible.
    pub async fn purge(&self, ctx: &OperationContext, services: &[Service]) -> Result<(), Error> {
        let closure = dependency_order(services);
        let mut failures = AggregatedError::new();

        for svc in closure.iter().rev() {
            let name = svc.name.as_str();
            if let Some(reason) = ctx.state() {
                failures.push(Failure::Cancelled {
                    target: name.to_string(),
                    reason,
                });
                continue;
            }
            if let Err(failure) = self.purge_one(svc).await {
                failures.push(failure);
            }
        }

        let mut networks = HashSet::new();
        for network in closure.iter().map(|svc| svc.host.network.as_str()) {
            if network.is_empty() || !networks.insert(network) {
                continue;
            }
            match self.engine.remove_network(network).await {
                Ok(()) => info!("Removed network {network}"),
                Err(e) if e.is_not_found() => debug!("network {network} already gone"),
                Err(e) => failures.push(lifecycle(network, format!("removing network: {e}"))),
            }
        }

        failures.into_result()
    }

    async fn purge_one(&self, svc: &Service) -> Result<(), Failure> {
        let name = svc.name.as_str();
        self.stop_one(name).await?;

        let container = self
            .engine
            .inspect_container(name)
            .await
            .map_err(|e| lifecycle(name, e))?;
        if container.state != ContainerState::NotCreated {
            info!("Removing {name}");
            self.engine
                .remove_container(name, true)
                .await
                .map_err(|e| lifecycle(name, e))?;
        }

        for volume in svc.host.volume_names() {
            match self.engine.remove_volume(volume).await {
                Ok(()) => info!("Removed volume {volume}"),
                Err(e) if e.is_not_found() => debug!("volume {volume} already gone"),
                Err(e) => return Err(lifecycle(name, format!("removing volume {volume}: {e}"))),
            }
        }
        Ok(())
    }

    /// Runs `command` in a running container and returns its combined output.
    pub async fn exec(
        &self,
        ctx: &OperationContext,
        container: &str,
        command: &[String],
    ) -> Result<String, Error> {
        let state = self
            .engine
            .inspect_container(container)
            .await
            .map_err(|e| lifecycle(container, e))?;
        if !state.is_running() {
            return Err(lifecycle(container, "not running").into());
        }

        debug!("exec in {container}: {command:?}");
        let output = tokio::select! {
            reason = ctx.done() => {
                return Err(Failure::Cancelled { target: container.to_string(), reason }.into());
            }
            output = self.engine.exec(container, command) => {
                output.map_err(|e| lifecycle(container, e))?
            }
        };

        if let Some(code) = output.exit_code.filter(|code| *code != 0) {
            debug!("command in {container} exited with code {code}");
        }
        Ok(output.output)
    }
}

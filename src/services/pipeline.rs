//! Concurrent image acquisition: build, pull and push fan out one task per
//! image and fan the results back in, in spawn order, as one
//! [`AggregatedError`].

use crate::domain::{
    BuildRequest, BuildSpec, ContainerEngine, EngineError, Icon, OperationContext,
    ProgressMessage, ProgressSink, ProgressState, PullProgress, RegistryAuth, Service,
    TransferStatus, dependency_order,
};
use crate::error::{AggregatedError, ConfigError, Error, Failure};
use crate::infra::archive::{DEFAULT_CONTEXT_LIMIT, build_context};
use crate::services::build_log::{BuildLogDecoder, BuildLogEvent};
use crate::services::registry::SOURCE_TOKEN_ENV;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Worker = (String, JoinHandle<Result<(), Failure>>);

/// Builds, pulls and pushes the images a stack needs.
#[derive(Clone)]
pub struct ImagePipeline {
    engine: Arc<dyn ContainerEngine>,
    sink: Arc<dyn ProgressSink>,
    credentials: HashMap<String, String>,
    context_limit: u64,
}

impl std::fmt::Debug for ImagePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImagePipeline")
            .field("engine", &self.engine)
            .field("credentials", &self.credentials.keys().collect::<Vec<_>>())
            .field("context_limit", &self.context_limit)
            .finish()
    }
}

impl ImagePipeline {
    /// Source-hosting credentials are read from the process environment here,
    /// once.
    pub fn new(engine: Arc<dyn ContainerEngine>, sink: Arc<dyn ProgressSink>) -> Self {
        let credentials = std::env::var(SOURCE_TOKEN_ENV)
            .ok()
            .filter(|token| !token.trim().is_empty())
            .map(|token| HashMap::from([(SOURCE_TOKEN_ENV.to_string(), token)]))
            .unwrap_or_default();

        Self {
            engine,
            sink,
            credentials,
            context_limit: DEFAULT_CONTEXT_LIMIT,
        }
    }

    /// Replaces the credential set (variable name to value).
    pub fn with_credentials(mut self, credentials: HashMap<String, String>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_context_limit(mut self, limit: u64) -> Self {
        self.context_limit = limit;
        self
    }

    /// Builds every service that carries a non-empty build spec. Services
    /// without one are ignored.
    pub async fn build_all(&self, ctx: &OperationContext, services: &[Service]) -> Result<(), Error> {
        let mut seen = HashSet::new();
        let builds: Vec<(&Service, &BuildSpec)> = services
            .iter()
            .filter_map(|svc| svc.build_spec().map(|spec| (svc, spec)))
            .filter(|(svc, _)| seen.insert(svc.image.as_str()))
            .collect();

        if builds.is_empty() {
            return Ok(());
        }

        // credentials are checked for every build before the daemon sees any
        let mut jobs = Vec::with_capacity(builds.len());
        for (svc, spec) in builds {
            let credential = match &spec.credential_env {
                Some(var) => {
                    let value = self.credentials.get(var).ok_or_else(|| {
                        ConfigError::MissingCredential {
                            var: var.clone(),
                            image: svc.image.clone(),
                        }
                    })?;
                    Some((var.clone(), value.clone()))
                }
                None => None,
            };
            jobs.push((svc.image.clone(), spec.clone(), credential));
        }

        info!("Building {} image(s)", jobs.len());
        let workers: Vec<Worker> = jobs
            .into_iter()
            .map(|(image, spec, credential)| {
                let work = build_one(
                    self.engine.clone(),
                    self.sink.clone(),
                    ctx.clone(),
                    image.clone(),
                    spec,
                    credential,
                    self.context_limit,
                );
                self.spawn(image, ProgressState::Building, work)
            })
            .collect();

        join(workers, |image, message| Failure::Build { image, message })
            .await
            .into_result()
    }

    /// Images reachable from `services` (dependencies included) that are
    /// neither built locally nor already present.
    pub async fn missing_images(&self, services: &[Service]) -> (Vec<String>, AggregatedError) {
        let closure = dependency_order(services);
        let built: HashSet<&str> = closure
            .iter()
            .filter(|svc| svc.needs_build())
            .map(|svc| svc.image.as_str())
            .collect();

        let mut seen = HashSet::new();
        let mut needed = Vec::new();
        let mut failures = AggregatedError::new();
        for svc in closure {
            let image = svc.image.as_str();
            if built.contains(image) || !seen.insert(image) {
                continue;
            }
            match self.engine.image_exists(image).await {
                Ok(true) => debug!("{image} already present"),
                Ok(false) => needed.push(image.to_string()),
                Err(e) => failures.push(Failure::Pull {
                    image: image.to_string(),
                    message: e.to_string(),
                }),
            }
        }
        (needed, failures)
    }

    /// Pulls every missing image the services and their dependencies need.
    pub async fn pull_all(&self, ctx: &OperationContext, services: &[Service]) -> Result<(), Error> {
        let (needed, mut failures) = self.missing_images(services).await;
        if needed.is_empty() {
            return failures.into_result();
        }

        info!("Pulling {} image(s)", needed.len());
        let workers: Vec<Worker> = needed
            .into_iter()
            .map(|image| {
                let work = pull_one(
                    self.engine.clone(),
                    self.sink.clone(),
                    ctx.clone(),
                    image.clone(),
                );
                self.spawn(image, ProgressState::Pulling, work)
            })
            .collect();

        failures.extend(join(workers, |image, message| Failure::Pull { image, message }).await);
        failures.into_result()
    }

    /// Tags every service image as `<target>/<image>` and pushes it. All
    /// images must exist locally before anything is sent.
    pub async fn push_all(
        &self,
        ctx: &OperationContext,
        target: &str,
        auth: &RegistryAuth,
        services: &[Service],
    ) -> Result<(), Error> {
        let mut seen = HashSet::new();
        let images: Vec<String> = services
            .iter()
            .map(|svc| svc.image.clone())
            .filter(|image| seen.insert(image.clone()))
            .collect();

        let mut failures = AggregatedError::new();
        for image in &images {
            match self.engine.image_exists(image).await {
                Ok(true) => {}
                Ok(false) => return Err(ConfigError::ImageNotFound(image.clone()).into()),
                Err(e) => failures.push(Failure::Push {
                    image: image.clone(),
                    message: e.to_string(),
                }),
            }
        }
        if !failures.is_empty() {
            return failures.into_result();
        }

        let target = target.trim_end_matches('/');
        info!("Pushing {} image(s) to {target}", images.len());
        let workers: Vec<Worker> = images
            .into_iter()
            .map(|image| {
                let work = push_one(
                    self.engine.clone(),
                    self.sink.clone(),
                    ctx.clone(),
                    image.clone(),
                    format!("{target}/{image}"),
                    auth.clone(),
                );
                self.spawn(image, ProgressState::Pushing, work)
            })
            .collect();

        join(workers, |image, message| Failure::Push { image, message })
            .await
            .into_result()
    }

    fn spawn<F>(&self, image: String, state: ProgressState, work: F) -> Worker
    where
        F: Future<Output = Result<(), Failure>> + Send + 'static,
    {
        let sink = self.sink.clone();
        let name = image.clone();
        let handle = tokio::spawn(async move {
            let result = work.await;
            if let Err(failure) = &result {
                sink.send(
                    ProgressMessage::image(&name, state, failure.to_string()).finished(Icon::Failure),
                );
            }
            result
        });
        (image, handle)
    }
}

/// Awaits the workers in spawn order. A panicked worker becomes a failure of
/// its own image.
async fn join(workers: Vec<Worker>, on_panic: fn(String, String) -> Failure) -> AggregatedError {
    let mut failures = AggregatedError::new();
    for (image, handle) in workers {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(failure)) => {
                warn!("{failure}");
                failures.push(failure);
            }
            Err(e) => failures.push(on_panic(image, e.to_string())),
        }
    }
    failures
}

fn cancelled(ctx: &OperationContext, image: &str) -> Result<(), Failure> {
    match ctx.state() {
        Some(reason) => Err(Failure::Cancelled {
            target: image.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

async fn build_one(
    engine: Arc<dyn ContainerEngine>,
    sink: Arc<dyn ProgressSink>,
    ctx: OperationContext,
    image: String,
    spec: BuildSpec,
    credential: Option<(String, String)>,
    limit: u64,
) -> Result<(), Failure> {
    let failed = |message: String| Failure::Build {
        image: image.clone(),
        message,
    };
    cancelled(&ctx, &image)?;
    sink.send(ProgressMessage::image(&image, ProgressState::Building, "Preparing build context"));

    let root = spec.context_root.clone();
    let dockerfile = spec.dockerfile.clone();
    let archive = tokio::task::spawn_blocking(move || build_context(&root, &dockerfile, limit));
    let archive = tokio::select! {
        biased;
        reason = ctx.done() => return Err(Failure::Cancelled { target: image.clone(), reason }),
        archive = archive => archive
            .map_err(|e| failed(e.to_string()))?
            .map_err(|e| failed(e.to_string()))?,
    };
    debug!("build context for {image} is {} bytes", archive.len());

    let request = BuildRequest {
        image: image.clone(),
        context: archive.into(),
        target: spec.target,
        args: spec.args,
        secrets: credential.into_iter().collect(),
    };

    let output = engine.build_image(request).map_err(|e| failed(e.to_string()))?;
    let decoder = BuildLogDecoder::new(output.format);
    let mut records = output.records;

    loop {
        let next = tokio::select! {
            biased;
            reason = ctx.done() => return Err(Failure::Cancelled { target: image.clone(), reason }),
            next = records.next() => next,
        };
        match next {
            None => break,
            Some(Err(e)) => return Err(failed(e.to_string())),
            Some(Ok(record)) => match decoder.decode(&record) {
                Some(BuildLogEvent::Error(message)) => return Err(failed(message)),
                Some(BuildLogEvent::Step(line)) => {
                    sink.send(ProgressMessage::image(&image, ProgressState::Building, line));
                }
                None => {}
            },
        }
    }

    sink.send(
        ProgressMessage::image(&image, ProgressState::Built, "Built").finished(Icon::Success),
    );
    Ok(())
}

async fn pull_one(
    engine: Arc<dyn ContainerEngine>,
    sink: Arc<dyn ProgressSink>,
    ctx: OperationContext,
    image: String,
) -> Result<(), Failure> {
    cancelled(&ctx, &image)?;
    sink.send(ProgressMessage::image(&image, ProgressState::Pulling, "Waiting"));

    let stream = engine.pull_image(&image);
    let mut progress =
        transfer(stream, &ctx, sink.as_ref(), &image, ProgressState::Pulling, |image, message| {
            Failure::Pull { image, message }
        })
        .await?;

    progress.complete();
    sink.send(
        ProgressMessage::image(&image, ProgressState::Pulling, "Pulled")
            .with_percent(progress.percent())
            .finished(Icon::Success),
    );
    Ok(())
}

async fn push_one(
    engine: Arc<dyn ContainerEngine>,
    sink: Arc<dyn ProgressSink>,
    ctx: OperationContext,
    image: String,
    remote: String,
    auth: RegistryAuth,
) -> Result<(), Failure> {
    cancelled(&ctx, &image)?;
    engine
        .tag_image(&image, &remote)
        .await
        .map_err(|e| Failure::Push {
            image: image.clone(),
            message: e.to_string(),
        })?;
    sink.send(ProgressMessage::image(&image, ProgressState::Pushing, format!("Pushing to {remote}")));

    let stream = engine.push_image(&remote, &auth);
    let mut progress =
        transfer(stream, &ctx, sink.as_ref(), &image, ProgressState::Pushing, |image, message| {
            Failure::Push { image, message }
        })
        .await?;

    progress.complete();
    sink.send(
        ProgressMessage::image(&image, ProgressState::Pushing, "Pushed")
            .with_percent(progress.percent())
            .finished(Icon::Success),
    );
    Ok(())
}

/// Drains a pull or push status stream, reporting increases in percentage,
/// and hands back the progress reached. The stream is dropped, closing the
/// response, as soon as the context ends.
async fn transfer(
    mut stream: BoxStream<'_, Result<TransferStatus, EngineError>>,
    ctx: &OperationContext,
    sink: &dyn ProgressSink,
    image: &str,
    state: ProgressState,
    failed: fn(String, String) -> Failure,
) -> Result<PullProgress, Failure> {
    let mut progress = PullProgress::new();
    loop {
        let next = tokio::select! {
            biased;
            reason = ctx.done() => return Err(Failure::Cancelled { target: image.to_string(), reason }),
            next = stream.next() => next,
        };
        let status = match next {
            None => return Ok(progress),
            Some(Err(e)) => return Err(failed(image.to_string(), e.to_string())),
            Some(Ok(status)) => status,
        };

        if let Some(error) = status.error.filter(|e| !e.trim().is_empty()) {
            return Err(failed(image.to_string(), error));
        }
        if let Some(percent) = progress.update(status.id.as_deref(), status.current, status.total) {
            let detail = status.status.unwrap_or_else(|| "Downloading".to_string());
            sink.send(ProgressMessage::image(image, state, detail).with_percent(percent));
        }
    }
}

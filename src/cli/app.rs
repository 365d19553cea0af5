use crate::cli::{Cli, Commands};
use crate::domain::{OperationContext, RegistryAuth, Service, ServiceKind};
use crate::infra::config::{NAMESPACE_KEY, StackConfig, load_stack_config};
use crate::infra::{DockerEngine, LogPresenter, Presenter, ProgressHub, TerminalPresenter};
use crate::services::{ImagePipeline, LifecycleController, ServiceRegistry, StartOptions};
use anyhow::{Context, Result};
use std::io::IsTerminal;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Started when no service is named on the command line.
const DEFAULT_SERVICES: [ServiceKind; 2] = [ServiceKind::Cardinal, ServiceKind::Nakama];

/// Stack file plus process-level fallbacks. A missing file at `path` yields
/// the defaults rooted at the current directory.
pub fn load_config(path: &Path) -> Result<StackConfig> {
    let mut config = if path.exists() {
        load_stack_config(path)?
    } else {
        warn!("stack file {path:?} not found, using defaults");
        StackConfig::default()
    };

    if config.namespace().is_none() {
        if let Ok(namespace) = std::env::var(NAMESPACE_KEY) {
            debug!("namespace {namespace:?} taken from the environment");
            config.env.insert(NAMESPACE_KEY.to_string(), namespace);
        }
    }
    Ok(config)
}

/// Names on the command line to descriptors; telemetry services are added
/// when enabled.
pub fn resolve_services(registry: &ServiceRegistry, names: &[String]) -> Result<Vec<Service>> {
    let kinds = if names.is_empty() {
        DEFAULT_SERVICES.to_vec()
    } else {
        names
            .iter()
            .map(|name| {
                ServiceKind::from_slug(name)
                    .ok_or_else(|| crate::error::ConfigError::UnknownService(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?
    };
    Ok(registry.describe_stack(&kinds)?)
}

fn presenter(plain: bool) -> Box<dyn Presenter> {
    if plain || !std::io::stderr().is_terminal() {
        Box::new(LogPresenter::new())
    } else {
        Box::new(TerminalPresenter::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Cancel,
    Exit,
}

/// First interrupt cancels `ctx`; once it is done, another one exits.
fn on_interrupt(ctx: &OperationContext) -> Interrupt {
    if ctx.state().is_some() {
        return Interrupt::Exit;
    }
    warn!("Interrupted, cancelling (press Ctrl-C again to exit now)");
    ctx.cancel();
    Interrupt::Cancel
}

fn cancel_on_interrupt(ctx: &OperationContext) {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("cannot listen for Ctrl-C: {e}");
                return;
            }
            if on_interrupt(&ctx) == Interrupt::Exit {
                warn!("Interrupted again, exiting");
                std::process::exit(130);
            }
        }
    });
}

pub async fn run(cli: Cli) -> Result<()> {
    let mut config = load_config(&cli.config)?;
    config.apply(cli.command.settings());

    let registry = ServiceRegistry::new(config)?;
    let config = registry.config();
    info!("Stack namespace: {}", registry.namespace());

    let ctx = match cli.timeout {
        Some(secs) => OperationContext::with_timeout(Duration::from_secs(secs)),
        None => OperationContext::new(),
    };
    cancel_on_interrupt(&ctx);

    let engine = Arc::new(DockerEngine::connect(config.buildkit).context("connecting to Docker")?);
    engine
        .ping()
        .await
        .context("the Docker daemon is not responding; is it running?")?;

    let (hub, progress) = ProgressHub::spawn(presenter(cli.plain));
    let pipeline = ImagePipeline::new(engine.clone(), Arc::new(hub));
    let controller =
        LifecycleController::new(engine, pipeline.clone(), StartOptions::from_config(config));

    let result = dispatch(cli.command, &ctx, &registry, &pipeline, &controller).await;
    progress.shutdown().await;
    result
}

async fn dispatch(
    command: Commands,
    ctx: &OperationContext,
    registry: &ServiceRegistry,
    pipeline: &ImagePipeline,
    controller: &LifecycleController,
) -> Result<()> {
    match command {
        Commands::Start { services, .. } => {
            let services = resolve_services(registry, &services)?;
            controller.start(ctx, &services).await?;
        }
        Commands::Stop { services } => {
            let services = resolve_services(registry, &services)?;
            controller.stop(ctx, &services).await?;
            info!("Stack stopped");
        }
        Commands::Restart { services, .. } => {
            let services = resolve_services(registry, &services)?;
            controller.restart(ctx, &services).await?;
        }
        Commands::Purge { services } => {
            let services = resolve_services(registry, &services)?;
            controller.purge(ctx, &services).await?;
            info!("Stack purged");
        }
        Commands::Build { services, .. } => {
            let services = resolve_services(registry, &services)?;
            pipeline.build_all(ctx, &services).await?;
        }
        Commands::Pull { services } => {
            let services = resolve_services(registry, &services)?;
            pipeline.pull_all(ctx, &services).await?;
        }
        Commands::Push {
            target,
            username,
            password,
            server,
            services,
        } => {
            let services = resolve_services(registry, &services)?;
            let auth = RegistryAuth {
                username,
                password,
                server,
            };
            pipeline.push_all(ctx, &target, &auth, &services).await?;
        }
        Commands::Exec { service, command } => {
            let kind = ServiceKind::from_slug(&service)
                .ok_or_else(|| crate::error::ConfigError::UnknownService(service.clone()))?;
            let output = controller
                .exec(ctx, &registry.container_name(kind), &command)
                .await?;
            print!("{output}");
        }
    }
    Ok(())
}

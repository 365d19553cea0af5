use anyhow::Result;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use worldstack::domain::{ContainerState, OperationContext, ServiceKind};
use worldstack::error::ConfigError;
use worldstack::infra::config::load_stack_config;
use worldstack::services::{ImagePipeline, LifecycleController, ServiceRegistry, StartOptions};
use worldstack::test_support::{MockEngine, RecordingSink};

const WORLD_TOML: &str = r#"
[stack]
detach = true

[cardinal]
CARDINAL_NAMESPACE = "demo"
CARDINAL_LOG_LEVEL = "debug"

[nakama]
DB_PASSWORD = "very_unsecure_password_please_change"
"#;

fn write_project(root: &Path, toml: &str) -> Result<()> {
    fs::write(root.join("world.toml"), toml)?;
    fs::create_dir_all(root.join("cardinal"))?;
    fs::write(root.join("cardinal/main.go"), "package main\n")?;
    fs::write(root.join("cardinal/go.mod"), "module demo\n")?;
    Ok(())
}

fn controller(
    registry: &ServiceRegistry,
    credentials: HashMap<String, String>,
) -> (LifecycleController, Arc<MockEngine>) {
    let engine = Arc::new(MockEngine::new());
    let pipeline = ImagePipeline::new(engine.clone(), Arc::new(RecordingSink::new()))
        .with_credentials(credentials);
    let options = StartOptions::from_config(registry.config());
    (LifecycleController::new(engine.clone(), pipeline, options), engine)
}

fn token() -> HashMap<String, String> {
    HashMap::from([("GITHUB_TOKEN".to_string(), "ghp_test".to_string())])
}

#[tokio::test]
async fn test_workflow_start_stop_purge() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_project(dir.path(), WORLD_TOML)?;

    let config = load_stack_config(&dir.path().join("world.toml"))?;
    let registry = ServiceRegistry::new(config)?;
    let services = registry.describe_stack(&[ServiceKind::Cardinal, ServiceKind::Nakama])?;
    let (controller, engine) = controller(&registry, token());
    let ctx = OperationContext::new();

    assert!(controller.options().detach);
    controller.start(&ctx, &services).await?;

    assert_eq!(
        engine.commands_starting_with("build:"),
        vec!["build:demo-cardinal:latest"]
    );
    let mut pulls = engine.commands_starting_with("pull:");
    pulls.sort();
    assert_eq!(
        pulls,
        vec![
            "pull:cockroachdb/cockroach:latest-v23.1",
            "pull:heroiclabs/nakama:3.22.0",
            "pull:redis:latest",
        ]
    );
    assert_eq!(
        engine.commands_starting_with("start:"),
        vec![
            "start:demo-redis",
            "start:demo-cardinal",
            "start:demo-nakama-db",
            "start:demo-nakama",
        ]
    );
    assert_eq!(engine.commands_starting_with("network:"), vec!["network:demo"]);

    controller.stop(&ctx, &services).await?;
    for name in ["demo-redis", "demo-cardinal", "demo-nakama-db", "demo-nakama"] {
        assert_eq!(engine.get_state(name), Some(ContainerState::Stopped), "{name}");
    }

    controller.purge(&ctx, &services).await?;
    assert_eq!(
        engine.commands_starting_with("remove_volume:"),
        vec!["remove_volume:demo-nakama-db-data", "remove_volume:demo-redis-data"]
    );
    assert!(engine.container("demo-cardinal").is_none());
    assert_eq!(
        engine.get_commands().last().map(String::as_str),
        Some("remove_network:demo")
    );

    Ok(())
}

#[tokio::test]
async fn test_workflow_missing_token_stops_before_engine() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_project(dir.path(), WORLD_TOML)?;

    let registry = ServiceRegistry::new(load_stack_config(&dir.path().join("world.toml"))?)?;
    let services = registry.describe_stack(&[ServiceKind::Cardinal])?;
    let (controller, engine) = controller(&registry, HashMap::new());

    let err = controller
        .start(&OperationContext::new(), &services)
        .await
        .unwrap_err();

    assert!(matches!(
        err.as_config(),
        Some(ConfigError::MissingCredential { image, .. }) if image == "demo-cardinal:latest"
    ));
    assert!(engine.commands_starting_with("build:").is_empty());
    assert!(engine.commands_starting_with("create:").is_empty());
    Ok(())
}

#[tokio::test]
async fn test_workflow_telemetry_pulls_auxiliary_images() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_project(
        dir.path(),
        &WORLD_TOML.replace("detach = true", "detach = true\ntelemetry = true"),
    )?;

    let registry = ServiceRegistry::new(load_stack_config(&dir.path().join("world.toml"))?)?;
    let services = registry.describe_stack(&[ServiceKind::Cardinal])?;
    let (controller, engine) = controller(&registry, token());

    controller.start(&OperationContext::new(), &services).await?;

    let pulls = engine.commands_starting_with("pull:");
    assert!(pulls.contains(&"pull:jaegertracing/all-in-one:1.61.0".to_string()));
    assert!(pulls.contains(&"pull:prom/prometheus:v2.54.1".to_string()));
    assert_eq!(engine.get_state("demo-jaeger"), Some(ContainerState::Running));
    Ok(())
}

#[test]
fn test_workflow_requires_namespace() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_project(dir.path(), "[nakama]\nDB_PASSWORD = \"pw\"\n")?;

    let config = load_stack_config(&dir.path().join("world.toml"))?;
    assert!(matches!(
        ServiceRegistry::new(config),
        Err(ConfigError::MissingNamespace)
    ));
    Ok(())
}

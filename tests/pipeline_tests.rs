use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use worldstack::domain::{
    BuildLogFormat, BuildSpec, OperationContext, ProgressState, RegistryAuth, Service, ServiceKind,
    TransferStatus,
};
use worldstack::error::{ConfigError, Error, Failure};
use worldstack::services::ImagePipeline;
use worldstack::test_support::{MockEngine, RecordingSink};

fn build_spec(root: &std::path::Path) -> BuildSpec {
    BuildSpec {
        dockerfile: "FROM scratch\nCOPY . /app\n".into(),
        context_root: root.to_path_buf(),
        ..Default::default()
    }
}

fn setup() -> (ImagePipeline, Arc<MockEngine>, Arc<RecordingSink>) {
    let engine = Arc::new(MockEngine::new());
    let sink = Arc::new(RecordingSink::new());
    let pipeline =
        ImagePipeline::new(engine.clone(), sink.clone()).with_credentials(HashMap::new());
    (pipeline, engine, sink)
}

fn status(layer: &str, current: i64, total: i64) -> TransferStatus {
    TransferStatus {
        id: Some(layer.into()),
        status: Some("Downloading".into()),
        current: Some(current),
        total: Some(total),
        error: None,
    }
}

#[tokio::test]
async fn test_pull_all_only_fetches_missing_images() {
    let (pipeline, engine, _sink) = setup();
    engine.add_image("redis:latest");

    let services = vec![
        Service::new("ns-redis", ServiceKind::Redis, "redis:latest"),
        Service::new("ns-db", ServiceKind::NakamaDb, "postgres:16"),
    ];
    pipeline
        .pull_all(&OperationContext::new(), &services)
        .await
        .unwrap();

    assert_eq!(engine.commands_starting_with("pull:"), vec!["pull:postgres:16"]);
    assert!(engine.has_image("postgres:16"));
}

#[tokio::test]
async fn test_pull_all_includes_dependencies_but_not_built_images() {
    let (pipeline, engine, _sink) = setup();
    let dir = tempfile::tempdir().unwrap();

    let shard = Service::new("ns-shard", ServiceKind::Cardinal, "ns-shard:latest")
        .with_build(build_spec(dir.path()))
        .with_dependency(Service::new("ns-redis", ServiceKind::Redis, "redis:latest"));
    let front = Service::new("ns-front", ServiceKind::Nakama, "heroiclabs/nakama:3.22.0")
        .with_dependency(shard);

    pipeline
        .pull_all(&OperationContext::new(), &[front])
        .await
        .unwrap();

    let pulls = engine.commands_starting_with("pull:");
    assert_eq!(
        pulls,
        vec!["pull:redis:latest", "pull:heroiclabs/nakama:3.22.0"]
    );
}

#[tokio::test]
async fn test_pull_progress_never_decreases_and_finishes_at_hundred() {
    let (pipeline, engine, sink) = setup();
    engine.script_pull(
        "postgres:16",
        vec![
            status("a", 10, 100),
            status("a", 60, 100),
            // stale resend
            status("a", 40, 100),
            // new layer lowers the raw ratio
            status("b", 0, 100),
            TransferStatus::default(),
            status("b", 100, 100),
        ],
    );

    pipeline
        .pull_all(
            &OperationContext::new(),
            &[Service::new("ns-db", ServiceKind::NakamaDb, "postgres:16")],
        )
        .await
        .unwrap();

    let messages = sink.for_image("postgres:16");
    let percents: Vec<u8> = messages.iter().filter_map(|m| m.percent).collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");
    assert_eq!(percents.last(), Some(&100));

    let last = messages.last().unwrap();
    assert!(last.done);
    assert_eq!(last.state, ProgressState::Pulling);
}

#[tokio::test]
async fn test_pull_error_record_fails_only_that_image() {
    let (pipeline, engine, _sink) = setup();
    engine.script_pull(
        "ghcr.io/private/evm:1.0",
        vec![TransferStatus {
            error: Some("denied: requested access to the resource is denied".into()),
            ..Default::default()
        }],
    );

    let services = vec![
        Service::new("ns-evm", ServiceKind::Evm, "ghcr.io/private/evm:1.0"),
        Service::new("ns-redis", ServiceKind::Redis, "redis:latest"),
    ];
    let err = pipeline
        .pull_all(&OperationContext::new(), &services)
        .await
        .unwrap_err();

    assert_eq!(
        err.failures(),
        &[Failure::Pull {
            image: "ghcr.io/private/evm:1.0".into(),
            message: "denied: requested access to the resource is denied".into(),
        }]
    );
    assert!(engine.has_image("redis:latest"));
}

#[tokio::test]
async fn test_build_all_reports_classic_error_and_keeps_siblings() {
    let (pipeline, engine, sink) = setup();
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("main.go"), "package main").unwrap();

    engine.script_build(
        "ns-bad:latest",
        BuildLogFormat::Classic,
        &[
            r#"{"stream":"Step 1/2 : FROM scratch"}"#,
            r#"{"errorDetail":{"message":"COPY failed: file not found"},"error":"COPY failed: file not found"}"#,
        ],
    );

    let services = vec![
        Service::new("ns-bad", ServiceKind::Cardinal, "ns-bad:latest")
            .with_build(build_spec(dir.path())),
        Service::new("ns-good", ServiceKind::Cardinal, "ns-good:latest")
            .with_build(build_spec(dir.path())),
        Service::new("ns-redis", ServiceKind::Redis, "redis:latest"),
    ];
    let err = pipeline
        .build_all(&OperationContext::new(), &services)
        .await
        .unwrap_err();

    assert_eq!(
        err.failures(),
        &[Failure::Build {
            image: "ns-bad:latest".into(),
            message: "COPY failed: file not found".into(),
        }]
    );
    assert!(engine.has_image("ns-good:latest"));
    assert!(!engine.has_image("ns-bad:latest"));
    assert!(engine.commands_starting_with("build:ns-redis").is_empty());

    let steps: Vec<String> = sink
        .for_image("ns-good:latest")
        .into_iter()
        .map(|m| m.detail)
        .collect();
    assert!(steps.contains(&"Step 1/1 : FROM scratch".to_string()));
}

#[tokio::test]
async fn test_build_all_reads_trace_records() {
    let (pipeline, engine, sink) = setup();
    let dir = tempfile::tempdir().unwrap();

    engine.script_build(
        "ns-shard:latest",
        BuildLogFormat::Trace,
        &[
            r#"{"vertexes":[{"digest":"sha256:1","name":"[build 1/4] FROM golang:1.22","started":"2024-05-01T10:00:00Z"}]}"#,
            r#"{"vertexes":[{"digest":"sha256:2","name":"[build 4/4] RUN go build","started":"2024-05-01T10:00:05Z","error":"process \"/bin/sh -c go build\" did not complete successfully: exit code: 1"}]}"#,
        ],
    );

    let err = pipeline
        .build_all(
            &OperationContext::new(),
            &[Service::new("ns-shard", ServiceKind::Cardinal, "ns-shard:latest")
                .with_build(build_spec(dir.path()))],
        )
        .await
        .unwrap_err();

    match err.failures() {
        [Failure::Build { image, message }] => {
            assert_eq!(image, "ns-shard:latest");
            assert!(message.ends_with("exit code: 1"), "{message}");
        }
        other => panic!("unexpected failures: {other:?}"),
    }
    let details: Vec<String> = sink
        .for_image("ns-shard:latest")
        .into_iter()
        .map(|m| m.detail)
        .collect();
    assert!(details.contains(&"[build 1/4] FROM golang:1.22".to_string()));
}

#[tokio::test]
async fn test_build_requires_credential_before_any_engine_call() {
    let (pipeline, engine, _sink) = setup();
    let dir = tempfile::tempdir().unwrap();

    let mut spec = build_spec(dir.path());
    spec.credential_env = Some("GITHUB_TOKEN".into());
    let shard =
        Service::new("ns-shard", ServiceKind::Cardinal, "ns-shard:latest").with_build(spec);

    let err = pipeline
        .build_all(&OperationContext::new(), &[shard.clone()])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Config(ConfigError::MissingCredential { ref var, .. }) if var == "GITHUB_TOKEN"
    ));
    assert!(engine.get_commands().is_empty());

    let pipeline = pipeline.with_credentials(HashMap::from([(
        "GITHUB_TOKEN".to_string(),
        "ghp_test".to_string(),
    )]));
    pipeline
        .build_all(&OperationContext::new(), &[shard])
        .await
        .unwrap();
    assert_eq!(engine.get_commands(), vec!["build:ns-shard:latest"]);

    let requests = engine.build_requests();
    let request = &requests[0];
    assert_eq!(
        request.secrets.get("GITHUB_TOKEN").map(String::as_str),
        Some("ghp_test")
    );
    assert!(!request.args.contains_key("GITHUB_TOKEN"));
}

#[tokio::test]
async fn test_oversized_context_fails_that_build() {
    let (pipeline, engine, _sink) = setup();
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("assets.bin"), vec![7u8; 8192]).unwrap();

    let err = pipeline
        .with_context_limit(1024)
        .build_all(
            &OperationContext::new(),
            &[Service::new("ns-shard", ServiceKind::Cardinal, "ns-shard:latest")
                .with_build(build_spec(dir.path()))],
        )
        .await
        .unwrap_err();

    assert!(matches!(err.failures(), [Failure::Build { .. }]));
    assert!(err.to_string().contains("exceeds 1024 bytes"));
    assert!(engine.get_commands().is_empty());
}

#[tokio::test]
async fn test_push_refuses_missing_images_before_pushing() {
    let (pipeline, engine, _sink) = setup();
    engine.add_image("ns-shard:latest");

    let services = vec![
        Service::new("ns-shard", ServiceKind::Cardinal, "ns-shard:latest"),
        Service::new("ns-front", ServiceKind::Nakama, "ns-front:latest"),
    ];
    let err = pipeline
        .push_all(
            &OperationContext::new(),
            "registry.local/team",
            &RegistryAuth::default(),
            &services,
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err.as_config(),
        Some(ConfigError::ImageNotFound(image)) if image == "ns-front:latest"
    ));
    assert!(engine.commands_starting_with("tag:").is_empty());
    assert!(engine.commands_starting_with("push:").is_empty());
}

#[tokio::test]
async fn test_push_tags_under_target() {
    let (pipeline, engine, sink) = setup();
    engine.add_image("ns-shard:latest");

    pipeline
        .push_all(
            &OperationContext::new(),
            "registry.local/team/",
            &RegistryAuth {
                username: "ci".into(),
                password: "secret".into(),
                server: "registry.local".into(),
            },
            &[Service::new("ns-shard", ServiceKind::Cardinal, "ns-shard:latest")],
        )
        .await
        .unwrap();

    assert_eq!(
        engine.commands_starting_with("tag:"),
        vec!["tag:ns-shard:latest->registry.local/team/ns-shard:latest"]
    );
    assert_eq!(
        engine.commands_starting_with("push:"),
        vec!["push:registry.local/team/ns-shard:latest"]
    );
    let last = sink.for_image("ns-shard:latest").pop().unwrap();
    assert!(last.done);
    assert_eq!(last.percent, Some(100));
}

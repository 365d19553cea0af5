use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use worldstack::domain::{
    BuildLogFormat, BuildSpec, CancelReason, OperationContext, RegistryAuth, Service,
    ServiceKind, TransferStatus,
};
use worldstack::error::Failure;
use worldstack::services::ImagePipeline;
use worldstack::test_support::{MockEngine, RecordingSink};

fn setup() -> (ImagePipeline, Arc<MockEngine>, Arc<RecordingSink>) {
    let engine = Arc::new(MockEngine::new());
    let sink = Arc::new(RecordingSink::new());
    let pipeline =
        ImagePipeline::new(engine.clone(), sink.clone()).with_credentials(HashMap::new());
    (pipeline, engine, sink)
}

fn pulled(names: &[(&str, &str)]) -> Vec<Service> {
    names
        .iter()
        .map(|(name, image)| Service::new(*name, ServiceKind::Redis, *image))
        .collect()
}

async fn wait_for_open_streams(engine: &MockEngine, count: usize) {
    for _ in 0..200 {
        if engine.open_streams() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("expected {count} open streams, found {}", engine.open_streams());
}

#[tokio::test]
async fn test_cancel_mid_pull_cancels_every_worker_and_closes_streams() {
    let (pipeline, engine, _sink) = setup();
    for image in ["redis:latest", "postgres:16"] {
        engine.script_pull(
            image,
            vec![TransferStatus {
                id: Some("layer".into()),
                current: Some(10),
                total: Some(100),
                ..Default::default()
            }],
        );
        engine.hang_on(image);
    }

    let ctx = OperationContext::new();
    let services = pulled(&[("ns-redis", "redis:latest"), ("ns-db", "postgres:16")]);
    let task = {
        let ctx = ctx.clone();
        tokio::spawn(async move { pipeline.pull_all(&ctx, &services).await })
    };

    wait_for_open_streams(&engine, 2).await;
    ctx.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert_eq!(
        err.failures(),
        &[
            Failure::Cancelled {
                target: "redis:latest".into(),
                reason: CancelReason::Cancelled,
            },
            Failure::Cancelled {
                target: "postgres:16".into(),
                reason: CancelReason::Cancelled,
            },
        ]
    );
    assert_eq!(engine.open_streams(), 0);
    assert!(!engine.has_image("redis:latest"));
}

#[tokio::test]
async fn test_deadline_is_distinct_from_cancellation() {
    let (pipeline, engine, _sink) = setup();
    engine.hang_on("redis:latest");

    let ctx = OperationContext::with_timeout(Duration::from_millis(30));
    let started = Instant::now();
    let err = pipeline
        .pull_all(&ctx, &pulled(&[("ns-redis", "redis:latest")]))
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(
        err.failures(),
        [Failure::Cancelled { reason: CancelReason::DeadlineExceeded, .. }]
    ));
    assert_eq!(engine.open_streams(), 0);
}

#[tokio::test]
async fn test_one_hanging_pull_does_not_block_sibling_results() {
    let (pipeline, engine, _sink) = setup();
    engine.hang_on("postgres:16");

    let ctx = OperationContext::with_timeout(Duration::from_millis(50));
    let err = pipeline
        .pull_all(
            &ctx,
            &pulled(&[("ns-redis", "redis:latest"), ("ns-db", "postgres:16")]),
        )
        .await
        .unwrap_err();

    assert_eq!(err.failures().len(), 1);
    assert_eq!(err.failures()[0].target(), "postgres:16");
    assert!(err.failures()[0].is_cancelled());
    assert!(engine.has_image("redis:latest"));
}

#[tokio::test]
async fn test_already_cancelled_context_makes_no_engine_calls_for_builds() {
    let (pipeline, engine, _sink) = setup();
    let dir = tempfile::tempdir().unwrap();
    engine.script_build("ns-app:latest", BuildLogFormat::Classic, &[]);

    let ctx = OperationContext::new();
    ctx.cancel();
    let err = pipeline
        .build_all(
            &ctx,
            &[Service::new("ns-app", ServiceKind::Cardinal, "ns-app:latest").with_build(
                BuildSpec {
                    dockerfile: "FROM scratch".into(),
                    context_root: dir.path().to_path_buf(),
                    ..Default::default()
                },
            )],
        )
        .await
        .unwrap_err();

    assert!(err.failures().iter().all(Failure::is_cancelled));
    assert!(engine.commands_starting_with("build:").is_empty());
    assert_eq!(engine.open_streams(), 0);
}

#[tokio::test]
async fn test_daemon_stream_error_is_a_pull_failure() {
    let (pipeline, engine, _sink) = setup();
    engine.set_fail_on("pull");

    let err = pipeline
        .pull_all(
            &OperationContext::new(),
            &pulled(&[("ns-redis", "redis:latest")]),
        )
        .await
        .unwrap_err();

    match err.failures() {
        [Failure::Pull { image, message }] => {
            assert_eq!(image, "redis:latest");
            assert!(message.contains("mock failure"), "{message}");
        }
        other => panic!("unexpected failures: {other:?}"),
    }
}

#[tokio::test]
async fn test_cancel_mid_build_closes_the_build_stream() {
    let (pipeline, engine, _sink) = setup();
    let dir = tempfile::tempdir().unwrap();
    engine.script_build(
        "ns-app:latest",
        BuildLogFormat::Classic,
        &[r#"{"stream":"Step 1/3 : FROM golang:1.22"}"#],
    );
    engine.hang_on("ns-app:latest");

    let ctx = OperationContext::new();
    let services = vec![
        Service::new("ns-app", ServiceKind::Cardinal, "ns-app:latest").with_build(BuildSpec {
            dockerfile: "FROM scratch".into(),
            context_root: dir.path().to_path_buf(),
            ..Default::default()
        }),
    ];
    let task = {
        let ctx = ctx.clone();
        tokio::spawn(async move { pipeline.build_all(&ctx, &services).await })
    };

    wait_for_open_streams(&engine, 1).await;
    ctx.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert_eq!(
        err.failures(),
        &[Failure::Cancelled {
            target: "ns-app:latest".into(),
            reason: CancelReason::Cancelled,
        }]
    );
    assert_eq!(engine.open_streams(), 0);
    assert!(!engine.has_image("ns-app:latest"));
}

#[tokio::test]
async fn test_cancel_mid_push_closes_the_push_stream() {
    let (pipeline, engine, _sink) = setup();
    engine.add_image("ns-app:latest");
    engine.add_image("redis:latest");
    engine.hang_on("registry.local/ns-app:latest");

    let ctx = OperationContext::new();
    let services = vec![
        Service::new("ns-app", ServiceKind::Cardinal, "ns-app:latest"),
        Service::new("ns-redis", ServiceKind::Redis, "redis:latest"),
    ];
    let task = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            pipeline
                .push_all(&ctx, "registry.local", &RegistryAuth::default(), &services)
                .await
        })
    };

    for _ in 0..200 {
        if engine.commands_starting_with("push:").len() == 2 && engine.open_streams() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(engine.open_streams(), 1);
    ctx.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert_eq!(
        err.failures(),
        &[Failure::Cancelled {
            target: "ns-app:latest".into(),
            reason: CancelReason::Cancelled,
        }]
    );
    assert_eq!(engine.open_streams(), 0);
}

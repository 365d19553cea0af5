//! BuildKit builds through `docker buildx`, whose `rawjson` progress output is
//! the vertex-graph trace format.

use crate::domain::{BuildLogFormat, BuildOutput, BuildRequest, EngineError};
use crate::infra::archive::DOCKERFILE_NAME;
use futures::StreamExt;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, warn};

struct BuildxRun {
    child: Option<Child>,
    lines: Lines<BufReader<ChildStderr>>,
}

fn command(request: &BuildRequest) -> Command {
    let mut cmd = Command::new("docker");
    cmd.arg("buildx")
        .arg("build")
        .arg("--progress=rawjson")
        .arg("--load")
        .arg("-t")
        .arg(&request.image)
        .arg("-f")
        .arg(DOCKERFILE_NAME);

    if let Some(target) = &request.target {
        cmd.arg("--target").arg(target);
    }
    for (key, value) in &request.args {
        cmd.arg("--build-arg").arg(format!("{key}={value}"));
    }
    // secret values reach buildx through its environment, never argv
    for (id, value) in &request.secrets {
        cmd.arg("--secret").arg(format!("id={id},env={id}"));
        cmd.env(id, value);
    }

    // context is the tar archive on stdin
    cmd.arg("-");
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Spawns the build. Dropping the returned stream kills the process.
pub fn build(request: BuildRequest) -> Result<BuildOutput<'static>, EngineError> {
    let mut child = command(&request).spawn()?;
    debug!("spawned docker buildx for {}", request.image);

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| EngineError::Daemon("docker buildx stdin unavailable".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| EngineError::Daemon("docker buildx stderr unavailable".into()))?;

    let context = request.context;
    let image = request.image;
    tokio::spawn(async move {
        // a killed build closes the pipe; nothing left to report then
        if let Err(e) = stdin.write_all(&context).await {
            warn!("streaming build context for {image}: {e}");
        }
    });

    let run = BuildxRun {
        child: Some(child),
        lines: BufReader::new(stderr).lines(),
    };

    let records = futures::stream::unfold(run, |mut run| async move {
        match run.lines.next_line().await {
            Ok(Some(line)) => Some((Ok(line.into_bytes()), run)),
            Ok(None) => {
                let mut child = run.child.take()?;
                match child.wait().await {
                    Ok(status) if status.success() => None,
                    Ok(status) => Some((
                        Err(EngineError::Daemon(format!("docker buildx exited with {status}"))),
                        run,
                    )),
                    Err(e) => Some((Err(EngineError::Io(e)), run)),
                }
            }
            Err(e) => {
                run.child.take();
                Some((Err(EngineError::Io(e)), run))
            }
        }
    })
    .boxed();

    Ok(BuildOutput {
        format: BuildLogFormat::Trace,
        records,
    })
}

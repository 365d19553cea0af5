pub mod app;

use crate::infra::config::{DEFAULT_STACK_FILE, StackSettings};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "worldstack",
    version,
    about = "Builds, pulls and runs a World Engine development stack"
)]
pub struct Cli {
    /// Stack file (TOML)
    #[arg(long, short, env = "WORLDSTACK_CONFIG", default_value = DEFAULT_STACK_FILE)]
    pub config: PathBuf,

    /// Plain log output instead of progress bars
    #[arg(long, global = true)]
    pub plain: bool,

    /// Abort the operation after this many seconds
    #[arg(long, global = true, value_name = "SECS")]
    pub timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags that override the `[stack]` table of the stack file.
#[derive(Args, Debug, Default, Clone)]
pub struct StackFlags {
    /// Rebuild images even when they exist locally
    #[arg(long)]
    pub build: bool,

    /// Return once containers are up
    #[arg(long, short)]
    pub detach: bool,

    /// Build the debug runtime and expose the debugger port
    #[arg(long)]
    pub debug: bool,

    /// Run Jaeger and Prometheus alongside the stack
    #[arg(long)]
    pub telemetry: bool,

    /// Use an external data-availability layer instead of the local devnet
    #[arg(long)]
    pub no_dev_da: bool,

    /// Build with BuildKit through docker buildx
    #[arg(long)]
    pub buildkit: bool,

    /// In detached mode, seconds to wait for containers to become ready
    #[arg(long, value_name = "SECS")]
    pub wait_timeout: Option<u64>,
}

impl StackFlags {
    /// Only flags that were given; absent flags keep the file's value.
    pub fn settings(&self) -> StackSettings {
        let set = |flag: bool| flag.then_some(true);
        StackSettings {
            build: set(self.build),
            detach: set(self.detach),
            debug: set(self.debug),
            telemetry: set(self.telemetry),
            dev_da: self.no_dev_da.then_some(false),
            buildkit: set(self.buildkit),
            wait_timeout: self.wait_timeout,
            ..Default::default()
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Acquire images and run the stack
    Start {
        #[command(flatten)]
        flags: StackFlags,
        /// Services to start (default: cardinal nakama)
        services: Vec<String>,
    },
    /// Stop running containers, keeping their data
    Stop { services: Vec<String> },
    /// Restart containers in place, or rebuild and start with --build
    Restart {
        #[command(flatten)]
        flags: StackFlags,
        services: Vec<String>,
    },
    /// Remove containers, volumes and the stack network
    Purge { services: Vec<String> },
    /// Build the images of services that are built from source
    Build {
        #[command(flatten)]
        flags: StackFlags,
        services: Vec<String>,
    },
    /// Pull the images the services and their dependencies need
    Pull { services: Vec<String> },
    /// Tag and push service images to a registry
    Push {
        /// Registry and repository prefix, e.g. registry.example.com/team
        #[arg(long)]
        target: String,
        #[arg(long, env = "REGISTRY_USERNAME", default_value = "")]
        username: String,
        #[arg(long, env = "REGISTRY_PASSWORD", hide_env_values = true, default_value = "")]
        password: String,
        /// Registry server address for authentication
        #[arg(long, default_value = "")]
        server: String,
        services: Vec<String>,
    },
    /// Run a command in a running service container
    Exec {
        service: String,
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
}

impl Commands {
    pub fn settings(&self) -> StackSettings {
        match self {
            Commands::Start { flags, .. }
            | Commands::Restart { flags, .. }
            | Commands::Build { flags, .. } => flags.settings(),
            _ => StackSettings::default(),
        }
    }
}

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Entries of the fixed service catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceKind {
    Cardinal,
    Nakama,
    NakamaDb,
    Redis,
    Evm,
    CelestiaDevnet,
    Jaeger,
    Prometheus,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 8] = [
        ServiceKind::Cardinal,
        ServiceKind::Nakama,
        ServiceKind::NakamaDb,
        ServiceKind::Redis,
        ServiceKind::Evm,
        ServiceKind::CelestiaDevnet,
        ServiceKind::Jaeger,
        ServiceKind::Prometheus,
    ];

    /// Suffix used in container, volume and image names.
    pub fn slug(self) -> &'static str {
        match self {
            ServiceKind::Cardinal => "cardinal",
            ServiceKind::Nakama => "nakama",
            ServiceKind::NakamaDb => "nakama-db",
            ServiceKind::Redis => "redis",
            ServiceKind::Evm => "evm",
            ServiceKind::CelestiaDevnet => "celestia-devnet",
            ServiceKind::Jaeger => "jaeger",
            ServiceKind::Prometheus => "prometheus",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.slug() == slug)
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Everything needed to build a service image from source.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BuildSpec {
    /// Dockerfile text, written at the root of the build context.
    pub dockerfile: String,
    pub target: Option<String>,
    pub args: BTreeMap<String, String>,
    /// Directory whose tree becomes the build context.
    pub context_root: PathBuf,
    /// Environment variable holding a source-hosting token the build needs.
    pub credential_env: Option<String>,
}

impl BuildSpec {
    pub fn is_empty(&self) -> bool {
        self.dockerfile.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub test: Vec<String>,
    pub interval: String,
    pub timeout: String,
    pub retries: u32,
}

impl HealthCheck {
    pub fn interval_duration(&self) -> Duration {
        parse_duration(&self.interval).unwrap_or(Duration::from_secs(1))
    }

    pub fn timeout_duration(&self) -> Duration {
        parse_duration(&self.timeout).unwrap_or(Duration::from_secs(1))
    }
}

/// Parses `250ms`, `5s` or `2m`.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerConfig {
    pub env: BTreeMap<String, String>,
    /// Container ports, e.g. `4040/tcp`.
    pub exposed_ports: Vec<String>,
    pub cap_add: Vec<String>,
    pub entrypoint: Vec<String>,
    pub command: Vec<String>,
    pub healthcheck: Option<HealthCheck>,
}

impl ContainerConfig {
    /// `KEY=VALUE` pairs in key order.
    pub fn env_pairs(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub host_port: u16,
    pub container_port: u16,
}

impl PortBinding {
    pub fn same(port: u16) -> Self {
        Self {
            host_port: port,
            container_port: port,
        }
    }

    pub fn container_key(&self) -> String {
        format!("{}/tcp", self.container_port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    No,
    Always,
    OnFailure,
    #[default]
    UnlessStopped,
}

impl RestartPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            RestartPolicy::No => "no",
            RestartPolicy::Always => "always",
            RestartPolicy::OnFailure => "on-failure",
            RestartPolicy::UnlessStopped => "unless-stopped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mount {
    /// Named volume owned by the stack; removed on purge.
    Volume { name: String, target: String },
    Bind { source: PathBuf, target: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HostConfig {
    pub port_bindings: Vec<PortBinding>,
    pub restart_policy: RestartPolicy,
    pub network: String,
    pub mounts: Vec<Mount>,
    pub security_opt: Vec<String>,
}

impl HostConfig {
    pub fn volume_names(&self) -> impl Iterator<Item = &str> {
        self.mounts.iter().filter_map(|m| match m {
            Mount::Volume { name, .. } => Some(name.as_str()),
            Mount::Bind { .. } => None,
        })
    }
}

/// A named container workload plus its build and runtime descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    /// Container name, unique per stack instance.
    pub name: String,
    pub kind: ServiceKind,
    pub image: String,
    pub build: Option<BuildSpec>,
    pub container: ContainerConfig,
    pub host: HostConfig,
    pub dependencies: Vec<Service>,
}

impl Service {
    pub fn new(name: impl Into<String>, kind: ServiceKind, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            image: image.into(),
            build: None,
            container: ContainerConfig::default(),
            host: HostConfig::default(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_build(mut self, build: BuildSpec) -> Self {
        self.build = Some(build);
        self
    }

    pub fn with_dependency(mut self, dependency: Service) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Build spec, when present and non-empty.
    pub fn build_spec(&self) -> Option<&BuildSpec> {
        self.build.as_ref().filter(|b| !b.is_empty())
    }

    pub fn needs_build(&self) -> bool {
        self.build_spec().is_some()
    }
}

/// Flattens `services` and their dependencies into start order: every
/// dependency precedes its dependents, duplicates (by name) appear once.
pub fn dependency_order(services: &[Service]) -> Vec<&Service> {
    fn visit<'a>(svc: &'a Service, seen: &mut HashSet<&'a str>, out: &mut Vec<&'a Service>) {
        if !seen.insert(svc.name.as_str()) {
            return;
        }
        for dep in &svc.dependencies {
            visit(dep, seen, out);
        }
        out.push(svc);
    }

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for svc in services {
        visit(svc, &mut seen, &mut out);
    }
    out
}

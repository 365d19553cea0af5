use crate::domain::{
    BuildSpec, HealthCheck, Mount, PortBinding, RestartPolicy, Service, ServiceKind,
};
use crate::error::ConfigError;
use crate::infra::config::{NAMESPACE_KEY, StackConfig};
use std::collections::{BTreeMap, HashSet};

const CARDINAL_DOCKERFILE: &str = include_str!("../../dockerfiles/cardinal.Dockerfile");
/// Variant for the legacy builder, which cannot mount build secrets.
const CARDINAL_LEGACY_DOCKERFILE: &str =
    include_str!("../../dockerfiles/cardinal.legacy.Dockerfile");

/// Token the Cardinal build uses to fetch private Go modules.
pub const SOURCE_TOKEN_ENV: &str = "GITHUB_TOKEN";

const CARDINAL_PORT: u16 = 4040;
const CARDINAL_DEBUG_PORT: u16 = 40000;
const REDIS_PORT: u16 = 6379;
const NAKAMA_DB_PORT: u16 = 26257;
const EVM_SEQUENCER_PORT: u16 = 9601;
const CELESTIA_RPC_PORT: u16 = 26658;
const JAEGER_OTLP_PORT: u16 = 4317;

/// Turns the stack configuration into fully defaulted [`Service`] values.
/// Every method is a pure function of the configuration.
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    config: StackConfig,
    namespace: String,
}

impl ServiceRegistry {
    pub fn new(config: StackConfig) -> Result<Self, ConfigError> {
        let namespace = config
            .namespace()
            .ok_or(ConfigError::MissingNamespace)?
            .to_string();
        Ok(Self { config, namespace })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn container_name(&self, kind: ServiceKind) -> String {
        format!("{}-{}", self.namespace, kind.slug())
    }

    /// Describes `kind` with its dependencies resolved transitively.
    pub fn describe(&self, kind: ServiceKind) -> Result<Service, ConfigError> {
        let mut visiting = Vec::new();
        self.describe_inner(kind, &mut visiting)
    }

    pub fn describe_by_name(&self, slug: &str) -> Result<Service, ConfigError> {
        let kind =
            ServiceKind::from_slug(slug).ok_or_else(|| ConfigError::UnknownService(slug.into()))?;
        self.describe(kind)
    }

    /// Describes every kind, appending the telemetry services when telemetry
    /// is enabled. Order is preserved and duplicates dropped.
    pub fn describe_stack(&self, kinds: &[ServiceKind]) -> Result<Vec<Service>, ConfigError> {
        let mut wanted: Vec<ServiceKind> = kinds.to_vec();
        if self.config.telemetry {
            wanted.extend([ServiceKind::Jaeger, ServiceKind::Prometheus]);
        }

        let mut seen = HashSet::new();
        let mut services = Vec::new();
        for kind in wanted {
            if !seen.insert(kind) {
                continue;
            }
            services.push(self.describe(kind)?);
        }
        Ok(services)
    }

    fn describe_inner(
        &self,
        kind: ServiceKind,
        visiting: &mut Vec<ServiceKind>,
    ) -> Result<Service, ConfigError> {
        if visiting.contains(&kind) {
            return Err(ConfigError::DependencyCycle(self.container_name(kind)));
        }
        visiting.push(kind);

        let mut service = self.base(kind)?;
        for dep in self.dependency_kinds(kind) {
            service.dependencies.push(self.describe_inner(dep, visiting)?);
        }

        visiting.pop();
        Ok(service)
    }

    fn dependency_kinds(&self, kind: ServiceKind) -> Vec<ServiceKind> {
        let mut deps = match kind {
            ServiceKind::Cardinal => vec![ServiceKind::Redis],
            ServiceKind::Nakama => vec![ServiceKind::NakamaDb, ServiceKind::Cardinal],
            ServiceKind::Evm if self.config.dev_da => vec![ServiceKind::CelestiaDevnet],
            _ => Vec::new(),
        };
        if self.config.telemetry && matches!(kind, ServiceKind::Cardinal | ServiceKind::Nakama) {
            deps.push(ServiceKind::Jaeger);
        }
        deps
    }

    fn base(&self, kind: ServiceKind) -> Result<Service, ConfigError> {
        let mut service = match kind {
            ServiceKind::Cardinal => self.cardinal(),
            ServiceKind::Nakama => self.nakama()?,
            ServiceKind::NakamaDb => self.nakama_db()?,
            ServiceKind::Redis => self.redis(),
            ServiceKind::Evm => self.evm()?,
            ServiceKind::CelestiaDevnet => self.celestia_devnet(),
            ServiceKind::Jaeger => self.jaeger(),
            ServiceKind::Prometheus => self.prometheus(),
        };

        service.host.network = self.namespace.clone();
        service.host.restart_policy = RestartPolicy::UnlessStopped;
        for binding in &service.host.port_bindings {
            let key = binding.container_key();
            if !service.container.exposed_ports.contains(&key) {
                service.container.exposed_ports.push(key);
            }
        }
        Ok(service)
    }

    fn service(&self, kind: ServiceKind, default_image: &str) -> Service {
        let override_key = format!("{}_IMAGE", kind.slug().replace('-', "_").to_uppercase());
        let image = self
            .config
            .get(&override_key)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(default_image);
        Service::new(self.container_name(kind), kind, image)
    }

    fn require(&self, kind: ServiceKind, key: &str) -> Result<String, ConfigError> {
        self.config
            .get(key)
            .map(str::to_string)
            .ok_or_else(|| ConfigError::MissingEnv {
                service: self.container_name(kind),
                key: key.to_string(),
            })
    }

    fn or_default(&self, key: &str, default: &str) -> String {
        self.config.get(key).unwrap_or(default).to_string()
    }

    fn passthrough(&self, env: &mut BTreeMap<String, String>, prefixes: &[&str]) {
        for (key, value) in &self.config.env {
            if prefixes.iter().any(|p| key.starts_with(p)) {
                env.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
    }

    fn volume(&self, kind: ServiceKind, target: &str) -> Mount {
        Mount::Volume {
            name: format!("{}-data", self.container_name(kind)),
            target: target.to_string(),
        }
    }

    fn cardinal(&self) -> Service {
        let kind = ServiceKind::Cardinal;
        let ns = &self.namespace;
        let mut svc = Service::new(self.container_name(kind), kind, format!("{ns}-cardinal:latest"));

        let target = if self.config.debug { "runtime-debug" } else { "runtime" };
        let dockerfile = if self.config.buildkit {
            CARDINAL_DOCKERFILE
        } else {
            CARDINAL_LEGACY_DOCKERFILE
        };
        svc.build = Some(BuildSpec {
            dockerfile: dockerfile.to_string(),
            target: Some(target.to_string()),
            args: BTreeMap::from([("SOURCE_PATH".to_string(), self.config.game_dir.clone())]),
            context_root: self.config.root_dir.clone(),
            credential_env: Some(SOURCE_TOKEN_ENV.to_string()),
        });

        let env = &mut svc.container.env;
        env.insert(NAMESPACE_KEY.into(), ns.clone());
        env.insert("REDIS_ADDRESS".into(), format!("{ns}-redis:{REDIS_PORT}"));
        env.insert(
            "BASE_SHARD_SEQUENCER_ADDRESS".into(),
            format!("{ns}-evm:{EVM_SEQUENCER_PORT}"),
        );
        self.passthrough(env, &["CARDINAL_", "REDIS_PASSWORD", "BASE_SHARD_ROUTER_KEY", "TELEMETRY_"]);
        if self.config.telemetry {
            env.insert("TELEMETRY_TRACE_ENABLED".into(), "true".into());
            env.insert(
                "TELEMETRY_JAEGER_ADDR".into(),
                format!("{ns}-jaeger:{JAEGER_OTLP_PORT}"),
            );
        }

        svc.host.port_bindings.push(PortBinding::same(CARDINAL_PORT));
        if self.config.debug {
            svc.host.port_bindings.push(PortBinding::same(CARDINAL_DEBUG_PORT));
            svc.container.cap_add.push("SYS_PTRACE".into());
            svc.host.security_opt.push("seccomp=unconfined".into());
        }
        svc
    }

    fn nakama(&self) -> Result<Service, ConfigError> {
        let kind = ServiceKind::Nakama;
        let ns = &self.namespace;
        let password = self.require(kind, "DB_PASSWORD")?;
        let queue = self.or_default("OUTGOING_QUEUE_SIZE", "64");
        let mut svc = self.service(kind, "heroiclabs/nakama:3.22.0");

        let db = format!("root:{password}@{ns}-nakama-db:{NAKAMA_DB_PORT}/nakama");
        svc.container.entrypoint = vec!["/bin/sh".into(), "-ec".into()];
        svc.container.command = vec![format!(
            "/nakama/nakama migrate up --database.address {db} && \
             exec /nakama/nakama --config /nakama/data/local.yml \
             --database.address {db} --socket.outgoing_queue_size={queue}"
        )];

        let env = &mut svc.container.env;
        env.insert("CARDINAL_CONTAINER".into(), self.container_name(ServiceKind::Cardinal));
        env.insert("CARDINAL_ADDR".into(), format!("{ns}-cardinal:{CARDINAL_PORT}"));
        env.insert(NAMESPACE_KEY.into(), ns.clone());
        env.insert("DB_PASSWORD".into(), password);
        env.insert("ENABLE_ALLOWLIST".into(), self.or_default("ENABLE_ALLOWLIST", "false"));
        env.insert("OUTGOING_QUEUE_SIZE".into(), queue);
        self.passthrough(env, &["NAKAMA_"]);
        if self.config.telemetry {
            env.insert("TRACE_ENABLED".into(), "true".into());
            env.insert("JAEGER_ADDR".into(), format!("{ns}-jaeger:{JAEGER_OTLP_PORT}"));
            env.insert("JAEGER_SAMPLE_RATE".into(), self.or_default("JAEGER_SAMPLE_RATE", "0.6"));
        }

        svc.host.port_bindings = [7349, 7350, 7351].into_iter().map(PortBinding::same).collect();
        svc.container.healthcheck = Some(HealthCheck {
            test: vec!["CMD".into(), "/nakama/nakama".into(), "healthcheck".into()],
            interval: "5s".into(),
            timeout: "3s".into(),
            retries: 5,
        });
        Ok(svc)
    }

    fn nakama_db(&self) -> Result<Service, ConfigError> {
        let kind = ServiceKind::NakamaDb;
        let password = self.require(kind, "DB_PASSWORD")?;
        let mut svc = self.service(kind, "cockroachdb/cockroach:latest-v23.1");

        svc.container.command = vec![
            "start-single-node".into(),
            "--insecure".into(),
            "--store=attrs=ssd,path=/var/lib/cockroach/".into(),
        ];
        let env = &mut svc.container.env;
        env.insert("COCKROACH_DATABASE".into(), "nakama".into());
        env.insert("COCKROACH_USER".into(), "root".into());
        env.insert("COCKROACH_PASSWORD".into(), password);

        svc.host.port_bindings = vec![PortBinding::same(NAKAMA_DB_PORT), PortBinding::same(8080)];
        svc.host.mounts.push(self.volume(kind, "/var/lib/cockroach"));
        svc.container.healthcheck = Some(HealthCheck {
            test: vec![
                "CMD".into(),
                "curl".into(),
                "-f".into(),
                "http://localhost:8080/health?ready=1".into(),
            ],
            interval: "3s".into(),
            timeout: "3s".into(),
            retries: 5,
        });
        Ok(svc)
    }

    fn redis(&self) -> Service {
        let kind = ServiceKind::Redis;
        let mut svc = self.service(kind, "redis:latest");

        if let Some(password) = self.config.get("REDIS_PASSWORD").filter(|p| !p.is_empty()) {
            svc.container.command = vec![
                "redis-server".into(),
                "--requirepass".into(),
                password.to_string(),
            ];
        }
        svc.host.port_bindings.push(PortBinding::same(REDIS_PORT));
        svc.host.mounts.push(self.volume(kind, "/data"));
        svc
    }

    fn evm(&self) -> Result<Service, ConfigError> {
        let kind = ServiceKind::Evm;
        let ns = &self.namespace;
        let router_key = self.require(kind, "BASE_SHARD_ROUTER_KEY")?;
        let da_namespace = self.require(kind, "DA_NAMESPACE_ID")?;
        let (da_url, da_token) = if self.config.dev_da {
            (
                format!("http://{ns}-celestia-devnet:{CELESTIA_RPC_PORT}"),
                self.or_default("DA_AUTH_TOKEN", ""),
            )
        } else {
            (
                self.require(kind, "DA_BASE_URL")?,
                self.require(kind, "DA_AUTH_TOKEN")?,
            )
        };

        let mut svc = self.service(kind, "ghcr.io/argus-labs/world-engine-evm:1.4.1");
        let env = &mut svc.container.env;
        env.insert("DA_BASE_URL".into(), da_url);
        env.insert("DA_AUTH_TOKEN".into(), da_token);
        env.insert("DA_NAMESPACE_ID".into(), da_namespace);
        env.insert("BASE_SHARD_ROUTER_KEY".into(), router_key);
        env.insert("FAUCET_ENABLED".into(), self.or_default("FAUCET_ENABLED", "false"));
        self.passthrough(env, &["FAUCET_", "CHAIN_"]);

        svc.host.port_bindings = [1317, 26657, 9090, EVM_SEQUENCER_PORT, 8545]
            .into_iter()
            .map(PortBinding::same)
            .collect();
        Ok(svc)
    }

    fn celestia_devnet(&self) -> Service {
        let mut svc = self.service(
            ServiceKind::CelestiaDevnet,
            "ghcr.io/rollkit/local-celestia-devnet:latest",
        );
        svc.host.port_bindings = vec![PortBinding::same(CELESTIA_RPC_PORT), PortBinding::same(26659)];
        svc.container.healthcheck = Some(HealthCheck {
            test: vec![
                "CMD".into(),
                "curl".into(),
                "-f".into(),
                "http://127.0.0.1:26659/head".into(),
            ],
            interval: "1s".into(),
            timeout: "1s".into(),
            retries: 20,
        });
        svc
    }

    fn jaeger(&self) -> Service {
        let mut svc = self.service(ServiceKind::Jaeger, "jaegertracing/all-in-one:1.61.0");
        svc.container
            .env
            .insert("COLLECTOR_OTLP_ENABLED".into(), "true".into());
        svc.host.port_bindings = [16686, JAEGER_OTLP_PORT, 4318]
            .into_iter()
            .map(PortBinding::same)
            .collect();
        svc
    }

    fn prometheus(&self) -> Service {
        let kind = ServiceKind::Prometheus;
        let mut svc = self.service(kind, "prom/prometheus:v2.54.1");
        svc.container.command = vec![
            "--config.file=/etc/prometheus/prometheus.yml".into(),
            "--storage.tsdb.path=/prometheus".into(),
        ];
        // 9090 belongs to the EVM gRPC endpoint
        svc.host.port_bindings.push(PortBinding {
            host_port: 9091,
            container_port: 9090,
        });
        svc.host.mounts.push(self.volume(kind, "/prometheus"));
        svc
    }
}

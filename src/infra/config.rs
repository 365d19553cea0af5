use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_STACK_FILE: &str = "world.toml";
pub const NAMESPACE_KEY: &str = "CARDINAL_NAMESPACE";

/// Flags from the `[stack]` table. Every field is optional so CLI flags can
/// be merged on top.
#[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct StackSettings {
    pub root_dir: Option<PathBuf>,
    pub game_dir: Option<String>,
    pub detach: Option<bool>,
    pub build: Option<bool>,
    pub debug: Option<bool>,
    pub dev_da: Option<bool>,
    pub telemetry: Option<bool>,
    pub buildkit: Option<bool>,
    /// Seconds to wait for detached containers to become ready.
    pub wait_timeout: Option<u64>,
}

#[derive(Deserialize, Debug, Default)]
struct StackFile {
    #[serde(default)]
    stack: StackSettings,
}

/// Resolved stack configuration: flags plus the flattened key/value map every
/// service descriptor reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackConfig {
    pub root_dir: PathBuf,
    pub game_dir: String,
    pub detach: bool,
    pub build: bool,
    pub debug: bool,
    pub dev_da: bool,
    pub telemetry: bool,
    pub buildkit: bool,
    pub wait_timeout: Option<Duration>,
    pub env: BTreeMap<String, String>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            game_dir: "cardinal".to_string(),
            detach: false,
            build: false,
            debug: false,
            dev_da: true,
            telemetry: false,
            buildkit: false,
            wait_timeout: None,
            env: BTreeMap::new(),
        }
    }
}

impl StackConfig {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    /// Namespace scoping every container and network, if configured.
    pub fn namespace(&self) -> Option<&str> {
        self.get(NAMESPACE_KEY).map(str::trim).filter(|ns| !ns.is_empty())
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Directory holding the game shard sources.
    pub fn game_path(&self) -> PathBuf {
        self.root_dir.join(&self.game_dir)
    }

    pub fn apply(&mut self, settings: StackSettings) {
        if let Some(dir) = settings.root_dir {
            let expanded = shellexpand::tilde(dir.to_string_lossy().as_ref()).into_owned();
            self.root_dir = PathBuf::from(expanded);
        }
        if let Some(dir) = settings.game_dir {
            self.game_dir = dir;
        }
        if let Some(v) = settings.detach {
            self.detach = v;
        }
        if let Some(v) = settings.build {
            self.build = v;
        }
        if let Some(v) = settings.debug {
            self.debug = v;
        }
        if let Some(v) = settings.dev_da {
            self.dev_da = v;
        }
        if let Some(v) = settings.telemetry {
            self.telemetry = v;
        }
        if let Some(v) = settings.buildkit {
            self.buildkit = v;
        }
        if let Some(secs) = settings.wait_timeout {
            self.wait_timeout = Some(Duration::from_secs(secs));
        }
    }

    /// Parses a stack file. `[stack]` holds flags; every other table is
    /// flattened into the key/value map. `base_dir` anchors a relative
    /// `root_dir`.
    pub fn from_toml_str(content: &str, base_dir: &Path) -> Result<Self, String> {
        let file: StackFile = toml::from_str(content).map_err(|e| e.to_string())?;
        let table: toml::Table = toml::from_str(content).map_err(|e| e.to_string())?;

        let mut config = StackConfig {
            root_dir: base_dir.to_path_buf(),
            ..Default::default()
        };

        let mut settings = file.stack;
        if let Some(dir) = settings.root_dir.take() {
            let expanded = PathBuf::from(
                shellexpand::tilde(dir.to_string_lossy().as_ref()).into_owned(),
            );
            settings.root_dir = Some(base_dir.join(expanded));
        }
        config.apply(settings);

        for (section, value) in table {
            if section == "stack" {
                continue;
            }
            match value {
                toml::Value::Table(entries) => {
                    for (key, value) in entries {
                        insert_scalar(&mut config.env, &section, key, value);
                    }
                }
                scalar => insert_scalar(&mut config.env, "", section, scalar),
            }
        }

        Ok(config)
    }
}

fn insert_scalar(env: &mut BTreeMap<String, String>, section: &str, key: String, value: toml::Value) {
    let text = match value {
        toml::Value::String(s) => s,
        toml::Value::Integer(i) => i.to_string(),
        toml::Value::Float(f) => f.to_string(),
        toml::Value::Boolean(b) => b.to_string(),
        other => {
            warn!("ignoring non-scalar key {key} in [{section}]: {}", other.type_str());
            return;
        }
    };

    if let Some(previous) = env.insert(key.clone(), text) {
        debug!("key {key} from [{section}] overrides earlier value {previous:?}");
    }
}

/// Loads the stack file at `path`. A missing file is an error; the caller
/// decides whether to fall back to defaults.
pub fn load_stack_config(path: &Path) -> Result<StackConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|e| ConfigError::Load {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    StackConfig::from_toml_str(&content, &base_dir).map_err(|message| ConfigError::Load {
        path: path.to_path_buf(),
        message,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Stopped,
    NotCreated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerHealthStatus {
    Healthy,
    Unhealthy,
    Starting,
    NotApplicable, // No healthcheck configured
}

#[derive(Debug, Clone)]
pub struct Container {
    pub name: String,
    pub state: ContainerState,
    pub health: ContainerHealthStatus,
}

impl Container {
    pub fn new(name: impl Into<String>, state: ContainerState) -> Self {
        Self {
            name: name.into(),
            state,
            health: ContainerHealthStatus::NotApplicable,
        }
    }

    pub fn not_created(name: impl Into<String>) -> Self {
        Self::new(name, ContainerState::NotCreated)
    }

    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }

    /// Running and either healthy or without a healthcheck.
    pub fn is_ready(&self) -> bool {
        self.is_running()
            && matches!(
                self.health,
                ContainerHealthStatus::Healthy | ContainerHealthStatus::NotApplicable
            )
    }
}

/// Container exit codes produced by an interrupt, SIGKILL or SIGTERM.
const GRACEFUL_EXIT_CODES: [i64; 3] = [130, 137, 143];

/// True when a foreground container exit should not be reported as a failure.
pub fn is_graceful_exit(code: i64) -> bool {
    code == 0 || GRACEFUL_EXIT_CODES.contains(&code)
}

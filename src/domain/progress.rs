use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    Building,
    Pulling,
    Pushing,
    Built,
}

impl ProgressState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProgressState::Building => "building",
            ProgressState::Pulling => "pulling",
            ProgressState::Pushing => "pushing",
            ProgressState::Built => "built",
        }
    }
}

impl fmt::Display for ProgressState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Icon {
    Working,
    Success,
    Failure,
}

impl Icon {
    pub fn glyph(self) -> &'static str {
        match self {
            Icon::Working => "…",
            Icon::Success => "✔",
            Icon::Failure => "✘",
        }
    }
}

/// One update for the progress presenter, keyed by image name.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressMessage {
    pub name: String,
    /// Resource type; always `image` for the acquisition pipeline.
    pub kind: &'static str,
    pub state: ProgressState,
    pub detail: String,
    /// Percentage for transfers, when known.
    pub percent: Option<u8>,
    pub done: bool,
    pub icon: Icon,
}

impl ProgressMessage {
    pub fn image(name: impl Into<String>, state: ProgressState, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: "image",
            state,
            detail: detail.into(),
            percent: None,
            done: false,
            icon: Icon::Working,
        }
    }

    pub fn with_percent(mut self, percent: u8) -> Self {
        self.percent = Some(percent);
        self
    }

    pub fn finished(mut self, icon: Icon) -> Self {
        self.done = true;
        self.icon = icon;
        self
    }
}

/// Destination for progress messages. Implementations serialize delivery,
/// workers never touch each other's progress state.
pub trait ProgressSink: Send + Sync {
    fn send(&self, message: ProgressMessage);
}

/// Per-image transfer percentage computed from cumulative layer byte counters.
/// The value never decreases.
#[derive(Debug, Default, Clone)]
pub struct PullProgress {
    layers: HashMap<String, (u64, u64)>,
    percent: u8,
}

impl PullProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    /// Records `current/total` bytes for a layer. Returns the new percentage
    /// only when it increased; missing or nonsensical counters are ignored.
    pub fn update(&mut self, layer: Option<&str>, current: Option<i64>, total: Option<i64>) -> Option<u8> {
        let (Some(current), Some(total)) = (current, total) else {
            return None;
        };
        if total <= 0 || current < 0 {
            return None;
        }
        let layer = layer.unwrap_or_default().to_string();
        let current = (current as u64).min(total as u64);
        self.layers.insert(layer, (current, total as u64));

        let (done, all) = self
            .layers
            .values()
            .fold((0u64, 0u64), |(d, a), (c, t)| (d + c, a + t));
        let computed = ((done as f64 / all as f64) * 100.0).floor() as u8;
        self.raise(computed.min(100))
    }

    /// Marks the transfer as finished.
    pub fn complete(&mut self) -> Option<u8> {
        self.raise(100)
    }

    fn raise(&mut self, candidate: u8) -> Option<u8> {
        if candidate > self.percent {
            self.percent = candidate;
            Some(candidate)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_never_regresses() {
        let mut progress = PullProgress::new();
        assert_eq!(progress.update(Some("a"), Some(50), Some(100)), Some(50));
        // stale resend
        assert_eq!(progress.update(Some("a"), Some(20), Some(100)), None);
        assert_eq!(progress.percent(), 50);
        assert_eq!(progress.update(Some("a"), Some(90), Some(100)), Some(90));
    }

    #[test]
    fn test_progress_aggregates_layers() {
        let mut progress = PullProgress::new();
        progress.update(Some("a"), Some(100), Some(100));
        // second layer appears; ratio drops to 100/300 but value is held
        assert_eq!(progress.update(Some("b"), Some(0), Some(200)), None);
        assert_eq!(progress.percent(), 100);
    }

    #[test]
    fn test_missing_counters_are_not_updates() {
        let mut progress = PullProgress::new();
        assert_eq!(progress.update(Some("a"), None, Some(10)), None);
        assert_eq!(progress.update(Some("a"), Some(5), None), None);
        assert_eq!(progress.update(Some("a"), Some(5), Some(0)), None);
        assert_eq!(progress.percent(), 0);
    }

    #[test]
    fn test_complete_reaches_hundred_once() {
        let mut progress = PullProgress::new();
        assert_eq!(progress.complete(), Some(100));
        assert_eq!(progress.complete(), None);
    }
}

use crate::domain::{ProgressMessage, ProgressSink, ProgressState};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Renders progress messages. Owned by a single task, so implementations
/// need no locking of their own.
pub trait Presenter: Send {
    fn present(&mut self, message: &ProgressMessage);

    fn finish(&mut self) {}
}

/// Plain log writer. Step and state changes, and transfers crossing a 10%
/// mark, are logged at `info`; everything else at `debug`.
#[derive(Debug, Default)]
pub struct LogPresenter {
    last: HashMap<String, (ProgressState, String, Option<u8>)>,
}

impl LogPresenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `message` says something the last line for its image did not.
    fn is_news(&mut self, message: &ProgressMessage) -> bool {
        let seen = (
            message.state,
            message.detail.clone(),
            message.percent.map(|p| p / 10),
        );
        self.last.insert(message.name.clone(), seen.clone()) != Some(seen)
    }
}

impl Presenter for LogPresenter {
    fn present(&mut self, message: &ProgressMessage) {
        let news = self.is_news(message);
        if message.done {
            info!(
                "{} {} {} {}",
                message.icon.glyph(),
                message.name,
                message.state,
                message.detail
            );
            return;
        }

        let line = match message.percent {
            Some(percent) => format!("{} {percent}%", message.detail),
            None => message.detail.clone(),
        };
        if news {
            info!("{} {} {}", message.name, message.state, line);
        } else {
            debug!("{} {} {}", message.name, message.state, line);
        }
    }
}

/// Interactive renderer: one bar per image.
pub struct TerminalPresenter {
    multi: MultiProgress,
    bars: HashMap<String, ProgressBar>,
    style: ProgressStyle,
}

impl TerminalPresenter {
    pub fn new() -> Self {
        let style = ProgressStyle::default_bar()
            .template("{prefix:.bold} [{bar:30.cyan/blue}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
            style,
        }
    }

    fn bar(&mut self, name: &str) -> &ProgressBar {
        let multi = &self.multi;
        let style = &self.style;
        self.bars.entry(name.to_string()).or_insert_with(|| {
            let bar = multi.add(ProgressBar::new(100));
            bar.set_style(style.clone());
            bar.set_prefix(name.to_string());
            bar
        })
    }
}

impl Default for TerminalPresenter {
    fn default() -> Self {
        Self::new()
    }
}

impl Presenter for TerminalPresenter {
    fn present(&mut self, message: &ProgressMessage) {
        let bar = self.bar(&message.name);
        if let Some(percent) = message.percent {
            bar.set_position(u64::from(percent));
        }
        let text = format!("{} {}: {}", message.icon.glyph(), message.state, message.detail);
        if message.done {
            bar.finish_with_message(text);
        } else {
            bar.set_message(text);
        }
    }

    fn finish(&mut self) {
        for bar in self.bars.values().filter(|b| !b.is_finished()) {
            bar.abandon();
        }
    }
}

enum HubMessage {
    Update(ProgressMessage),
    Shutdown,
}

/// Channel-backed [`ProgressSink`]. Workers send; one task presents.
#[derive(Debug, Clone)]
pub struct ProgressHub {
    tx: mpsc::UnboundedSender<HubMessage>,
}

impl std::fmt::Debug for HubMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HubMessage::Update(m) => f.debug_tuple("Update").field(m).finish(),
            HubMessage::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Handle to the presenter task.
pub struct ProgressTask {
    tx: mpsc::UnboundedSender<HubMessage>,
    join: JoinHandle<()>,
}

impl ProgressHub {
    pub fn spawn(mut presenter: Box<dyn Presenter>) -> (ProgressHub, ProgressTask) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let join = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    HubMessage::Update(update) => presenter.present(&update),
                    HubMessage::Shutdown => break,
                }
            }
            presenter.finish();
        });

        (ProgressHub { tx: tx.clone() }, ProgressTask { tx, join })
    }
}

impl ProgressSink for ProgressHub {
    fn send(&self, message: ProgressMessage) {
        // receiver only goes away after shutdown
        let _ = self.tx.send(HubMessage::Update(message));
    }
}

impl ProgressTask {
    /// Drains pending messages and stops the presenter.
    pub async fn shutdown(self) {
        let _ = self.tx.send(HubMessage::Shutdown);
        if let Err(e) = self.join.await {
            warn!("progress presenter stopped abnormally: {e}");
        }
    }
}

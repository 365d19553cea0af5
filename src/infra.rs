pub mod archive;
pub mod buildx;
pub mod config;
pub mod docker_adapter;
pub mod progress;

pub use docker_adapter::DockerEngine;
pub use progress::{LogPresenter, Presenter, ProgressHub, ProgressTask, TerminalPresenter};

//! Control-plane access: declaration reads and writes plus the watch feed.

mod client;
mod store;
mod watch;

pub use client::{KubeClient, KubeConfig, KubeError, KIND, PLURAL};
pub use watch::{KubeWatchSource, DEFAULT_WATCH_TIMEOUT};

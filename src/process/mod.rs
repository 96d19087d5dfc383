//! Process-level collaborators of the loader
//!
//! - Process roles: which kind of process is initializing native code
//! - Application context: installed-package metadata
//! - Command line: pre-native switch storage and its hand-off to native
//! - Task runners: where best-effort background work is posted

mod command_line;
mod context;
mod task_runner;

pub use command_line::{CommandLine, switches};
pub use context::{ApplicationContext, ApplicationInfo, StaticContext};
pub use task_runner::{InlineTaskRunner, TaskRunner, ThreadTaskRunner, TokioTaskRunner};

use std::fmt;

/// Process roles native code can be initialized for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessType {
    /// Not yet known
    Uninitialized,
    /// Main browser process
    Browser,
    /// Sandboxed child (renderer, GPU, utility)
    Child,
    /// Embedder process hosting a WebView
    WebView,
    /// Child process spawned for a WebView
    WebViewChild,
    /// Embedder process hosting WebLayer
    WebLayer,
    /// Child process spawned for WebLayer
    WebLayerChild,
}

impl ProcessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessType::Uninitialized => "Uninitialized",
            ProcessType::Browser => "Browser",
            ProcessType::Child => "Child",
            ProcessType::WebView => "WebView",
            ProcessType::WebViewChild => "WebViewChild",
            ProcessType::WebLayer => "WebLayer",
            ProcessType::WebLayerChild => "WebLayerChild",
        }
    }

    /// Value handed across the native boundary
    pub fn as_raw(&self) -> i32 {
        match self {
            ProcessType::Uninitialized => 0,
            ProcessType::Browser => 1,
            ProcessType::Child => 2,
            ProcessType::WebView => 3,
            ProcessType::WebViewChild => 4,
            ProcessType::WebLayer => 5,
            ProcessType::WebLayerChild => 6,
        }
    }

    /// Whether this is the full browser process
    pub fn is_browser(&self) -> bool {
        matches!(self, ProcessType::Browser)
    }
}

impl fmt::Display for ProcessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProcessType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "browser" => Ok(ProcessType::Browser),
            "child" | "renderer" => Ok(ProcessType::Child),
            "webview" => Ok(ProcessType::WebView),
            "webview-child" => Ok(ProcessType::WebViewChild),
            "weblayer" => Ok(ProcessType::WebLayer),
            "weblayer-child" => Ok(ProcessType::WebLayerChild),
            other => Err(format!("unknown process type: {other}")),
        }
    }
}

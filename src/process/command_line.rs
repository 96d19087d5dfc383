//! Process command line before and after native code is available
//!
//! Until native code is loaded, switches are kept on this side. The loader
//! hands them to native exactly once; from then on the native command line
//! is authoritative.

use log::debug;
use parking_lot::Mutex;

use crate::loader::NativeBridge;

/// Well-known switch names
pub mod switches {
    /// Turns on the reached-code profiler in the browser process
    pub const ENABLE_REACHED_CODE_PROFILER: &str = "enable-reached-code-profiler";
}

#[derive(Debug, Default)]
struct CommandLineState {
    switches: Vec<String>,
    native: bool,
}

/// Process command line
#[derive(Debug, Default)]
pub struct CommandLine {
    state: Mutex<CommandLineState>,
}

impl CommandLine {
    /// Create an empty command line
    pub fn new() -> Self {
        Self::default()
    }

    /// Create from process arguments, keeping only `--switch[=value]` entries
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let switches = args
            .into_iter()
            .filter_map(|arg| arg.as_ref().strip_prefix("--").map(str::to_string))
            .filter(|s| !s.is_empty())
            .collect();
        Self {
            state: Mutex::new(CommandLineState {
                switches,
                native: false,
            }),
        }
    }

    /// Append a switch (without the leading dashes)
    pub fn append_switch(&self, name: &str) {
        let mut state = self.state.lock();
        if state.native {
            debug!(target: "LibraryLoader", "switch --{name} appended after native hand-off");
        }
        state.switches.push(name.to_string());
    }

    /// Check whether a switch is present
    pub fn has_switch(&self, name: &str) -> bool {
        self.state
            .lock()
            .switches
            .iter()
            .any(|s| s == name || s.split_once('=').is_some_and(|(key, _)| key == name))
    }

    /// Snapshot of all switches
    pub fn switches(&self) -> Vec<String> {
        self.state.lock().switches.clone()
    }

    /// Hand the switches over to native code.
    ///
    /// Returns `false` if this already happened; the bridge is not called again.
    pub fn enable_native_proxy(&self, bridge: &dyn NativeBridge) -> bool {
        let mut state = self.state.lock();
        if state.native {
            return false;
        }
        let argv: Vec<String> = state.switches.iter().map(|s| format!("--{s}")).collect();
        bridge.enable_native_command_line(&argv);
        state.native = true;
        true
    }

    /// Whether native code owns the command line
    pub fn is_native(&self) -> bool {
        self.state.lock().native
    }
}

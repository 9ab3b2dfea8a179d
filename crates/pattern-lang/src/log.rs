// Log console fed by pattern programs (std::print, std::warning, ...)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        })
    }
}

pub type LogCallback = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

#[derive(Default)]
struct ConsoleState {
    entries: Vec<(LogLevel, String)>,
    callback: Option<LogCallback>,
    debug_enabled: bool,
}

/// Thread-safe sink for program output. Cloning shares the same console.
#[derive(Clone, Default)]
pub struct LogConsole {
    state: Arc<Mutex<ConsoleState>>,
}

impl LogConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_callback(&self, callback: Option<LogCallback>) {
        self.lock().callback = callback;
    }

    pub fn set_debug(&self, enabled: bool) {
        self.lock().debug_enabled = enabled;
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!(target: "pattern_lang::console", "{}", message),
            LogLevel::Info => tracing::info!(target: "pattern_lang::console", "{}", message),
            LogLevel::Warning => tracing::warn!(target: "pattern_lang::console", "{}", message),
            LogLevel::Error => tracing::error!(target: "pattern_lang::console", "{}", message),
        }
        // The callback runs outside the lock so it may log again.
        let callback = {
            let mut state = self.lock();
            if level == LogLevel::Debug && !state.debug_enabled {
                return;
            }
            state.entries.push((level, message.clone()));
            state.callback.clone()
        };
        if let Some(cb) = callback {
            cb(level, &message);
        }
    }

    pub fn entries(&self) -> Vec<(LogLevel, String)> {
        self.lock().entries.clone()
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConsoleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for LogConsole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogConsole")
            .field("entries", &self.lock().entries.len())
            .finish()
    }
}

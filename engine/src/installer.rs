//! Availability check for the external tool.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use ink_ls_types::CompilationSettings;

/// Decides whether the tool named by `settings` can be launched at all.
pub trait ToolInstaller: Send + Sync {
    fn ensure_tool_installed(&self, settings: &CompilationSettings) -> bool;
}

/// Looks the executable up on `PATH` (or at its explicit location).
///
/// Nothing is downloaded. Successful lookups are remembered; failures are
/// retried on the next call so installing the tool needs no restart.
#[derive(Debug, Default)]
pub struct PathToolLocator {
    found: Mutex<HashSet<String>>,
}

impl PathToolLocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn locate(settings: &CompilationSettings) -> bool {
        let executable = settings.inklecate_path.as_str();
        if settings.uses_shim() {
            // Launched as a shim argument, so only its presence matters.
            Path::new(executable).is_file() || which::which(executable).is_ok()
        } else {
            which::which(executable).is_ok()
        }
    }
}

impl ToolInstaller for PathToolLocator {
    fn ensure_tool_installed(&self, settings: &CompilationSettings) -> bool {
        let key = settings.inklecate_path.clone();
        if self
            .found
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&key)
        {
            return true;
        }
        if !Self::locate(settings) {
            tracing::info!(executable = %key, "inklecate is not available");
            return false;
        }
        self.found
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key);
        true
    }
}

//! Source-file filter for workspace mirroring.

use std::collections::BTreeSet;
use std::path::Path;

/// Extensions recognized as story sources when none are configured.
pub const DEFAULT_EXTENSIONS: [&str; 2] = ["ink", "ink2"];

#[derive(Debug, Clone)]
pub struct SourceFilter {
    extensions: BTreeSet<String>,
}

impl Default for SourceFilter {
    fn default() -> Self {
        Self::new(DEFAULT_EXTENSIONS)
    }
}

impl SourceFilter {
    /// Leading dots are ignored, so `".ink"` and `"ink"` are equivalent.
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let extensions = extensions
            .into_iter()
            .map(|e| e.as_ref().trim_start_matches('.').to_string())
            .filter(|e| !e.is_empty())
            .collect();
        Self { extensions }
    }

    pub fn extensions(&self) -> impl Iterator<Item = &str> {
        self.extensions.iter().map(String::as_str)
    }

    /// Extension check alone, without touching the filesystem.
    ///
    /// A file named exactly like an extension (`ink`) has no extension.
    #[must_use]
    pub fn has_source_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.extensions.contains(ext))
    }

    /// Whether `path` takes part in mirroring.
    ///
    /// A missing path is logged and rejected; it is never an error.
    pub async fn is_source_file(&self, path: &Path, allow_directories: bool) -> bool {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!(path = %path.display(), "Skipping unreadable path: {e}");
                return false;
            }
        };
        if metadata.is_dir() {
            return allow_directories;
        }
        self.has_source_extension(path)
    }
}

use std::path::{Path, PathBuf};
use std::{env, fs};

use ink_ls_types::{CompilationSettings, PartialSettings, ShimSetting};
use serde::Deserialize;
use thiserror::Error;

use crate::filter::SourceFilter;

/// Contents of `~/.ink-ls/config.toml`. Every section is optional.
#[derive(Debug, Default, Deserialize)]
pub struct InkLsConfig {
    /// Lowest-precedence settings tier, below anything the client sends.
    pub defaults: Option<PartialSettings>,
    pub mirror: Option<MirrorConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MirrorConfig {
    /// Source extensions copied into scratch directories.
    pub extensions: Option<Vec<String>>,
    /// Parent of the scratch directories. Defaults to the system temp dir.
    pub scratch_dir: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

/// Replace `${VAR}` with the variable's value; unset variables become empty.
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let var = &after[..end];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

fn expand_opt(value: Option<&String>) -> Option<String> {
    value.map(|v| expand_env_vars(v))
}

impl InkLsConfig {
    /// Load the user config. A missing file is `Ok(None)`.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(None),
        }
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {}: {err}", path.display());
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Ok(Some(config)),
            Err(err) => {
                tracing::warn!("Failed to parse config at {}: {err}", path.display());
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    /// Built-in platform defaults overlaid with the `[defaults]` section.
    #[must_use]
    pub fn default_settings(&self) -> CompilationSettings {
        let platform = CompilationSettings::platform_default();
        let Some(defaults) = &self.defaults else {
            return platform;
        };
        let expanded = PartialSettings {
            main_story_path: expand_opt(defaults.main_story_path.as_ref()),
            inklecate_path: expand_opt(defaults.inklecate_path.as_ref()),
            run_through_shim: defaults.run_through_shim.as_ref().map(|shim| match shim {
                ShimSetting::Path(path) => ShimSetting::Path(expand_env_vars(path)),
                other => other.clone(),
            }),
        };
        expanded.resolve(&platform)
    }

    #[must_use]
    pub fn source_filter(&self) -> SourceFilter {
        match self.mirror.as_ref().and_then(|m| m.extensions.as_ref()) {
            Some(extensions) if !extensions.is_empty() => SourceFilter::new(extensions),
            _ => SourceFilter::default(),
        }
    }

    #[must_use]
    pub fn scratch_base(&self) -> PathBuf {
        self.mirror
            .as_ref()
            .and_then(|m| m.scratch_dir.as_deref())
            .map(expand_env_vars)
            .filter(|dir| !dir.trim().is_empty())
            .map_or_else(env::temp_dir, PathBuf::from)
    }
}

pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".ink-ls").join("config.toml"))
}

//! Compilation settings and their layered resolution.
//!
//! Settings reach the server from three tiers: a resource-scoped client
//! setting, the client's initialization options, and a process-wide default.
//! Every tier except the default is a [`PartialSettings`] whose fields may be
//! absent. [`merge_settings`] folds the tiers in precedence order into a
//! fully-resolved [`CompilationSettings`].

use serde::{Deserialize, Serialize};

/// Shim command used when `run_through_shim` is `true` without an explicit path.
pub const DEFAULT_SHIM: &str = "mono";

/// Main story file used when no tier names one.
pub const DEFAULT_MAIN_STORY: &str = "main.ink";

#[cfg(windows)]
pub const DEFAULT_INKLECATE: &str = "inklecate.exe";
#[cfg(not(windows))]
pub const DEFAULT_INKLECATE: &str = "inklecate";

#[derive(Deserialize)]
#[serde(untagged)]
enum RawShim {
    Flag(bool),
    Path(String),
}

/// Whether the external tool must be launched through an intermediate runtime.
///
/// Clients send either a boolean or the shim's own path.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "RawShim", into = "serde_json::Value")]
pub enum ShimSetting {
    Disabled,
    /// Enabled, using [`DEFAULT_SHIM`].
    Enabled,
    /// Enabled, using this executable as the shim.
    Path(String),
}

impl From<RawShim> for ShimSetting {
    fn from(raw: RawShim) -> Self {
        match raw {
            RawShim::Flag(false) => Self::Disabled,
            RawShim::Flag(true) => Self::Enabled,
            RawShim::Path(path) => Self::Path(path),
        }
    }
}

impl From<ShimSetting> for serde_json::Value {
    fn from(shim: ShimSetting) -> Self {
        match shim {
            ShimSetting::Disabled => Self::Bool(false),
            ShimSetting::Enabled => Self::Bool(true),
            ShimSetting::Path(path) => Self::String(path),
        }
    }
}

impl ShimSetting {
    /// An empty path carries no information and is inherited from the next tier.
    fn is_unset(&self) -> bool {
        matches!(self, Self::Path(path) if path.trim().is_empty())
    }

    #[must_use]
    pub fn command(&self) -> Option<&str> {
        match self {
            Self::Disabled => None,
            Self::Enabled => Some(DEFAULT_SHIM),
            Self::Path(path) => Some(path.as_str()),
        }
    }
}

/// One settings tier. Absent or empty fields inherit from the next-lower tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialSettings {
    #[serde(default, alias = "main_story_path", skip_serializing_if = "Option::is_none")]
    pub main_story_path: Option<String>,
    #[serde(
        default,
        alias = "inklecate_path",
        alias = "inklecateExecutablePath",
        skip_serializing_if = "Option::is_none"
    )]
    pub inklecate_path: Option<String>,
    #[serde(
        default,
        alias = "run_through_shim",
        alias = "runThroughMono",
        skip_serializing_if = "Option::is_none"
    )]
    pub run_through_shim: Option<ShimSetting>,
}

fn non_empty(value: Option<&String>) -> Option<&String> {
    value.filter(|v| !v.trim().is_empty())
}

impl PartialSettings {
    /// Field-wise fallback: keep `self`'s value unless it is absent or empty.
    #[must_use]
    pub fn or(&self, lower: &PartialSettings) -> PartialSettings {
        PartialSettings {
            main_story_path: non_empty(self.main_story_path.as_ref())
                .or(lower.main_story_path.as_ref())
                .cloned(),
            inklecate_path: non_empty(self.inklecate_path.as_ref())
                .or(lower.inklecate_path.as_ref())
                .cloned(),
            run_through_shim: self
                .run_through_shim
                .as_ref()
                .filter(|s| !s.is_unset())
                .or(lower.run_through_shim.as_ref())
                .cloned(),
        }
    }

    /// Fill whatever is still missing from fully-resolved defaults.
    #[must_use]
    pub fn resolve(&self, defaults: &CompilationSettings) -> CompilationSettings {
        let shim = match self.run_through_shim.as_ref().filter(|s| !s.is_unset()) {
            Some(shim) => shim.command().map(str::to_string),
            None => defaults.shim.clone(),
        };
        CompilationSettings {
            main_story_path: non_empty(self.main_story_path.as_ref())
                .cloned()
                .unwrap_or_else(|| defaults.main_story_path.clone()),
            inklecate_path: non_empty(self.inklecate_path.as_ref())
                .cloned()
                .unwrap_or_else(|| defaults.inklecate_path.clone()),
            shim,
        }
    }
}

/// Fully-resolved settings for one compile or play cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationSettings {
    /// Main story path, relative to the workspace root.
    pub main_story_path: String,
    /// The `inklecate` executable.
    pub inklecate_path: String,
    /// Shim command the executable is run through, if any.
    pub shim: Option<String>,
}

impl CompilationSettings {
    /// Process-wide defaults derived from the platform.
    #[must_use]
    pub fn platform_default() -> Self {
        Self {
            main_story_path: DEFAULT_MAIN_STORY.to_string(),
            inklecate_path: DEFAULT_INKLECATE.to_string(),
            shim: None,
        }
    }

    #[must_use]
    pub fn uses_shim(&self) -> bool {
        self.shim.is_some()
    }
}

impl Default for CompilationSettings {
    fn default() -> Self {
        Self::platform_default()
    }
}

/// Merge the three tiers: resource-scoped, then initialization options, then defaults.
#[must_use]
pub fn merge_settings(
    resource: Option<&PartialSettings>,
    init_options: Option<&PartialSettings>,
    defaults: &CompilationSettings,
) -> CompilationSettings {
    let empty = PartialSettings::default();
    let resource = resource.unwrap_or(&empty);
    let init_options = init_options.unwrap_or(&empty);
    resource.or(init_options).resolve(defaults)
}

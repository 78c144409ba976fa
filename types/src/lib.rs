//! Core domain types for ink-ls.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer of the server.

#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

mod diagnostic;
mod runtime;
mod settings;

pub use diagnostic::{DiagnosticKind, DiagnosticSeverity, StoryDiagnostic, UnknownKindError};
pub use runtime::{
    Choice, DID_COMPILE_STORY, DidCompileStoryParams, Notification, RUNTIME_CHOICE,
    RUNTIME_END_OF_STORY, RUNTIME_ERROR, RUNTIME_PROMPT, RUNTIME_TAG, RUNTIME_TEXT, RunMode,
    RuntimeEvent,
};
pub use settings::{
    CompilationSettings, DEFAULT_INKLECATE, DEFAULT_MAIN_STORY, DEFAULT_SHIM, PartialSettings,
    ShimSetting, merge_settings,
};

/// Level of a user-visible message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLevel {
    Error = 1,
    Warning = 2,
    Info = 3,
}

/// A workspace folder as reported by the client.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct WorkspaceFolder {
    pub uri: String,
    #[serde(default)]
    pub name: String,
}

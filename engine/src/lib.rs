//! Workspace mirroring and `inklecate` orchestration for ink-ls.
//!
//! This crate owns everything between the editor protocol and the external
//! tool: URI/path translation, scratch mirrors of client workspaces, process
//! supervision, output parsing and the orchestration that ties them together.
//! The editor itself is only seen through [`EditorClient`].

#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

mod client;
mod config;
mod filter;
mod installer;
mod mirror;
mod orchestrator;
mod parser;
pub mod paths;
mod supervisor;

pub use client::{
    ClientFut, DIAGNOSTIC_SOURCE, EditorClient, EditorDiagnostic, Position, Range,
};
pub use config::{ConfigError, InkLsConfig, MirrorConfig, config_path, expand_env_vars};
pub use filter::{DEFAULT_EXTENSIONS, SourceFilter};
pub use installer::{PathToolLocator, ToolInstaller};
pub use mirror::{FileUpdateError, MirrorError, MirrorState, WorkspaceEntry, WorkspaceMirror};
pub use orchestrator::{
    COMMANDS, COMPILE_STORY, CompilationOrchestrator, FileChange, FileChangeKind, KILL_RUNNER,
    OrchestratorError, PLAY_STORY, RunTask, RunTrigger, SELECT_OPTION,
};
pub use parser::{
    END_OF_STORY, LineBuffer, OutputLine, OutputScanner, PROMPT_MARKER, ScanEvent, classify_line,
    strip_bom,
};
pub use paths::{InvalidUriError, PathToUriError};
pub use supervisor::{
    ProcessSupervisor, RunFut, RunHandle, RunRequest, RunnerEvent, StoryRunner, SupervisorError,
};

pub use ink_ls_types;

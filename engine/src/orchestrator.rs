//! Compilation orchestration.
//!
//! Turns editor activity (document edits, watched-file changes, workspace
//! folder changes, commands) into mirror updates and tool runs, and turns run
//! results back into diagnostics and notifications for the editor.
//!
//! Compile requests overlap: each one starts its own process, and whichever
//! finishes last determines what the editor shows. Play requests stop the
//! addressable process first, so at most one interactive session is driven.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ink_ls_types::{
    CompilationSettings, DidCompileStoryParams, MessageLevel, Notification, PartialSettings,
    RunMode, StoryDiagnostic, WorkspaceFolder, merge_settings,
};
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::client::{EditorClient, EditorDiagnostic};
use crate::installer::ToolInstaller;
use crate::mirror::{FileUpdateError, MirrorError, WorkspaceEntry, WorkspaceMirror};
use crate::paths::{self, InvalidUriError};
use crate::supervisor::{RunHandle, RunRequest, RunnerEvent, StoryRunner, SupervisorError};

pub const COMPILE_STORY: &str = "compile-story";
pub const PLAY_STORY: &str = "play-story";
pub const SELECT_OPTION: &str = "select-option";
pub const KILL_RUNNER: &str = "kill-runner";

/// Every command accepted by [`CompilationOrchestrator::execute_command`].
pub const COMMANDS: [&str; 4] = [COMPILE_STORY, PLAY_STORY, SELECT_OPTION, KILL_RUNNER];

const TOOL_ERROR_MESSAGE: &str = "inklecate reported an error. See the ink-ls log for details.";

const UNRECOVERABLE_MESSAGE: &str =
    "ink-ls hit an unrecoverable error while updating its copy of the workspace. \
     See the ink-ls log for details.";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("invalid arguments for {command}: {reason}")]
    InvalidArguments {
        command: &'static str,
        reason: String,
    },
    #[error(transparent)]
    InvalidUri(#[from] InvalidUriError),
    #[error("no workspace folder contains {0}")]
    NoWorkspace(String),
    #[error("inklecate is not available")]
    ToolUnavailable,
    #[error("workspace is not ready, cannot process {document}")]
    NotReady {
        document: String,
        #[source]
        source: MirrorError,
    },
    #[error("main story {} lies outside workspace {root_uri}", path.display())]
    MainStoryOutside { path: PathBuf, root_uri: String },
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

impl OrchestratorError {
    fn level(&self) -> MessageLevel {
        match self {
            Self::NoWorkspace(_) | Self::ToolUnavailable => MessageLevel::Warning,
            _ => MessageLevel::Error,
        }
    }

    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Supervisor(e) => e.user_message(),
            Self::ToolUnavailable => {
                "inklecate could not be found. Install it or set inklecateExecutablePath."
                    .to_string()
            }
            other => other.to_string(),
        }
    }
}

/// What asked for a run. Edits stay quiet when the tool is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTrigger {
    DocumentChange,
    Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChangeKind {
    Created,
    Changed,
    Deleted,
}

/// A watched-file event reported by the editor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub uri: String,
    pub kind: FileChangeKind,
}

/// A started run whose results are being delivered in the background.
#[derive(Debug)]
pub struct RunTask {
    generation: u64,
    mode: RunMode,
    handle: JoinHandle<()>,
}

impl RunTask {
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// Wait until every result of the run has reached the editor.
    pub async fn finished(self) {
        if let Err(e) = self.handle.await {
            tracing::error!("Run consumer task failed: {e}");
        }
    }
}

/// How a run's process ended.
#[derive(Debug, Clone, Copy)]
struct RunExit {
    code: Option<i32>,
    killed: bool,
}

/// State shared with background run consumers.
struct Shared {
    client: Arc<dyn EditorClient>,
    /// Open documents: normalized real path to the URI the editor used.
    open_documents: Mutex<HashMap<PathBuf, String>>,
    /// Per workspace, the URIs whose last published list was non-empty.
    published: Mutex<HashMap<String, HashSet<String>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    async fn consume(self: Arc<Self>, entry: WorkspaceEntry, mut handle: RunHandle) {
        let mode = handle.mode;
        let mut reported_tool_error = false;
        let mut finished = None;
        let mut exit = None;
        while let Some(event) = handle.events.recv().await {
            match event {
                RunnerEvent::Runtime(event) => self.client.notify(Notification::from(&event)),
                RunnerEvent::ToolError(_) => {
                    if !reported_tool_error {
                        self.client.show_message(MessageLevel::Error, TOOL_ERROR_MESSAGE);
                        reported_tool_error = true;
                    }
                }
                RunnerEvent::Finished {
                    diagnostics,
                    artifact,
                } => finished = Some((diagnostics, artifact)),
                RunnerEvent::Exited { code, killed } => {
                    tracing::debug!(
                        generation = handle.generation,
                        ?code,
                        killed,
                        "Run exited"
                    );
                    exit = Some(RunExit { code, killed });
                }
            }
        }

        // Stdout and the exit status arrive from separate tasks, in either order.
        let Some((diagnostics, artifact)) = finished else {
            tracing::warn!(generation = handle.generation, "Run ended without output");
            return;
        };
        self.publish(&entry, &diagnostics);
        if mode == RunMode::Compile && diagnostics.is_empty() {
            self.announce(&entry, exit, artifact.as_deref());
        }
    }

    /// Send `didCompileStory` for a compile that exited cleanly.
    fn announce(&self, entry: &WorkspaceEntry, exit: Option<RunExit>, artifact: Option<&Path>) {
        match exit {
            Some(RunExit {
                code: Some(0),
                killed: false,
            }) => {}
            other => {
                tracing::warn!(
                    exit = ?other,
                    "Compile reported no diagnostics but did not succeed"
                );
                return;
            }
        }
        let Some(artifact) = artifact else {
            tracing::warn!("Compile run finished without an artifact path");
            return;
        };
        match paths::path_to_file_uri(artifact) {
            Ok(story_uri) => {
                tracing::info!(story = %story_uri, "Story compiled");
                self.client
                    .notify(Notification::did_compile_story(&DidCompileStoryParams {
                        workspace_uri: entry.root_uri().to_string(),
                        story_uri: story_uri.to_string(),
                    }));
            }
            Err(e) => tracing::warn!("{e}"),
        }
    }

    /// Publish one list per file: open documents of the workspace, files with
    /// diagnostics, and files that had diagnostics last time.
    fn publish(&self, entry: &WorkspaceEntry, diagnostics: &[StoryDiagnostic]) {
        let open: Vec<(PathBuf, String)> = lock(&self.open_documents)
            .iter()
            .filter(|(path, _)| paths::is_child_path(path, entry.root()))
            .map(|(path, uri)| (path.clone(), uri.clone()))
            .collect();

        let mut by_uri: BTreeMap<String, Vec<EditorDiagnostic>> = BTreeMap::new();
        for (_, uri) in &open {
            by_uri.entry(uri.clone()).or_default();
        }
        for diagnostic in diagnostics {
            let path = paths::normalize_path(diagnostic.path());
            let uri = match open.iter().find(|(open_path, _)| *open_path == path) {
                Some((_, uri)) => uri.clone(),
                None => match paths::path_to_file_uri(&path) {
                    Ok(uri) => uri.to_string(),
                    Err(e) => {
                        tracing::warn!("Dropping diagnostic: {e}");
                        continue;
                    }
                },
            };
            by_uri
                .entry(uri)
                .or_default()
                .push(EditorDiagnostic::from(diagnostic));
        }

        let current: HashSet<String> = by_uri
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(uri, _)| uri.clone())
            .collect();
        let previous = lock(&self.published)
            .insert(entry.root_uri().to_string(), current)
            .unwrap_or_default();
        for uri in previous {
            by_uri.entry(uri).or_default();
        }

        for (uri, list) in by_uri {
            self.client.publish_diagnostics(&uri, list);
        }
    }
}

pub struct CompilationOrchestrator {
    shared: Arc<Shared>,
    runner: Arc<dyn StoryRunner>,
    installer: Arc<dyn ToolInstaller>,
    mirror: Arc<WorkspaceMirror>,
    /// Lowest settings tier.
    defaults: CompilationSettings,
    init_settings: Mutex<Option<PartialSettings>>,
}

impl CompilationOrchestrator {
    pub fn new(
        client: Arc<dyn EditorClient>,
        runner: Arc<dyn StoryRunner>,
        installer: Arc<dyn ToolInstaller>,
        mirror: Arc<WorkspaceMirror>,
        defaults: CompilationSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                client,
                open_documents: Mutex::new(HashMap::new()),
                published: Mutex::new(HashMap::new()),
            }),
            runner,
            installer,
            mirror,
            defaults,
            init_settings: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn mirror(&self) -> &WorkspaceMirror {
        &self.mirror
    }

    pub fn set_initialization_options(&self, settings: Option<PartialSettings>) {
        *lock(&self.init_settings) = settings;
    }

    /// URIs of the documents the editor has open, sorted.
    #[must_use]
    pub fn open_documents(&self) -> Vec<String> {
        let mut uris: Vec<String> = lock(&self.shared.open_documents)
            .values()
            .cloned()
            .collect();
        uris.sort();
        uris
    }

    /// Register folders without mirroring them yet.
    pub fn add_workspace_folders(&self, folders: &[WorkspaceFolder]) {
        for folder in folders {
            if let Err(e) = self.mirror.register(&folder.uri) {
                tracing::warn!("Ignoring workspace folder: {e}");
            }
        }
    }

    /// Mirror every registered workspace, asking the editor for folders if
    /// none are known yet.
    pub async fn mirror_workspaces(&self) {
        if self.mirror.entries().is_empty() {
            self.refresh_workspace_folders().await;
        }
        let uris: Vec<String> = self
            .mirror
            .entries()
            .iter()
            .map(|entry| entry.root_uri().to_string())
            .collect();
        self.mirror_uris(&uris).await;
    }

    async fn mirror_uris(&self, uris: &[String]) {
        for (uri, result) in self.mirror.mirror_all(uris).await {
            match result {
                Ok(entry) => tracing::info!(
                    scratch = ?entry.scratch(),
                    "Workspace {uri} mirrored"
                ),
                Err(e) => tracing::warn!("Failed to mirror workspace {uri}: {e}"),
            }
        }
    }

    pub async fn on_workspace_folders_changed(
        &self,
        added: &[WorkspaceFolder],
        removed: &[WorkspaceFolder],
    ) {
        for folder in removed {
            let entry = self.mirror.entry(&folder.uri);
            if !self.mirror.forget(&folder.uri) {
                continue;
            }
            lock(&self.shared.published).remove(&folder.uri);
            if let Some(scratch) = entry.as_ref().and_then(WorkspaceEntry::scratch)
                && let Err(e) = tokio::fs::remove_dir_all(scratch).await
            {
                tracing::warn!(
                    scratch = %scratch.display(),
                    "Failed to remove scratch directory: {e}"
                );
            }
            tracing::info!("Workspace {} removed", folder.uri);
        }

        self.add_workspace_folders(added);
        let uris: Vec<String> = added.iter().map(|f| f.uri.clone()).collect();
        self.mirror_uris(&uris).await;
    }

    pub async fn on_document_opened(&self, uri: &str, text: &str) -> Option<RunTask> {
        match paths::to_filesystem_path(uri) {
            Ok(path) => {
                lock(&self.shared.open_documents)
                    .insert(paths::normalize_path(&path), uri.to_string());
            }
            Err(e) => {
                tracing::debug!("Not tracking document: {e}");
                return None;
            }
        }
        self.on_document_changed(uri, text).await
    }

    /// Mirror the editor's text for `uri`, then compile its workspace.
    pub async fn on_document_changed(&self, uri: &str, text: &str) -> Option<RunTask> {
        let path = match paths::to_filesystem_path(uri) {
            Ok(path) => paths::normalize_path(&path),
            Err(e) => {
                tracing::debug!("Ignoring change: {e}");
                return None;
            }
        };
        let Some(entry) = self.owning_entry(&path).await else {
            tracing::debug!("No workspace owns {uri}");
            return None;
        };
        if !self.mirror_edit(uri, &path, text, &entry).await {
            return None;
        }
        self.run(Some(uri), RunMode::Compile, RunTrigger::DocumentChange)
            .await
    }

    /// Write `text` into the mirror. A failed write abandons the scratch
    /// directory and mirrors the workspace again before the second attempt.
    async fn mirror_edit(
        &self,
        uri: &str,
        path: &Path,
        text: &str,
        entry: &WorkspaceEntry,
    ) -> bool {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let ready = match self.ready_entry(entry, uri).await {
                Ok(ready) => ready,
                Err(e) => {
                    tracing::error!("Mirror of {} not ready: {e}", entry.root_uri());
                    self.shared.client.show_message(e.level(), &e.user_message());
                    return false;
                }
            };
            match self.mirror.apply_document_edit(path, text, &ready).await {
                Ok(()) => return true,
                Err(e @ FileUpdateError::OutsideWorkspace { .. }) => {
                    tracing::debug!("{e}");
                    return false;
                }
                Err(e) if attempt == 1 => {
                    tracing::warn!("Failed to mirror edit of {uri}, re-mirroring: {e}");
                    if let Some(scratch) = ready.scratch() {
                        self.mirror.mark_stale(ready.root_uri(), scratch);
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to mirror edit of {uri}: {e}");
                    self.shared
                        .client
                        .show_message(MessageLevel::Error, UNRECOVERABLE_MESSAGE);
                    return false;
                }
            }
        }
    }

    /// Forget the document and put the on-disk contents back into the mirror.
    pub async fn on_document_closed(&self, uri: &str) {
        let Ok(path) = paths::to_filesystem_path(uri) else {
            return;
        };
        let path = paths::normalize_path(&path);
        lock(&self.shared.open_documents).remove(&path);

        let Some(entry) = self.mirror.find_owner(&path) else {
            return;
        };
        if entry.scratch().is_none() {
            return;
        }
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            self.mirror.apply_created_file(&path, &entry).await;
        } else {
            self.mirror.apply_deleted_file(&path, &entry).await;
        }
    }

    pub async fn on_files_changed(&self, changes: &[FileChange]) {
        for change in changes {
            let path = match paths::to_filesystem_path(&change.uri) {
                Ok(path) => paths::normalize_path(&path),
                Err(e) => {
                    tracing::debug!("Ignoring file event: {e}");
                    continue;
                }
            };
            let Some(entry) = self
                .mirror
                .find_owner(&path)
                .filter(|entry| entry.scratch().is_some())
            else {
                continue;
            };
            match change.kind {
                FileChangeKind::Changed
                    if lock(&self.shared.open_documents).contains_key(&path) =>
                {
                    // The editor buffer is authoritative while the document is open.
                }
                FileChangeKind::Created | FileChangeKind::Changed => {
                    self.mirror.apply_created_file(&path, &entry).await;
                }
                FileChangeKind::Deleted => self.mirror.apply_deleted_file(&path, &entry).await,
            }
        }
    }

    pub async fn on_files_created(&self, uris: &[String]) {
        let changes: Vec<FileChange> = uris
            .iter()
            .map(|uri| FileChange {
                uri: uri.clone(),
                kind: FileChangeKind::Created,
            })
            .collect();
        self.on_files_changed(&changes).await;
    }

    pub async fn on_files_deleted(&self, uris: &[String]) {
        let changes: Vec<FileChange> = uris
            .iter()
            .map(|uri| FileChange {
                uri: uri.clone(),
                kind: FileChangeKind::Deleted,
            })
            .collect();
        self.on_files_changed(&changes).await;
    }

    /// Compile or play the workspace owning `uri` (the first workspace when
    /// `uri` is `None`). Failures are reported to the editor, not returned.
    pub async fn run(
        &self,
        uri: Option<&str>,
        mode: RunMode,
        trigger: RunTrigger,
    ) -> Option<RunTask> {
        match self.try_run(uri, mode).await {
            Ok(task) => Some(task),
            Err(OrchestratorError::ToolUnavailable) if trigger == RunTrigger::DocumentChange => {
                tracing::info!("inklecate is not available, skipping compile");
                None
            }
            Err(e) => {
                tracing::warn!(mode = mode.as_str(), "Run failed: {e}");
                self.shared.client.show_message(e.level(), &e.user_message());
                None
            }
        }
    }

    async fn try_run(
        &self,
        uri: Option<&str>,
        mode: RunMode,
    ) -> Result<RunTask, OrchestratorError> {
        let (entry, scope_uri) = match uri {
            Some(uri) => {
                let path = paths::normalize_path(&paths::to_filesystem_path(uri)?);
                let entry = self
                    .owning_entry(&path)
                    .await
                    .ok_or_else(|| OrchestratorError::NoWorkspace(uri.to_string()))?;
                (entry, uri.to_string())
            }
            None => {
                let entry = self.first_workspace().await.ok_or_else(|| {
                    OrchestratorError::NoWorkspace("the default story".to_string())
                })?;
                let scope = entry.root_uri().to_string();
                (entry, scope)
            }
        };

        let settings = self.settings_for(&scope_uri).await;
        if !self.installer.ensure_tool_installed(&settings) {
            return Err(OrchestratorError::ToolUnavailable);
        }

        let entry = self.ready_entry(&entry, &scope_uri).await?;
        let real_main = paths::normalize_path(&entry.root().join(&settings.main_story_path));
        let scratch_main = entry.scratch_path_for(&real_main).ok_or_else(|| {
            OrchestratorError::MainStoryOutside {
                path: real_main.clone(),
                root_uri: entry.root_uri().to_string(),
            }
        })?;
        let request = RunRequest {
            settings,
            scratch_main,
            real_main,
        };

        let handle = match mode {
            RunMode::Compile => self.runner.compile(request).await?,
            RunMode::Play => {
                self.runner.stop();
                self.runner.play(request).await?
            }
        };
        let generation = handle.generation;
        let consumer = Arc::clone(&self.shared).consume(entry, handle);
        Ok(RunTask {
            generation,
            mode,
            handle: tokio::spawn(consumer),
        })
    }

    async fn ready_entry(
        &self,
        entry: &WorkspaceEntry,
        document: &str,
    ) -> Result<WorkspaceEntry, OrchestratorError> {
        match self.mirror.ensure_ready(entry.root_uri()).await {
            Ok(ready) => Ok(ready),
            Err(e) => {
                tracing::warn!("Mirror of {} not ready, retrying: {e}", entry.root_uri());
                self.mirror
                    .ensure_ready(entry.root_uri())
                    .await
                    .map_err(|source| OrchestratorError::NotReady {
                        document: document.to_string(),
                        source,
                    })
            }
        }
    }

    async fn settings_for(&self, scope_uri: &str) -> CompilationSettings {
        let resource = self.shared.client.resource_settings(scope_uri).await;
        let init = lock(&self.init_settings).clone();
        merge_settings(resource.as_ref(), init.as_ref(), &self.defaults)
    }

    async fn owning_entry(&self, path: &Path) -> Option<WorkspaceEntry> {
        if let Some(entry) = self.mirror.find_owner(path) {
            return Some(entry);
        }
        if self.refresh_workspace_folders().await {
            self.mirror.find_owner(path)
        } else {
            None
        }
    }

    async fn first_workspace(&self) -> Option<WorkspaceEntry> {
        if let Some(entry) = self.mirror.entries().into_iter().next() {
            return Some(entry);
        }
        self.refresh_workspace_folders().await;
        self.mirror.entries().into_iter().next()
    }

    /// Register whatever folders the editor reports. Returns whether it reported any.
    async fn refresh_workspace_folders(&self) -> bool {
        let Some(folders) = self.shared.client.workspace_folders().await else {
            return false;
        };
        self.add_workspace_folders(&folders);
        !folders.is_empty()
    }

    pub async fn execute_command(
        &self,
        command: &str,
        args: &[Value],
    ) -> Result<Option<RunTask>, OrchestratorError> {
        match command {
            COMPILE_STORY => {
                let uri = uri_argument(COMPILE_STORY, args)?;
                Ok(self
                    .run(uri.as_deref(), RunMode::Compile, RunTrigger::Command)
                    .await)
            }
            PLAY_STORY => {
                let uri = uri_argument(PLAY_STORY, args)?;
                Ok(self
                    .run(uri.as_deref(), RunMode::Play, RunTrigger::Command)
                    .await)
            }
            SELECT_OPTION => {
                let index = index_argument(args)?;
                self.runner.submit_choice(index);
                Ok(None)
            }
            KILL_RUNNER => {
                self.runner.stop();
                Ok(None)
            }
            other => Err(OrchestratorError::UnknownCommand(other.to_string())),
        }
    }
}

/// Optional document URI, given as a string or as `{ "uri": ... }`.
fn uri_argument(
    command: &'static str,
    args: &[Value],
) -> Result<Option<String>, OrchestratorError> {
    match args.first() {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(uri)) => Ok(Some(uri.clone())),
        Some(Value::Object(map)) => match map.get("uri") {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(uri)) => Ok(Some(uri.clone())),
            Some(other) => Err(OrchestratorError::InvalidArguments {
                command,
                reason: format!("uri must be a string, got {other}"),
            }),
        },
        Some(other) => Err(OrchestratorError::InvalidArguments {
            command,
            reason: format!("expected a document URI, got {other}"),
        }),
    }
}

/// Choice index, given as a number, a numeric string or `{ "index": ... }`.
fn index_argument(args: &[Value]) -> Result<u32, OrchestratorError> {
    let invalid = |reason: String| OrchestratorError::InvalidArguments {
        command: SELECT_OPTION,
        reason,
    };
    let value = match args.first() {
        Some(Value::Object(map)) => map.get("index"),
        other => other,
    };
    let index = match value {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    let index = index.ok_or_else(|| invalid(format!("expected a choice index, got {value:?}")))?;
    u32::try_from(index).map_err(|_| invalid(format!("choice index {index} is out of range")))
}

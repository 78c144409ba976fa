//! Workspace mirroring: private scratch copies of each client workspace.
//!
//! Every workspace root the client reports gets an entry here. The entry's
//! scratch directory holds a filtered copy of the root's story sources and is
//! what the external tool actually compiles, so unsaved editor buffers can be
//! tested without touching the user's files.
//!
//! Per entry: `Unmirrored → Mirroring → Ready`, with `Mirroring → Failed` on
//! error. A failed or vanished mirror is retried from scratch with a fresh
//! directory; broken scratch trees are never patched.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::filter::SourceFilter;
use crate::paths::{self, InvalidUriError};

const SCRATCH_PREFIX: &str = "ink-ls-";

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("workspace {0} is not registered")]
    NotRegistered(String),
    #[error("failed to create scratch directory {}: {source}", path.display())]
    CreateScratch { path: PathBuf, source: io::Error },
    #[error("failed to read {}: {source}", path.display())]
    ReadSource { path: PathBuf, source: io::Error },
    #[error("failed to copy {} to {}: {source}", from.display(), to.display())]
    Copy {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },
    #[error("mirroring of {0} was superseded by a newer pass")]
    Superseded(String),
}

#[derive(Debug, Error)]
pub enum FileUpdateError {
    #[error("workspace {0} has no scratch directory yet")]
    NotMirrored(String),
    #[error("{} is not inside workspace {root_uri}", path.display())]
    OutsideWorkspace { path: PathBuf, root_uri: String },
    #[error("failed to write {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorState {
    Unmirrored,
    Mirroring,
    Ready(PathBuf),
    Failed(String),
}

/// Snapshot of one workspace entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceEntry {
    root_uri: String,
    root: PathBuf,
    scratch: Option<PathBuf>,
}

impl WorkspaceEntry {
    #[must_use]
    pub fn root_uri(&self) -> &str {
        &self.root_uri
    }

    /// Real workspace root on disk.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scratch directory, present once the entry is `Ready`.
    #[must_use]
    pub fn scratch(&self) -> Option<&Path> {
        self.scratch.as_deref()
    }

    /// Map a real path inside the workspace to its mirrored location.
    #[must_use]
    pub fn scratch_path_for(&self, real: &Path) -> Option<PathBuf> {
        let scratch = self.scratch.as_ref()?;
        let rel = paths::relative_to(real, &self.root)?;
        Some(scratch.join(rel))
    }

    /// Map a mirrored path back to the real workspace.
    #[must_use]
    pub fn real_path_for(&self, mirrored: &Path) -> Option<PathBuf> {
        let scratch = self.scratch.as_ref()?;
        let rel = paths::relative_to(mirrored, scratch)?;
        Some(self.root.join(rel))
    }
}

struct EntryState {
    root: PathBuf,
    state: MirrorState,
    /// Bumped on every mirroring pass; a pass commits only if it is still current.
    generation: u64,
}

impl EntryState {
    fn snapshot(&self, root_uri: &str) -> WorkspaceEntry {
        WorkspaceEntry {
            root_uri: root_uri.to_string(),
            root: self.root.clone(),
            scratch: match &self.state {
                MirrorState::Ready(path) => Some(path.clone()),
                _ => None,
            },
        }
    }
}

enum Step {
    Check(WorkspaceEntry),
    Wait,
    Mirror { root: PathBuf, generation: u64 },
}

pub struct WorkspaceMirror {
    scratch_base: PathBuf,
    filter: SourceFilter,
    entries: Mutex<HashMap<String, EntryState>>,
    /// Signalled whenever a mirroring pass settles.
    settled: Notify,
}

impl WorkspaceMirror {
    pub fn new(scratch_base: impl Into<PathBuf>, filter: SourceFilter) -> Self {
        Self {
            scratch_base: scratch_base.into(),
            filter,
            entries: Mutex::new(HashMap::new()),
            settled: Notify::new(),
        }
    }

    #[must_use]
    pub fn filter(&self) -> &SourceFilter {
        &self.filter
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, EntryState>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a workspace root. Registering an existing root keeps its entry.
    pub fn register(&self, root_uri: &str) -> Result<WorkspaceEntry, InvalidUriError> {
        let root = paths::to_filesystem_path(root_uri)?;
        let mut entries = self.lock();
        let entry = entries
            .entry(root_uri.to_string())
            .or_insert_with(|| EntryState {
                root: paths::normalize_path(&root),
                state: MirrorState::Unmirrored,
                generation: 0,
            });
        Ok(entry.snapshot(root_uri))
    }

    /// Drop an entry. Removing its scratch directory is up to the caller.
    pub fn forget(&self, root_uri: &str) -> bool {
        let removed = self.lock().remove(root_uri).is_some();
        if removed {
            self.settled.notify_waiters();
        }
        removed
    }

    #[must_use]
    pub fn entry(&self, root_uri: &str) -> Option<WorkspaceEntry> {
        self.lock().get(root_uri).map(|e| e.snapshot(root_uri))
    }

    #[must_use]
    pub fn state(&self, root_uri: &str) -> Option<MirrorState> {
        self.lock().get(root_uri).map(|e| e.state.clone())
    }

    /// All entries, ordered by root URI.
    #[must_use]
    pub fn entries(&self) -> Vec<WorkspaceEntry> {
        let mut all: Vec<_> = self
            .lock()
            .iter()
            .map(|(uri, e)| e.snapshot(uri))
            .collect();
        all.sort_by(|a, b| a.root_uri.cmp(&b.root_uri));
        all
    }

    /// The workspace that contains `path`, if any.
    #[must_use]
    pub fn find_owner(&self, path: &Path) -> Option<WorkspaceEntry> {
        let entries = self.entries();
        paths::find_owning_workspace(path, &entries, WorkspaceEntry::root).cloned()
    }

    /// Copy `root` into a brand-new scratch directory.
    ///
    /// Partial copies are not rolled back; callers retry with a fresh directory.
    pub async fn create_mirror(&self, root: &Path) -> Result<PathBuf, MirrorError> {
        let started = Instant::now();
        let scratch = self
            .scratch_base
            .join(format!("{SCRATCH_PREFIX}{}", Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&scratch)
            .await
            .map_err(|source| MirrorError::CreateScratch {
                path: scratch.clone(),
                source,
            })?;

        let copied = self.copy_tree(root, &scratch).await?;
        tracing::info!(
            root = %root.display(),
            scratch = %scratch.display(),
            files = copied,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Workspace mirrored"
        );
        Ok(scratch)
    }

    async fn copy_tree(&self, root: &Path, scratch: &Path) -> Result<usize, MirrorError> {
        let mut copied = 0;
        let mut pending = vec![(root.to_path_buf(), scratch.to_path_buf())];

        while let Some((src_dir, dst_dir)) = pending.pop() {
            let mut dir = tokio::fs::read_dir(&src_dir)
                .await
                .map_err(|source| MirrorError::ReadSource {
                    path: src_dir.clone(),
                    source,
                })?;

            loop {
                let next = dir
                    .next_entry()
                    .await
                    .map_err(|source| MirrorError::ReadSource {
                        path: src_dir.clone(),
                        source,
                    })?;
                let Some(item) = next else { break };
                let src = item.path();
                let dst = dst_dir.join(item.file_name());

                // The scratch tree may live inside the workspace (e.g. a workspace under /tmp).
                if src == scratch || (src.starts_with(&self.scratch_base) && is_scratch_dir(&src)) {
                    continue;
                }
                if !self.filter.is_source_file(&src, true).await {
                    continue;
                }

                let file_type = item
                    .file_type()
                    .await
                    .map_err(|source| MirrorError::ReadSource {
                        path: src.clone(),
                        source,
                    })?;
                let is_dir_link = file_type.is_symlink()
                    && tokio::fs::metadata(&src).await.is_ok_and(|m| m.is_dir());
                if is_dir_link {
                    tracing::debug!(path = %src.display(), "Not following directory symlink");
                    continue;
                }

                if file_type.is_dir() {
                    tokio::fs::create_dir_all(&dst)
                        .await
                        .map_err(|source| MirrorError::Copy {
                            from: src.clone(),
                            to: dst.clone(),
                            source,
                        })?;
                    pending.push((src, dst));
                } else {
                    tokio::fs::copy(&src, &dst)
                        .await
                        .map_err(|source| MirrorError::Copy {
                            from: src.clone(),
                            to: dst.clone(),
                            source,
                        })?;
                    copied += 1;
                }
            }
        }
        Ok(copied)
    }

    /// Return a `Ready` entry, mirroring it first if needed.
    ///
    /// At most one mirroring pass is started per call. A caller that finds
    /// another pass in flight waits for it to settle and reuses its result.
    pub async fn ensure_ready(&self, root_uri: &str) -> Result<WorkspaceEntry, MirrorError> {
        let mut waited = false;
        loop {
            match self.next_step(root_uri, waited)? {
                Step::Check(entry) => {
                    let scratch = entry.scratch().map(Path::to_path_buf);
                    if let Some(scratch) = scratch {
                        if tokio::fs::metadata(&scratch).await.is_ok_and(|m| m.is_dir()) {
                            return Ok(entry);
                        }
                        tracing::warn!(
                            scratch = %scratch.display(),
                            "Scratch directory vanished, re-mirroring {root_uri}"
                        );
                        self.mark_stale(root_uri, &scratch);
                    }
                }
                Step::Wait => {
                    let notified = self.settled.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    // Re-check after arming the waiter; a pass may have settled meanwhile.
                    if self.state(root_uri) == Some(MirrorState::Mirroring) {
                        notified.await;
                    }
                    waited = true;
                }
                Step::Mirror { root, generation } => {
                    return self.run_pass(root_uri, &root, generation).await;
                }
            }
        }
    }

    fn next_step(&self, root_uri: &str, waited: bool) -> Result<Step, MirrorError> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(root_uri)
            .ok_or_else(|| MirrorError::NotRegistered(root_uri.to_string()))?;
        match &entry.state {
            MirrorState::Ready(_) => Ok(Step::Check(entry.snapshot(root_uri))),
            MirrorState::Mirroring if !waited => Ok(Step::Wait),
            _ => {
                entry.generation += 1;
                entry.state = MirrorState::Mirroring;
                Ok(Step::Mirror {
                    root: entry.root.clone(),
                    generation: entry.generation,
                })
            }
        }
    }

    /// Send a `Ready` entry back to `Unmirrored` if it still points at `scratch`.
    pub(crate) fn mark_stale(&self, root_uri: &str, scratch: &Path) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(root_uri)
            && entry.state == MirrorState::Ready(scratch.to_path_buf())
        {
            entry.state = MirrorState::Unmirrored;
        }
    }

    async fn run_pass(
        &self,
        root_uri: &str,
        root: &Path,
        generation: u64,
    ) -> Result<WorkspaceEntry, MirrorError> {
        let result = self.create_mirror(root).await;

        let outcome = {
            let mut entries = self.lock();
            match entries.get_mut(root_uri) {
                Some(entry) if entry.generation == generation => {
                    match result {
                        Ok(scratch) => {
                            entry.state = MirrorState::Ready(scratch);
                            Ok(entry.snapshot(root_uri))
                        }
                        Err(e) => {
                            entry.state = MirrorState::Failed(e.to_string());
                            Err(e)
                        }
                    }
                }
                current => {
                    if let Ok(scratch) = &result {
                        tracing::debug!(
                            scratch = %scratch.display(),
                            "Discarding superseded mirror of {root_uri}"
                        );
                    }
                    match current {
                        Some(entry) if matches!(entry.state, MirrorState::Ready(_)) => {
                            Ok(entry.snapshot(root_uri))
                        }
                        _ => Err(MirrorError::Superseded(root_uri.to_string())),
                    }
                }
            }
        };
        self.settled.notify_waiters();
        outcome
    }

    /// Register and mirror several roots concurrently.
    pub async fn mirror_all(
        &self,
        root_uris: &[String],
    ) -> Vec<(String, Result<WorkspaceEntry, MirrorError>)> {
        let passes = root_uris.iter().map(|uri| async move {
            let result = match self.register(uri) {
                Ok(_) => self.ensure_ready(uri).await,
                Err(e) => {
                    tracing::warn!("Cannot mirror workspace: {e}");
                    Err(MirrorError::NotRegistered(uri.clone()))
                }
            };
            (uri.clone(), result)
        });
        join_all(passes).await
    }

    /// Overwrite the mirrored copy of `doc` with the editor's current text.
    pub async fn apply_document_edit(
        &self,
        doc: &Path,
        text: &str,
        entry: &WorkspaceEntry,
    ) -> Result<(), FileUpdateError> {
        if entry.scratch().is_none() {
            return Err(FileUpdateError::NotMirrored(entry.root_uri.clone()));
        }
        let target = entry
            .scratch_path_for(doc)
            .ok_or_else(|| FileUpdateError::OutsideWorkspace {
                path: doc.to_path_buf(),
                root_uri: entry.root_uri.clone(),
            })?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| FileUpdateError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::write(&target, text)
            .await
            .map_err(|source| FileUpdateError::Io {
                path: target.clone(),
                source,
            })?;
        tracing::trace!(target = %target.display(), bytes = text.len(), "Mirrored document edit");
        Ok(())
    }

    /// Copy a file the client reports as newly created on disk. Best-effort.
    pub async fn apply_created_file(&self, file: &Path, entry: &WorkspaceEntry) {
        if !self.filter.is_source_file(file, false).await {
            return;
        }
        let Some(target) = entry.scratch_path_for(file) else {
            tracing::debug!(
                path = %file.display(),
                "Created file has no mirror location in {}",
                entry.root_uri
            );
            return;
        };
        if let Some(parent) = target.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            tracing::warn!(path = %parent.display(), "Failed to create mirror directory: {e}");
            return;
        }
        if let Err(e) = tokio::fs::copy(file, &target).await {
            tracing::warn!(
                from = %file.display(),
                to = %target.display(),
                "Failed to mirror created file: {e}"
            );
        }
    }

    /// Remove the mirrored copy of a file deleted on disk. Best-effort.
    pub async fn apply_deleted_file(&self, file: &Path, entry: &WorkspaceEntry) {
        let Some(target) = entry.scratch_path_for(file) else {
            return;
        };
        match tokio::fs::remove_file(&target).await {
            Ok(()) => tracing::debug!(path = %target.display(), "Removed mirrored file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %target.display(),
                "Failed to remove mirrored file: {e}"
            ),
        }
    }
}

fn is_scratch_dir(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(SCRATCH_PREFIX))
}

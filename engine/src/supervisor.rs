//! External tool process supervision.
//!
//! [`ProcessSupervisor`] launches `inklecate` against a mirrored story, pumps
//! its stdout through the [`OutputScanner`] and reports everything as
//! [`RunnerEvent`]s on a per-run channel.
//!
//! One process is *addressable* at a time: the slot holds the most recently
//! started run, and only that run receives choices and stop requests. A run
//! displaced by a newer one keeps running until it exits on its own so its
//! diagnostics still arrive. Each run carries a generation number and its exit
//! only clears the slot while the slot still holds that generation.

use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ink_ls_types::{CompilationSettings, RunMode, RuntimeEvent, StoryDiagnostic};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};

use crate::parser::{OutputScanner, ScanEvent, strip_bom};

const EVENT_CHANNEL_CAPACITY: usize = 256;

const STDIN_CHANNEL_CAPACITY: usize = 16;

const READ_BUFFER_SIZE: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Settings point at something unusable; nothing was spawned.
    #[error("{0}")]
    Configuration(String),
    #[error("failed to start {}: {source}. {hint}", program.display())]
    Spawn {
        program: PathBuf,
        hint: String,
        source: io::Error,
    },
}

impl SupervisorError {
    /// Text suitable for an editor popup.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Configuration(message) => message.clone(),
            Self::Spawn { hint, .. } => format!("Unable to start inklecate. {hint}"),
        }
    }
}

/// What to run and where its output belongs.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub settings: CompilationSettings,
    /// Main story inside the scratch directory; this is what the tool reads.
    pub scratch_main: PathBuf,
    /// Main story inside the real workspace; diagnostics point here.
    pub real_main: PathBuf,
}

impl RunRequest {
    /// `<main>.json` next to the scratch main story.
    #[must_use]
    pub fn artifact_path(&self) -> PathBuf {
        let mut path = self.scratch_main.as_os_str().to_owned();
        path.push(".json");
        PathBuf::from(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerEvent {
    /// Play-mode output, in the order the tool printed it.
    Runtime(RuntimeEvent),
    /// One chunk of stderr.
    ToolError(String),
    /// Stdout closed; everything the run had to say has been said.
    Finished {
        diagnostics: Vec<StoryDiagnostic>,
        /// Compiled story written by a compile run.
        artifact: Option<PathBuf>,
    },
    Exited {
        code: Option<i32>,
        /// Terminated through [`StoryRunner::stop`].
        killed: bool,
    },
}

/// A started run. The event channel closes once the process has exited and
/// its output is drained.
#[derive(Debug)]
pub struct RunHandle {
    pub generation: u64,
    pub mode: RunMode,
    pub events: mpsc::Receiver<RunnerEvent>,
}

/// Run future type alias.
pub type RunFut<'a> =
    Pin<Box<dyn Future<Output = Result<RunHandle, SupervisorError>> + Send + 'a>>;

/// Capability interface over the external tool.
pub trait StoryRunner: Send + Sync {
    fn compile(&self, request: RunRequest) -> RunFut<'_>;

    fn play(&self, request: RunRequest) -> RunFut<'_>;

    /// Send a choice to the addressable process. Returns whether it was queued.
    fn submit_choice(&self, index: u32) -> bool;

    /// Kill the addressable process. Returns whether there was one.
    fn stop(&self) -> bool;

    fn is_running(&self) -> bool;
}

struct ActiveRun {
    generation: u64,
    stdin: Option<mpsc::Sender<String>>,
    kill: oneshot::Sender<()>,
}

#[derive(Default)]
struct Slot {
    last_generation: u64,
    active: Option<ActiveRun>,
}

/// Resolved command line.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Launch {
    program: PathBuf,
    args: Vec<OsString>,
    shim: Option<String>,
}

#[derive(Clone, Default)]
pub struct ProcessSupervisor {
    slot: Arc<Mutex<Slot>>,
}

impl ProcessSupervisor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Generation of the addressable run, if any.
    #[must_use]
    pub fn current_generation(&self) -> Option<u64> {
        self.lock().active.as_ref().map(|run| run.generation)
    }

    pub async fn start(
        &self,
        mode: RunMode,
        request: RunRequest,
    ) -> Result<RunHandle, SupervisorError> {
        let launch = verify(mode, &request).await?;
        let story_dir = request
            .scratch_main
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        let mut cmd = Command::new(&launch.program);
        cmd.args(&launch.args)
            .current_dir(&story_dir)
            .stdin(match mode {
                RunMode::Play => Stdio::piped(),
                RunMode::Compile => Stdio::null(),
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            hint: spawn_hint(launch.shim.as_deref(), &source),
            program: launch.program.clone(),
            source,
        })?;
        tracing::info!(
            program = %launch.program.display(),
            mode = mode.as_str(),
            pid = child.id(),
            "Started inklecate"
        );

        let (event_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (kill_tx, kill_rx) = oneshot::channel();
        let stdin = child.stdin.take().map(spawn_stdin_writer);

        let generation = {
            let mut slot = self.lock();
            slot.last_generation += 1;
            let generation = slot.last_generation;
            if let Some(previous) = slot.active.replace(ActiveRun {
                generation,
                stdin,
                kill: kill_tx,
            }) {
                tracing::debug!(
                    previous = previous.generation,
                    current = generation,
                    "Previous run is no longer addressable"
                );
            }
            generation
        };

        if let Some(stdout) = child.stdout.take() {
            let scanner = OutputScanner::new(mode, request.real_main.clone());
            let artifact = (mode == RunMode::Compile).then(|| request.artifact_path());
            tokio::spawn(pump_stdout(stdout, scanner, mode, artifact, event_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_stderr(stderr, event_tx.clone()));
        }

        let slot = Arc::clone(&self.slot);
        tokio::spawn(async move {
            let mut kill_rx = kill_rx;
            let mut killed = false;
            let status = tokio::select! {
                status = child.wait() => status,
                signal = &mut kill_rx => {
                    // A dropped sender means the run was displaced, not stopped.
                    if signal.is_ok() {
                        killed = true;
                        if let Err(e) = child.start_kill() {
                            tracing::warn!("Failed to kill inklecate: {e}");
                        }
                    }
                    child.wait().await
                }
            };
            let code = log_exit(generation, status, killed);
            release(&slot, generation);
            let _ = event_tx.send(RunnerEvent::Exited { code, killed }).await;
        });

        Ok(RunHandle {
            generation,
            mode,
            events,
        })
    }
}

impl StoryRunner for ProcessSupervisor {
    fn compile(&self, request: RunRequest) -> RunFut<'_> {
        Box::pin(self.start(RunMode::Compile, request))
    }

    fn play(&self, request: RunRequest) -> RunFut<'_> {
        Box::pin(self.start(RunMode::Play, request))
    }

    fn submit_choice(&self, index: u32) -> bool {
        let slot = self.lock();
        let Some(stdin) = slot.active.as_ref().and_then(|run| run.stdin.as_ref()) else {
            tracing::info!(index, "No interactive story to receive the choice");
            return false;
        };
        match stdin.try_send(format!("{index}\n")) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(index, "Failed to queue choice: {e}");
                false
            }
        }
    }

    fn stop(&self) -> bool {
        let Some(run) = self.lock().active.take() else {
            return false;
        };
        tracing::info!(generation = run.generation, "Stopping inklecate");
        let _ = run.kill.send(());
        true
    }

    fn is_running(&self) -> bool {
        self.lock().active.is_some()
    }
}

fn release(slot: &Mutex<Slot>, generation: u64) {
    let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if slot
        .active
        .as_ref()
        .is_some_and(|run| run.generation == generation)
    {
        slot.active = None;
    }
}

fn log_exit(generation: u64, status: io::Result<ExitStatus>, killed: bool) -> Option<i32> {
    match status {
        Ok(status) if status.success() => {
            tracing::debug!(generation, "inklecate exited");
            status.code()
        }
        Ok(status) if killed => {
            tracing::debug!(generation, %status, "inklecate stopped");
            status.code()
        }
        Ok(status) => {
            tracing::warn!(generation, %status, "inklecate exited abnormally");
            status.code()
        }
        Err(e) => {
            tracing::error!(generation, "Failed to wait for inklecate: {e}");
            None
        }
    }
}

fn spawn_stdin_writer(mut stdin: ChildStdin) -> mpsc::Sender<String> {
    let (tx, mut rx) = mpsc::channel::<String>(STDIN_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                tracing::warn!("inklecate stdin write error: {e}");
                break;
            }
            if let Err(e) = stdin.flush().await {
                tracing::warn!("inklecate stdin flush error: {e}");
                break;
            }
        }
    });
    tx
}

async fn pump_stdout(
    mut stdout: impl AsyncRead + Unpin,
    mut scanner: OutputScanner,
    mode: RunMode,
    artifact: Option<PathBuf>,
    tx: mpsc::Sender<RunnerEvent>,
) {
    let mut diagnostics = Vec::new();
    let mut ended = false;
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let (events, closed) = match stdout.read(&mut buf).await {
            Ok(0) => (scanner.finish(), true),
            Ok(n) => (scanner.push(&buf[..n]), false),
            Err(e) => {
                tracing::warn!("inklecate stdout read error: {e}");
                (scanner.finish(), true)
            }
        };
        for event in events {
            match event {
                ScanEvent::Diagnostic(diagnostic) => diagnostics.push(diagnostic),
                ScanEvent::Runtime(RuntimeEvent::EndOfStory) if ended => {}
                ScanEvent::Runtime(event) => {
                    ended |= event == RuntimeEvent::EndOfStory;
                    let _ = tx.send(RunnerEvent::Runtime(event)).await;
                }
            }
        }
        if closed {
            break;
        }
    }

    if mode == RunMode::Play && !ended {
        let _ = tx
            .send(RunnerEvent::Runtime(RuntimeEvent::EndOfStory))
            .await;
    }
    let _ = tx
        .send(RunnerEvent::Finished {
            diagnostics,
            artifact,
        })
        .await;
}

async fn pump_stderr(mut stderr: impl AsyncRead + Unpin, tx: mpsc::Sender<RunnerEvent>) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]);
                let text = strip_bom(&chunk).trim();
                if text.is_empty() {
                    continue;
                }
                tracing::error!("inklecate stderr: {text}");
                let _ = tx.send(RunnerEvent::ToolError(text.to_string())).await;
            }
            Err(e) => {
                tracing::warn!("inklecate stderr read error: {e}");
                break;
            }
        }
    }
}

/// Check the settings and build the command line. Nothing is spawned here.
async fn verify(mode: RunMode, request: &RunRequest) -> Result<Launch, SupervisorError> {
    let settings = &request.settings;
    let main = request.scratch_main.as_os_str().to_owned();
    let mut tool_args: Vec<OsString> = match mode {
        RunMode::Compile => vec![
            OsString::from("-o"),
            request.artifact_path().into_os_string(),
            main,
        ],
        RunMode::Play => vec![OsString::from("-p"), main],
    };

    match settings.shim.as_deref() {
        Some(shim) => {
            if let Err(e) = tokio::fs::File::open(&request.scratch_main).await {
                return Err(SupervisorError::Configuration(format!(
                    "The main story {} could not be read ({e}). Check mainStoryPath.",
                    request.real_main.display()
                )));
            }
            let program = which::which(shim).map_err(|_| {
                SupervisorError::Configuration(format!(
                    "'{shim}' was not found. Install it, or point runThroughMono at its location."
                ))
            })?;
            let mut args = vec![OsString::from(&settings.inklecate_path)];
            args.append(&mut tool_args);
            Ok(Launch {
                program,
                args,
                shim: Some(shim.to_string()),
            })
        }
        None => {
            let program = which::which(&settings.inklecate_path).map_err(|_| {
                SupervisorError::Configuration(format!(
                    "inklecate was not found or is not executable at '{}'. \
                     Check inklecateExecutablePath.",
                    settings.inklecate_path
                ))
            })?;
            Ok(Launch {
                program,
                args: tool_args,
                shim: None,
            })
        }
    }
}

fn spawn_hint(shim: Option<&str>, error: &io::Error) -> String {
    let missing = matches!(
        error.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
    );
    let mut hints: Vec<String> = Vec::new();
    match shim {
        Some(shim) if missing => {
            hints.push(format!("'{shim}' could not be launched; make sure it is installed."));
        }
        Some(_) => {}
        None if cfg!(not(windows)) => hints.push(
            "On macOS and Linux inklecate may need to run through mono; \
             try enabling runThroughMono."
                .to_string(),
        ),
        None => {}
    }
    if missing {
        hints.push(
            "Check that inklecateExecutablePath points at the inklecate executable.".to_string(),
        );
    }
    if hints.is_empty() {
        hints.push("See the server log for details.".to_string());
    }
    hints.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ink_ls_types::{Choice, DiagnosticKind};

    fn request(dir: &Path, script: &str) -> RunRequest {
        let scratch = dir.join("scratch");
        std::fs::create_dir_all(&scratch).unwrap();
        std::fs::write(scratch.join("main.ink"), "Hello.\n").unwrap();
        let tool = dir.join("fake-inklecate.sh");
        std::fs::write(&tool, script).unwrap();
        RunRequest {
            settings: CompilationSettings {
                main_story_path: "main.ink".to_string(),
                inklecate_path: tool.to_string_lossy().into_owned(),
                shim: Some("sh".to_string()),
            },
            scratch_main: scratch.join("main.ink"),
            real_main: PathBuf::from("/real/story/main.ink"),
        }
    }

    async fn drain(handle: &mut RunHandle) -> Vec<RunnerEvent> {
        let mut events = Vec::new();
        while let Some(event) = handle.events.recv().await {
            events.push(event);
        }
        events
    }

    fn finished(events: &[RunnerEvent]) -> (&[StoryDiagnostic], Option<&Path>) {
        events
            .iter()
            .find_map(|e| match e {
                RunnerEvent::Finished {
                    diagnostics,
                    artifact,
                } => Some((diagnostics.as_slice(), artifact.as_deref())),
                _ => None,
            })
            .expect("run finished")
    }

    #[test]
    fn artifact_sits_next_to_main_story() {
        let request = RunRequest {
            settings: CompilationSettings::platform_default(),
            scratch_main: PathBuf::from("/tmp/ink-ls-1/main.ink"),
            real_main: PathBuf::from("/w/main.ink"),
        };
        assert_eq!(
            request.artifact_path(),
            PathBuf::from("/tmp/ink-ls-1/main.ink.json")
        );
    }

    #[test]
    fn spawn_hints_name_the_likely_cause() {
        let not_found = io::Error::from(io::ErrorKind::NotFound);
        let hint = spawn_hint(Some("mono"), &not_found);
        assert!(hint.contains("'mono' could not be launched"));
        assert!(hint.contains("inklecateExecutablePath"));

        let other = io::Error::other("boom");
        assert!(!spawn_hint(Some("mono"), &other).is_empty());
        #[cfg(not(windows))]
        assert!(spawn_hint(None, &other).contains("runThroughMono"));
    }

    #[tokio::test]
    async fn missing_executable_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request(dir.path(), "");
        req.settings.shim = None;
        req.settings.inklecate_path = dir
            .path()
            .join("no-such-inklecate")
            .to_string_lossy()
            .into_owned();

        let supervisor = ProcessSupervisor::new();
        let err = supervisor.compile(req).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Configuration(_)));
        assert!(err.user_message().contains("inklecateExecutablePath"));
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn unreadable_main_story_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request(dir.path(), "");
        req.scratch_main = dir.path().join("scratch/missing.ink");

        let err = ProcessSupervisor::new().play(req).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Configuration(_)));
        assert!(err.user_message().contains("mainStoryPath"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn compile_collects_diagnostics_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"
[ "$1" = "-o" ] || exit 3
printf 'ERROR: line 3: bad syntax\nWARNING: '"'"'sub/a.ink'"'"' line 9: odd\n'
echo "disk full" >&2
"#;
        let req = request(dir.path(), script);
        let artifact = req.artifact_path();

        let supervisor = ProcessSupervisor::new();
        let mut handle = supervisor.compile(req).await.unwrap();
        assert_eq!(handle.mode, RunMode::Compile);
        let events = drain(&mut handle).await;

        let (diagnostics, produced) = finished(&events);
        assert_eq!(produced, Some(artifact.as_path()));
        assert_eq!(diagnostics.len(), 2);
        assert_eq!(diagnostics[0].kind(), DiagnosticKind::Error);
        assert_eq!(diagnostics[0].path(), Path::new("/real/story/main.ink"));
        assert_eq!(diagnostics[0].line(), 3);
        assert_eq!(diagnostics[1].path(), Path::new("/real/story/sub/a.ink"));

        assert!(events.contains(&RunnerEvent::ToolError("disk full".to_string())));
        assert!(events.contains(&RunnerEvent::Exited {
            code: Some(0),
            killed: false
        }));
        assert!(!supervisor.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn play_session_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let script = r##"
[ "$1" = "-p" ] || exit 3
echo "You stand at a crossroads."
echo "# tags: intro"
echo "1: Go north"
echo "2: Go south"
printf '?> '
read choice
echo "You picked $choice."
echo "--- End of story ---"
"##;
        let supervisor = ProcessSupervisor::new();
        let mut handle = supervisor.play(request(dir.path(), script)).await.unwrap();

        let mut events = Vec::new();
        while let Some(event) = handle.events.recv().await {
            let prompt = event == RunnerEvent::Runtime(RuntimeEvent::Prompt);
            events.push(event);
            if prompt {
                assert!(supervisor.submit_choice(2));
            }
        }

        let runtime: Vec<RuntimeEvent> = events
            .iter()
            .filter_map(|e| match e {
                RunnerEvent::Runtime(event) => Some(event.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            runtime,
            vec![
                RuntimeEvent::Text("You stand at a crossroads.".to_string()),
                RuntimeEvent::Tags(vec!["intro".to_string()]),
                RuntimeEvent::Choice(Choice {
                    index: 1,
                    text: "Go north".to_string()
                }),
                RuntimeEvent::Choice(Choice {
                    index: 2,
                    text: "Go south".to_string()
                }),
                RuntimeEvent::Prompt,
                RuntimeEvent::Text("You picked 2.".to_string()),
                RuntimeEvent::EndOfStory,
            ]
        );
        let (_, artifact) = finished(&events);
        assert!(artifact.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn play_without_sentinel_still_ends_story() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new();
        let mut handle = supervisor
            .play(request(dir.path(), "echo 'The end, abruptly.'\n"))
            .await
            .unwrap();
        let events = drain(&mut handle).await;
        let ends = events
            .iter()
            .filter(|e| **e == RunnerEvent::Runtime(RuntimeEvent::EndOfStory))
            .count();
        assert_eq!(ends, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_kills_the_addressable_process() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new();
        let mut handle = supervisor
            .play(request(dir.path(), "echo ready\nread line\n"))
            .await
            .unwrap();

        assert_eq!(
            handle.events.recv().await,
            Some(RunnerEvent::Runtime(RuntimeEvent::Text("ready".to_string())))
        );
        assert!(supervisor.stop());
        assert!(!supervisor.stop());
        assert!(!supervisor.is_running());
        assert!(!supervisor.submit_choice(1));

        let events = drain(&mut handle).await;
        assert!(
            events
                .iter()
                .any(|e| matches!(e, RunnerEvent::Exited { killed: true, .. }))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stale_exit_does_not_clear_newer_run() {
        let dir = tempfile::tempdir().unwrap();
        let fast = request(dir.path(), "sleep 0.1\n");
        let slow_dir = tempfile::tempdir().unwrap();
        let slow = request(slow_dir.path(), "sleep 0.6\n");

        let supervisor = ProcessSupervisor::new();
        let mut first = supervisor.compile(fast).await.unwrap();
        let mut second = supervisor.compile(slow).await.unwrap();
        assert!(second.generation > first.generation);
        assert_eq!(supervisor.current_generation(), Some(second.generation));

        drain(&mut first).await;
        assert!(supervisor.is_running());
        assert_eq!(supervisor.current_generation(), Some(second.generation));

        drain(&mut second).await;
        assert!(!supervisor.is_running());
        assert_eq!(supervisor.current_generation(), None);
    }

    #[test]
    fn submit_choice_without_process_is_a_no_op() {
        let supervisor = ProcessSupervisor::new();
        assert!(!supervisor.submit_choice(0));
        assert!(!supervisor.stop());
    }
}

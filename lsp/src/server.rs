//! The server session: reads frames from the editor, routes replies to
//! waiting requests and feeds everything else to the orchestrator in order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use ink_ls_engine::{
    COMMANDS, CompilationOrchestrator, InkLsConfig, OrchestratorError, PathToolLocator,
    ProcessSupervisor, StoryRunner, ToolInstaller, WorkspaceMirror,
};
use ink_ls_types::CompilationSettings;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::client::{self, LspClient, PendingMap, WriterCommand};
use crate::codec::{FrameReader, FrameWriter};
use crate::protocol::{
    self, DidChangeParams, DidChangeWatchedFilesParams, DidChangeWorkspaceFoldersParams,
    DidCloseParams, DidOpenParams, ExecuteCommandParams, FileEvent, Incoming, InitializeParams,
    Response,
};

/// How long a request to the editor may stay unanswered.
const CLIENT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Everything the session needs besides the connection itself.
pub struct ServerOptions {
    pub defaults: CompilationSettings,
    pub mirror: Arc<WorkspaceMirror>,
    pub runner: Arc<dyn StoryRunner>,
    pub installer: Arc<dyn ToolInstaller>,
    pub request_timeout: Duration,
}

impl ServerOptions {
    /// The production wiring: a real process supervisor and `PATH` lookup.
    pub fn from_config(config: &InkLsConfig) -> Self {
        Self {
            defaults: config.default_settings(),
            mirror: Arc::new(WorkspaceMirror::new(
                config.scratch_base(),
                config.source_filter(),
            )),
            runner: Arc::new(ProcessSupervisor::new()),
            installer: Arc::new(PathToolLocator::new()),
            request_timeout: Duration::from_secs(CLIENT_REQUEST_TIMEOUT_SECS),
        }
    }
}

/// Why [`serve`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The editor sent `exit`; `clean` when `shutdown` came first.
    Exit { clean: bool },
    /// The input stream ended or became unreadable.
    InputClosed,
}

impl SessionEnd {
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            SessionEnd::Exit { clean: true } => 0,
            SessionEnd::Exit { clean: false } | SessionEnd::InputClosed => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Uninitialized,
    Running { watch_files: bool },
    ShuttingDown,
}

enum Flow {
    Continue,
    End(SessionEnd),
}

struct Session {
    client: Arc<LspClient>,
    orchestrator: Arc<CompilationOrchestrator>,
    runner: Arc<dyn StoryRunner>,
    state: SessionState,
}

/// Serve one editor connection until `exit` or end of input.
pub async fn serve<R, W>(input: R, output: W, options: ServerOptions) -> Result<SessionEnd>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let pending: PendingMap = Arc::new(tokio::sync::Mutex::new(HashMap::new()));

    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<WriterCommand>();
    let writer_handle = tokio::spawn(async move {
        let mut writer = FrameWriter::new(output);
        while let Some(command) = writer_rx.recv().await {
            match command {
                WriterCommand::Send(frame) => {
                    if let Err(e) = writer.write_frame(&frame).await {
                        tracing::warn!("Write to editor failed: {e:#}");
                        break;
                    }
                }
                WriterCommand::Shutdown => break,
            }
        }
    });

    let client = Arc::new(LspClient::new(
        writer_tx.clone(),
        pending.clone(),
        options.request_timeout,
    ));

    // Replies are routed here, off the session task, so a handler waiting
    // on the editor cannot block the reply it is waiting for.
    let (incoming_tx, mut incoming_rx) = mpsc::unbounded_channel::<Incoming>();
    let reader_client = client.clone();
    let reader_handle = tokio::spawn(async move {
        let mut reader = FrameReader::new(input);
        loop {
            let frame = match reader.read_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::info!("Editor closed the input stream");
                    break;
                }
                Err(e) => {
                    tracing::error!("Unreadable input from editor: {e:#}");
                    break;
                }
            };
            match protocol::parse_incoming(&frame) {
                Some(Incoming::Response { id, body }) => {
                    client::resolve_response(&pending, id, body).await;
                }
                Some(message) => {
                    if incoming_tx.send(message).is_err() {
                        break;
                    }
                }
                None => reject_malformed(&reader_client, &frame),
            }
        }
    });

    let runner = options.runner.clone();
    let orchestrator = Arc::new(CompilationOrchestrator::new(
        client.clone(),
        options.runner,
        options.installer,
        options.mirror,
        options.defaults,
    ));
    let mut session = Session {
        client,
        orchestrator,
        runner,
        state: SessionState::Uninitialized,
    };

    let mut end = SessionEnd::InputClosed;
    while let Some(message) = incoming_rx.recv().await {
        let flow = match message {
            Incoming::Request { id, method, params } => {
                let response = session.handle_request(id, &method, params).await;
                session.client.send(&response);
                Flow::Continue
            }
            Incoming::Notification { method, params } => {
                session.handle_notification(&method, params).await
            }
            Incoming::Response { .. } => Flow::Continue,
        };
        if let Flow::End(reason) = flow {
            end = reason;
            break;
        }
    }

    session.runner.stop();
    reader_handle.abort();
    let _ = writer_tx.send(WriterCommand::Shutdown);
    if let Err(e) = writer_handle.await {
        tracing::warn!("Writer task failed: {e}");
    }
    tracing::info!(?end, "Session ended");
    Ok(end)
}

fn reject_malformed(client: &LspClient, frame: &Value) {
    match frame.get("id").filter(|id| !id.is_null()) {
        Some(id) => {
            client.send(&Response::error(
                id.clone(),
                protocol::INVALID_REQUEST,
                "message has neither a method nor a result",
            ));
        }
        None => tracing::debug!("Ignoring malformed frame: {frame}"),
    }
}

fn parse_params<T: DeserializeOwned>(method: &str, params: Value) -> Option<T> {
    serde_json::from_value(params)
        .inspect_err(|e| tracing::warn!("Malformed {method} params: {e}"))
        .ok()
}

impl Session {
    async fn handle_request(&mut self, id: Value, method: &str, params: Value) -> Response {
        match (self.state, method) {
            (SessionState::Uninitialized, "initialize") => self.initialize(id, params),
            (SessionState::Uninitialized, _) => Response::error(
                id,
                protocol::SERVER_NOT_INITIALIZED,
                "server has not been initialized",
            ),
            (_, "initialize") => {
                Response::error(id, protocol::INVALID_REQUEST, "server is already initialized")
            }
            (SessionState::ShuttingDown, _) => {
                Response::error(id, protocol::INVALID_REQUEST, "server is shutting down")
            }
            (_, "shutdown") => {
                self.runner.stop();
                self.state = SessionState::ShuttingDown;
                Response::ok(id, Value::Null)
            }
            (_, "workspace/executeCommand") => self.execute_command(id, params).await,
            _ => {
                tracing::debug!("Unsupported request: {method}");
                Response::error(
                    id,
                    protocol::METHOD_NOT_FOUND,
                    format!("method not found: {method}"),
                )
            }
        }
    }

    fn initialize(&mut self, id: Value, params: Value) -> Response {
        let params: InitializeParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(e) => {
                return Response::error(
                    id,
                    protocol::INVALID_PARAMS,
                    format!("invalid initialize params: {e}"),
                );
            }
        };

        let capabilities = params.capabilities.workspace;
        self.client.set_capabilities(capabilities);
        self.orchestrator.add_workspace_folders(&params.folders());
        self.orchestrator.set_initialization_options(params.settings());
        self.state = SessionState::Running {
            watch_files: capabilities.did_change_watched_files.dynamic_registration,
        };
        tracing::info!(
            folders = self.orchestrator.mirror().entries().len(),
            configuration = capabilities.configuration,
            "Initialized"
        );
        Response::ok(id, protocol::initialize_result(&COMMANDS))
    }

    async fn execute_command(&self, id: Value, params: Value) -> Response {
        let Some(params) = parse_params::<ExecuteCommandParams>("workspace/executeCommand", params)
        else {
            return Response::error(id, protocol::INVALID_PARAMS, "invalid executeCommand params");
        };
        match self
            .orchestrator
            .execute_command(&params.command, &params.arguments)
            .await
        {
            Ok(_) => Response::ok(id, Value::Null),
            Err(e @ OrchestratorError::UnknownCommand(_)) => {
                Response::error(id, protocol::METHOD_NOT_FOUND, e.to_string())
            }
            Err(e) => Response::error(id, protocol::INVALID_PARAMS, e.to_string()),
        }
    }

    async fn handle_notification(&mut self, method: &str, params: Value) -> Flow {
        if method == "exit" {
            return Flow::End(SessionEnd::Exit {
                clean: self.state == SessionState::ShuttingDown,
            });
        }
        let SessionState::Running { watch_files } = self.state else {
            tracing::debug!("Dropping {method} outside a running session");
            return Flow::Continue;
        };

        match method {
            "initialized" => {
                if watch_files {
                    self.register_file_watchers();
                }
                // Off the session loop; later requests wait on the pass only
                // when they need the mirror.
                let orchestrator = Arc::clone(&self.orchestrator);
                tokio::spawn(async move { orchestrator.mirror_workspaces().await });
            }
            "textDocument/didOpen" => {
                if let Some(params) = parse_params::<DidOpenParams>(method, params) {
                    let document = params.text_document;
                    self.orchestrator
                        .on_document_opened(&document.uri, &document.text)
                        .await;
                }
            }
            "textDocument/didChange" => {
                if let Some(params) = parse_params::<DidChangeParams>(method, params)
                    && let Some(text) = params.full_text()
                {
                    self.orchestrator
                        .on_document_changed(&params.text_document.uri, text)
                        .await;
                }
            }
            "textDocument/didClose" => {
                if let Some(params) = parse_params::<DidCloseParams>(method, params) {
                    self.orchestrator
                        .on_document_closed(&params.text_document.uri)
                        .await;
                }
            }
            "workspace/didChangeWatchedFiles" => {
                if let Some(params) = parse_params::<DidChangeWatchedFilesParams>(method, params) {
                    let changes: Vec<_> =
                        params.changes.iter().filter_map(FileEvent::to_change).collect();
                    self.orchestrator.on_files_changed(&changes).await;
                }
            }
            "workspace/didChangeWorkspaceFolders" => {
                if let Some(params) =
                    parse_params::<DidChangeWorkspaceFoldersParams>(method, params)
                {
                    self.orchestrator
                        .on_workspace_folders_changed(&params.event.added, &params.event.removed)
                        .await;
                }
            }
            _ if method.starts_with("$/") => {}
            _ => tracing::trace!("Ignoring notification: {method}"),
        }
        Flow::Continue
    }

    fn register_file_watchers(&self) {
        let params =
            protocol::watched_files_registration(self.orchestrator.mirror().filter().extensions());
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(e) = client.send_request("client/registerCapability", params).await {
                tracing::warn!("File watcher registration failed: {e:#}");
            }
        });
    }
}

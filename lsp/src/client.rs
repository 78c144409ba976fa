//! The editor as seen through the connection: outgoing frames and
//! server-to-client requests awaiting their replies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use ink_ls_engine::{ClientFut, EditorClient, EditorDiagnostic};
use ink_ls_types::{
    MessageLevel, Notification as EngineNotification, PartialSettings, WorkspaceFolder,
};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{self, Notification, Request, WorkspaceCapabilities};

pub(crate) enum WriterCommand {
    Send(Value),
    Shutdown,
}

pub(crate) type PendingMap = Arc<tokio::sync::Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

pub(crate) struct LspClient {
    writer_tx: mpsc::UnboundedSender<WriterCommand>,
    pending: PendingMap,
    next_id: AtomicU64,
    capabilities: Mutex<WorkspaceCapabilities>,
    request_timeout: Duration,
}

impl LspClient {
    pub(crate) fn new(
        writer_tx: mpsc::UnboundedSender<WriterCommand>,
        pending: PendingMap,
        request_timeout: Duration,
    ) -> Self {
        Self {
            writer_tx,
            pending,
            next_id: AtomicU64::new(1),
            capabilities: Mutex::new(WorkspaceCapabilities::default()),
            request_timeout,
        }
    }

    pub(crate) fn set_capabilities(&self, capabilities: WorkspaceCapabilities) {
        *self
            .capabilities
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = capabilities;
    }

    fn capabilities(&self) -> WorkspaceCapabilities {
        *self
            .capabilities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a frame for the writer task. Returns `false` once it has stopped.
    pub(crate) fn send(&self, message: &impl Serialize) -> bool {
        let frame = match serde_json::to_value(message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("Failed to serialize outgoing message: {e}");
                return false;
            }
        };
        self.writer_tx.send(WriterCommand::Send(frame)).is_ok()
    }

    fn send_notification(&self, method: &'static str, params: Value) {
        if !self.send(&Notification::new(method, params)) {
            tracing::debug!("Dropping {method}: connection closed");
        }
    }

    /// Send a request to the editor and wait for its reply body.
    pub(crate) async fn send_request(&self, method: &'static str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if !self.send(&Request::new(id, method, Some(params))) {
            self.pending.lock().await.remove(&id);
            bail!("connection closed before {method} was sent");
        }

        let body = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(body)) => body,
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&id);
                bail!("connection closed while waiting for {method}");
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                bail!("{method} timed out after {:?}", self.request_timeout);
            }
        };

        if let Some(error) = body.get("error") {
            bail!(
                "{method} failed: {}",
                error["message"].as_str().unwrap_or("unknown error")
            );
        }
        body.get("result")
            .cloned()
            .with_context(|| format!("{method} reply has no result"))
    }
}

/// Route a reply from the editor to the request waiting on it.
pub(crate) async fn resolve_response(pending: &PendingMap, id: u64, body: Value) {
    let waiter = pending.lock().await.remove(&id);
    match waiter {
        Some(tx) => {
            let _ = tx.send(body);
        }
        None => tracing::debug!("Reply for unknown request {id}"),
    }
}

impl EditorClient for LspClient {
    fn workspace_folders(&self) -> ClientFut<'_, Option<Vec<WorkspaceFolder>>> {
        Box::pin(async move {
            if !self.capabilities().workspace_folders {
                return None;
            }
            match self.send_request("workspace/workspaceFolders", Value::Null).await {
                Ok(Value::Null) => None,
                Ok(result) => serde_json::from_value(result)
                    .inspect_err(|e| tracing::warn!("Malformed workspace folder list: {e}"))
                    .ok(),
                Err(e) => {
                    tracing::warn!("{e:#}");
                    None
                }
            }
        })
    }

    fn resource_settings<'a>(
        &'a self,
        scope_uri: &'a str,
    ) -> ClientFut<'a, Option<PartialSettings>> {
        Box::pin(async move {
            if !self.capabilities().configuration {
                return None;
            }
            let result = match self
                .send_request("workspace/configuration", protocol::configuration_params(scope_uri))
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!("{e:#}");
                    return None;
                }
            };
            let section = result.get(0).filter(|value| !value.is_null())?;
            serde_json::from_value(section.clone())
                .inspect_err(|e| tracing::warn!(scope = scope_uri, "Malformed ink settings: {e}"))
                .ok()
        })
    }

    fn publish_diagnostics(&self, uri: &str, diagnostics: Vec<EditorDiagnostic>) {
        self.send_notification(
            "textDocument/publishDiagnostics",
            json!({ "uri": uri, "diagnostics": diagnostics }),
        );
    }

    fn notify(&self, notification: EngineNotification) {
        self.send_notification(notification.method, notification.params);
    }

    fn show_message(&self, level: MessageLevel, message: &str) {
        self.send_notification(
            "window/showMessage",
            json!({ "type": level as u8, "message": message }),
        );
    }
}

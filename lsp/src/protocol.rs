//! JSON-RPC envelopes and the slice of LSP message shapes the server reads.

use ink_ls_engine::{FileChange, FileChangeKind};
use ink_ls_types::{PartialSettings, WorkspaceFolder};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const SERVER_NOT_INITIALIZED: i64 = -32002;

/// Configuration section requested from the client.
pub const SETTINGS_SECTION: &str = "ink";

/// TextDocumentSyncKind.Full
const SYNC_FULL: u8 = 1;

#[derive(Debug, Serialize)]
pub struct Request {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: u64, method: &'static str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Notification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    pub params: Value,
}

impl Notification {
    pub fn new(method: &'static str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
}

/// Reply to a client request. Exactly one of `result` / `error` is set.
#[derive(Debug, Serialize)]
pub struct Response {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(ResponseError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// A decoded frame from the client.
#[derive(Debug, PartialEq)]
pub enum Incoming {
    /// Reply to a request this server sent.
    Response { id: u64, body: Value },
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    Notification { method: String, params: Value },
}

pub fn parse_incoming(frame: &Value) -> Option<Incoming> {
    let id = frame.get("id").filter(|id| !id.is_null());
    let method = frame.get("method").and_then(Value::as_str).map(String::from);
    let params = frame.get("params").cloned().unwrap_or(Value::Null);
    let is_reply = frame.get("result").is_some() || frame.get("error").is_some();

    match (id, method) {
        (Some(id), Some(method)) => Some(Incoming::Request {
            id: id.clone(),
            method,
            params,
        }),
        (None, Some(method)) => Some(Incoming::Notification { method, params }),
        (Some(id), None) if is_reply => Some(Incoming::Response {
            id: id.as_u64()?,
            body: frame.clone(),
        }),
        _ => None,
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    #[serde(default)]
    pub root_uri: Option<String>,
    #[serde(default)]
    pub workspace_folders: Option<Vec<WorkspaceFolder>>,
    #[serde(default)]
    pub initialization_options: Option<Value>,
    #[serde(default)]
    pub capabilities: ClientCapabilities,
}

impl InitializeParams {
    /// Folders to register: the explicit list, else the root URI.
    pub fn folders(&self) -> Vec<WorkspaceFolder> {
        match &self.workspace_folders {
            Some(folders) if !folders.is_empty() => folders.clone(),
            _ => self
                .root_uri
                .iter()
                .map(|uri| WorkspaceFolder {
                    uri: uri.clone(),
                    name: String::new(),
                })
                .collect(),
        }
    }

    /// Settings passed at startup, either bare or under the `ink` key.
    pub fn settings(&self) -> Option<PartialSettings> {
        let options = self.initialization_options.as_ref()?;
        let section = options.get(SETTINGS_SECTION).unwrap_or(options);
        match serde_json::from_value(section.clone()) {
            Ok(settings) => Some(settings),
            Err(e) => {
                tracing::warn!("Ignoring malformed initializationOptions: {e}");
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    #[serde(default)]
    pub workspace: WorkspaceCapabilities,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceCapabilities {
    #[serde(default)]
    pub configuration: bool,
    #[serde(default)]
    pub workspace_folders: bool,
    #[serde(default)]
    pub did_change_watched_files: DynamicRegistration,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicRegistration {
    #[serde(default)]
    pub dynamic_registration: bool,
}

#[derive(Debug, Deserialize)]
pub struct DocumentId {
    pub uri: String,
}

#[derive(Debug, Deserialize)]
pub struct OpenedDocument {
    pub uri: String,
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidOpenParams {
    pub text_document: OpenedDocument,
}

#[derive(Debug, Deserialize)]
pub struct ContentChange {
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidChangeParams {
    pub text_document: DocumentId,
    pub content_changes: Vec<ContentChange>,
}

impl DidChangeParams {
    /// With full sync the last change carries the whole document.
    pub fn full_text(&self) -> Option<&str> {
        self.content_changes.last().map(|change| change.text.as_str())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidCloseParams {
    pub text_document: DocumentId,
}

#[derive(Debug, Deserialize)]
pub struct FileEvent {
    pub uri: String,
    #[serde(rename = "type")]
    pub kind: u8,
}

impl FileEvent {
    pub fn to_change(&self) -> Option<FileChange> {
        let kind = match self.kind {
            1 => FileChangeKind::Created,
            2 => FileChangeKind::Changed,
            3 => FileChangeKind::Deleted,
            _ => return None,
        };
        Some(FileChange {
            uri: self.uri.clone(),
            kind,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct DidChangeWatchedFilesParams {
    pub changes: Vec<FileEvent>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WorkspaceFoldersChange {
    #[serde(default)]
    pub added: Vec<WorkspaceFolder>,
    #[serde(default)]
    pub removed: Vec<WorkspaceFolder>,
}

#[derive(Debug, Deserialize)]
pub struct DidChangeWorkspaceFoldersParams {
    pub event: WorkspaceFoldersChange,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteCommandParams {
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
}

pub fn initialize_result(commands: &[&str]) -> Value {
    json!({
        "capabilities": {
            "textDocumentSync": {
                "openClose": true,
                "change": SYNC_FULL,
            },
            "executeCommandProvider": {
                "commands": commands,
            },
            "workspace": {
                "workspaceFolders": {
                    "supported": true,
                    "changeNotifications": true,
                },
            },
        },
        "serverInfo": {
            "name": "ink-ls",
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

pub fn configuration_params(scope_uri: &str) -> Value {
    json!({
        "items": [{ "scopeUri": scope_uri, "section": SETTINGS_SECTION }]
    })
}

/// Registration asking the client to report changes to story sources.
pub fn watched_files_registration<'a>(extensions: impl IntoIterator<Item = &'a str>) -> Value {
    let extensions: Vec<&str> = extensions.into_iter().collect();
    let glob = match extensions.as_slice() {
        [single] => format!("**/*.{single}"),
        many => format!("**/*.{{{}}}", many.join(",")),
    };
    json!({
        "registrations": [{
            "id": "ink-ls-watched-files",
            "method": "workspace/didChangeWatchedFiles",
            "registerOptions": {
                "watchers": [{ "globPattern": glob }],
            },
        }]
    })
}

//! Shared test utilities and fixtures
//!
//! Story workspaces on disk, stand-in `inklecate` scripts and an in-memory
//! editor connection to a running server.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ink_ls_engine::{PathToolLocator, ProcessSupervisor, SourceFilter, WorkspaceMirror};
use ink_ls_lsp::codec::{FrameReader, FrameWriter};
use ink_ls_lsp::{ServerOptions, SessionEnd, serve};
use ink_ls_types::CompilationSettings;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

const FRAME_TIMEOUT: Duration = Duration::from_secs(10);

/// A story project on disk.
pub struct StoryWorkspace {
    pub dir: TempDir,
}

impl StoryWorkspace {
    /// `main.ink`, an included file with the second extension, and files
    /// that must never reach the mirror.
    pub fn sample() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("main.ink"), "INCLUDE story/a.ink2\nHello.\n").unwrap();
        fs::create_dir_all(root.join("story")).unwrap();
        fs::write(root.join("story/a.ink2"), "=== a ===\nThere.\n-> END\n").unwrap();
        fs::write(root.join(".config"), "editor=1\n").unwrap();
        fs::write(root.join("notes.txt"), "not a story\n").unwrap();
        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn root_uri(&self) -> String {
        url::Url::from_file_path(self.root()).unwrap().to_string()
    }

    pub fn uri(&self, relative: &str) -> String {
        url::Url::from_file_path(self.root().join(relative))
            .unwrap()
            .to_string()
    }
}

/// Write a shell script standing in for `inklecate`. It is launched through
/// the `sh` shim, so it needs no executable bit.
pub fn write_tool(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("inklecate.sh");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    path
}

pub fn tool_settings(tool: &Path) -> CompilationSettings {
    CompilationSettings {
        main_story_path: "main.ink".to_string(),
        inklecate_path: tool.to_string_lossy().into_owned(),
        shim: Some("sh".to_string()),
    }
}

/// Relative paths of every file below `root`, sorted.
pub fn list_files(root: &Path) -> Vec<String> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let relative = path.strip_prefix(root).unwrap();
                out.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    let mut out = Vec::new();
    walk(root, root, &mut out);
    out.sort();
    out
}

/// The editor side of an in-memory connection to a running server.
pub struct Editor {
    writer: FrameWriter<WriteHalf<DuplexStream>>,
    reader: FrameReader<ReadHalf<DuplexStream>>,
    server: JoinHandle<anyhow::Result<SessionEnd>>,
    next_id: u64,
    pub scratch: TempDir,
}

impl Editor {
    /// Start a server with the real supervisor and tool lookup.
    pub fn start(defaults: CompilationSettings) -> Self {
        let scratch = tempfile::tempdir().unwrap();
        let options = ServerOptions {
            defaults,
            mirror: Arc::new(WorkspaceMirror::new(scratch.path(), SourceFilter::default())),
            runner: Arc::new(ProcessSupervisor::new()),
            installer: Arc::new(PathToolLocator::new()),
            request_timeout: Duration::from_secs(5),
        };
        let (ours, theirs) = tokio::io::duplex(256 * 1024);
        let (server_in, server_out) = tokio::io::split(theirs);
        let (our_in, our_out) = tokio::io::split(ours);
        Self {
            writer: FrameWriter::new(our_out),
            reader: FrameReader::new(our_in),
            server: tokio::spawn(serve(server_in, server_out, options)),
            next_id: 1,
            scratch,
        }
    }

    pub async fn send(&mut self, frame: Value) {
        self.writer.write_frame(&frame).await.unwrap();
    }

    pub async fn notify(&mut self, method: &str, params: Value) {
        self.send(json!({ "jsonrpc": "2.0", "method": method, "params": params }))
            .await;
    }

    /// Send a request and return its id without waiting for the reply.
    pub async fn request(&mut self, method: &str, params: Value) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.send(json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }))
            .await;
        id
    }

    pub async fn recv(&mut self) -> Value {
        tokio::time::timeout(FRAME_TIMEOUT, self.reader.read_frame())
            .await
            .expect("timed out waiting for the server")
            .unwrap()
            .expect("server closed the connection")
    }

    /// Read frames until one matches, returning everything read before it.
    pub async fn recv_until(&mut self, matches: impl Fn(&Value) -> bool) -> (Vec<Value>, Value) {
        let mut seen = Vec::new();
        loop {
            let frame = tokio::time::timeout(FRAME_TIMEOUT, self.reader.read_frame())
                .await
                .unwrap_or_else(|_| panic!("no matching frame; saw {seen:#?}"))
                .unwrap()
                .expect("server closed the connection");
            if matches(&frame) {
                return (seen, frame);
            }
            seen.push(frame);
        }
    }

    /// Read until the reply to `id`.
    pub async fn reply(&mut self, id: u64) -> (Vec<Value>, Value) {
        self.recv_until(|frame| frame["id"] == id && frame.get("method").is_none())
            .await
    }

    pub async fn initialize(&mut self, folders: &[String], options: Value) -> Value {
        let folders: Vec<Value> = folders
            .iter()
            .map(|uri| json!({ "uri": uri, "name": "story" }))
            .collect();
        let id = self
            .request(
                "initialize",
                json!({
                    "processId": null,
                    "workspaceFolders": folders,
                    "initializationOptions": options,
                    "capabilities": {}
                }),
            )
            .await;
        let (_, reply) = self.reply(id).await;
        self.notify("initialized", json!({})).await;
        reply
    }

    /// `shutdown` then `exit`; returns every frame seen before the reply.
    pub async fn shutdown(mut self) -> Vec<Value> {
        let id = self.request("shutdown", Value::Null).await;
        let (seen, _) = self.reply(id).await;
        self.notify("exit", Value::Null).await;
        let end = self.server.await.unwrap().unwrap();
        assert_eq!(end, SessionEnd::Exit { clean: true });
        seen
    }
}

pub fn is_notification(frame: &Value, method: &str) -> bool {
    frame["method"] == method && frame.get("id").is_none()
}

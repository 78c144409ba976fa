//! The supervisor keeps exactly one addressable run.

#![cfg(unix)]

use std::fs;
use std::path::Path;

use ink_ls_engine::{ProcessSupervisor, RunHandle, RunRequest, RunnerEvent, StoryRunner};
use ink_ls_types::RunMode;

use crate::common::{tool_settings, write_tool};

fn request(dir: &Path, body: &str) -> RunRequest {
    let tool_dir = dir.join(format!("tool-{}", body.len()));
    fs::create_dir_all(&tool_dir).unwrap();
    let tool = write_tool(&tool_dir, body);
    let main = dir.join("main.ink");
    fs::write(&main, "Hello.\n").unwrap();
    RunRequest {
        settings: tool_settings(&tool),
        scratch_main: main.clone(),
        real_main: main,
    }
}

/// Drain a run until its exit event.
async fn exit_of(mut handle: RunHandle) -> (Option<i32>, bool) {
    while let Some(event) = handle.events.recv().await {
        if let RunnerEvent::Exited { code, killed } = event {
            return (code, killed);
        }
    }
    panic!("run {} ended without an exit event", handle.generation);
}

#[tokio::test]
async fn overlapping_runs_keep_the_newest_addressable() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = ProcessSupervisor::new();

    let first = supervisor
        .compile(request(dir.path(), "sleep 0.2"))
        .await
        .unwrap();
    let second = supervisor
        .compile(request(dir.path(), "sleep 1; exit 0"))
        .await
        .expect("starting over a live run must not fail");

    assert!(second.generation > first.generation);
    assert_eq!(first.mode, RunMode::Compile);
    assert_eq!(supervisor.current_generation(), Some(second.generation));

    let newest = second.generation;
    assert_eq!(exit_of(first).await, (Some(0), false));
    assert_eq!(
        supervisor.current_generation(),
        Some(newest),
        "a stale exit must not clear the newer run"
    );
    assert!(supervisor.is_running());

    assert_eq!(exit_of(second).await, (Some(0), false));
    assert_eq!(supervisor.current_generation(), None);
    assert!(!supervisor.is_running());
}

#[tokio::test]
async fn stop_kills_only_the_addressable_run() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = ProcessSupervisor::new();

    let handle = supervisor
        .play(request(dir.path(), "exec sleep 30"))
        .await
        .unwrap();
    assert!(supervisor.is_running());
    assert!(supervisor.stop());

    let (_, killed) = exit_of(handle).await;
    assert!(killed);
    assert!(!supervisor.is_running());
    assert!(!supervisor.stop(), "nothing left to stop");
}

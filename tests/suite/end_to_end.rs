//! A full editor session against a stand-in `inklecate`.

#![cfg(unix)]

use std::fs;

use ink_ls_types::CompilationSettings;
use serde_json::{Value, json};

use crate::common::{Editor, StoryWorkspace, is_notification, tool_settings, write_tool};

const COMPILE_OK: &str = r#"[ "$1" = "-o" ] && printf '{"inkVersion":21}' > "$2"
exit 0"#;

const COMPILE_ERROR: &str = r#"echo "ERROR: line 3: bad syntax"
exit 1"#;

const CRASH: &str = r#"echo 'Unhandled exception: boom' >&2
exit 1"#;

const PLAY: &str = r#"if [ "$1" = "-p" ]; then
  echo "Hello."
  echo "1: Go north"
  echo "2: Go south"
  printf '?> '
  read choice
  echo "You chose $choice."
  echo "--- End of story ---"
fi
exit 0"#;

fn did_open(uri: &str, text: &str) -> Value {
    json!({
        "textDocument": { "uri": uri, "languageId": "ink", "version": 1, "text": text }
    })
}

fn diagnostics_for<'a>(frames: &'a [Value], uri: &str) -> Vec<&'a Value> {
    frames
        .iter()
        .filter(|f| is_notification(f, "textDocument/publishDiagnostics"))
        .filter(|f| f["params"]["uri"] == uri)
        .collect()
}

#[tokio::test]
async fn clean_compile_announces_the_story() {
    let workspace = StoryWorkspace::sample();
    let tools = tempfile::tempdir().unwrap();
    let tool = write_tool(tools.path(), COMPILE_OK);
    let mut editor = Editor::start(tool_settings(&tool));

    editor.initialize(&[workspace.root_uri()], Value::Null).await;
    let main_uri = workspace.uri("main.ink");
    editor
        .notify("textDocument/didOpen", did_open(&main_uri, "Hello again.\n"))
        .await;

    let (seen, compiled) = editor
        .recv_until(|f| is_notification(f, "didCompileStory"))
        .await;
    assert_eq!(compiled["params"]["workspaceUri"], workspace.root_uri());

    let story_uri = compiled["params"]["storyUri"].as_str().unwrap();
    let story = url::Url::parse(story_uri).unwrap().to_file_path().unwrap();
    assert!(story.starts_with(editor.scratch.path()), "{story:?}");
    assert!(story_uri.ends_with("main.ink.json"));
    assert_eq!(fs::read_to_string(&story).unwrap(), r#"{"inkVersion":21}"#);

    // The editor buffer went to the mirror, not to the workspace.
    let mirrored_main = story.with_file_name("main.ink");
    assert_eq!(fs::read_to_string(mirrored_main).unwrap(), "Hello again.\n");
    assert_eq!(
        fs::read_to_string(workspace.root().join("main.ink")).unwrap(),
        "INCLUDE story/a.ink2\nHello.\n"
    );

    let published = diagnostics_for(&seen, &main_uri);
    assert_eq!(published.len(), 1, "{seen:#?}");
    assert_eq!(published[0]["params"]["diagnostics"], json!([]));

    editor.shutdown().await;
}

#[tokio::test]
async fn compile_error_is_published_without_announcement() {
    let workspace = StoryWorkspace::sample();
    let tools = tempfile::tempdir().unwrap();
    let tool = write_tool(tools.path(), COMPILE_ERROR);
    // Tool location arrives through initialization options this time.
    let mut editor = Editor::start(CompilationSettings::platform_default());

    editor
        .initialize(
            &[workspace.root_uri()],
            json!({
                "inklecateExecutablePath": tool.to_string_lossy(),
                "runThroughMono": "sh"
            }),
        )
        .await;
    let main_uri = workspace.uri("main.ink");
    editor
        .notify("textDocument/didOpen", did_open(&main_uri, "Hello.\n\n* [oops\n"))
        .await;

    let (_, published) = editor
        .recv_until(|f| {
            is_notification(f, "textDocument/publishDiagnostics") && f["params"]["uri"] == main_uri
        })
        .await;
    let diagnostics = published["params"]["diagnostics"].as_array().unwrap();
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0]["severity"], 1);
    assert_eq!(diagnostics[0]["message"], "bad syntax");
    assert_eq!(diagnostics[0]["source"], "inklecate");
    assert_eq!(diagnostics[0]["range"]["start"]["line"], 2);

    let rest = editor.shutdown().await;
    assert!(
        !rest.iter().any(|f| is_notification(f, "didCompileStory")),
        "{rest:#?}"
    );
}

#[tokio::test]
async fn crashed_compile_is_reported_without_announcement() {
    let workspace = StoryWorkspace::sample();
    let tools = tempfile::tempdir().unwrap();
    let tool = write_tool(tools.path(), CRASH);
    let mut editor = Editor::start(tool_settings(&tool));
    editor.initialize(&[workspace.root_uri()], Value::Null).await;

    let main_uri = workspace.uri("main.ink");
    editor
        .notify("textDocument/didOpen", did_open(&main_uri, "Hello.\n"))
        .await;
    let (seen, published) = editor
        .recv_until(|f| {
            is_notification(f, "textDocument/publishDiagnostics") && f["params"]["uri"] == main_uri
        })
        .await;
    assert_eq!(published["params"]["diagnostics"], json!([]));
    assert!(
        seen.iter()
            .any(|f| is_notification(f, "window/showMessage") && f["params"]["type"] == 1),
        "{seen:#?}"
    );

    let rest = editor.shutdown().await;
    assert!(
        !seen
            .iter()
            .chain(&rest)
            .any(|f| is_notification(f, "didCompileStory")),
        "{rest:#?}"
    );
}

#[tokio::test]
async fn play_session_streams_runtime_events() {
    let workspace = StoryWorkspace::sample();
    let tools = tempfile::tempdir().unwrap();
    let tool = write_tool(tools.path(), PLAY);
    let mut editor = Editor::start(tool_settings(&tool));
    editor.initialize(&[workspace.root_uri()], Value::Null).await;

    editor
        .request("workspace/executeCommand", json!({ "command": "play-story" }))
        .await;
    let (before_prompt, _) = editor
        .recv_until(|f| is_notification(f, "runtime/prompt"))
        .await;

    let text: Vec<&Value> = before_prompt
        .iter()
        .filter(|f| is_notification(f, "runtime/text"))
        .map(|f| &f["params"]["text"])
        .collect();
    assert_eq!(text, vec![&json!("Hello.")]);
    let choices: Vec<&Value> = before_prompt
        .iter()
        .filter(|f| is_notification(f, "runtime/choice"))
        .map(|f| &f["params"]["choice"]["text"])
        .collect();
    assert_eq!(choices, vec![&json!("Go north"), &json!("Go south")]);

    editor
        .request(
            "workspace/executeCommand",
            json!({ "command": "select-option", "arguments": [1] }),
        )
        .await;
    let (after_choice, _) = editor
        .recv_until(|f| is_notification(f, "runtime/endOfStory"))
        .await;
    assert!(
        after_choice
            .iter()
            .any(|f| is_notification(f, "runtime/text") && f["params"]["text"] == "You chose 1."),
        "{after_choice:#?}"
    );

    editor.shutdown().await;
}

#[tokio::test]
async fn missing_tool_only_complains_on_explicit_commands() {
    let workspace = StoryWorkspace::sample();
    let tools = tempfile::tempdir().unwrap();
    let mut editor = Editor::start(CompilationSettings {
        inklecate_path: tools.path().join("absent").to_string_lossy().into_owned(),
        ..CompilationSettings::platform_default()
    });
    editor.initialize(&[workspace.root_uri()], Value::Null).await;

    let main_uri = workspace.uri("main.ink");
    editor
        .notify("textDocument/didOpen", did_open(&main_uri, "Hello.\n"))
        .await;
    let id = editor
        .request("workspace/executeCommand", json!({ "command": "compile-story" }))
        .await;
    let (seen, reply) = editor.reply(id).await;
    assert!(reply["result"].is_null());

    let messages: Vec<&Value> = seen
        .iter()
        .filter(|f| is_notification(f, "window/showMessage"))
        .collect();
    assert_eq!(messages.len(), 1, "{seen:#?}");
    assert_eq!(messages[0]["params"]["type"], 2);
    assert!(
        messages[0]["params"]["message"]
            .as_str()
            .unwrap()
            .contains("inklecate")
    );

    editor.shutdown().await;
}

//! Play-mode runtime events and the notifications that carry them.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const DID_COMPILE_STORY: &str = "didCompileStory";
pub const RUNTIME_TEXT: &str = "runtime/text";
pub const RUNTIME_TAG: &str = "runtime/tag";
pub const RUNTIME_CHOICE: &str = "runtime/choice";
pub const RUNTIME_PROMPT: &str = "runtime/prompt";
pub const RUNTIME_END_OF_STORY: &str = "runtime/endOfStory";
pub const RUNTIME_ERROR: &str = "runtime/error";

/// How the external tool is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunMode {
    /// Compile to a JSON artifact and collect diagnostics.
    Compile,
    /// Interactive play session over stdin/stdout.
    Play,
}

impl RunMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Compile => "compile",
            Self::Play => "play",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub text: String,
}

/// One structured event of an interactive session, in tool output order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    Text(String),
    Tags(Vec<String>),
    Choice(Choice),
    Prompt,
    EndOfStory,
    Error(String),
}

impl RuntimeEvent {
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            Self::Text(_) => RUNTIME_TEXT,
            Self::Tags(_) => RUNTIME_TAG,
            Self::Choice(_) => RUNTIME_CHOICE,
            Self::Prompt => RUNTIME_PROMPT,
            Self::EndOfStory => RUNTIME_END_OF_STORY,
            Self::Error(_) => RUNTIME_ERROR,
        }
    }

    #[must_use]
    pub fn params(&self) -> Value {
        match self {
            Self::Text(text) => json!({ "text": text }),
            Self::Tags(tags) => json!({ "tags": tags }),
            Self::Choice(choice) => json!({ "choice": choice }),
            Self::Prompt | Self::EndOfStory => json!({}),
            Self::Error(error) => json!({ "error": error }),
        }
    }
}

/// Payload of [`DID_COMPILE_STORY`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidCompileStoryParams {
    pub workspace_uri: String,
    pub story_uri: String,
}

/// A server-to-client notification produced by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: &'static str,
    pub params: Value,
}

impl Notification {
    #[must_use]
    pub fn did_compile_story(params: &DidCompileStoryParams) -> Self {
        Self {
            method: DID_COMPILE_STORY,
            params: json!({
                "workspaceUri": params.workspace_uri,
                "storyUri": params.story_uri,
            }),
        }
    }
}

impl From<&RuntimeEvent> for Notification {
    fn from(event: &RuntimeEvent) -> Self {
        Self {
            method: event.method(),
            params: event.params(),
        }
    }
}

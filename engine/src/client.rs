//! The editor on the other end of the connection, as the engine sees it.

use std::future::Future;
use std::pin::Pin;

use ink_ls_types::{MessageLevel, Notification, PartialSettings, StoryDiagnostic, WorkspaceFolder};
use serde::{Deserialize, Serialize};

/// Client request future type alias.
pub type ClientFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Source tag attached to every published diagnostic.
pub const DIAGNOSTIC_SOURCE: &str = "inklecate";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

/// A diagnostic in the editor's wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditorDiagnostic {
    pub range: Range,
    pub severity: u8,
    pub source: String,
    pub message: String,
}

impl From<&StoryDiagnostic> for EditorDiagnostic {
    /// The tool reports lines only, so the range covers the whole line.
    fn from(diagnostic: &StoryDiagnostic) -> Self {
        let line = diagnostic.line().saturating_sub(1);
        Self {
            range: Range {
                start: Position { line, character: 0 },
                end: Position {
                    line,
                    character: u32::MAX,
                },
            },
            severity: diagnostic.severity().as_lsp(),
            source: DIAGNOSTIC_SOURCE.to_string(),
            message: diagnostic.display_message(),
        }
    }
}

/// Everything the engine needs from the editor.
///
/// The two queries resolve to `None` when the editor does not support them.
/// The rest are fire-and-forget.
pub trait EditorClient: Send + Sync {
    fn workspace_folders(&self) -> ClientFut<'_, Option<Vec<WorkspaceFolder>>>;

    /// Settings scoped to `scope_uri` (a document or workspace root).
    fn resource_settings<'a>(
        &'a self,
        scope_uri: &'a str,
    ) -> ClientFut<'a, Option<PartialSettings>>;

    /// Replace the diagnostics shown for `uri`. An empty list clears them.
    fn publish_diagnostics(&self, uri: &str, diagnostics: Vec<EditorDiagnostic>);

    fn notify(&self, notification: Notification);

    fn show_message(&self, level: MessageLevel, message: &str);
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use ink_ls_types::DiagnosticKind;

    use super::*;

    #[test]
    fn converts_to_whole_line_range() {
        let diagnostic = StoryDiagnostic::new(
            DiagnosticKind::Error,
            PathBuf::from("/w/main.ink"),
            3,
            "bad syntax".to_string(),
        );
        let converted = EditorDiagnostic::from(&diagnostic);
        assert_eq!(converted.range.start, Position { line: 2, character: 0 });
        assert_eq!(converted.range.end.line, 2);
        assert_eq!(converted.range.end.character, u32::MAX);
        assert_eq!(converted.severity, 1);
        assert_eq!(converted.source, "inklecate");
        assert_eq!(converted.message, "bad syntax");
    }

    #[test]
    fn todo_becomes_prefixed_information() {
        let diagnostic = StoryDiagnostic::new(
            DiagnosticKind::Todo,
            PathBuf::from("/w/main.ink"),
            1,
            "write the ending".to_string(),
        );
        let converted = EditorDiagnostic::from(&diagnostic);
        assert_eq!(converted.severity, 3);
        assert_eq!(converted.message, "Todo: write the ending");
    }

    #[test]
    fn serializes_in_lsp_shape() {
        let diagnostic = StoryDiagnostic::new(
            DiagnosticKind::RuntimeWarning,
            PathBuf::from("/w/main.ink"),
            10,
            "odd".to_string(),
        );
        let value = serde_json::to_value(EditorDiagnostic::from(&diagnostic)).unwrap();
        assert_eq!(value["range"]["start"]["line"], 9);
        assert_eq!(value["severity"], 2);
        assert_eq!(value["source"], "inklecate");
    }
}

//! Diagnostics reported by the external tool.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

/// Severity level for a published diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiagnosticSeverity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

impl DiagnosticSeverity {
    /// LSP numeric severity (1=Error, 2=Warning, 3=Info, 4=Hint).
    #[must_use]
    pub fn as_lsp(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "info",
            Self::Hint => "hint",
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("unrecognized diagnostic kind: {0:?}")]
pub struct UnknownKindError(pub String);

/// The kind marker `inklecate` prints at the start of a diagnostic line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
    Error,
    Warning,
    RuntimeError,
    RuntimeWarning,
    Todo,
}

impl DiagnosticKind {
    pub const ALL: [DiagnosticKind; 5] = [
        Self::Error,
        Self::Warning,
        Self::RuntimeError,
        Self::RuntimeWarning,
        Self::Todo,
    ];

    #[must_use]
    pub fn marker(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warning => "WARNING",
            Self::RuntimeError => "RUNTIME ERROR",
            Self::RuntimeWarning => "RUNTIME WARNING",
            Self::Todo => "TODO",
        }
    }

    /// Five kinds onto three severities.
    #[must_use]
    pub fn severity(self) -> DiagnosticSeverity {
        match self {
            Self::Error | Self::RuntimeError => DiagnosticSeverity::Error,
            Self::Warning | Self::RuntimeWarning => DiagnosticSeverity::Warning,
            Self::Todo => DiagnosticSeverity::Information,
        }
    }

    /// Runtime kinds are routed to the runtime stream while playing.
    #[must_use]
    pub fn is_runtime(self) -> bool {
        matches!(self, Self::RuntimeError | Self::RuntimeWarning)
    }
}

impl FromStr for DiagnosticKind {
    type Err = UnknownKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.marker() == s)
            .ok_or_else(|| UnknownKindError(s.to_string()))
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.marker())
    }
}

/// A diagnostic keyed to a real source file (never a scratch path).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryDiagnostic {
    kind: DiagnosticKind,
    path: PathBuf,
    /// 1-based, as written by the tool.
    line: u32,
    message: String,
}

impl StoryDiagnostic {
    #[must_use]
    pub fn new(kind: DiagnosticKind, path: PathBuf, line: u32, message: String) -> Self {
        Self {
            kind,
            path,
            line,
            message,
        }
    }

    #[must_use]
    pub fn kind(&self) -> DiagnosticKind {
        self.kind
    }

    #[must_use]
    pub fn severity(&self) -> DiagnosticSeverity {
        self.kind.severity()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 1-based line number.
    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Message as shown to the user; TODOs are prefixed.
    #[must_use]
    pub fn display_message(&self) -> String {
        match self.kind {
            DiagnosticKind::Todo => format!("Todo: {}", self.message),
            _ => self.message.clone(),
        }
    }

    /// Format as `path:line: severity: message`.
    #[must_use]
    pub fn display_with_path(&self) -> String {
        format!(
            "{}:{}: {}: {}",
            self.path.display(),
            self.line,
            self.severity().label(),
            self.display_message(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_mapping_is_total() {
        let severities: Vec<_> = DiagnosticKind::ALL.iter().map(|k| k.severity()).collect();
        assert_eq!(
            severities,
            vec![
                DiagnosticSeverity::Error,
                DiagnosticSeverity::Warning,
                DiagnosticSeverity::Error,
                DiagnosticSeverity::Warning,
                DiagnosticSeverity::Information,
            ]
        );
    }

    #[test]
    fn markers_round_trip_through_from_str() {
        for kind in DiagnosticKind::ALL {
            assert_eq!(kind.marker().parse::<DiagnosticKind>().unwrap(), kind);
        }
        assert!("FATAL".parse::<DiagnosticKind>().is_err());
        assert!("error".parse::<DiagnosticKind>().is_err());
    }

    #[test]
    fn runtime_kinds() {
        assert!(DiagnosticKind::RuntimeError.is_runtime());
        assert!(DiagnosticKind::RuntimeWarning.is_runtime());
        assert!(!DiagnosticKind::Error.is_runtime());
        assert!(!DiagnosticKind::Todo.is_runtime());
    }

    #[test]
    fn todo_message_is_prefixed() {
        let diag = StoryDiagnostic::new(
            DiagnosticKind::Todo,
            PathBuf::from("main.ink"),
            4,
            "write the ending".to_string(),
        );
        assert_eq!(diag.display_message(), "Todo: write the ending");
        assert_eq!(diag.display_with_path(), "main.ink:4: info: Todo: write the ending");
    }

    #[test]
    fn lsp_numeric_severity() {
        assert_eq!(DiagnosticSeverity::Error.as_lsp(), 1);
        assert_eq!(DiagnosticSeverity::Warning.as_lsp(), 2);
        assert_eq!(DiagnosticSeverity::Information.as_lsp(), 3);
        assert!(DiagnosticSeverity::Error.is_error());
        assert!(!DiagnosticSeverity::Hint.is_error());
    }
}

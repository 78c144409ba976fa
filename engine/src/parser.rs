//! Parser for `inklecate`'s line-oriented stdout.
//!
//! [`classify_line`] recognizes one line; [`LineBuffer`] reassembles lines
//! from arbitrarily split stdout chunks; [`OutputScanner`] ties the two
//! together and applies the compile/play routing rules.

use std::mem;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use ink_ls_types::{Choice, DiagnosticKind, RunMode, RuntimeEvent, StoryDiagnostic};
use regex::Regex;

/// Sentinel line printed when a played story runs out of content.
pub const END_OF_STORY: &str = "--- End of story ---";

/// Marker of a line asking the user to pick a choice.
pub const PROMPT_MARKER: &str = "?>";

const BOM: &str = "\u{feff}";
const BOM_BYTES: &[u8] = b"\xEF\xBB\xBF";

static DIAGNOSTIC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Z][A-Z ]*[A-Z]):\s*(?:'([^']+)'\s+)?line (\d+):\s*(.*)$")
        .expect("diagnostic pattern is valid")
});

static TAGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^# tags: (.*)$").expect("tags pattern is valid"));

static CHOICE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+): (.*)$").expect("choice pattern is valid"));

#[must_use]
pub fn strip_bom(text: &str) -> &str {
    text.strip_prefix(BOM).unwrap_or(text)
}

/// One classified line of tool output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Diagnostic {
        kind: DiagnosticKind,
        /// Path relative to the main story's directory, when the tool names one.
        file: Option<String>,
        /// 1-based.
        line: u32,
        message: String,
    },
    Tags(Vec<String>),
    Choice(Choice),
    Prompt,
    EndOfStory,
    Text(String),
}

/// Classify a single line (without its terminator).
///
/// Returns `None` for empty lines and for diagnostic-shaped lines whose kind
/// is not recognized.
#[must_use]
pub fn classify_line(line: &str) -> Option<OutputLine> {
    let line = line.strip_suffix('\r').unwrap_or(line);

    if let Some(caps) = DIAGNOSTIC.captures(line) {
        let Ok(kind) = caps[1].parse::<DiagnosticKind>() else {
            tracing::debug!("Dropping diagnostic with unknown kind: {line}");
            return None;
        };
        let Ok(line_number) = caps[3].parse::<u32>() else {
            tracing::debug!("Dropping diagnostic with unparsable line: {line}");
            return None;
        };
        return Some(OutputLine::Diagnostic {
            kind,
            file: caps.get(2).map(|m| m.as_str().to_string()),
            line: line_number,
            message: caps[4].to_string(),
        });
    }

    if let Some(caps) = TAGS.captures(line) {
        let tags = caps[1]
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        return Some(OutputLine::Tags(tags));
    }

    if let Some(caps) = CHOICE.captures(line)
        && let Ok(index) = caps[1].parse::<u32>()
    {
        return Some(OutputLine::Choice(Choice {
            index,
            text: caps[2].to_string(),
        }));
    }

    if line.starts_with(PROMPT_MARKER) {
        return Some(OutputLine::Prompt);
    }

    if line == END_OF_STORY {
        return Some(OutputLine::EndOfStory);
    }

    if line.trim().is_empty() {
        None
    } else {
        Some(OutputLine::Text(line.to_string()))
    }
}

/// Reassembles complete lines from stdout chunks.
///
/// The trailing partial line of a chunk is retained until a later chunk
/// completes it or [`LineBuffer::finish`] flushes it.
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: Vec<u8>,
}

impl LineBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let chunk = chunk.strip_prefix(BOM_BYTES).unwrap_or(chunk);
        let mut lines = Vec::new();
        for byte in chunk {
            if *byte == b'\n' {
                let raw = mem::take(&mut self.partial);
                lines.push(decode_line(&raw));
            } else {
                self.partial.push(*byte);
            }
        }
        lines
    }

    /// Take the pending partial line if it is a choice prompt.
    ///
    /// The tool prints the prompt marker and then blocks on stdin without a
    /// newline, so waiting for the terminator would stall the session.
    pub fn take_prompt(&mut self) -> Option<String> {
        if self.partial.starts_with(PROMPT_MARKER.as_bytes()) {
            let raw = mem::take(&mut self.partial);
            Some(decode_line(&raw))
        } else {
            None
        }
    }

    /// Flush whatever partial line remains at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let raw = mem::take(&mut self.partial);
        Some(decode_line(&raw))
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// A parsed output item, already routed for the run mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Diagnostic(StoryDiagnostic),
    Runtime(RuntimeEvent),
}

/// Streaming scanner over one process's stdout.
#[derive(Debug)]
pub struct OutputScanner {
    mode: RunMode,
    main_story: PathBuf,
    story_dir: PathBuf,
    /// Compile mode stops collecting diagnostics at the first plain-text line.
    collecting: bool,
    buffer: LineBuffer,
}

impl OutputScanner {
    /// `main_story` is the real (not mirrored) path of the main story file.
    #[must_use]
    pub fn new(mode: RunMode, main_story: PathBuf) -> Self {
        let story_dir = main_story
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self {
            mode,
            main_story,
            story_dir,
            collecting: true,
            buffer: LineBuffer::new(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<ScanEvent> {
        let mut events: Vec<ScanEvent> = Vec::new();
        for line in self.buffer.push(chunk) {
            events.extend(self.scan_line(&line));
        }
        if self.mode == RunMode::Play
            && let Some(prompt) = self.buffer.take_prompt()
        {
            events.extend(self.scan_line(&prompt));
        }
        events
    }

    pub fn finish(&mut self) -> Vec<ScanEvent> {
        match self.buffer.finish() {
            Some(line) => self.scan_line(&line).into_iter().collect(),
            None => Vec::new(),
        }
    }

    fn scan_line(&mut self, line: &str) -> Option<ScanEvent> {
        match (classify_line(line)?, self.mode) {
            (
                OutputLine::Diagnostic {
                    kind,
                    file,
                    line,
                    message,
                },
                mode,
            ) => {
                if mode == RunMode::Play && kind.is_runtime() {
                    return Some(ScanEvent::Runtime(RuntimeEvent::Error(message)));
                }
                if mode == RunMode::Compile && !self.collecting {
                    return None;
                }
                let path = match file {
                    Some(file) => self.story_dir.join(file),
                    None => self.main_story.clone(),
                };
                Some(ScanEvent::Diagnostic(StoryDiagnostic::new(
                    kind, path, line, message,
                )))
            }
            (OutputLine::Text(_), RunMode::Compile) => {
                if self.collecting {
                    tracing::debug!("Unstructured compiler output, closing diagnostics: {line}");
                }
                self.collecting = false;
                None
            }
            (_, RunMode::Compile) => None,
            (OutputLine::Text(text), RunMode::Play) => {
                Some(ScanEvent::Runtime(RuntimeEvent::Text(text)))
            }
            (OutputLine::Tags(tags), RunMode::Play) => {
                Some(ScanEvent::Runtime(RuntimeEvent::Tags(tags)))
            }
            (OutputLine::Choice(choice), RunMode::Play) => {
                Some(ScanEvent::Runtime(RuntimeEvent::Choice(choice)))
            }
            (OutputLine::Prompt, RunMode::Play) => Some(ScanEvent::Runtime(RuntimeEvent::Prompt)),
            (OutputLine::EndOfStory, RunMode::Play) => {
                Some(ScanEvent::Runtime(RuntimeEvent::EndOfStory))
            }
        }
    }
}

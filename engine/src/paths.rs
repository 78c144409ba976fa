//! URI and path translation.
//!
//! Pure functions only: converting client URIs to filesystem paths and back,
//! and deciding whether one path lies inside another.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, Error)]
#[error("invalid document URI {uri:?}: {reason}")]
pub struct InvalidUriError {
    uri: String,
    reason: &'static str,
}

impl InvalidUriError {
    fn new(uri: &str, reason: &'static str) -> Self {
        Self {
            uri: uri.to_string(),
            reason,
        }
    }

    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }
}

#[derive(Debug, Clone, Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub struct PathToUriError {
    path: PathBuf,
}

/// `C:`, `c:\...`, `D:/...`
fn has_drive_prefix(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() >= 2
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes.len() == 2 || bytes[2] == b'\\' || bytes[2] == b'/')
}

fn scheme_of(s: &str) -> Option<&str> {
    let (scheme, _) = s.split_once(':')?;
    let mut chars = scheme.chars();
    let first = chars.next()?;
    let valid = first.is_ascii_alphabetic()
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    valid.then_some(scheme)
}

/// Convert a document URI to a filesystem path.
///
/// Plain paths (no scheme) and drive-letter paths are returned unchanged.
/// `file:` URIs are decoded. Anything else is rejected.
pub fn to_filesystem_path(uri: &str) -> Result<PathBuf, InvalidUriError> {
    if uri.is_empty() {
        return Err(InvalidUriError::new(uri, "empty"));
    }
    if has_drive_prefix(uri) {
        return Ok(PathBuf::from(uri));
    }
    match scheme_of(uri) {
        None => Ok(PathBuf::from(uri)),
        Some(scheme) if scheme.eq_ignore_ascii_case("file") => {
            let url = Url::parse(uri).map_err(|_| InvalidUriError::new(uri, "malformed URI"))?;
            url.to_file_path()
                .map_err(|()| InvalidUriError::new(uri, "not a local file path"))
        }
        Some(_) => Err(InvalidUriError::new(uri, "unsupported scheme")),
    }
}

pub fn path_to_file_uri(path: &Path) -> Result<Url, PathToUriError> {
    Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

/// Lexically resolve `.` and `..` components.
#[must_use]
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for c in path.components() {
        match c {
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(c),
            },
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out.iter().collect()
}

/// Relative location of `candidate` under `ancestor`, if strictly inside it.
#[must_use]
pub fn relative_to(candidate: &Path, ancestor: &Path) -> Option<PathBuf> {
    let candidate = normalize_path(candidate);
    let ancestor = normalize_path(ancestor);
    let rel = candidate.strip_prefix(&ancestor).ok()?;
    if rel.as_os_str().is_empty() {
        return None;
    }
    Some(rel.to_path_buf())
}

/// Separator-agnostic lexical form of a path string.
#[derive(Debug, PartialEq, Eq)]
struct LexicalPath {
    /// Lower-cased drive letter and/or leading root.
    anchor: Option<String>,
    segments: Vec<String>,
}

impl LexicalPath {
    fn parse(raw: &str) -> Self {
        let unified = raw.replace('\\', "/");
        let (drive, rest) = if has_drive_prefix(&unified) {
            (Some(unified[..2].to_ascii_lowercase()), &unified[2..])
        } else {
            (None, unified.as_str())
        };
        let rooted = rest.starts_with('/');
        let anchor = match (drive, rooted) {
            (Some(d), true) => Some(format!("{d}/")),
            (Some(d), false) => Some(d),
            (None, true) => Some("/".to_string()),
            (None, false) => None,
        };

        let mut segments: Vec<String> = Vec::new();
        for seg in rest.split('/') {
            match seg {
                "" | "." => {}
                ".." => match segments.last() {
                    Some(last) if last != ".." => {
                        segments.pop();
                    }
                    // `..` above a root stays at the root.
                    _ if anchor.is_some() => {}
                    _ => segments.push("..".to_string()),
                },
                other => segments.push(other.to_string()),
            }
        }
        Self { anchor, segments }
    }
}

/// True iff `candidate` lies strictly within `ancestor` once both are resolved.
///
/// Works on either separator style, with or without drive letters.
#[must_use]
pub fn is_child_path(candidate: impl AsRef<Path>, ancestor: impl AsRef<Path>) -> bool {
    let candidate = LexicalPath::parse(&candidate.as_ref().to_string_lossy());
    let ancestor = LexicalPath::parse(&ancestor.as_ref().to_string_lossy());

    // A differing anchor would make the relative path absolute.
    if candidate.anchor != ancestor.anchor {
        return false;
    }
    if candidate.segments.len() <= ancestor.segments.len() {
        return false;
    }
    if ancestor.segments.iter().any(|s| s == "..") {
        return false;
    }
    candidate
        .segments
        .iter()
        .zip(&ancestor.segments)
        .all(|(c, a)| c == a)
        && candidate.segments[ancestor.segments.len()] != ".."
}

/// First entry whose root is an ancestor of `path`.
pub fn find_owning_workspace<'a, T>(
    path: &Path,
    entries: impl IntoIterator<Item = &'a T>,
    root_of: impl Fn(&T) -> &Path,
) -> Option<&'a T> {
    entries
        .into_iter()
        .find(|entry| is_child_path(path, root_of(entry)))
}

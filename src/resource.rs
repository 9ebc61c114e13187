//! Resolution of changelog paths to readable content.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::Error;

/// Prefix some deployments use for changelogs bundled with the application.
pub const CLASSPATH_PREFIX: &str = "classpath:";

/// Strip a leading `classpath:` from a changelog path.
pub fn strip_classpath_prefix(path: &str) -> &str {
    path.strip_prefix(CLASSPATH_PREFIX).unwrap_or(path)
}

/// Resolves changelog source paths to their text.
pub trait ResourceAccessor: Send + Sync {
    /// Read the resource at `path`.
    fn read(&self, path: &str) -> Result<String, Error>;

    /// Resolve `relative` against the directory containing `base`.
    fn resolve(&self, base: &str, relative: &str) -> String {
        let (prefix, base) = match base.strip_prefix(CLASSPATH_PREFIX) {
            Some(rest) => (CLASSPATH_PREFIX, rest),
            None => ("", base),
        };
        let parent = match base.rfind('/') {
            Some(i) => &base[..i],
            None => "",
        };
        let joined = if parent.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{}", parent, relative)
        };
        format!("{}{}", prefix, normalize(&joined))
    }
}

/// Collapse `.` and `..` segments of a `/`-separated path.
fn normalize(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if matches!(segments.last(), Some(last) if *last != "..") {
                    segments.pop();
                } else if !absolute {
                    segments.push("..");
                }
            }
            other => segments.push(other),
        }
    }
    let joined = segments.join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}

/// Reads changelogs from a directory on disk. Relative paths resolve against `root`.
#[derive(Debug, Clone)]
pub struct FileSystemResourceAccessor {
    root: PathBuf,
}

impl FileSystemResourceAccessor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ResourceAccessor for FileSystemResourceAccessor {
    fn read(&self, path: &str) -> Result<String, Error> {
        let full = self.root.join(strip_classpath_prefix(path));
        match std::fs::read_to_string(&full) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::ResourceNotFound(path.to_string()))
            }
            Err(e) => Err(Error::io(full, e)),
        }
    }
}

/// Serves changelogs from memory. Useful for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryResourceAccessor {
    files: HashMap<String, String>,
}

impl MemoryResourceAccessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.insert(path, content);
        self
    }

    pub fn insert(&mut self, path: impl Into<String>, content: impl Into<String>) {
        self.files.insert(path.into(), content.into());
    }
}

impl ResourceAccessor for MemoryResourceAccessor {
    fn read(&self, path: &str) -> Result<String, Error> {
        self.files
            .get(path)
            .or_else(|| self.files.get(strip_classpath_prefix(path)))
            .cloned()
            .ok_or_else(|| Error::ResourceNotFound(path.to_string()))
    }
}

//! Utility functions

use crate::error::{DriverError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

/// Reads the json file and deserializes it into the provided type.
pub fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|err| DriverError::io(err, path))?;
    serde_json::from_str(&contents).map_err(Into::into)
}

/// Writes serializes the provided value to JSON and writes it to a file.
///
/// The file is written atomically: the content goes to a temporary sibling
/// first which is then persisted under the final name.
pub fn write_json_file<T: Serialize>(path: impl AsRef<Path>, content: &T) -> Result<()> {
    let path = path.as_ref();
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut file =
        tempfile::NamedTempFile::new_in(dir).map_err(|err| DriverError::io(err, dir))?;
    serde_json::to_writer_pretty(&mut file, content)?;
    file.write_all(b"\n").map_err(|err| DriverError::io(err, path))?;
    file.persist(path).map_err(|err| DriverError::io(err.error, path))?;
    Ok(())
}

/// Creates the parent directory of the given file path, if there is one.
pub fn create_parent_dir_all(file: impl AsRef<Path>) -> Result<()> {
    let file = file.as_ref();
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).map_err(|err| DriverError::io(err, parent))?;
    }
    Ok(())
}

/// Canonicalize the path, returning it unchanged if canonicalization fails
/// because it does not exist yet.
pub fn canonicalize(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    dunce::canonicalize(path).unwrap_or_else(|_| normalize(path))
}

/// Lexically normalizes the path: resolves `.` and `..` components without
/// touching the filesystem.
pub fn normalize(path: impl AsRef<Path>) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for comp in path.as_ref().components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(comp);
                }
            }
            comp => out.push(comp),
        }
    }
    out
}

/// Resolves `file` against `directory` unless it is already absolute, then
/// lexically normalizes the result.
pub fn resolve_in(directory: impl AsRef<Path>, file: impl AsRef<Path>) -> PathBuf {
    let file = file.as_ref();
    if file.is_absolute() {
        normalize(file)
    } else {
        normalize(directory.as_ref().join(file))
    }
}

/// Collapses backslash-escaped spaces (`\ `) into plain spaces.
///
/// Clang SA removes the escape sequences when it writes its result files
/// while other analyzers keep them, so canonical artifact paths always use
/// the collapsed form.
pub fn unescape_spaces(s: &str) -> String {
    s.replace("\\ ", " ")
}

/// Returns the file name of the path as a lossy string.
pub fn file_name(path: impl AsRef<Path>) -> String {
    path.as_ref().file_name().map(|f| f.to_string_lossy().into_owned()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_normalize_paths() {
        assert_eq!(normalize("/a/b/../c/./d"), PathBuf::from("/a/c/d"));
        assert_eq!(normalize("a/./b"), PathBuf::from("a/b"));
    }

    #[test]
    fn resolves_relative_sources() {
        assert_eq!(resolve_in("/proj", "src/a.c"), PathBuf::from("/proj/src/a.c"));
        assert_eq!(resolve_in("/proj", "/abs/a.c"), PathBuf::from("/abs/a.c"));
        assert_eq!(resolve_in("/proj/sub", "../a.c"), PathBuf::from("/proj/a.c"));
    }

    #[test]
    fn unescapes_spaces() {
        assert_eq!(unescape_spaces(r"/p/my\ file.c"), "/p/my file.c");
        assert_eq!(unescape_spaces("/p/plain.c"), "/p/plain.c");
    }

    #[test]
    fn json_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        let value = serde_json::json!({"a": 1, "b": ["x", "y"]});
        write_json_file(&path, &value).unwrap();
        let read: serde_json::Value = read_json_file(&path).unwrap();
        assert_eq!(read, value);
    }
}

//! The canonical representation of a single build action.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
};

/// Languages recognized by the supported analyzers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    C,
    Cpp,
    ObjC,
    ObjCpp,
}

impl Language {
    /// The language as it is spelled on a compiler command line (`-x`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::C => "c",
            Language::Cpp => "c++",
            Language::ObjC => "objective-c",
            Language::ObjCpp => "objective-c++",
        }
    }

    /// Parses a `-x <lang>` argument.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "c" => Some(Language::C),
            "c++" => Some(Language::Cpp),
            "objective-c" => Some(Language::ObjC),
            "objective-c++" => Some(Language::ObjCpp),
            _ => None,
        }
    }

    /// Determines the language from a source file extension.
    ///
    /// Note that `.C` (upper case) counts as C++, like it does for gcc.
    pub fn from_extension(path: &Path) -> Option<Self> {
        let ext = path.extension()?;
        match ext.to_str()? {
            "c" => Some(Language::C),
            "cp" | "cpp" | "cxx" | "txx" | "cc" | "C" | "ii" => Some(Language::Cpp),
            "m" => Some(Language::ObjC),
            "mm" => Some(Language::ObjCpp),
            _ => None,
        }
    }

    pub fn is_cpp(&self) -> bool {
        matches!(self, Language::Cpp | Language::ObjCpp)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a build command does with its inputs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    #[default]
    Compile,
    Link,
    Preprocess,
    Info,
}

/// One deduplicated compile step producing exactly one translation unit.
///
/// Instances are created by the log parser and never mutated afterwards;
/// attaching an analyzer produces a fresh value via [`Self::with_analyzer`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildAction {
    original_command: String,
    directory: PathBuf,
    source: PathBuf,
    lang: Option<Language>,
    target: String,
    compiler_includes: Vec<String>,
    compiler_standard: String,
    analyzer_options: Vec<String>,
    output: String,
    kind: ActionKind,
    analyzer: String,
}

/// Field bundle used to construct a [`BuildAction`]; filled in by the log
/// parser's flag transformers.
#[derive(Clone, Debug, Default)]
pub struct ActionDetails {
    pub original_command: String,
    pub directory: PathBuf,
    pub source: PathBuf,
    pub lang: Option<Language>,
    pub target: String,
    pub compiler_includes: Vec<String>,
    pub compiler_standard: String,
    pub analyzer_options: Vec<String>,
    pub output: String,
    pub kind: Option<ActionKind>,
}

impl From<ActionDetails> for BuildAction {
    fn from(details: ActionDetails) -> Self {
        Self {
            original_command: details.original_command,
            directory: details.directory,
            source: details.source,
            lang: details.lang,
            target: details.target,
            compiler_includes: details.compiler_includes,
            compiler_standard: details.compiler_standard,
            analyzer_options: details.analyzer_options,
            output: details.output,
            kind: details.kind.unwrap_or_default(),
            analyzer: String::new(),
        }
    }
}

impl BuildAction {
    pub fn original_command(&self) -> &str {
        &self.original_command
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn lang(&self) -> Option<Language> {
        self.lang
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Implicit include directories of the original compiler, already in
    /// argv fragment form (`-isystem <dir>` pairs).
    pub fn compiler_includes(&self) -> &[String] {
        &self.compiler_includes
    }

    /// The default language standard flag of the original compiler, e.g.
    /// `-std=gnu11`. Empty if it could not be determined.
    pub fn compiler_standard(&self) -> &str {
        &self.compiler_standard
    }

    pub fn analyzer_options(&self) -> &[String] {
        &self.analyzer_options
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    /// Name of the analyzer this action has been assigned to. Empty until
    /// [`Self::with_analyzer`] is used.
    pub fn analyzer(&self) -> &str {
        &self.analyzer
    }

    /// Returns a copy of this action assigned to the given analyzer.
    pub fn with_analyzer(&self, analyzer: impl Into<String>) -> Self {
        Self { analyzer: analyzer.into(), ..self.clone() }
    }

    /// Content hash over (analyzer options, analyzer, target, source).
    ///
    /// If the compilation database contains the same compilation action
    /// multiple times it should be checked only once, and two actions may
    /// never share an artifact path: this hash is the identity used for
    /// both.
    pub fn content_hash(&self) -> String {
        let mut hasher = Md5::new();
        for opt in &self.analyzer_options {
            hasher.update(opt.as_bytes());
        }
        hasher.update(self.analyzer.as_bytes());
        hasher.update(self.target.as_bytes());
        hasher.update(self.source.to_string_lossy().as_bytes());
        hex(&hasher.finalize())
    }

    /// Key of this action in the build-action map.
    pub fn map_key(&self) -> (PathBuf, String) {
        (self.source.clone(), self.target.clone())
    }

    /// Reverts to the original compilation database record.
    pub fn to_db_entry(&self) -> serde_json::Value {
        serde_json::json!({
            "command": self.original_command,
            "directory": self.directory,
            "file": self.source,
        })
    }
}

/// Two actions are the same action iff their original commands are equal.
impl PartialEq for BuildAction {
    fn eq(&self, other: &Self) -> bool {
        self.original_command == other.original_command
    }
}

impl Eq for BuildAction {}

impl std::hash::Hash for BuildAction {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.content_hash().hash(state);
    }
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

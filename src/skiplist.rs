//! Skip-list handling.
//!
//! Skip-list file format:
//!
//! ```text
//! -/skip/all/source/in/directory*
//! -/do/not/check/this.file
//! +/dir/check.this.file
//! -/dir/*
//! ```
//!
//! The first matching line decides; unmatched paths are analyzed.

use crate::error::{DriverError, Result};
use glob::{MatchOptions, Pattern};
use std::{fs, path::Path};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sign {
    Include,
    Exclude,
}

/// Compiled skip-list: an ordered sequence of include/exclude globs.
#[derive(Debug, Default)]
pub struct SkipList {
    patterns: Vec<(Sign, Pattern)>,
}

impl SkipList {
    /// Reads and compiles a skip-list file. Malformed lines are skipped
    /// with a warning.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|err| DriverError::io(err, path))?;
        Ok(Self::parse(&content))
    }

    /// Compiles skip-list lines from an in-memory string.
    pub fn parse(content: &str) -> Self {
        let mut patterns = Vec::new();
        for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if line.len() < 2 {
                warn!("Skipping malformed skipfile pattern: {line}");
                continue;
            }
            let sign = match line.as_bytes()[0] {
                b'-' => Sign::Exclude,
                b'+' => Sign::Include,
                _ => {
                    warn!("Skipping malformed skipfile pattern: {line}");
                    continue;
                }
            };
            // A trailing `*` so that directory prefixes match too.
            let glob = format!("{}*", line[1..].trim());
            match Pattern::new(&glob) {
                Ok(pattern) => patterns.push((sign, pattern)),
                Err(_) => warn!("Skipping malformed skipfile pattern: {line}"),
            }
        }
        Self { patterns }
    }

    /// Whether the analyzer should skip the given source file.
    pub fn should_skip(&self, source: impl AsRef<Path>) -> bool {
        let source = source.as_ref().to_string_lossy();
        let opts =
            MatchOptions { require_literal_separator: false, ..MatchOptions::default() };
        for (sign, pattern) in &self.patterns {
            if pattern.matches_with(&source, opts) {
                return *sign == Sign::Exclude;
            }
        }
        false
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

//! The run metadata document.
//!
//! A per-run `metadata.json` consumed by the downstream store and parse
//! tooling. The current format is the multi-tool `{version: 2, tools: []}`
//! form; legacy single-tool documents are upgraded transparently on read.

use crate::{error::Result, utils};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

/// The metadata format emitted by this tool.
pub const METADATA_VERSION: u64 = 2;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Timestamps {
    #[serde(default)]
    pub begin: f64,
    #[serde(default)]
    pub end: f64,
}

/// Per-analyzer counters of the run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerStatistics {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub successful: u64,
    #[serde(default)]
    pub successful_sources: Vec<PathBuf>,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub failed_sources: Vec<PathBuf>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataAnalyzer {
    /// Enablement of every known checker of this analyzer.
    #[serde(default)]
    pub checkers: BTreeMap<String, bool>,
    #[serde(default)]
    pub analyzer_statistics: AnalyzerStatistics,
}

/// The record of one tool invocation inside the metadata document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataTool {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub output_path: PathBuf,
    #[serde(default)]
    pub working_directory: PathBuf,
    #[serde(default)]
    pub skipped: u64,
    #[serde(default)]
    pub timestamps: Timestamps,
    #[serde(default)]
    pub analyzers: BTreeMap<String, MetadataAnalyzer>,
    /// Maps report artifact paths to the analyzed source path.
    #[serde(default)]
    pub result_source_files: BTreeMap<PathBuf, PathBuf>,
}

impl MetadataTool {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            command: std::env::args().collect(),
            working_directory: std::env::current_dir().unwrap_or_default(),
            timestamps: Timestamps { begin: unix_time(), end: 0.0 },
            ..Default::default()
        }
    }

    pub fn mark_finished(&mut self) {
        self.timestamps.end = unix_time();
    }

    pub fn analyzer_mut(&mut self, analyzer: &str) -> &mut MetadataAnalyzer {
        self.analyzers.entry(analyzer.to_string()).or_default()
    }
}

/// The multi-tool metadata document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub version: u64,
    pub tools: Vec<MetadataTool>,
}

impl Metadata {
    pub fn new(tool: MetadataTool) -> Self {
        Self { version: METADATA_VERSION, tools: vec![tool] }
    }

    /// Reads a metadata document, transparently upgrading the legacy
    /// single-tool format.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let raw: serde_json::Value = utils::read_json_file(path)?;
        Ok(Self::from_value(raw))
    }

    fn from_value(raw: serde_json::Value) -> Self {
        if raw.get("version").and_then(|v| v.as_u64()).unwrap_or(1) >= 2 {
            return serde_json::from_value(raw)
                .unwrap_or_else(|_| Self { version: METADATA_VERSION, tools: Vec::new() });
        }
        Self { version: METADATA_VERSION, tools: vec![v1_to_tool(&raw)] }
    }

    /// Writes the document; done exactly once, at the end of the run.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        utils::write_json_file(path, self)
    }
}

/// Converts a legacy single-tool document into a tool record.
fn v1_to_tool(raw: &serde_json::Value) -> MetadataTool {
    let mut tool = MetadataTool {
        name: "analysis-driver".to_string(),
        version: raw
            .pointer("/versions/analysis-driver")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        command: serde_json::from_value(raw.get("command").cloned().unwrap_or_default())
            .unwrap_or_default(),
        output_path: path_field(raw, "output_path"),
        working_directory: path_field(raw, "working_directory"),
        skipped: raw.get("skipped").and_then(|v| v.as_u64()).unwrap_or_default(),
        timestamps: serde_json::from_value(raw.get("timestamps").cloned().unwrap_or_default())
            .unwrap_or_default(),
        analyzers: BTreeMap::new(),
        result_source_files: serde_json::from_value(
            raw.get("result_source_files").cloned().unwrap_or_default(),
        )
        .unwrap_or_default(),
    };

    let empty = serde_json::Map::new();
    let checkers = raw.get("checkers").and_then(|v| v.as_object()).unwrap_or(&empty);
    for (analyzer_name, checkers) in checkers {
        // Older documents store a bare checker name list, newer ones a
        // name-to-enabled map.
        let checkers: BTreeMap<String, bool> = match checkers {
            serde_json::Value::Array(names) => names
                .iter()
                .filter_map(|n| n.as_str())
                .map(|n| (n.to_string(), true))
                .collect(),
            value => serde_json::from_value(value.clone()).unwrap_or_default(),
        };
        let statistics = raw
            .pointer(&format!("/analyzer_statistics/{analyzer_name}"))
            .cloned()
            .map(|v| serde_json::from_value(v).unwrap_or_default())
            .unwrap_or_default();
        tool.analyzers.insert(
            analyzer_name.clone(),
            MetadataAnalyzer { checkers, analyzer_statistics: statistics },
        );
    }
    tool
}

fn path_field(raw: &serde_json::Value, field: &str) -> PathBuf {
    raw.get(field).and_then(|v| v.as_str()).map(PathBuf::from).unwrap_or_default()
}

fn unix_time() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_tool() -> MetadataTool {
        let mut tool = MetadataTool {
            name: "analysis-driver".into(),
            version: "0.1.0".into(),
            command: vec!["analyze".into(), "compile_commands.json".into()],
            output_path: "/out".into(),
            working_directory: "/proj".into(),
            skipped: 1,
            timestamps: Timestamps { begin: 100.0, end: 200.0 },
            ..Default::default()
        };
        let analyzer = tool.analyzer_mut("clangsa");
        analyzer.checkers.insert("core.DivideZero".into(), true);
        analyzer.analyzer_statistics = AnalyzerStatistics {
            version: "clang 14".into(),
            successful: 2,
            successful_sources: vec!["/proj/a.c".into(), "/proj/b.c".into()],
            failed: 1,
            failed_sources: vec!["/proj/c.c".into()],
        };
        tool.result_source_files.insert("/out/a.plist".into(), "/proj/a.c".into());
        tool
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");

        let metadata = Metadata::new(sample_tool());
        metadata.write(&path).unwrap();
        let read = Metadata::read(&path).unwrap();
        assert_eq!(read, metadata);
    }

    #[test]
    fn upgrades_v1_documents() {
        let v1 = serde_json::json!({
            "command": ["analysis-driver", "analyze"],
            "versions": {"analysis-driver": "0.0.9"},
            "working_directory": "/proj",
            "output_path": "/out",
            "skipped": 3,
            "timestamps": {"begin": 1.0, "end": 2.0},
            "checkers": {
                "clangsa": ["core.DivideZero", "deadcode.DeadStores"],
                "clang-tidy": {"misc-dangling-handle": false}
            },
            "analyzer_statistics": {
                "clangsa": {"successful": 5, "failed": 0,
                            "successful_sources": ["/proj/a.c"],
                            "failed_sources": [], "version": "clang 13"}
            },
            "result_source_files": {"/out/a.plist": "/proj/a.c"}
        });

        let metadata = Metadata::from_value(v1);
        assert_eq!(metadata.version, 2);
        assert_eq!(metadata.tools.len(), 1);

        let tool = &metadata.tools[0];
        assert_eq!(tool.name, "analysis-driver");
        assert_eq!(tool.version, "0.0.9");
        assert_eq!(tool.skipped, 3);
        assert_eq!(tool.timestamps, Timestamps { begin: 1.0, end: 2.0 });
        assert_eq!(tool.analyzers["clangsa"].checkers["core.DivideZero"], true);
        assert_eq!(tool.analyzers["clang-tidy"].checkers["misc-dangling-handle"], false);
        assert_eq!(tool.analyzers["clangsa"].analyzer_statistics.successful, 5);
        assert_eq!(
            tool.result_source_files[&PathBuf::from("/out/a.plist")],
            PathBuf::from("/proj/a.c")
        );
    }

    #[test]
    fn v2_documents_read_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        let metadata = Metadata::new(sample_tool());
        metadata.write(&path).unwrap();

        // Re-reading an upgraded document is idempotent.
        let once = Metadata::read(&path).unwrap();
        once.write(&path).unwrap();
        let twice = Metadata::read(&path).unwrap();
        assert_eq!(once, twice);
    }
}

//! Cppcheck adapter.

use crate::{
    analyzers::{Analyzer, AnalyzerConfig, ResultHandler},
    buildlog::action::BuildAction,
    error::{DriverError, Result},
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{fs, path::PathBuf, sync::Arc};

static RE_VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Cppcheck (?P<version>[\d.]+)").unwrap());

/// Extracts the version number from the `cppcheck --version` output.
pub(crate) fn parse_version(output: &str) -> Option<String> {
    RE_VERSION.captures(output.trim()).map(|c| c["version"].to_string())
}

/// Parses the `--errorlist` XML dump into `(checker id, message)` pairs.
pub(crate) fn parse_checkers(output: &str) -> Vec<(String, String)> {
    static RE_ERROR: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r#"<error\s+id="(?P<id>[^"]+)"[^>]*?msg="(?P<msg>[^"]*)""#).unwrap()
    });
    RE_ERROR
        .captures_iter(output)
        .map(|m| (m["id"].to_string(), m["msg"].to_string()))
        .collect()
}

/// Constructs the cppcheck commands for one build action.
pub struct Cppcheck {
    action: BuildAction,
    config: Arc<AnalyzerConfig>,
}

impl Cppcheck {
    pub const NAME: &'static str = "cppcheck";

    pub fn new(action: BuildAction, config: Arc<AnalyzerConfig>) -> Self {
        Self { action, config }
    }

    /// The raw plist output directory of this invocation.
    fn raw_output_dir(&self, result_handler: &ResultHandler) -> PathBuf {
        result_handler.workspace().join("cppcheck")
    }
}

impl Analyzer for Cppcheck {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    fn action(&self) -> &BuildAction {
        &self.action
    }

    fn construct_command(&self, result_handler: &ResultHandler) -> Result<Vec<String>> {
        let config = &self.config;
        let mut cmd = vec![config.binary.to_string_lossy().into_owned()];

        // The enabled severity classes; checker level enablement happens
        // through suppressions.
        let severities = config
            .analyzer_options
            .get("enable")
            .map(String::as_str)
            .unwrap_or("all");
        cmd.push(format!("--enable={severities}"));

        for checker_name in config.checkers.disabled() {
            cmd.push(format!("--suppress={checker_name}"));
        }

        cmd.extend(config.extra_arguments.iter().cloned());

        // Cppcheck does not handle the probed compiler includes well, so
        // only the explicit includes and defines are forwarded.
        for option in self.action.analyzer_options() {
            if option.starts_with("-I") || option.starts_with("-D") {
                cmd.push(option.clone());
            }
        }

        cmd.push(format!("--plist-output={}", self.raw_output_dir(result_handler).display()));
        cmd.push(self.action.source().to_string_lossy().into_owned());

        Ok(cmd)
    }

    /// Renames the generated plist file to the canonical artifact name.
    fn post_process(&self, result_handler: &mut ResultHandler) -> Result<()> {
        let stem = self
            .action
            .source()
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let raw_output = self.raw_output_dir(result_handler).join(format!("{stem}.plist"));
        if raw_output.exists() {
            let artifact = result_handler.analyzer_result_file().to_path_buf();
            fs::rename(&raw_output, &artifact)
                .map_err(|err| DriverError::io(err, &raw_output))?;
        }
        Ok(())
    }

    /// Cppcheck reports the checked file paths in its `Checking ...` lines.
    fn mentioned_files(&self, output: &str) -> std::collections::BTreeSet<PathBuf> {
        static RE_CHECKING: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^Checking (\S+)").unwrap());
        output
            .lines()
            .filter_map(|line| RE_CHECKING.captures(line))
            .map(|m| PathBuf::from(m[1].trim_end_matches(':')))
            .collect()
    }
}

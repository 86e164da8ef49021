//! GCC Static Analyzer adapter (`-fanalyzer`).

use crate::{
    analyzers::{has_flag, Analyzer, AnalyzerConfig, ResultHandler},
    buildlog::action::BuildAction,
    error::{DriverError, Result},
};
use std::{fs, sync::Arc};

/// Prefix of the analyzer warnings in the gcc help output.
const WARNING_PREFIX: &str = "-Wanalyzer";
/// Prefix of the uniform internal checker names.
const CHECKER_PREFIX: &str = "gcc-";

/// Renames a gcc warning to the uniform internal checker form:
/// `-Wanalyzer-double-free` becomes `gcc-analyzer-double-free`.
fn actual_name_to_checker_name(warning: &str) -> String {
    format!("{CHECKER_PREFIX}{}", &warning[2..])
}

/// The `-Wno-` spelling which disables the checker behind an internal name.
fn checker_name_to_disabled_flag(checker_name: &str) -> String {
    format!("-Wno-{}", checker_name.trim_start_matches(CHECKER_PREFIX))
}

/// Parses the `--help=warning` output, keeping the `-Wanalyzer` family.
pub(crate) fn parse_checkers(output: &str) -> Vec<(String, String)> {
    let mut checkers = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        let (warning_name, description) =
            line.split_once(' ').unwrap_or((line, ""));
        if warning_name.starts_with(WARNING_PREFIX) {
            checkers
                .push((actual_name_to_checker_name(warning_name), description.trim().to_string()));
        }
    }
    checkers
}

/// Constructs the gcc analyzer commands for one build action.
pub struct GccAnalyzer {
    action: BuildAction,
    config: Arc<AnalyzerConfig>,
}

impl GccAnalyzer {
    pub const NAME: &'static str = "gcc";

    pub fn new(action: BuildAction, config: Arc<AnalyzerConfig>) -> Self {
        Self { action, config }
    }
}

impl Analyzer for GccAnalyzer {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    fn action(&self) -> &BuildAction {
        &self.action
    }

    fn result_file_extension(&self) -> &'static str {
        "sarif"
    }

    fn construct_command(&self, _result_handler: &ResultHandler) -> Result<Vec<String>> {
        let config = &self.config;

        // Linking must not start, but -fsyntax-only would stop the
        // compilation too early for proper diagnostics.
        let mut cmd = vec![
            config.binary.to_string_lossy().into_owned(),
            "-fanalyzer".to_string(),
            "-c".to_string(),
            "-o/dev/null".to_string(),
        ];

        cmd.extend(config.extra_arguments.iter().cloned());
        cmd.extend(self.action.analyzer_options().iter().cloned());

        cmd.push("-fdiagnostics-format=sarif-stderr".to_string());

        for checker_name in config.checkers.disabled() {
            cmd.push(checker_name_to_disabled_flag(checker_name));
        }

        if let Some(lang) = self.action.lang() {
            if !has_flag("-x", &cmd) {
                cmd.extend(["-x".to_string(), lang.to_string()]);
            }
        }

        cmd.push(self.action.source().to_string_lossy().into_owned());

        Ok(cmd)
    }

    /// The SARIF document arrives on stderr; a successful run persists it
    /// as the canonical artifact.
    fn post_process(&self, result_handler: &mut ResultHandler) -> Result<()> {
        if result_handler.return_code != 0 {
            return Ok(());
        }
        let artifact = result_handler.analyzer_result_file().to_path_buf();
        fs::write(&artifact, &result_handler.stderr)
            .map_err(|err| DriverError::io(err, &artifact))?;
        Ok(())
    }
}

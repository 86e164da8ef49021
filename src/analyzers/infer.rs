//! Facebook Infer adapter.

use crate::{
    analyzers::{Analyzer, AnalyzerConfig, ResultHandler},
    buildlog::{action::BuildAction, log_parser},
    checkers::CheckerState,
    error::{DriverError, Result},
    supervisor::AnalyzerEnv,
};
use std::{collections::BTreeSet, fs, path::PathBuf, sync::Arc};

/// Extracts the version from the `infer --version` output, whose first line
/// reads `Infer version v1.1.0`.
pub(crate) fn parse_version(output: &str) -> Option<String> {
    let first_line = output.lines().next()?;
    let last_word = first_line.split_whitespace().last()?;
    Some(last_word.trim_start_matches('v').to_string())
}

/// Parses the `help --list-issue-types` output. Each line is a `:`
/// separated record with the issue id first and the reporting checker in
/// the seventh field.
pub(crate) fn parse_checkers(output: &str) -> Vec<(String, String)> {
    let mut checkers = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.trim().split(':').collect();
        if fields.len() < 7 {
            continue;
        }
        let issue_id = fields[0].to_lowercase();
        let checker = if fields.len() == 7 { fields[6] } else { fields[5] };
        let description = format!("used by '{checker}' checker");
        checkers.push((format!("infer-{}", issue_id.replace('_', "-")), description));
    }
    checkers
}

/// The per-issue-type flag form: `infer-dead-store` becomes `DEAD_STORE`.
fn issue_type_flag(checker_name: &str) -> String {
    checker_name.trim_start_matches("infer-").replace('-', "_").to_uppercase()
}

/// Constructs the Infer commands for one build action.
pub struct Infer {
    action: BuildAction,
    config: Arc<AnalyzerConfig>,
}

impl Infer {
    pub const NAME: &'static str = "infer";

    pub fn new(action: BuildAction, config: Arc<AnalyzerConfig>) -> Self {
        Self { action, config }
    }

    fn output_dir(&self, result_handler: &ResultHandler) -> PathBuf {
        result_handler
            .workspace()
            .join("infer")
            .join(&self.action.content_hash()[..8])
    }
}

impl Analyzer for Infer {
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
        "json"
    }

    fn construct_command(&self, result_handler: &ResultHandler) -> Result<Vec<String>> {
        let config = &self.config;

        let mut cmd = vec![
            config.binary.to_string_lossy().into_owned(),
            "run".to_string(),
            "--keep-going".to_string(),
            "--project-root".to_string(),
            "/".to_string(),
        ];

        for (name, state, _) in config.checkers.checkers() {
            let flag = issue_type_flag(name);
            if state == CheckerState::Disabled {
                cmd.extend(["--disable-issue-type".to_string(), flag]);
            } else {
                cmd.extend(["--enable-issue-type".to_string(), flag]);
            }
        }

        let output_dir = self.output_dir(result_handler);
        fs::create_dir_all(&output_dir).map_err(|err| DriverError::io(err, &output_dir))?;
        cmd.extend(["-o".to_string(), output_dir.to_string_lossy().into_owned()]);
        cmd.push("--".to_string());

        // Infer drives the original build command itself, with the flags
        // gcc accepts but the capture toolchain does not filtered out.
        use crate::buildlog::action::Language;
        let c_or_cpp = matches!(self.action.lang(), Some(Language::C | Language::Cpp));
        let original = shell_words::split(self.action.original_command())
            .map_err(|err| DriverError::msg(format!("unparseable build command: {err}")))?;
        for token in original {
            if c_or_cpp && log_parser::is_ignored_option(&token) {
                continue;
            }
            cmd.push(token);
        }

        if self.action.lang().map(|lang| lang.is_cpp()).unwrap_or(false) {
            cmd.push("-stdlib=libc++".to_string());
        }

        Ok(cmd)
    }

    /// Moves the `report.json` of a successful run to the canonical
    /// artifact name.
    fn post_process(&self, result_handler: &mut ResultHandler) -> Result<()> {
        if result_handler.return_code != 0 {
            return Ok(());
        }
        let report = self.output_dir(result_handler).join("report.json");
        if report.exists() {
            let artifact = result_handler.analyzer_result_file().to_path_buf();
            fs::rename(&report, &artifact).map_err(|err| DriverError::io(err, &report))?;
        }
        Ok(())
    }

    fn mentioned_files(&self, _output: &str) -> BTreeSet<PathBuf> {
        BTreeSet::new()
    }

    /// Infer subprocesses run with a pinned timezone.
    fn environment(&self) -> AnalyzerEnv {
        self.config.environment.with_var("TZ", "UTC")
    }
}

//! Clang-Tidy adapter.

use crate::{
    analyzers::{has_flag, Analyzer, AnalyzerConfig, ResultHandler},
    buildlog::action::BuildAction,
    checkers::CheckerState,
    error::{DriverError, Result},
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{collections::BTreeSet, fs, path::PathBuf, sync::Arc};

/// Prefix under which compiler diagnostics appear as tidy checkers.
const DIAGNOSTIC_PREFIX: &str = "clang-diagnostic-";

/// Parses the `-list-checks` output. Clang Static Analyzer checkers are
/// skipped: their results are produced by the dedicated analyzer.
pub(crate) fn parse_checkers(output: &str) -> Vec<(String, String)> {
    static RE_CHECKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\S+$").unwrap());

    let mut checkers = Vec::new();
    for line in output.lines().map(str::trim) {
        if line.starts_with("Enabled checks:") || line.is_empty() {
            continue;
        }
        if line.starts_with("clang-analyzer-") {
            continue;
        }
        if RE_CHECKER.is_match(line) {
            checkers.push((line.to_string(), String::new()));
        }
    }
    checkers
}

/// The warning behind a checker name of the `clang-diagnostic-` family.
fn compiler_warning_name(checker_name: &str) -> Option<&str> {
    checker_name.strip_prefix(DIAGNOSTIC_PREFIX)
}

/// Constructs the clang-tidy commands for one build action.
pub struct ClangTidy {
    action: BuildAction,
    config: Arc<AnalyzerConfig>,
}

impl ClangTidy {
    pub const NAME: &'static str = "clang-tidy";

    pub fn new(action: BuildAction, config: Arc<AnalyzerConfig>) -> Self {
        Self { action, config }
    }

    /// The `-checks=` entries and the compiler warning flags to enable.
    ///
    /// When the checks come from a user supplied configuration (either a
    /// `-config=` payload with a `Checks` key or `take-config-from-directory`)
    /// no explicit checks are emitted, only the compiler warnings. The
    /// `clang-analyzer-*` family stays force-disabled either way and
    /// `clang-diagnostic-*` force-enabled so that compiler diagnostics
    /// surface as reports.
    fn checker_list(&self) -> (Vec<String>, Vec<String>) {
        let config = &self.config;
        let mut checks = Vec::new();
        let mut compiler_warnings = Vec::new();

        // Never run ClangSA checkers from inside clang-tidy; they are
        // driven by the dedicated analyzer.
        checks.push("-clang-analyzer-*".to_string());
        checks.push("clang-diagnostic-*".to_string());

        for (name, state, _) in config.checkers.checkers() {
            if let Some(warning) = compiler_warning_name(name) {
                match state {
                    CheckerState::Enabled => compiler_warnings.push(format!("-W{warning}")),
                    CheckerState::Disabled => {
                        compiler_warnings.push(format!("-Wno-{warning}"))
                    }
                    CheckerState::Default => {}
                }
                continue;
            }
            match state {
                CheckerState::Enabled => checks.push(name.to_string()),
                CheckerState::Disabled => checks.push(format!("-{name}")),
                CheckerState::Default => {}
            }
        }

        if config.analyzer_options.get("take-config-from-directory").map(String::as_str)
            == Some("true")
        {
            return (Vec::new(), compiler_warnings);
        }

        if self.has_checker_config() {
            if let Ok(value) =
                serde_json::from_str::<serde_json::Value>(config.checker_config.trim())
            {
                if value.get("Checks").is_some() {
                    return (Vec::new(), compiler_warnings);
                }
            }
        }

        (checks, compiler_warnings)
    }

    fn has_checker_config(&self) -> bool {
        !self.config.checker_config.is_empty() && self.config.checker_config != "{}"
    }
}

impl Analyzer for ClangTidy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    fn action(&self) -> &BuildAction {
        &self.action
    }

    fn construct_command(&self, _result_handler: &ResultHandler) -> Result<Vec<String>> {
        let config = &self.config;
        let mut cmd = vec![config.binary.to_string_lossy().into_owned()];

        let (checks, compiler_warnings) = self.checker_list();

        // A `-config=` supplied through the extra arguments overrides both
        // the computed checks and the computed config.
        let user_supplied_config =
            config.extra_arguments.iter().any(|arg| arg.starts_with("-config="));

        if !checks.is_empty() && !user_supplied_config {
            // The invocation runs without a shell, so no globbing occurs
            // even though the checks contain glob characters.
            cmd.push(format!("-checks={}", checks.join(",")));
        }

        cmd.extend(config.extra_arguments.iter().cloned());

        if self.has_checker_config() && !user_supplied_config {
            cmd.push(format!("-config={}", config.checker_config));
        }

        cmd.push(self.action.source().to_string_lossy().into_owned());

        cmd.push("--".to_string());
        cmd.push("-Qunused-arguments".to_string());

        // These compiler warnings are on by default.
        cmd.extend(["-Wall", "-Wextra"].map(String::from));

        if let Some(lang) = self.action.lang() {
            if !has_flag("-x", &cmd) {
                cmd.extend(["-x".to_string(), lang.to_string()]);
            }
        }

        if !has_flag("--target", &cmd) && !self.action.target().is_empty() {
            cmd.push(format!("--target={}", self.action.target()));
        }

        cmd.extend(self.action.analyzer_options().iter().cloned());
        cmd.extend(self.action.compiler_includes().iter().cloned());

        if !has_flag("-std", &cmd) && !has_flag("--std", &cmd) {
            let standard = self.action.compiler_standard();
            if !standard.is_empty() {
                cmd.push(standard.to_string());
            }
        }

        cmd.extend(compiler_warnings);

        Ok(cmd)
    }

    /// Clang-tidy prints its diagnostics to stdout; the captured output is
    /// the canonical artifact of a successful run.
    fn post_process(&self, result_handler: &mut ResultHandler) -> Result<()> {
        if result_handler.return_code != 0 {
            return Ok(());
        }
        let artifact = result_handler.analyzer_result_file().to_path_buf();
        fs::write(&artifact, &result_handler.stdout)
            .map_err(|err| DriverError::io(err, &artifact))?;
        Ok(())
    }

    /// A line mentioning a file in clang-tidy's output looks like
    /// `/path/to/file.cpp:10:4: warning: ...`.
    fn mentioned_files(&self, output: &str) -> BTreeSet<PathBuf> {
        static RE_DIAG_LINE: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"^(?P<path>[\S ]+?):(?P<line>\d+?):(?P<column>\d+?): ").unwrap()
        });
        output
            .lines()
            .filter_map(|line| RE_DIAG_LINE.captures(line))
            .map(|m| PathBuf::from(&m["path"]))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::AnalyzerKind;
    use crate::buildlog::action::{ActionDetails, Language};
    use crate::checkers::{CheckerGroups, CheckerRegistry};

    fn action() -> BuildAction {
        BuildAction::from(ActionDetails {
            original_command: "g++ -c a.cpp".into(),
            directory: "/proj".into(),
            source: "/proj/a.cpp".into(),
            lang: Some(Language::Cpp),
            compiler_standard: "-std=gnu++14".into(),
            analyzer_options: vec!["-I/proj/include".into()],
            ..Default::default()
        })
        .with_analyzer(ClangTidy::NAME)
    }

    fn config_with(checkers: &[(&str, bool)]) -> AnalyzerConfig {
        let mut config =
            AnalyzerConfig::new(AnalyzerKind::ClangTidy, PathBuf::from("clang-tidy"));
        let discovered: Vec<(String, String)> = checkers
            .iter()
            .map(|(name, _)| (name.to_string(), String::new()))
            .collect();
        let overrides: Vec<(String, bool)> = checkers
            .iter()
            .map(|(name, enabled)| (format!("checker:{name}"), *enabled))
            .collect();
        config
            .checkers
            .initialize_checkers(&CheckerGroups::default(), &discovered, &overrides, false, false)
            .unwrap();
        config
    }

    #[test]
    fn parses_list_checks_output() {
        let out = "\
Enabled checks:
    bugprone-use-after-move
    clang-analyzer-core.DivideZero
    misc-dangling-handle
";
        assert_eq!(
            parse_checkers(out),
            vec![
                ("bugprone-use-after-move".to_string(), String::new()),
                ("misc-dangling-handle".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn checks_argument_keeps_sa_disabled_and_diagnostics_enabled() {
        let config = config_with(&[("bugprone-use-after-move", true)]);
        let tidy = ClangTidy::new(action(), Arc::new(config));
        let rh = tidy.build_result_handler(std::path::Path::new("/out"));
        let cmd = tidy.construct_command(&rh).unwrap();

        let checks = cmd.iter().find(|a| a.starts_with("-checks=")).unwrap();
        assert!(checks.contains("-clang-analyzer-*"));
        assert!(checks.contains("clang-diagnostic-*"));
        assert!(checks.contains("bugprone-use-after-move"));
    }

    #[test]
    fn disabled_checkers_are_negated() {
        let config = config_with(&[("misc-dangling-handle", false)]);
        let tidy = ClangTidy::new(action(), Arc::new(config));
        let rh = tidy.build_result_handler(std::path::Path::new("/out"));
        let cmd = tidy.construct_command(&rh).unwrap();
        let checks = cmd.iter().find(|a| a.starts_with("-checks=")).unwrap();
        assert!(checks.contains(",-misc-dangling-handle"));
    }

    #[test]
    fn diagnostic_checkers_become_warning_flags() {
        let config =
            config_with(&[("clang-diagnostic-unused-variable", true), ("clang-diagnostic-padded", false)]);
        let tidy = ClangTidy::new(action(), Arc::new(config));
        let rh = tidy.build_result_handler(std::path::Path::new("/out"));
        let cmd = tidy.construct_command(&rh).unwrap();
        assert!(cmd.contains(&"-Wunused-variable".to_string()));
        assert!(cmd.contains(&"-Wno-padded".to_string()));
    }

    #[test]
    fn driver_args_follow_the_separator() {
        let config = config_with(&[]);
        let tidy = ClangTidy::new(action(), Arc::new(config));
        let rh = tidy.build_result_handler(std::path::Path::new("/out"));
        let cmd = tidy.construct_command(&rh).unwrap();

        let sep = cmd.iter().position(|a| a == "--").unwrap();
        let driver_args = &cmd[sep + 1..];
        assert!(driver_args.contains(&"-Qunused-arguments".to_string()));
        assert!(driver_args.contains(&"-std=gnu++14".to_string()));
        assert!(driver_args.contains(&"-I/proj/include".to_string()));
        assert!(cmd[..sep].contains(&"/proj/a.cpp".to_string()));
    }

    #[test]
    fn user_config_overrides_computed_checks() {
        let mut config = config_with(&[("bugprone-use-after-move", true)]);
        config.extra_arguments = vec!["-config={\"Checks\": \"misc-*\"}".to_string()];
        config.checker_config = "{\"CheckOptions\": []}".to_string();
        let tidy = ClangTidy::new(action(), Arc::new(config));
        let rh = tidy.build_result_handler(std::path::Path::new("/out"));
        let cmd = tidy.construct_command(&rh).unwrap();

        assert!(!cmd.iter().any(|a| a.starts_with("-checks=")));
        // Only the user supplied -config survives.
        let configs: Vec<_> = cmd.iter().filter(|a| a.starts_with("-config=")).collect();
        assert_eq!(configs.len(), 1);
        assert!(configs[0].contains("misc-*"));
    }

    #[test]
    fn checks_key_in_checker_config_suppresses_computed_checks() {
        let mut config = config_with(&[("bugprone-use-after-move", true)]);
        config.checker_config = "{\"Checks\": \"misc-*\"}".to_string();
        let tidy = ClangTidy::new(action(), Arc::new(config));
        let rh = tidy.build_result_handler(std::path::Path::new("/out"));
        let cmd = tidy.construct_command(&rh).unwrap();

        assert!(!cmd.iter().any(|a| a.starts_with("-checks=")));
        assert!(cmd.iter().any(|a| a.starts_with("-config=")));
    }

    #[test]
    fn extracts_mentioned_files_from_diagnostics() {
        let config = config_with(&[]);
        let tidy = ClangTidy::new(action(), Arc::new(config));
        let out = "\
/proj/a.cpp:10:4: warning: use after move [bugprone-use-after-move]
/proj/include/b.h:3:1: note: declared here
random line
";
        let files = tidy.mentioned_files(out);
        assert_eq!(files.len(), 2);
        assert!(files.contains(&PathBuf::from("/proj/a.cpp")));
        assert!(files.contains(&PathBuf::from("/proj/include/b.h")));
    }
}

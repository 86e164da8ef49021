//! Clang Static Analyzer adapter.

use crate::{
    analyzers::{has_flag, Analyzer, AnalyzerConfig, ResultHandler},
    buildlog::action::BuildAction,
    checkers::CheckerState,
    ctu,
    error::Result,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{collections::BTreeSet, path::PathBuf, sync::Arc};

static RE_VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"version\s+(\d+\.\d+(\.\d+)?)").unwrap());

static RE_CTU_AST_LOAD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"CTU loaded AST file: (.*)").unwrap());

/// Extracts the short version from `clang --version` (also used for the
/// clang-tidy output, which carries the same `LLVM version X.Y.Z` form).
pub(crate) fn parse_version(output: &str) -> Option<String> {
    RE_VERSION.captures(output).map(|c| c[1].to_string())
}

/// Parses the `-analyzer-checker-help` listing into
/// `(checker name, description)` pairs.
///
/// The checker name and its description are usually in one line, but long
/// checker names push the description into the following line.
pub(crate) fn parse_checkers(output: &str) -> Vec<(String, String)> {
    static RE_NAME_AND_DESCRIPTION: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^\s\s(?P<name>\S*)\s*(?P<description>.*)$").unwrap());
    static RE_NAME_ONLY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s\s\S+$").unwrap());
    static RE_CHECKER_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s\s\S").unwrap());

    let mut checkers = Vec::new();
    let mut pending_name: Option<String> = None;
    for line in output.lines() {
        if line.starts_with("CHECKERS:") || line.is_empty() {
            continue;
        }
        if let Some(name) = pending_name.take() {
            if !RE_CHECKER_LINE.is_match(line) {
                // The description of the overlong name from the previous line.
                checkers.push((name, line.trim().to_string()));
                continue;
            }
            checkers.push((name, String::new()));
        }
        if RE_NAME_ONLY.is_match(line.trim_end()) {
            pending_name = Some(line.trim().to_string());
        } else if let Some(m) = RE_NAME_AND_DESCRIPTION.captures(line.trim_end()) {
            checkers.push((m["name"].to_string(), m["description"].to_string()));
        }
    }
    if let Some(name) = pending_name {
        checkers.push((name, String::new()));
    }
    checkers
}

/// Constructs Clang Static Analyzer commands for one build action.
pub struct ClangSa {
    action: BuildAction,
    config: Arc<AnalyzerConfig>,
    disable_ctu: bool,
    /// Configuration fragments of individual checkers, prepended before the
    /// checker enablement flags.
    checker_configs: Vec<Vec<String>>,
}

impl ClangSa {
    pub const NAME: &'static str = "clangsa";

    pub fn new(action: BuildAction, config: Arc<AnalyzerConfig>) -> Self {
        Self { action, config, disable_ctu: false, checker_configs: Vec::new() }
    }

    /// Whether the configuration carries a CTU directory at all.
    pub fn is_ctu_available(&self) -> bool {
        self.config.ctu.is_some()
    }

    /// Whether CTU is in effect for this particular invocation.
    pub fn is_ctu_enabled(&self) -> bool {
        !self.disable_ctu
    }

    /// Disables CTU for this invocation even though it is available. Must
    /// happen before the command is constructed.
    pub fn disable_ctu(&mut self) {
        self.disable_ctu = true;
    }

    /// Adds configuration options of a specific checker, e.g.
    /// `["-Xclang", "-analyzer-config", "-Xclang", "option=value"]`.
    pub fn add_checker_config(&mut self, config: Vec<String>) {
        self.checker_configs.push(config);
    }
}

impl Analyzer for ClangSa {
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
        let mut cmd = vec![
            config.binary.to_string_lossy().into_owned(),
            "--analyze".to_string(),
            // Do not warn about the unused gcc/g++ arguments.
            "-Qunused-arguments".to_string(),
        ];

        cmd.extend(
            [
                "-Xclang",
                "-analyzer-opt-analyze-headers",
                "-Xclang",
                "-analyzer-output=plist-multi-file",
            ]
            .map(String::from),
        );
        cmd.push("-o".to_string());
        cmd.push(result_handler.analyzer_result_file().to_string_lossy().into_owned());

        // Expand macros in the plist output on the bug path.
        cmd.extend(
            ["-Xclang", "-analyzer-config", "-Xclang", "expand-macros=true"].map(String::from),
        );

        // Checker configuration must precede the checker enablement.
        for checker_config in &self.checker_configs {
            cmd.extend(checker_config.iter().cloned());
        }

        for (name, state, _) in config.checkers.checkers() {
            match state {
                CheckerState::Enabled => {
                    cmd.push("-Xclang".to_string());
                    cmd.push(format!("-analyzer-checker={name}"));
                }
                CheckerState::Disabled => {
                    cmd.push("-Xclang".to_string());
                    cmd.push(format!("-analyzer-disable-checker={name}"));
                }
                CheckerState::Default => {}
            }
        }

        if config.enable_z3 {
            cmd.extend(["-Xclang", "-analyzer-constraints=z3"].map(String::from));
        }
        if config.enable_z3_refutation && !config.enable_z3 {
            cmd.extend(
                ["-Xclang", "-analyzer-config", "-Xclang", "crosscheck-with-z3=true"]
                    .map(String::from),
            );
        }

        if let Some(ctu_config) = config.ctu.as_ref().filter(|_| !self.disable_ctu) {
            let triple = ctu::get_triple_arch(&self.action, config)?;
            let triple_dir = ctu_config.dir.join(&triple);
            cmd.extend(
                [
                    "-Xclang",
                    "-analyzer-config",
                    "-Xclang",
                    "experimental-enable-naive-ctu-analysis=true",
                    "-Xclang",
                    "-analyzer-config",
                ]
                .map(String::from),
            );
            cmd.push("-Xclang".to_string());
            cmd.push(format!("ctu-dir={}", triple_dir.display()));
            if ctu_config.on_demand {
                cmd.push("-Xclang".to_string());
                cmd.push("-analyzer-config".to_string());
                cmd.push("-Xclang".to_string());
                cmd.push(format!(
                    "ctu-invocation-list={}",
                    triple_dir.join(ctu::INVOCATION_LIST).display()
                ));
            }
        }

        if let Some(lang) = self.action.lang() {
            if !has_flag("-x", &cmd) {
                cmd.extend(["-x".to_string(), lang.to_string()]);
            }
        }

        if !has_flag("--target", &cmd) && !self.action.target().is_empty() {
            cmd.push(format!("--target={}", self.action.target()));
        }

        if !has_flag("-std", &cmd) && !self.action.compiler_standard().is_empty() {
            cmd.push(self.action.compiler_standard().to_string());
        }

        cmd.extend(config.extra_arguments.iter().cloned());
        cmd.extend(self.action.analyzer_options().iter().cloned());
        cmd.extend(self.action.compiler_includes().iter().cloned());

        cmd.push(self.action.source().to_string_lossy().into_owned());

        Ok(cmd)
    }

    /// ClangSA's CTU mode reports every AST file it inlined definitions
    /// from; those paths feed the reproducer and the connection lists.
    fn mentioned_files(&self, output: &str) -> BTreeSet<PathBuf> {
        output
            .lines()
            .filter_map(|line| RE_CTU_AST_LOAD.captures(line))
            .map(|m| PathBuf::from(m[1].trim()))
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
            original_command: "gcc -c a.c".into(),
            directory: "/proj".into(),
            source: "/proj/a.c".into(),
            lang: Some(Language::C),
            target: "x86_64-linux-gnu".into(),
            compiler_standard: "-std=gnu11".into(),
            compiler_includes: vec!["-isystem".into(), "/usr/include".into()],
            analyzer_options: vec!["-O2".into()],
            ..Default::default()
        })
        .with_analyzer(ClangSa::NAME)
    }

    fn config() -> AnalyzerConfig {
        let mut config = AnalyzerConfig::new(AnalyzerKind::ClangSa, PathBuf::from("clang"));
        let mut registry = CheckerRegistry::default();
        registry
            .initialize_checkers(
                &CheckerGroups::default(),
                &[
                    ("core.DivideZero".to_string(), String::new()),
                    ("deadcode.DeadStores".to_string(), String::new()),
                ],
                &vec![
                    ("core.DivideZero".to_string(), true),
                    ("deadcode.DeadStores".to_string(), false),
                ],
                false,
                false,
            )
            .unwrap();
        config.checkers = registry;
        config
    }

    #[test]
    fn command_carries_analysis_mode_and_checker_states() {
        let analyzer = ClangSa::new(action(), Arc::new(config()));
        let rh = analyzer.build_result_handler(std::path::Path::new("/out"));
        let cmd = analyzer.construct_command(&rh).unwrap();

        assert_eq!(cmd[0], "clang");
        assert!(cmd.contains(&"--analyze".to_string()));
        assert!(cmd.contains(&"-Qunused-arguments".to_string()));
        assert!(cmd.contains(&"-analyzer-output=plist-multi-file".to_string()));
        assert!(cmd.contains(&"-analyzer-checker=core.DivideZero".to_string()));
        assert!(cmd.contains(&"-analyzer-disable-checker=deadcode.DeadStores".to_string()));
        assert!(cmd.contains(&"--target=x86_64-linux-gnu".to_string()));
        assert!(cmd.contains(&"-std=gnu11".to_string()));
        assert!(cmd.contains(&"-isystem".to_string()));
        assert_eq!(cmd.last().unwrap(), "/proj/a.c");
    }

    #[test]
    fn z3_solver_flag_is_exclusive_with_refutation() {
        let mut config = config();
        config.enable_z3 = true;
        let analyzer = ClangSa::new(action(), Arc::new(config));
        let rh = analyzer.build_result_handler(std::path::Path::new("/out"));
        let cmd = analyzer.construct_command(&rh).unwrap();
        assert!(cmd.contains(&"-analyzer-constraints=z3".to_string()));
        assert!(!cmd.contains(&"crosscheck-with-z3=true".to_string()));

        let mut config = self::config();
        config.enable_z3_refutation = true;
        let analyzer = ClangSa::new(action(), Arc::new(config));
        let cmd = analyzer.construct_command(&rh).unwrap();
        assert!(cmd.contains(&"crosscheck-with-z3=true".to_string()));
    }

    #[test]
    fn parses_version_output() {
        let out = "Ubuntu clang version 14.0.6\nTarget: x86_64-pc-linux-gnu\n";
        assert_eq!(parse_version(out), Some("14.0.6".to_string()));
        assert_eq!(parse_version("garbage"), None);
    }

    #[test]
    fn parses_checker_listing() {
        let out = "\
OVERVIEW: Clang Static Analyzer Checkers List

CHECKERS:
  core.DivideZero          Check for division by zero
  core.NullDereference     Check for dereferences of null pointers
  alpha.core.VeryLongCheckerNameThatWrapsToTheNextLine
                           The wrapped description
";
        let checkers = parse_checkers(out);
        assert_eq!(
            checkers,
            vec![
                ("core.DivideZero".to_string(), "Check for division by zero".to_string()),
                (
                    "core.NullDereference".to_string(),
                    "Check for dereferences of null pointers".to_string()
                ),
                (
                    "alpha.core.VeryLongCheckerNameThatWrapsToTheNextLine".to_string(),
                    "The wrapped description".to_string()
                ),
            ]
        );
    }

    #[test]
    fn extracts_ctu_loaded_ast_files() {
        let analyzer = ClangSa::new(action(), Arc::new(config()));
        let output = "\
warning: something
CTU loaded AST file: /out/ctu-dir/x86_64/ast/proj/b.c.ast
CTU loaded AST file: /out/ctu-dir/x86_64/ast/proj/c.c.ast
";
        let files = analyzer.mentioned_files(output);
        assert_eq!(files.len(), 2);
        assert!(files.contains(&PathBuf::from("/out/ctu-dir/x86_64/ast/proj/b.c.ast")));
    }
}

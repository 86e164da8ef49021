//! Analyzer adapters.
//!
//! Every supported analyzer implements the same operation set behind the
//! [`Analyzer`] trait: command construction for a build action, result
//! post-processing and mentioned-file extraction. The per-analyzer
//! capabilities that exist before any action is known (binary resolution,
//! version probing, checker discovery) hang off [`AnalyzerKind`]; the
//! schedulers hold a map from analyzer name to seeded configuration and
//! treat all of them uniformly.

use crate::{
    buildlog::action::BuildAction,
    checkers::CheckerRegistry,
    error::{DriverError, Result},
    supervisor::{self, AnalyzerEnv},
};
use semver::Version;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::{Path, PathBuf},
    process::Command,
    sync::{Arc, Mutex, OnceLock},
};

pub mod clang_tidy;
pub mod clangsa;
pub mod cppcheck;
pub mod gcc;
pub mod infer;
pub mod result_handler;

pub use result_handler::ResultHandler;

/// The supported analyzers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AnalyzerKind {
    ClangSa,
    ClangTidy,
    Cppcheck,
    Gcc,
    Infer,
}

impl AnalyzerKind {
    pub const ALL: [AnalyzerKind; 5] = [
        AnalyzerKind::ClangSa,
        AnalyzerKind::ClangTidy,
        AnalyzerKind::Cppcheck,
        AnalyzerKind::Gcc,
        AnalyzerKind::Infer,
    ];

    /// The stable identifier of the analyzer.
    pub fn name(&self) -> &'static str {
        match self {
            AnalyzerKind::ClangSa => "clangsa",
            AnalyzerKind::ClangTidy => "clang-tidy",
            AnalyzerKind::Cppcheck => "cppcheck",
            AnalyzerKind::Gcc => "gcc",
            AnalyzerKind::Infer => "infer",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Locates a callable binary for the analyzer.
    ///
    /// An absolute configured path is taken as-is when it is executable and
    /// never auto-resolved otherwise. Plain names are searched in `PATH`,
    /// falling back to versioned installations (`clang-14`,
    /// `cppcheck-2.9`, ...).
    pub fn resolve_binary(&self, configured: &str) -> Result<PathBuf> {
        if Path::new(configured).is_absolute() {
            return supervisor::find_executable(configured).ok_or_else(|| {
                DriverError::msg(format!(
                    "configured binary '{configured}' for analyzer '{}' is not executable",
                    self.name()
                ))
            });
        }

        if let Some(found) = supervisor::find_executable(configured) {
            return Ok(found);
        }

        let (preferred, pattern): (&[&str], &str) = match self {
            AnalyzerKind::ClangSa => {
                (&["clang", "clang++"], r"^clang(\+\+)?(-\d+(\.\d+){0,2})?$")
            }
            AnalyzerKind::ClangTidy => (&["clang-tidy"], r"^clang-tidy(-\d+(\.\d+){0,2})?$"),
            AnalyzerKind::Cppcheck => (&["cppcheck"], r"^cppcheck(-\d+(\.\d+){0,2})?$"),
            AnalyzerKind::Gcc => (&["gcc", "g++"], r"^g(cc|\+\+)(-\d+(\.\d+){0,2})?$"),
            AnalyzerKind::Infer => (&["infer"], r"^infer(-\d+(\.\d+){0,2})?$"),
        };
        let pattern = regex::Regex::new(pattern).expect("analyzer binary patterns are valid");
        supervisor::get_binary_in_path(preferred, &pattern).ok_or_else(|| {
            DriverError::msg(format!(
                "failed to detect binary for analyzer '{}' in PATH",
                self.name()
            ))
        })
    }

    /// Returns the version number reported by the binary: the short,
    /// totally orderable form by default, the full multi-line output with
    /// `detailed`.
    pub fn version(&self, binary: &Path, detailed: bool) -> Result<String> {
        let arg = match self {
            AnalyzerKind::Gcc if !detailed => "-dumpfullversion",
            _ => "--version",
        };
        let mut cmd = Command::new(binary);
        cmd.arg(arg);
        if matches!(self, AnalyzerKind::Infer) {
            cmd.env("TZ", "UTC");
        }
        let output = cmd.output().map_err(|err| DriverError::io(err, binary))?;
        if !output.status.success() {
            return Err(DriverError::msg(format!(
                "failed to get version of '{}'",
                binary.display()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if detailed {
            return Ok(stdout.trim().to_string());
        }
        let short = match self {
            AnalyzerKind::ClangSa | AnalyzerKind::ClangTidy => {
                clangsa::parse_version(&stdout)
            }
            AnalyzerKind::Cppcheck => cppcheck::parse_version(&stdout),
            AnalyzerKind::Gcc => Some(stdout.trim().to_string()),
            AnalyzerKind::Infer => infer::parse_version(&stdout),
        };
        short.ok_or_else(|| {
            DriverError::msg(format!("version not found in '{}' output", binary.display()))
        })
    }

    /// Invokes `version()` once per binary and parses the short form into a
    /// totally orderable [`Version`]. Results are cached process-wide.
    pub fn version_short(&self, binary: &Path) -> Result<Version> {
        static VERSION_CACHE: OnceLock<Mutex<HashMap<PathBuf, Version>>> = OnceLock::new();
        let mut lock = VERSION_CACHE
            .get_or_init(|| Mutex::new(HashMap::new()))
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(version) = lock.get(binary) {
            return Ok(version.clone());
        }
        let version = lenient_version(&self.version(binary, false)?)?;
        lock.insert(binary.to_path_buf(), version.clone());
        Ok(version)
    }

    /// Decides whether the analyzer binary is usable. `None` means
    /// compatible; otherwise the reason is returned.
    pub fn incompatibility(&self, binary: &Path) -> Option<String> {
        match self {
            AnalyzerKind::Gcc => {
                let version = match self.version_short(binary) {
                    Ok(version) => version,
                    Err(_) => {
                        return Some(
                            "GCC binary is too old to support -dumpfullversion.".to_string(),
                        )
                    }
                };
                // '-fdiagnostics-format=sarif-stderr' arrived in GCC 13.
                if version >= Version::new(13, 0, 0) {
                    None
                } else {
                    Some(format!(
                        "GCC binary found is too old at v{version}; minimum version is 13.0.0."
                    ))
                }
            }
            _ => None,
        }
    }

    /// Asks the binary for its checker list and parses the output into
    /// `(name, description)` pairs.
    pub fn list_checkers(&self, binary: &Path) -> Result<Vec<(String, String)>> {
        let (args, env): (&[&str], Option<(&str, &str)>) = match self {
            AnalyzerKind::ClangSa => (&["-cc1", "-analyzer-checker-help-alpha"], None),
            AnalyzerKind::ClangTidy => (&["-list-checks", "-checks=*"], None),
            AnalyzerKind::Cppcheck => (&["--errorlist"], None),
            AnalyzerKind::Gcc => (&["--help=warning"], None),
            AnalyzerKind::Infer => {
                (&["help", "--list-issue-types"], Some(("TZ", "UTC")))
            }
        };
        let mut cmd = Command::new(binary);
        cmd.args(args);
        if let Some((key, value)) = env {
            cmd.env(key, value);
        }
        let output = cmd.output().map_err(|err| DriverError::io(err, binary))?;
        if !output.status.success() {
            return Err(DriverError::AnalyzerFailure(
                self.name().to_string(),
                output.status,
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        Ok(match self {
            AnalyzerKind::ClangSa => clangsa::parse_checkers(&stdout),
            AnalyzerKind::ClangTidy => clang_tidy::parse_checkers(&stdout),
            AnalyzerKind::Cppcheck => cppcheck::parse_checkers(&stdout),
            AnalyzerKind::Gcc => gcc::parse_checkers(&stdout),
            AnalyzerKind::Infer => infer::parse_checkers(&stdout),
        })
    }

    /// Constructs the adapter for one build action.
    pub fn construct(&self, action: &BuildAction, config: Arc<AnalyzerConfig>) -> Box<dyn Analyzer> {
        match self {
            AnalyzerKind::ClangSa => Box::new(clangsa::ClangSa::new(action.clone(), config)),
            AnalyzerKind::ClangTidy => {
                Box::new(clang_tidy::ClangTidy::new(action.clone(), config))
            }
            AnalyzerKind::Cppcheck => {
                Box::new(cppcheck::Cppcheck::new(action.clone(), config))
            }
            AnalyzerKind::Gcc => Box::new(gcc::GccAnalyzer::new(action.clone(), config)),
            AnalyzerKind::Infer => Box::new(infer::Infer::new(action.clone(), config)),
        }
    }
}

impl std::fmt::Display for AnalyzerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Parses a lenient version string: missing minor/patch components count
/// as zero, so `cppcheck`'s `2.9` orders like `2.9.0`.
fn lenient_version(s: &str) -> Result<Version> {
    let s = s.trim();
    if let Ok(version) = Version::parse(s) {
        return Ok(version);
    }
    let mut parts = s.split('.').map(|p| p.parse::<u64>());
    let major = parts.next().transpose().ok().flatten();
    let minor = parts.next().transpose().ok().flatten().unwrap_or(0);
    let patch = parts.next().transpose().ok().flatten().unwrap_or(0);
    match major {
        Some(major) => Ok(Version::new(major, minor, patch)),
        None => Err(DriverError::msg(format!("unparseable analyzer version '{s}'"))),
    }
}

/// CTU configuration of the Clang Static Analyzer.
#[derive(Clone, Debug)]
pub struct CtuConfig {
    /// The per-run CTU data directory (`<output>/ctu-dir`).
    pub dir: PathBuf,
    /// On-demand mode parses the original sources during analysis instead
    /// of loading serialized ASTs.
    pub on_demand: bool,
    /// The external-definition mapping tool.
    pub extdef_mapping_tool: PathBuf,
}

/// The name of the merged external definition map inside a triple dir.
pub const CTU_FINAL_MAP: &str = "externalDefMap.txt";
/// The directory collecting per-action map fragments before the merge.
pub const CTU_TEMP_FNMAP_DIR: &str = "tmp-fnmap";

/// Seeded, read-only configuration of one analyzer for the whole run.
#[derive(Clone, Debug)]
pub struct AnalyzerConfig {
    pub kind: AnalyzerKind,
    pub binary: PathBuf,
    pub checkers: CheckerRegistry,
    /// Extra arguments forwarded verbatim to every invocation.
    pub extra_arguments: Vec<String>,
    /// Checker configuration payload (clang-tidy `-config=...`).
    pub checker_config: String,
    /// Analyzer level options, e.g. `take-config-from-directory`.
    pub analyzer_options: BTreeMap<String, String>,
    pub environment: AnalyzerEnv,
    /// CTU data of Clang SA; unset for every other analyzer.
    pub ctu: Option<CtuConfig>,
    pub enable_z3: bool,
    pub enable_z3_refutation: bool,
}

impl AnalyzerConfig {
    pub fn new(kind: AnalyzerKind, binary: PathBuf) -> Self {
        Self {
            kind,
            binary,
            checkers: CheckerRegistry::default(),
            extra_arguments: Vec::new(),
            checker_config: String::new(),
            analyzer_options: BTreeMap::new(),
            environment: AnalyzerEnv::default(),
            ctu: None,
            enable_z3: false,
            enable_z3_refutation: false,
        }
    }

    /// Checks for contradictory settings; run before any task is started.
    pub fn validate(&self) -> Result<()> {
        if self.enable_z3 && self.enable_z3_refutation {
            return Err(DriverError::config(
                "Z3 as the solver backend and Z3 refutation are mutually exclusive",
            ));
        }
        Ok(())
    }
}

/// Uniform contract of one analyzer bound to one build action.
pub trait Analyzer: Send + Sync {
    /// Stable identifier, the same as the corresponding [`AnalyzerKind`].
    fn name(&self) -> &'static str;

    fn config(&self) -> &AnalyzerConfig;

    fn action(&self) -> &BuildAction;

    /// File extension of the canonical result artifact.
    fn result_file_extension(&self) -> &'static str {
        "plist"
    }

    /// Creates the result container the scheduler fills in.
    fn build_result_handler(&self, output_dir: &Path) -> ResultHandler {
        ResultHandler::new(self.action(), output_dir, self.result_file_extension())
    }

    /// Produces the argv to execute for this action.
    fn construct_command(&self, result_handler: &ResultHandler) -> Result<Vec<String>>;

    /// Hook run after the subprocess finished; may rename artifacts or
    /// surface additional reports from the captured output.
    fn post_process(&self, _result_handler: &mut ResultHandler) -> Result<()> {
        Ok(())
    }

    /// Files mentioned in the analyzer's standard outputs; used to enrich
    /// reproducer archives.
    fn mentioned_files(&self, _output: &str) -> BTreeSet<PathBuf> {
        BTreeSet::new()
    }

    /// The environment the subprocess runs with.
    fn environment(&self) -> AnalyzerEnv {
        self.config().environment.clone()
    }
}

/// Returns true if the command already carries a flag starting with `flag`.
pub(crate) fn has_flag(flag: &str, cmd: &[String]) -> bool {
    cmd.iter().any(|arg| arg.starts_with(flag))
}

/// Prepends `flag` before every element of `args`.
pub(crate) fn prepend_all(flag: &str, args: &[String]) -> Vec<String> {
    args.iter().flat_map(|arg| [flag.to_string(), arg.clone()]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_round_trip() {
        for kind in AnalyzerKind::ALL {
            assert_eq!(AnalyzerKind::parse(kind.name()), Some(kind));
        }
        assert_eq!(AnalyzerKind::parse("no-such-analyzer"), None);
    }

    #[test]
    fn lenient_version_pads_missing_components() {
        assert_eq!(lenient_version("2.9").unwrap(), Version::new(2, 9, 0));
        assert_eq!(lenient_version("14.0.6").unwrap(), Version::new(14, 0, 6));
        assert_eq!(lenient_version("13").unwrap(), Version::new(13, 0, 0));
        assert!(lenient_version("not-a-version").is_err());
    }

    #[test]
    fn z3_switches_are_mutually_exclusive() {
        let mut config = AnalyzerConfig::new(AnalyzerKind::ClangSa, PathBuf::from("clang"));
        config.enable_z3 = true;
        config.enable_z3_refutation = true;
        assert!(config.validate().is_err());
        config.enable_z3 = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn has_flag_matches_prefixes() {
        let cmd = vec!["-std=gnu11".to_string(), "--target=mips".to_string()];
        assert!(has_flag("-std", &cmd));
        assert!(has_flag("--target", &cmd));
        assert!(!has_flag("-x", &cmd));
    }

    #[test]
    fn prepend_all_interleaves_the_flag() {
        assert_eq!(
            prepend_all("-isystem", &["/a".to_string(), "/b".to_string()]),
            ["-isystem", "/a", "-isystem", "/b"]
        );
    }
}

//! Implicit compiler information.
//!
//! GCC implicitly adds system include directories, a build target and a
//! default language standard to every compilation. The analyzers run with
//! Clang's defaults instead, so the original compiler must be probed for
//! these values and the result forwarded explicitly on the analyzer command
//! line. Probe results are cached on disk per compiler binary.

use crate::{
    buildlog::action::Language,
    error::{DriverError, Result},
    utils,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    io::Write,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

static RE_STANDARD_VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"CC_FOUND_STANDARD_VER#(\S+)").unwrap());

/// Probe translation unit whose `#error` output reveals `__STDC_VERSION__`.
const VERSION_PROBE_C: &str = r#"
#ifdef __STDC_VERSION__
#  if __STDC_VERSION__ >= 201710L
#    error CC_FOUND_STANDARD_VER#17
#  elif __STDC_VERSION__ >= 201112L
#    error CC_FOUND_STANDARD_VER#11
#  elif __STDC_VERSION__ >= 199901L
#    error CC_FOUND_STANDARD_VER#99
#  elif __STDC_VERSION__ >= 199409L
#    error CC_FOUND_STANDARD_VER#94
#  else
#    error CC_FOUND_STANDARD_VER#90
#  endif
#else
#  error CC_FOUND_STANDARD_VER#90
#endif
"#;

/// Probe translation unit whose `#error` output reveals `__cplusplus`.
const VERSION_PROBE_CPP: &str = r#"
#ifdef __cplusplus
#  if __cplusplus >= 201703L
#    error CC_FOUND_STANDARD_VER#17
#  elif __cplusplus >= 201402L
#    error CC_FOUND_STANDARD_VER#14
#  elif __cplusplus >= 201103L
#    error CC_FOUND_STANDARD_VER#11
#  else
#    error CC_FOUND_STANDARD_VER#98
#  endif
#else
#  error CC_FOUND_STANDARD_VER#98
#endif
"#;

/// Implicit information of a single compiler binary.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerInfo {
    /// Include directories as argv fragments, e.g. `["-isystem", "/usr/include"]`.
    #[serde(default)]
    pub includes: Vec<String>,
    /// The default target triple.
    #[serde(default)]
    pub target: String,
    /// The default standard as a `-std=` flag.
    #[serde(default)]
    pub default_standard: String,
}

/// Per-run cache of implicit compiler information, keyed by compiler path.
///
/// If a cache file from an earlier run exists it is consulted instead of
/// reinvoking the compilers.
#[derive(Debug, Default)]
pub struct CompilerInfoCache {
    entries: BTreeMap<String, CompilerInfo>,
    /// Set when the cache was seeded from a file; probing is disabled then.
    from_file: bool,
}

impl CompilerInfoCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a previously written `compiler_info.json`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let entries: BTreeMap<String, CompilerInfo> = utils::read_json_file(path)?;
        Ok(Self { entries, from_file: true })
    }

    /// A cache that never invokes a compiler; unknown compilers resolve to
    /// empty implicit info.
    pub fn offline() -> Self {
        Self { entries: BTreeMap::new(), from_file: true }
    }

    /// Writes the collected information to `compiler_info.json`.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        utils::write_json_file(path, &self.entries)
    }

    pub fn get(&self, compiler: &str) -> Option<&CompilerInfo> {
        self.entries.get(compiler)
    }

    /// Returns the implicit info for `compiler`, probing it on first use.
    ///
    /// `flags` are the analyzer options collected so far; `-m32`/`-m64`,
    /// `-std=` and `--sysroot` affect the implicit include paths and are
    /// forwarded to the probe.
    pub fn info_for(&mut self, compiler: &str, lang: Language, flags: &[String]) -> CompilerInfo {
        if let Some(info) = self.entries.get(compiler) {
            return info.clone();
        }
        if self.from_file {
            error!("Could not find compiler {compiler} in the compiler info file");
            return CompilerInfo::default();
        }

        let info = CompilerInfo {
            includes: compiler_includes(compiler, lang, flags),
            target: compiler_target(compiler),
            default_standard: compiler_standard(compiler, lang),
        };
        self.entries.insert(compiler.to_string(), info.clone());
        info
    }
}

/// Returns the stderr of a compiler invocation, or `None` when the process
/// could not be executed.
fn compiler_stderr(argv: &[String], stdin: Stdio) -> Option<String> {
    debug!("Retrieving implicit compiler info via {:?}", argv.join(" "));
    let output = Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(stdin)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output();
    match output {
        Ok(output) => Some(String::from_utf8_lossy(&output.stderr).into_owned()),
        Err(err) => {
            error!("Error during process execution: {} ({err})", argv.join(" "));
            None
        }
    }
}

/// Parses the include paths from `<compiler> -E -v` stderr: the lines between
/// the "search starts here" and "End of search list" markers.
fn parse_compiler_includes(lines: &str) -> Vec<PathBuf> {
    const START_MARK: &str = "#include <...> search starts here:";
    const END_MARK: &str = "End of search list.";

    let mut include_paths = Vec::new();
    let mut collecting = false;
    for line in lines.lines() {
        if line.starts_with(END_MARK) {
            break;
        }
        if collecting {
            let line = line.trim();
            // On OSX framework includes carry a "(framework directory)"
            // suffix which is not part of the path.
            let path = match line.find("(framework directory)") {
                Some(pos) => line[..pos].trim_end(),
                None => line,
            };
            include_paths.push(PathBuf::from(path));
        }
        if line.starts_with(START_MARK) {
            collecting = true;
        }
    }
    include_paths
}

/// Drops GCC's `include-fixed` directory and any directory shipping
/// intrinsic headers; Clang brings its own versions of those.
fn filter_compiler_includes(include_dirs: Vec<PathBuf>) -> Vec<PathBuf> {
    fn contains_intrinsic_headers(dir: &Path) -> bool {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries.filter_map(|e| e.ok()).any(|e| {
                    e.file_name().to_string_lossy().ends_with("intrin.h")
                })
            })
            .unwrap_or(false)
    }

    include_dirs
        .into_iter()
        .filter(|dir| {
            utils::normalize(dir).file_name().map_or(true, |name| name != "include-fixed")
        })
        .filter(|dir| !contains_intrinsic_headers(dir))
        .collect()
}

/// Probes the implicit include directories of the compiler and returns them
/// as `-isystem` argv fragments.
fn compiler_includes(compiler: &str, lang: Language, flags: &[String]) -> Vec<String> {
    static RE_TARGET_AFFECTING: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^(-m(32|64)|-std=)").unwrap());

    let mut extra_opts: Vec<String> =
        flags.iter().filter(|f| RE_TARGET_AFFECTING.is_match(f)).cloned().collect();
    if let Some(pos) = flags.iter().position(|f| f.starts_with("--sysroot")) {
        if flags[pos] == "--sysroot" {
            if let Some(value) = flags.get(pos + 1) {
                extra_opts.push(format!("--sysroot={value}"));
            }
        } else {
            extra_opts.push(flags[pos].clone());
        }
    }

    let mut argv = vec![compiler.to_string()];
    argv.extend(extra_opts);
    argv.extend(["-E", "-x", lang.as_str(), "-", "-v"].map(String::from));

    let Some(err) = compiler_stderr(&argv, Stdio::piped()) else { return Vec::new() };
    filter_compiler_includes(parse_compiler_includes(&err))
        .into_iter()
        .flat_map(|dir| {
            ["-isystem".to_string(), utils::normalize(dir).to_string_lossy().into_owned()]
        })
        .collect()
}

/// Parses the `Target:` line of `<compiler> -v`.
fn compiler_target(compiler: &str) -> String {
    let argv = vec![compiler.to_string(), "-v".to_string()];
    let Some(lines) = compiler_stderr(&argv, Stdio::null()) else { return String::new() };
    parse_compiler_target(&lines)
}

fn parse_compiler_target(lines: &str) -> String {
    for line in lines.lines() {
        let mut words = line.split_whitespace();
        if words.next() == Some("Target:") {
            if let Some(target) = words.next() {
                return target.to_string();
            }
        }
    }
    String::new()
}

/// Determines the default standard of the compiler by compiling a probe file
/// whose `#error` directives report the standard version year.
///
/// GCC supports a GNU extension for each standard, which is a superset of
/// the plain one, so the GNU spelling is returned.
fn compiler_standard(compiler: &str, lang: Language) -> String {
    let (probe, suffix) = if lang.is_cpp() {
        (VERSION_PROBE_CPP, ".cpp")
    } else {
        (VERSION_PROBE_C, ".c")
    };

    let source = tempfile::Builder::new().suffix(suffix).tempfile();
    let Ok(mut source) = source else { return String::new() };
    if source.write_all(probe.as_bytes()).is_err() {
        return String::new();
    }

    let argv =
        vec![compiler.to_string(), source.path().to_string_lossy().into_owned()];
    let Some(err) = compiler_stderr(&argv, Stdio::null()) else { return String::new() };

    standard_flag_from_output(&err, lang)
}

fn standard_flag_from_output(output: &str, lang: Language) -> String {
    match RE_STANDARD_VERSION.captures(output).map(|c| c[1].to_string()) {
        // C94 has no gnu spelling.
        Some(ver) if ver == "94" => "-std=iso9899:199409".to_string(),
        Some(ver) => {
            format!("-std=gnu{}{ver}", if lang.is_cpp() { "++" } else { "" })
        }
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GCC_SEARCH_OUTPUT: &str = "\
ignoring nonexistent directory \"/usr/local/include/x86_64-linux-gnu\"
#include \"...\" search starts here:
#include <...> search starts here:
 /usr/lib/gcc/x86_64-linux-gnu/12/include
 /usr/local/include
 /usr/lib/gcc/x86_64-linux-gnu/12/include-fixed
 /System/Library/Frameworks (framework directory)
End of search list.
";

    #[test]
    fn parses_include_search_list() {
        let includes = parse_compiler_includes(GCC_SEARCH_OUTPUT);
        assert_eq!(
            includes,
            vec![
                PathBuf::from("/usr/lib/gcc/x86_64-linux-gnu/12/include"),
                PathBuf::from("/usr/local/include"),
                PathBuf::from("/usr/lib/gcc/x86_64-linux-gnu/12/include-fixed"),
                PathBuf::from("/System/Library/Frameworks"),
            ]
        );
    }

    #[test]
    fn filters_include_fixed() {
        let filtered = filter_compiler_includes(vec![
            PathBuf::from("/usr/include"),
            PathBuf::from("/usr/lib/gcc/x86_64-linux-gnu/12/include-fixed"),
            PathBuf::from("/usr/lib/gcc/x86_64-linux-gnu/12/include-fixed/"),
        ]);
        assert_eq!(filtered, vec![PathBuf::from("/usr/include")]);
    }

    #[test]
    fn parses_target_line() {
        let out = "Using built-in specs.\nTarget: x86_64-linux-gnu\nThread model: posix\n";
        assert_eq!(parse_compiler_target(out), "x86_64-linux-gnu");
        assert_eq!(parse_compiler_target("no target here"), "");
    }

    #[test]
    fn maps_standard_years_to_flags() {
        let out = "probe.c:4:6: error: #error CC_FOUND_STANDARD_VER#17";
        assert_eq!(standard_flag_from_output(out, Language::C), "-std=gnu17");
        assert_eq!(standard_flag_from_output(out, Language::Cpp), "-std=gnu++17");

        let out94 = "probe.c:8:6: error: #error CC_FOUND_STANDARD_VER#94";
        assert_eq!(standard_flag_from_output(out94, Language::C), "-std=iso9899:199409");

        assert_eq!(standard_flag_from_output("nothing", Language::C), "");
    }

    #[test]
    fn cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compiler_info.json");

        let mut cache = CompilerInfoCache::new();
        cache.entries.insert(
            "/usr/bin/gcc".to_string(),
            CompilerInfo {
                includes: vec!["-isystem".into(), "/usr/include".into()],
                target: "x86_64-linux-gnu".into(),
                default_standard: "-std=gnu11".into(),
            },
        );
        cache.write(&path).unwrap();

        let reloaded = CompilerInfoCache::from_file(&path).unwrap();
        assert_eq!(reloaded.get("/usr/bin/gcc"), cache.get("/usr/bin/gcc"));
        // A cache loaded from file never probes unknown compilers.
        let mut reloaded = reloaded;
        assert_eq!(reloaded.info_for("/usr/bin/unknown", Language::C, &[]), CompilerInfo::default());
    }
}

//! Compilation database parsing.
//!
//! Transforms raw compilation database entries into [`BuildAction`]s that
//! the analyzers can consume: gcc-specific parameters are filtered out,
//! implicit targets and include paths are added and duplicate compile
//! commands are collapsed according to the configured deduplication policy.

use crate::{
    buildlog::{
        action::{ActionDetails, ActionKind, BuildAction, Language},
        compiler_info::CompilerInfoCache,
    },
    error::{DriverError, Result},
    skiplist::SkipList,
    supervisor,
    utils,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path, path::PathBuf};

/// One entry of a JSON compilation database. Unknown fields are ignored.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompilationDbEntry {
    pub directory: PathBuf,
    pub file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Vec<String>>,
}

/// Replace gcc build target options with values accepted by Clang.
static REPLACE_OPTIONS_MAP: &[(&str, &[&str])] = &[
    ("-mips32", &["-target", "mips", "-mips32"]),
    ("-mips64", &["-target", "mips64", "-mips64"]),
    ("-mpowerpc", &["-target", "powerpc"]),
    ("-mpowerpc64", &["-target", "powerpc64"]),
];

/// Compilation flags of which the prefix matches any of these patterns are
/// not forwarded to the analyzers.
static IGNORED_OPTIONS: Lazy<Regex> = Lazy::new(|| {
    let patterns = [
        // --- Unknown to Clang --- //
        "-fallow-fetchr-insn",
        "-fcall-saved-",
        "-fcond-mismatch",
        "-fconserve-stack",
        "-fcrossjumping",
        "-fcse-follow-jumps",
        "-fcse-skip-blocks",
        "-ffixed-r2",
        "-ffp$",
        "-fgcse-lm",
        "-fhoist-adjacent-loads",
        "-findirect-inlining",
        "-finline-limit",
        "-finline-local-initialisers",
        "-fipa-sra",
        "-fno-aggressive-loop-optimizations",
        "-fno-delete-null-pointer-checks",
        "-fno-jump-table",
        "-fno-strength-reduce",
        "-fno-toplevel-reorder",
        "-fno-unit-at-a-time",
        "-fno-var-tracking-assignments",
        "-fobjc-link-runtime",
        "-fpartial-inlining",
        "-fpeephole2",
        "-fr$",
        "-fregmove",
        "-frename-registers",
        "-freorder-functions",
        "-frerun-cse-after-loop",
        "-fs$",
        "-fsched-spec",
        "-fthread-jumps",
        "-ftree-pre",
        "-ftree-switch-conversion",
        "-ftree-tail-merge",
        "-m(no-)?abm",
        "-m(no-)?sdata",
        "-m(no-)?spe",
        "-m(no-)?string$",
        "-m(no-)?dsbt",
        "-m(no-)?fixed-ssp",
        "-m(no-)?pointers-to-nested-functions",
        "-mpcrel-func-addr",
        "-maccumulate-outgoing-args",
        "-mcall-aixdesc",
        "-mppa3-addr-bug",
        "-mtraceback=",
        "-mtext=",
        "-misa=",
        "-mfix-cortex-m3-ldrd$",
        "-mmultiple$",
        "-msahf$",
        "-mthumb-interwork$",
        "-mupdate$",
        // Deprecated ARM option for ARM Procedure Call Standard frames.
        "-mapcs",
        "-fno-merge-const-bfstores$",
        "-fno-ipa-sra$",
        "-mno-thumb-interwork$",
        // ARM option preventing instruction reordering in the prologue.
        "-mno-sched-prolog",
        // Keep asserts in the analyzed code.
        "-DNDEBUG$",
        // --- Ignored --- //
        "-save-temps",
        // Clang warns differently than gcc, so '-Werror' and
        // '-pedantic-errors' can fail the analysis even if the compilation
        // passes.
        "-Werror",
        "-pedantic-errors",
        "-g(.+)?$",
        // Link Time Optimization:
        "-flto",
        // MicroBlaze Options:
        "-mxl",
        // PowerPC SPE Options:
        "-mfloat-gprs",
        "-mabi",
    ];
    Regex::new(&format!("^(?:{})", patterns.join("|"))).unwrap()
});

/// Ignored flags which consume a fixed number of following arguments that
/// must be dropped with them.
static IGNORED_PARAM_OPTIONS: Lazy<Vec<(Regex, usize)>> = Lazy::new(|| {
    [
        ("^-install_name", 1),
        ("^-exported_symbols_list", 1),
        ("^-current_version", 1),
        ("^-compatibility_version", 1),
        ("^-init$", 1),
        ("^-e$", 1),
        ("^-seg1addr", 1),
        ("^-bundle_loader", 1),
        ("^-multiply_defined", 1),
        ("^-sectorder", 3),
        ("^--param$", 1),
        ("^-u$", 1),
        ("^--serialize-diagnostics", 1),
        ("^-framework", 1),
        // Skip paired Xclang options like "-Xclang -mllvm".
        ("^-Xclang", 1),
        // The Darwin linker can be given a file listing sources to link.
        ("^-filelist", 1),
    ]
    .into_iter()
    .map(|(pattern, n)| (Regex::new(pattern).unwrap(), n))
    .collect()
});

static COMPILE_OPTIONS: Lazy<Regex> = Lazy::new(|| {
    let patterns = [
        "-nostdinc",
        r"-nostdinc\+\+",
        "-pedantic",
        "-O[1-3]",
        "-Os",
        "-std=",
        "-f",
        "-m",
        "-W",
        "--sysroot=",
        "--gcc-toolchain=",
    ];
    Regex::new(&format!("^(?:{})", patterns.join("|"))).unwrap()
});

/// Compile options that take a parameter, either merged into the same token
/// or as the following one.
static COMPILE_OPTIONS_MERGED: Lazy<Regex> = Lazy::new(|| {
    let patterns = [
        "--sysroot",
        "--include",
        "-include",
        "-iquote",
        "-[DIUF]",
        "-idirafter",
        "-isystem",
        "-macros",
        "-isysroot",
        "-iprefix",
        "-iwithprefix",
        "-iwithprefixbefore",
    ];
    Regex::new(&format!("^({})", patterns.join("|"))).unwrap()
});

static PRECOMPILATION_OPTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^-(E|M[TQFJPVM]*)$").unwrap());

static GCC_TOOLCHAIN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^--gcc-toolchain=(\S+)$").unwrap());

/// Returns the toolchain path if a `--gcc-toolchain=` flag is present.
pub fn toolchain_in_args<S: AsRef<str>>(args: impl IntoIterator<Item = S>) -> Option<String> {
    args.into_iter()
        .find_map(|arg| GCC_TOOLCHAIN.captures(arg.as_ref()).map(|c| c[1].to_string()))
}

/// Whether the flag belongs to the gcc-only set that the analyzers do not
/// accept.
pub(crate) fn is_ignored_option(token: &str) -> bool {
    IGNORED_OPTIONS.is_match(token)
}

/// Deduplication policy for colliding compilation commands.
#[derive(Clone, Debug, Default)]
pub enum CompileUniqueing {
    /// Keep one action per canonical content hash.
    #[default]
    None,
    /// Fail the run if two actions share a source file.
    Strict,
    /// Keep the action with the lexicographically smaller output path.
    Alpha,
    /// Keep the action whose original command matches the pattern; two or
    /// zero matches per source are an error.
    Regex(String),
}

impl CompileUniqueing {
    /// Parses the user supplied uniqueing mode; anything other than the
    /// known keywords is treated as a regex pattern.
    pub fn parse(s: &str) -> Self {
        match s {
            "none" => CompileUniqueing::None,
            "strict" => CompileUniqueing::Strict,
            "alpha" => CompileUniqueing::Alpha,
            pattern => CompileUniqueing::Regex(pattern.to_string()),
        }
    }
}

/// Cursor over the split build command, allowing transformers to consume
/// the parameters of the flag they matched.
struct TokenCursor<'a> {
    tokens: &'a [String],
    idx: usize,
}

impl<'a> TokenCursor<'a> {
    fn current(&self) -> &'a str {
        &self.tokens[self.idx]
    }

    /// Consumes the next token and returns it, staying on it.
    fn take_next(&mut self) -> Option<&'a str> {
        if self.idx + 1 < self.tokens.len() {
            self.idx += 1;
            Some(&self.tokens[self.idx])
        } else {
            self.idx = self.tokens.len();
            None
        }
    }

    /// Drops the following `n` tokens.
    fn skip(&mut self, n: usize) {
        self.idx = (self.idx + n).min(self.tokens.len());
    }
}

fn skip_ignored(it: &mut TokenCursor<'_>, _: &mut ActionDetails) -> bool {
    if IGNORED_OPTIONS.is_match(it.current()) {
        return true;
    }
    for (pattern, arg_num) in IGNORED_PARAM_OPTIONS.iter() {
        if pattern.is_match(it.current()) {
            it.skip(*arg_num);
            return true;
        }
    }
    false
}

fn replace_target_options(it: &mut TokenCursor<'_>, details: &mut ActionDetails) -> bool {
    match REPLACE_OPTIONS_MAP.iter().find(|(flag, _)| *flag == it.current()) {
        Some((_, replacement)) => {
            details.analyzer_options.extend(replacement.iter().map(|s| s.to_string()));
            true
        }
        None => false,
    }
}

/// Collects the compilation (i.e. not linker or preprocessor) flags into
/// the analyzer options.
fn collect_compile_opts(it: &mut TokenCursor<'_>, details: &mut ActionDetails) -> bool {
    let item = it.current();
    if COMPILE_OPTIONS.is_match(item) {
        details.analyzer_options.push(item.to_string());
        return true;
    }

    let Some(m) = COMPILE_OPTIONS_MERGED.find(item) else { return false };
    let flag = m.as_str().to_string();
    let together = flag.len() != item.len();

    let param = if together {
        item[flag.len()..].to_string()
    } else {
        match it.take_next() {
            Some(param) => param.to_string(),
            None => return true,
        }
    };

    // Relative include paths are resolved against the build directory, the
    // analyzer is not invoked from there.
    let param = if flag == "-I" {
        utils::resolve_in(&details.directory, &param).to_string_lossy().into_owned()
    } else {
        param
    };

    if together {
        details.analyzer_options.push(format!("{flag}{param}"));
    } else {
        details.analyzer_options.extend([flag, param]);
    }
    true
}

fn determine_action_type(it: &mut TokenCursor<'_>, details: &mut ActionDetails) -> bool {
    let item = it.current();
    if item == "-c" {
        details.kind = Some(ActionKind::Compile);
        true
    } else if item.starts_with("-print-prog-name") {
        if details.kind != Some(ActionKind::Compile) {
            details.kind = Some(ActionKind::Info);
        }
        true
    } else if PRECOMPILATION_OPTION.is_match(item) {
        if details.kind != Some(ActionKind::Compile) {
            details.kind = Some(ActionKind::Preprocess);
        }
        true
    } else {
        false
    }
}

/// Skips the compiled source file names (arguments with no dash prefix).
fn skip_sources(it: &mut TokenCursor<'_>, _: &mut ActionDetails) -> bool {
    !it.current().starts_with('-')
}

fn get_arch(it: &mut TokenCursor<'_>, details: &mut ActionDetails) -> bool {
    if it.current() == "-arch" {
        if let Some(arch) = it.take_next() {
            details.target = arch.to_string();
        }
        true
    } else {
        false
    }
}

fn get_language(it: &mut TokenCursor<'_>, details: &mut ActionDetails) -> bool {
    let item = it.current();
    if !item.starts_with("-x") {
        return false;
    }
    let lang = if item == "-x" { it.take_next().unwrap_or_default() } else { &item[2..] };
    if let Some(lang) = Language::parse(lang) {
        details.lang = Some(lang);
    }
    true
}

fn get_output(it: &mut TokenCursor<'_>, details: &mut ActionDetails) -> bool {
    if it.current() == "-o" {
        if let Some(output) = it.take_next() {
            details.output = output.to_string();
        }
        true
    } else {
        false
    }
}

/// Determines the effective compiler of the build command.
///
/// A leading `ccache` wrapper is dropped when the following token resolves
/// to an executable compiler; otherwise the command may be a bare
/// `ccache main.cpp` form where the real compiler comes from the ccache
/// configuration and cannot be recovered here.
fn determine_compiler(command: &[String]) -> String {
    if command[0].contains("ccache")
        && command.len() > 1
        && supervisor::find_executable(&command[1]).is_some()
    {
        return command[1].clone();
    }
    command[0].clone()
}

/// Parses one compilation database entry into a [`BuildAction`].
pub fn parse_options(
    entry: &CompilationDbEntry,
    compiler_info: &mut CompilerInfoCache,
) -> Result<BuildAction> {
    let (original_command, command) = match (&entry.arguments, &entry.command) {
        (Some(arguments), _) => (shell_words::join(arguments), arguments.clone()),
        (None, Some(command)) => {
            let split = shell_words::split(command)
                .map_err(|err| DriverError::msg(format!("unparseable command: {err}")))?;
            (command.clone(), split)
        }
        (None, None) => return Err(DriverError::MalformedDbEntry),
    };
    if command.is_empty() {
        return Err(DriverError::MalformedDbEntry);
    }

    let mut details = ActionDetails {
        original_command,
        directory: entry.directory.clone(),
        ..Default::default()
    };

    let compiler = determine_compiler(&command);
    if compiler.contains("++") || compiler.contains("cpp") {
        details.lang = Some(Language::Cpp);
    }

    type Transformer = fn(&mut TokenCursor<'_>, &mut ActionDetails) -> bool;
    let transformers: &[Transformer] = &[
        skip_ignored,
        replace_target_options,
        collect_compile_opts,
        determine_action_type,
        skip_sources,
        get_arch,
        get_language,
        get_output,
    ];

    let mut it = TokenCursor { tokens: &command, idx: 1 };
    while it.idx < command.len() {
        let consumed = transformers.iter().any(|t| t(&mut it, &mut details));
        if !consumed {
            trace!("Unhandled argument: {}", it.current());
        }
        it.idx += 1;
    }

    details.source = utils::resolve_in(&entry.directory, &entry.file);

    // The language of the source decides whether this is an analyzable
    // compilation at all; unknown extensions mean a link step.
    match Language::from_extension(&details.source) {
        Some(lang) => {
            if details.lang.is_none() {
                details.lang = Some(lang);
            }
        }
        None => details.kind = Some(ActionKind::Link),
    }

    // With --gcc-toolchain a non-default toolchain is in effect and Clang
    // resolves headers against it; probing the host compiler would conflict
    // with that.
    let toolchain = toolchain_in_args(&details.analyzer_options);
    if toolchain.is_none() && !compiler.contains("ccache") {
        if let Some(lang) = details.lang {
            let info = compiler_info.info_for(&compiler, lang, &details.analyzer_options);
            if details.compiler_includes.is_empty() {
                details.compiler_includes = info.includes;
            }
            if details.compiler_standard.is_empty() {
                details.compiler_standard = info.default_standard;
            }
            if details.target.is_empty() {
                details.target = info.target;
            }
        }
    }

    Ok(details.into())
}

/// Reads up the compilation database and returns the deduplicated list of
/// build actions prepared for analyzer execution.
///
/// The auto-detected compiler info is dumped into
/// `<report_dir>/compiler_info.json`; if `compiler_info_file` points to an
/// existing file it is consulted instead of probing the compilers.
pub fn parse_unique_log(
    compilation_database: &[CompilationDbEntry],
    report_dir: &Path,
    compile_uniqueing: &CompileUniqueing,
    skip: Option<&SkipList>,
    compiler_info_file: Option<&Path>,
) -> Result<Vec<BuildAction>> {
    if compilation_database.is_empty() {
        return Err(DriverError::EmptyCompilationDatabase);
    }

    let mut compiler_info = match compiler_info_file.filter(|f| f.exists()) {
        Some(file) => CompilerInfoCache::from_file(file)?,
        None => CompilerInfoCache::new(),
    };

    // An invalid pattern is a configuration error detected up front.
    enum Uniqueing {
        None,
        Strict,
        Alpha,
        Regex(Regex),
    }
    let uniqueing = match compile_uniqueing {
        CompileUniqueing::None => Uniqueing::None,
        CompileUniqueing::Strict => Uniqueing::Strict,
        CompileUniqueing::Alpha => Uniqueing::Alpha,
        CompileUniqueing::Regex(pattern) => Uniqueing::Regex(Regex::new(pattern)?),
    };

    let mut uniqued: BTreeMap<String, BuildAction> = BTreeMap::new();
    let mut skipped = 0usize;

    for entry in compilation_database {
        if skip.is_some_and(|s| s.should_skip(&entry.file)) {
            debug!("Skipping file {}", entry.file.display());
            skipped += 1;
            continue;
        }

        let action = parse_options(entry, &mut compiler_info)?;
        if action.lang().is_none() || action.kind() != ActionKind::Compile {
            continue;
        }

        let source_key = action.source().to_string_lossy().into_owned();
        match &uniqueing {
            Uniqueing::None => {
                uniqued.entry(action.content_hash()).or_insert(action);
            }
            Uniqueing::Strict => {
                if let Some(existing) = uniqued.get(&source_key) {
                    return Err(DriverError::DuplicateAction(
                        existing.original_command().to_string(),
                        action.original_command().to_string(),
                    ));
                }
                uniqued.insert(source_key, action);
            }
            Uniqueing::Alpha => match uniqued.get(&source_key) {
                Some(existing) if action.output() >= existing.output() => {}
                _ => {
                    uniqued.insert(source_key, action);
                }
            },
            Uniqueing::Regex(re) => match uniqued.get(&source_key) {
                None => {
                    uniqued.insert(source_key, action);
                }
                Some(existing) => {
                    let new_matches = re.is_match(action.original_command());
                    let old_matches = re.is_match(existing.original_command());
                    match (new_matches, old_matches) {
                        (true, false) => {
                            uniqued.insert(source_key, action);
                        }
                        (false, true) => {}
                        _ => {
                            return Err(DriverError::DuplicateAction(
                                existing.original_command().to_string(),
                                action.original_command().to_string(),
                            ))
                        }
                    }
                }
            },
        }
    }

    let compiler_info_out = report_dir.join("compiler_info.json");
    debug!("Writing compiler info into: {}", compiler_info_out.display());
    compiler_info.write(&compiler_info_out)?;

    if uniqued.is_empty() {
        return Err(DriverError::EmptyCompilationDatabase);
    }

    if skipped > 0 {
        debug!("{skipped} compile commands skipped by the skip list");
    }
    debug!("Parsing the compilation database done.");
    Ok(uniqued.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(directory: &str, file: &str, command: &str) -> CompilationDbEntry {
        CompilationDbEntry {
            directory: PathBuf::from(directory),
            file: PathBuf::from(file),
            command: Some(command.to_string()),
            arguments: None,
        }
    }

    fn parse(command: &str) -> BuildAction {
        // An offline cache never shells out to a compiler.
        let mut info = CompilerInfoCache::offline();
        parse_options(&entry("/proj", "a.c", command), &mut info).unwrap()
    }

    #[test]
    fn classifies_compile_actions() {
        let action = parse("gcc -c a.c -o a.o");
        assert_eq!(action.kind(), ActionKind::Compile);
        assert_eq!(action.lang(), Some(Language::C));
        assert_eq!(action.output(), "a.o");
        assert_eq!(action.source(), Path::new("/proj/a.c"));
    }

    #[test]
    fn classifies_preprocess_and_info_actions() {
        assert_eq!(parse("gcc -E a.c").kind(), ActionKind::Preprocess);
        assert_eq!(parse("gcc -M a.c").kind(), ActionKind::Preprocess);
        assert_eq!(parse("gcc -print-prog-name=ld a.c").kind(), ActionKind::Info);
        // -c is sticky over the preprocessor flags.
        assert_eq!(parse("gcc -c -MD a.c").kind(), ActionKind::Compile);
    }

    #[test]
    fn unknown_extension_is_a_link_action() {
        let mut info = CompilerInfoCache::offline();
        let action =
            parse_options(&entry("/proj", "a.o", "gcc a.o -o prog"), &mut info).unwrap();
        assert_eq!(action.kind(), ActionKind::Link);
    }

    #[test]
    fn keeps_compile_options_and_drops_ignored_ones() {
        let action = parse(
            "gcc -c -O2 -std=c99 -fno-strict-aliasing -Werror -flto -g -save-temps \
             -DNAME=value -Wall a.c",
        );
        assert_eq!(
            action.analyzer_options(),
            ["-O2", "-std=c99", "-fno-strict-aliasing", "-DNAME=value", "-Wall"]
        );
    }

    #[test]
    fn ignored_flags_consume_their_parameters() {
        let action = parse("gcc -c --param max-inline-insns=5 -Xclang -mllvm -O1 a.c");
        assert_eq!(action.analyzer_options(), ["-O1"]);
    }

    #[test]
    fn normalizes_merged_and_split_include_flags() {
        let action = parse("gcc -c -I sub -Iother -isystem /usr/x -D A=1 a.c");
        assert_eq!(
            action.analyzer_options(),
            ["-I", "/proj/sub", "-I/proj/other", "-isystem", "/usr/x", "-D", "A=1"]
        );
    }

    #[test]
    fn replaces_gcc_target_flags() {
        let action = parse("gcc -c -mips32 a.c");
        assert_eq!(action.analyzer_options(), ["-target", "mips", "-mips32"]);
    }

    #[test]
    fn captures_arch_and_language() {
        let action = parse("gcc -c -arch armv7 -x c++ a.c");
        assert_eq!(action.target(), "armv7");
        assert_eq!(action.lang(), Some(Language::Cpp));
    }

    #[test]
    fn cpp_compiler_name_implies_cpp() {
        let mut info = CompilerInfoCache::offline();
        let action =
            parse_options(&entry("/proj", "a.cpp", "g++ -c a.cpp"), &mut info).unwrap();
        assert_eq!(action.lang(), Some(Language::Cpp));
    }

    #[test]
    fn arguments_form_is_accepted() {
        let mut info = CompilerInfoCache::offline();
        let entry = CompilationDbEntry {
            directory: PathBuf::from("/proj"),
            file: PathBuf::from("a.c"),
            command: None,
            arguments: Some(vec!["gcc".into(), "-c".into(), "a.c".into()]),
        };
        let action = parse_options(&entry, &mut info).unwrap();
        assert_eq!(action.original_command(), "gcc -c a.c");
        assert_eq!(action.kind(), ActionKind::Compile);
    }

    #[test]
    fn entry_without_command_or_arguments_is_fatal() {
        let mut info = CompilerInfoCache::offline();
        let entry = CompilationDbEntry {
            directory: PathBuf::from("/proj"),
            file: PathBuf::from("a.c"),
            command: None,
            arguments: None,
        };
        assert!(matches!(
            parse_options(&entry, &mut info),
            Err(DriverError::MalformedDbEntry)
        ));
    }

    #[test]
    fn finds_gcc_toolchain() {
        assert_eq!(
            toolchain_in_args(["-O2", "--gcc-toolchain=/opt/gcc"]),
            Some("/opt/gcc".to_string())
        );
        assert_eq!(toolchain_in_args(["-O2"]), None);
    }

    fn unique(
        entries: &[CompilationDbEntry],
        uniqueing: CompileUniqueing,
    ) -> Result<Vec<BuildAction>> {
        let dir = tempfile::tempdir().unwrap();
        // An empty compiler info file suppresses compiler probing.
        let info_file = dir.path().join("compiler_info.json");
        std::fs::write(&info_file, "{}").unwrap();
        parse_unique_log(entries, dir.path(), &uniqueing, None, Some(&info_file))
    }

    #[test]
    fn empty_database_is_fatal() {
        assert!(matches!(
            unique(&[], CompileUniqueing::None),
            Err(DriverError::EmptyCompilationDatabase)
        ));
    }

    #[test]
    fn none_uniqueing_collapses_identical_actions() {
        let entries = vec![
            entry("/proj", "a.c", "gcc -c a.c -o a.o"),
            entry("/proj", "a.c", "gcc -c a.c -o b.o"),
            entry("/proj", "b.c", "gcc -c b.c -o b.o"),
        ];
        let actions = unique(&entries, CompileUniqueing::None).unwrap();
        assert_eq!(actions.len(), 2);
    }

    #[test]
    fn strict_uniqueing_fails_on_source_collision() {
        let entries = vec![
            entry("/proj", "a.c", "gcc -c a.c -o a.o"),
            entry("/proj", "a.c", "gcc -c a.c -o b.o"),
        ];
        let err = unique(&entries, CompileUniqueing::Strict).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("gcc -c a.c -o a.o") && msg.contains("gcc -c a.c -o b.o"));
    }

    #[test]
    fn alpha_uniqueing_keeps_smaller_output() {
        let entries = vec![
            entry("/proj", "a.c", "gcc -c a.c -o zzz.o"),
            entry("/proj", "a.c", "gcc -c a.c -o aaa.o"),
        ];
        let actions = unique(&entries, CompileUniqueing::Alpha).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].output(), "aaa.o");
    }

    #[test]
    fn regex_uniqueing_keeps_the_matching_action() {
        let entries = vec![
            entry("/proj", "a.c", "gcc -c a.c -o debug/a.o"),
            entry("/proj", "a.c", "gcc -c a.c -o release/a.o"),
        ];
        let actions =
            unique(&entries, CompileUniqueing::Regex(r".*release.*".into())).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].output(), "release/a.o");
    }

    #[test]
    fn regex_uniqueing_fails_when_both_match() {
        let entries = vec![
            entry("/proj", "a.c", "gcc -c a.c -o release/a.o"),
            entry("/proj", "a.c", "gcc -c a.c -o release/b.o"),
        ];
        assert!(unique(&entries, CompileUniqueing::Regex(r".*release.*".into())).is_err());
    }

    #[test]
    fn regex_uniqueing_fails_when_neither_matches() {
        let entries = vec![
            entry("/proj", "a.c", "gcc -c a.c -o debug/a.o"),
            entry("/proj", "a.c", "gcc -c a.c -o debug/b.o"),
        ];
        assert!(unique(&entries, CompileUniqueing::Regex(r".*release.*".into())).is_err());
    }

    #[test]
    fn skip_list_filters_entries() {
        let entries = vec![
            entry("/proj", "a.c", "gcc -c a.c"),
            entry("/proj", "skip_me.c", "gcc -c skip_me.c"),
        ];
        let dir = tempfile::tempdir().unwrap();
        let info_file = dir.path().join("compiler_info.json");
        std::fs::write(&info_file, "{}").unwrap();
        let skip = SkipList::parse("-*skip_me.c\n");
        let actions = parse_unique_log(
            &entries,
            dir.path(),
            &CompileUniqueing::None,
            Some(&skip),
            Some(&info_file),
        )
        .unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].source(), Path::new("/proj/a.c"));
    }

    #[test]
    fn link_only_database_is_reported_empty() {
        let entries = vec![entry("/proj", "a.o", "gcc a.o -o prog")];
        assert!(matches!(
            unique(&entries, CompileUniqueing::None),
            Err(DriverError::EmptyCompilationDatabase)
        ));
    }
}

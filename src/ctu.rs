//! Cross-translation-unit data generation.
//!
//! The first phase of a CTU run produces, per translation unit, either a
//! serialized AST or an invocation-list entry, plus a fragment of the
//! external definition map. After the pre-analysis pool drains the
//! fragments are merged into one map per target triple.

use crate::{
    analyzers::{has_flag, AnalyzerConfig, CTU_FINAL_MAP, CTU_TEMP_FNMAP_DIR},
    buildlog::action::BuildAction,
    error::{DriverError, Result},
    supervisor,
    utils,
};
use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
};

/// Name of the on-demand invocation list inside a triple directory.
pub const INVOCATION_LIST: &str = "invocation-list.yml";

/// Generates a standardized and cleaned compile command serving as the base
/// for the CTU related invocations.
pub fn get_compile_command(
    action: &BuildAction,
    config: &AnalyzerConfig,
    source: Option<&Path>,
    output: Option<&Path>,
) -> Vec<String> {
    let mut cmd = vec![config.binary.to_string_lossy().into_owned()];

    if !has_flag("--target", &cmd) && !action.target().is_empty() {
        cmd.push(format!("--target={}", action.target()));
    }
    cmd.extend(action.compiler_includes().iter().cloned());
    cmd.push("-c".to_string());
    if let Some(lang) = action.lang() {
        if !has_flag("-x", &cmd) {
            cmd.extend(["-x".to_string(), lang.to_string()]);
        }
    }
    cmd.extend(config.extra_arguments.iter().cloned());
    cmd.extend(action.analyzer_options().iter().cloned());
    if let Some(output) = output {
        cmd.extend(["-o".to_string(), output.to_string_lossy().into_owned()]);
    }
    if let Some(source) = source {
        cmd.push(source.to_string_lossy().into_owned());
    }
    if !has_flag("-std", &cmd) && !has_flag("--std", &cmd) {
        cmd.push(action.compiler_standard().to_string());
    }
    cmd.retain(|arg| !arg.is_empty());
    cmd
}

/// Returns the architecture part of the target triple the compiler picks
/// for this compilation: a `-###` dry run reports the chosen `-triple`.
pub fn get_triple_arch(action: &BuildAction, config: &AnalyzerConfig) -> Result<String> {
    let mut cmd = get_compile_command(action, config, Some(action.source()), None);
    cmd.insert(1, "-###".to_string());

    let out = supervisor::run_process(
        &cmd,
        Some(action.directory()),
        &config.environment,
        |_| {},
    )?;

    let combined = format!("{}{}", out.stdout, out.stderr);
    let Some(last_line) = combined.lines().rev().find(|l| !l.trim().is_empty()) else {
        return Ok(String::new());
    };
    let tokens = shell_words::split(last_line).unwrap_or_default();
    let arch = tokens
        .iter()
        .position(|t| t == "-triple")
        .and_then(|i| tokens.get(i + 1))
        .map(|triple| triple.split('-').next().unwrap_or_default().to_string())
        .unwrap_or_default();
    Ok(arch)
}

/// The AST-dump path of a source file relative to the triple directory: the
/// `ast` prefix plus the absolute source path with its root stripped, with
/// an `.ast` suffix.
pub fn ast_dump_path(source: &Path) -> PathBuf {
    let mut relative = source.to_string_lossy().into_owned();
    if let Some(stripped) = relative.strip_prefix('/') {
        relative = stripped.to_string();
    }
    PathBuf::from("ast").join(format!("{relative}.ast"))
}

/// Generates the serialized AST for the current compilation command. Used
/// during AST-dump based analysis.
pub fn generate_ast(
    action: &BuildAction,
    config: &AnalyzerConfig,
    triple_arch: &str,
) -> Result<()> {
    let ctu = config.ctu.as_ref().expect("CTU directory is configured for the pre-analysis");
    let ast_path = ctu.dir.join(triple_arch).join(ast_dump_path(action.source()));
    utils::create_parent_dir_all(&ast_path)?;

    let mut cmd = get_compile_command(action, config, None, None);
    // The __clang_analyzer__ macro needs to be set in the imported TUs too.
    cmd.extend(["-emit-ast", "-D__clang_analyzer__", "-w", "-o"].map(String::from));
    cmd.push(ast_path.to_string_lossy().into_owned());
    cmd.push(action.source().to_string_lossy().into_owned());

    debug!("Generating AST using '{}'", shell_words::join(&cmd));
    let out = supervisor::run_process(&cmd, Some(action.directory()), &config.environment, |_| {})?;
    if !out.success() {
        error!(
            "Error generating AST.\n\ncommand:\n\n{}\n\nstderr:\n\n{}",
            shell_words::join(&cmd),
            out.stderr
        );
    }
    Ok(())
}

/// Appends the invocation of the current compilation command to the
/// invocation list of its triple. Used during on-demand analysis, where the
/// analyzer parses the original sources instead of loading AST dumps.
pub fn generate_invocation_list(
    action: &BuildAction,
    config: &AnalyzerConfig,
    triple_arch: &str,
) -> Result<()> {
    let ctu = config.ctu.as_ref().expect("CTU directory is configured for the pre-analysis");
    let triple_dir = ctu.dir.join(triple_arch);
    fs::create_dir_all(&triple_dir).map_err(|err| DriverError::io(err, &triple_dir))?;
    let invocation_list = triple_dir.join(INVOCATION_LIST);

    let source = utils::canonicalize(action.source());
    let mut cmd = get_compile_command(action, config, None, None);
    cmd.extend(["-D__clang_analyzer__", "-w"].map(String::from));

    // One single-entry mapping per action; the list is the concatenation of
    // these fragments.
    let entry: BTreeMap<String, Vec<String>> =
        BTreeMap::from([(source.to_string_lossy().into_owned(), cmd)]);
    let invocation_line = serde_yaml::to_string(&entry)?;
    trace!("Appending invocation list item {invocation_line:?}");

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&invocation_list)
        .map_err(|err| DriverError::io(err, &invocation_list))?;
    file.write_all(invocation_line.as_bytes())
        .map_err(|err| DriverError::io(err, &invocation_list))?;
    Ok(())
}

/// Turns the textual function map with source files into one with mapped
/// paths: absolute source paths for on-demand analysis, relative AST-dump
/// paths otherwise.
fn func_map_list_src_to_ast(func_src_list: &[&str], on_demand: bool) -> Vec<String> {
    let mut func_ast_list = Vec::with_capacity(func_src_list.len());
    for line in func_src_list {
        let Some(split_at) = line.find(' ') else { continue };
        let (mangled_name, path) = (&line[..split_at], &line[split_at + 1..]);
        let mapped = if on_demand {
            path.to_string()
        } else {
            ast_dump_path(Path::new(path)).to_string_lossy().into_owned()
        };
        func_ast_list.push(format!("{mangled_name} {mapped}"));
    }
    func_ast_list
}

/// Generates the external definition map fragment for the current source.
///
/// On-demand CTU analysis requires the mangled name to source file mapping,
/// AST-dump based analysis the mangled name to AST dump mapping.
pub fn map_functions(
    action: &BuildAction,
    config: &AnalyzerConfig,
    triple_arch: &str,
) -> Result<()> {
    let ctu = config.ctu.as_ref().expect("CTU directory is configured for the pre-analysis");

    let mut cmd = get_compile_command(action, config, None, None);
    cmd[0] = ctu.extdef_mapping_tool.to_string_lossy().into_owned();
    cmd.insert(1, action.source().to_string_lossy().into_owned());
    cmd.insert(2, "--".to_string());

    debug!("Generating function map using '{}'", shell_words::join(&cmd));
    let out = supervisor::run_process(&cmd, Some(action.directory()), &config.environment, |_| {})?;
    if !out.success() {
        error!(
            "Error generating function map.\n\ncommand:\n\n{}\n\nstderr:\n\n{}",
            shell_words::join(&cmd),
            out.stderr
        );
        return Ok(());
    }

    let func_src_list: Vec<&str> = out.stdout.lines().collect();
    let func_ast_list = func_map_list_src_to_ast(&func_src_list, ctu.on_demand);
    if func_ast_list.is_empty() {
        return Ok(());
    }

    let fnmap_dir = ctu.dir.join(triple_arch).join(CTU_TEMP_FNMAP_DIR);
    fs::create_dir_all(&fnmap_dir).map_err(|err| DriverError::io(err, &fnmap_dir))?;

    // Every action writes to its own unique fragment file.
    let mut fragment = tempfile::Builder::new()
        .prefix("fnmap-")
        .tempfile_in(&fnmap_dir)
        .map_err(|err| DriverError::io(err, &fnmap_dir))?;
    fragment
        .write_all((func_ast_list.join("\n") + "\n").as_bytes())
        .map_err(|err| DriverError::io(err, &fnmap_dir))?;
    fragment.keep().map_err(|err| DriverError::io(err.error, &fnmap_dir))?;
    Ok(())
}

/// Merges the per-action function map fragments into a global map per
/// triple and removes the temporary fragment directories.
///
/// The merged map is the duplicate-free union of every fragment's lines; a
/// failure here is fatal for the run since the main phase cannot work
/// without the map.
pub fn merge_clang_extdef_mappings(ctu_dir: &Path) -> Result<()> {
    let triples = fs::read_dir(ctu_dir).map_err(|err| DriverError::io(err, ctu_dir))?;
    for triple in triples.filter_map(|e| e.ok()) {
        let triple_path = triple.path();
        if !triple_path.is_dir() {
            continue;
        }
        let fnmap_dir = triple_path.join(CTU_TEMP_FNMAP_DIR);
        if !fnmap_dir.is_dir() {
            continue;
        }

        let mut merged: Vec<String> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut fragments: Vec<PathBuf> = fs::read_dir(&fnmap_dir)
            .map_err(|err| DriverError::io(err, &fnmap_dir))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        fragments.sort();
        for fragment in fragments {
            let content =
                fs::read_to_string(&fragment).map_err(|err| DriverError::io(err, &fragment))?;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                if seen.insert(line.to_string()) {
                    merged.push(line.to_string());
                }
            }
        }

        let merged_map = triple_path.join(CTU_FINAL_MAP);
        fs::write(&merged_map, merged.join("\n") + "\n")
            .map_err(|err| DriverError::io(err, &merged_map))?;

        fs::remove_dir_all(&fnmap_dir).map_err(|err| DriverError::io(err, &fnmap_dir))?;
    }
    Ok(())
}

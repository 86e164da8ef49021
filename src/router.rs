//! Result routing.
//!
//! Classifies each invocation outcome, moves the result artifacts into the
//! success/failed/reproducer directories, packs reproducer archives for
//! failed analyses and folds the per-result sidecars into the run metadata.

use crate::{
    analyzers::{Analyzer, ResultHandler},
    analysis::ActionsMap,
    buildlog::log_parser,
    error::{DriverError, Result},
    metadata::MetadataTool,
    utils,
};
use std::{
    collections::BTreeSet,
    fs,
    io::Write,
    path::{Path, PathBuf},
};
use zip::write::FileOptions;

/// The sibling directories maintained under the report output path.
#[derive(Clone, Debug)]
pub struct OutputDirs {
    pub output: PathBuf,
    /// Captured stdout/stderr of successful analyses.
    pub success: PathBuf,
    /// Reproducer zips of failed analyses.
    pub failed: PathBuf,
    /// Reproducer zips packed on explicit request, success or failure.
    pub reproducer: PathBuf,
    /// Which other TUs were involved during CTU analysis.
    pub ctu_connections: PathBuf,
}

impl OutputDirs {
    /// Creates the directory tree under the output path. The reproducer
    /// directory only exists when reproducers were requested.
    pub fn create(output: &Path, generate_reproducer: bool) -> Result<Self> {
        let dirs = Self {
            success: output.join("success"),
            failed: output.join("failed"),
            reproducer: output.join("reproducer"),
            ctu_connections: output.join("ctu_connections"),
            output: output.to_path_buf(),
        };
        for dir in [&dirs.success, &dirs.failed, &dirs.ctu_connections] {
            fs::create_dir_all(dir).map_err(|err| DriverError::io(err, dir))?;
        }
        // Cppcheck writes its raw plist files here before the rename.
        let cppcheck_dir = output.join("cppcheck");
        fs::create_dir_all(&cppcheck_dir).map_err(|err| DriverError::io(err, &cppcheck_dir))?;
        if generate_reproducer {
            fs::create_dir_all(&dirs.reproducer)
                .map_err(|err| DriverError::io(err, &dirs.reproducer))?;
        }
        Ok(dirs)
    }

    /// Removes the success and failed directories if they stayed empty.
    pub fn remove_empty(&self) {
        for dir in [&self.success, &self.failed] {
            if fs::read_dir(dir).map(|mut it| it.next().is_none()).unwrap_or(false) {
                let _ = fs::remove_dir_all(dir);
            }
        }
    }
}

/// Failure class encoded into the reproducer archive name, derived solely
/// from the exit code.
pub fn failure_type(return_code: i32) -> &'static str {
    match return_code {
        0 => "",
        1 => "_compile_error",
        254 => "_crash",
        _ => "_unknown",
    }
}

/// Saves the analyzer output streams next to the results.
pub fn save_output(base_file_name: &Path, stdout: &str, stderr: &str) {
    let mut save = |suffix: &str, content: &str| {
        if content.is_empty() {
            return;
        }
        let path = PathBuf::from(format!("{}{suffix}", base_file_name.display()));
        if let Err(err) = fs::write(&path, content) {
            debug!("Failed to save analyzer output to {}: {err}", path.display());
        }
    };
    save(".stdout.txt", stdout);
    save(".stderr.txt", stderr);
}

/// Writes the `.source` sidecar next to the result file and moves the raw
/// analyzer output to the canonical artifact name if it differs.
pub fn save_metadata_sidecar(
    result_file: &Path,
    analyzer_result_file: &Path,
    analyzed_source: &Path,
) -> Result<()> {
    let sidecar = PathBuf::from(format!("{}.source", result_file.display()));
    let source = utils::unescape_spaces(&analyzed_source.to_string_lossy());
    fs::write(&sidecar, source + "\n").map_err(|err| DriverError::io(err, &sidecar))?;

    if analyzer_result_file.exists() && !result_file.exists() {
        fs::rename(analyzer_result_file, result_file)
            .map_err(|err| DriverError::io(err, analyzer_result_file))?;
    }
    Ok(())
}

/// Handles a successful analysis: captures the output streams if requested
/// and finalizes the canonical artifact with its sidecar.
pub fn handle_success(
    result_handler: &ResultHandler,
    result_file: &Path,
    capture_analysis_output: bool,
    success_dir: &Path,
) -> Result<()> {
    if capture_analysis_output {
        let base = success_dir.join(utils::file_name(result_file));
        save_output(&base, &result_handler.stdout, &result_handler.stderr);
    }

    save_metadata_sidecar(
        result_file,
        result_handler.analyzer_result_file(),
        result_handler.analyzed_source_file(),
    )
}

/// All files mentioned by the analyzer in either output stream.
fn mentioned_files(analyzer: &dyn Analyzer, result_handler: &ResultHandler) -> BTreeSet<PathBuf> {
    let mut files = analyzer.mentioned_files(&result_handler.stdout);
    files.extend(analyzer.mentioned_files(&result_handler.stderr));
    files
}

/// The path of a file inside the archive: the original absolute path rooted
/// at the archive root.
fn zip_entry_name(path: &Path) -> String {
    let name = path.to_string_lossy();
    name.trim_start_matches('/').to_string()
}

/// Packs a reproducer archive containing the build and analysis commands,
/// the captured outputs and every involved source file, so a failed
/// analysis can be rerun offline.
pub fn handle_reproducer(
    analyzer: &dyn Analyzer,
    result_handler: &ResultHandler,
    zip_file: &Path,
    actions_map: &ActionsMap,
) -> Result<()> {
    let action = result_handler.action();

    debug!("Collecting debug data for {}", zip_file.display());
    let mut sources: BTreeSet<PathBuf> = BTreeSet::new();
    sources.insert(action.source().to_path_buf());

    for mentioned in mentioned_files(analyzer, result_handler) {
        let mentioned = utils::resolve_in(action.directory(), &mentioned);
        sources.insert(mentioned.clone());
        let key = (mentioned.clone(), action.target().to_string());
        match actions_map.get(&key) {
            Some(dependent) => {
                sources.insert(dependent.source().to_path_buf());
            }
            None => debug!("Could not find {key:?} in the build actions."),
        }
    }

    let io_err = |err: std::io::Error| DriverError::io(err, zip_file);
    let file = fs::File::create(zip_file).map_err(io_err)?;
    let mut archive = zip::ZipWriter::new(file);
    let options: FileOptions = FileOptions::default();

    archive.start_file("build-action", options)?;
    archive.write_all(action.original_command().as_bytes()).map_err(io_err)?;

    archive.start_file("analyzer-command", options)?;
    archive
        .write_all(shell_words::join(&result_handler.analyzer_cmd).as_bytes())
        .map_err(io_err)?;

    archive.start_file("return-code", options)?;
    archive.write_all(result_handler.return_code.to_string().as_bytes()).map_err(io_err)?;

    archive.start_file("stdout", options)?;
    archive.write_all(result_handler.stdout.as_bytes()).map_err(io_err)?;

    archive.start_file("stderr", options)?;
    archive.write_all(result_handler.stderr.as_bytes()).map_err(io_err)?;

    let original_args = shell_words::split(action.original_command()).unwrap_or_default();
    if let Some(toolchain) = log_parser::toolchain_in_args(&original_args) {
        archive.start_file("gcc-toolchain-path", options)?;
        archive.write_all(toolchain.as_bytes()).map_err(io_err)?;
    }

    let compiler_info = result_handler.workspace().join("compiler_info.json");
    if let Ok(content) = fs::read(&compiler_info) {
        archive.start_file("compiler_info.json", options)?;
        archive.write_all(&content).map_err(io_err)?;
    }

    let mut packed = BTreeSet::new();
    for source in sources {
        let Ok(content) = fs::read(&source) else {
            debug!("Could not read {} for the reproducer.", source.display());
            continue;
        };
        let entry = zip_entry_name(&source);
        if packed.insert(entry.clone()) {
            archive.start_file(entry, options)?;
            archive.write_all(&content).map_err(io_err)?;
        }
    }

    archive.finish()?;
    debug!("ZIP file written at {}", zip_file.display());
    Ok(())
}

/// Handles a failed analysis: packs the reproducer zip and removes any
/// artifact of an earlier successful run, so the run does not report a
/// stale success for a now-failed translation unit.
pub fn handle_failure(
    analyzer: &dyn Analyzer,
    result_handler: &ResultHandler,
    zip_file: &Path,
    result_file: &Path,
    actions_map: &ActionsMap,
) {
    if let Err(err) = handle_reproducer(analyzer, result_handler, zip_file, actions_map) {
        debug!("Failed to pack the reproducer archive: {err}");
    }

    if result_file.exists() {
        let _ = fs::remove_file(result_file);
    }
}

/// Writes the list of source files involved by CTU analysis for this
/// action, or removes a stale list when nothing was involved.
pub fn collect_ctu_involved_files(
    analyzer: &dyn Analyzer,
    result_handler: &ResultHandler,
    ctu_connections_dir: &Path,
) {
    if analyzer.name() != "clangsa" {
        return;
    }

    let involved = mentioned_files(analyzer, result_handler);
    let out = ctu_connections_dir.join(result_handler.action_key());

    if involved.is_empty() {
        if out.exists() {
            let _ = fs::remove_file(&out);
        }
        return;
    }
    let lines: Vec<String> =
        involved.iter().map(|p| p.to_string_lossy().into_owned()).collect();
    if let Err(err) = fs::write(&out, lines.join("\n")) {
        debug!("Failed to write the CTU connection list {}: {err}", out.display());
    }
}

/// Soaks the `.source` sidecar files into the metadata document and removes
/// them from disk.
pub fn fold_source_sidecars(output: &Path, tool: &mut MetadataTool) -> Result<()> {
    let entries = fs::read_dir(output).map_err(|err| DriverError::io(err, output))?;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().map(|e| e != "source").unwrap_or(true) {
            continue;
        }
        let content =
            fs::read_to_string(&path).map_err(|err| DriverError::io(err, &path))?;
        let artifact = path.with_extension("");
        tool.result_source_files.insert(artifact, PathBuf::from(content.trim()));
        fs::remove_file(&path).map_err(|err| DriverError::io(err, &path))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::{clangsa::ClangSa, AnalyzerConfig, AnalyzerKind};
    use crate::buildlog::action::{ActionDetails, BuildAction, Language};
    use std::{collections::HashMap, io::Read, sync::Arc};

    fn action(dir: &Path) -> BuildAction {
        let source = dir.join("a.c");
        fs::write(&source, "int main() { return 0; }\n").unwrap();
        BuildAction::from(ActionDetails {
            original_command: format!("gcc -c {} --gcc-toolchain=/opt/gcc", source.display()),
            directory: dir.to_path_buf(),
            source,
            lang: Some(Language::C),
            ..Default::default()
        })
        .with_analyzer("clangsa")
    }

    fn handler(dir: &Path) -> (Box<dyn Analyzer>, ResultHandler) {
        let action = action(dir);
        let config =
            Arc::new(AnalyzerConfig::new(AnalyzerKind::ClangSa, PathBuf::from("clang")));
        let analyzer = AnalyzerKind::ClangSa.construct(&action, config);
        let mut rh = analyzer.build_result_handler(dir);
        rh.analyzer_cmd = vec!["clang".into(), "--analyze".into()];
        rh.return_code = 1;
        rh.stdout = "some stdout".into();
        rh.stderr = "some stderr".into();
        (analyzer, rh)
    }

    fn zip_names(path: &Path) -> Vec<String> {
        let mut archive = zip::ZipArchive::new(fs::File::open(path).unwrap()).unwrap();
        (0..archive.len()).map(|i| archive.by_index(i).unwrap().name().to_string()).collect()
    }

    fn zip_entry(path: &Path, name: &str) -> String {
        let mut archive = zip::ZipArchive::new(fs::File::open(path).unwrap()).unwrap();
        let mut content = String::new();
        archive.by_name(name).unwrap().read_to_string(&mut content).unwrap();
        content
    }

    #[test]
    fn failure_classes_follow_exit_codes() {
        assert_eq!(failure_type(0), "");
        assert_eq!(failure_type(1), "_compile_error");
        assert_eq!(failure_type(254), "_crash");
        assert_eq!(failure_type(-1), "_unknown");
        assert_eq!(failure_type(13), "_unknown");
    }

    #[test]
    fn reproducer_contains_flat_debug_entries() {
        let dir = tempfile::tempdir().unwrap();
        let (analyzer, rh) = handler(dir.path());
        let zip_file = dir.path().join("repro.zip");
        let actions_map: ActionsMap = Arc::new(HashMap::new());

        handle_reproducer(analyzer.as_ref(), &rh, &zip_file, &actions_map).unwrap();

        let names = zip_names(&zip_file);
        for expected in ["build-action", "analyzer-command", "return-code", "stdout", "stderr"] {
            assert!(names.contains(&expected.to_string()), "{expected} missing: {names:?}");
        }
        assert_eq!(zip_entry(&zip_file, "return-code"), "1");
        assert_eq!(zip_entry(&zip_file, "stderr"), "some stderr");
        assert_eq!(zip_entry(&zip_file, "analyzer-command"), "clang --analyze");
        assert_eq!(zip_entry(&zip_file, "gcc-toolchain-path"), "/opt/gcc");

        // The analyzed source is packed with its absolute path as the
        // archive-internal path.
        let source_entry = zip_entry_name(&dir.path().join("a.c"));
        assert!(names.contains(&source_entry), "{source_entry} missing: {names:?}");
    }

    #[test]
    fn failure_removes_stale_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let (analyzer, rh) = handler(dir.path());
        let stale = dir.path().join("stale.plist");
        fs::write(&stale, "old").unwrap();
        let actions_map: ActionsMap = Arc::new(HashMap::new());

        handle_failure(
            analyzer.as_ref(),
            &rh,
            &dir.path().join("repro.zip"),
            &stale,
            &actions_map,
        );
        assert!(!stale.exists());
        assert!(dir.path().join("repro.zip").exists());
    }

    #[test]
    fn success_writes_sidecar_and_renames_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let (_, mut rh) = handler(dir.path());
        rh.return_code = 0;
        // The raw analyzer output lives under an escaped name.
        let raw = dir.path().join("raw.plist");
        fs::write(&raw, "<plist/>").unwrap();
        rh.set_analyzer_result_file(raw.clone());

        let result_file = dir.path().join("final.plist");
        handle_success(&rh, &result_file, true, dir.path()).unwrap();

        assert!(result_file.exists());
        assert!(!raw.exists());
        let sidecar = dir.path().join("final.plist.source");
        let content = fs::read_to_string(&sidecar).unwrap();
        assert_eq!(content.trim(), rh.analyzed_source_file().to_string_lossy());

        // Output capture used the success dir.
        assert!(dir.path().join("final.plist.stdout.txt").exists());
    }

    #[test]
    fn sidecars_fold_into_metadata() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.plist"), "x").unwrap();
        fs::write(dir.path().join("a.plist.source"), "/proj/a.c\n").unwrap();

        let mut tool = MetadataTool::default();
        fold_source_sidecars(dir.path(), &mut tool).unwrap();

        assert_eq!(
            tool.result_source_files[&dir.path().join("a.plist")],
            PathBuf::from("/proj/a.c")
        );
        assert!(!dir.path().join("a.plist.source").exists());
    }

    #[test]
    fn ctu_connections_list_is_written_and_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let (analyzer, mut rh) = handler(dir.path());
        let connections = dir.path().join("ctu_connections");
        fs::create_dir_all(&connections).unwrap();

        rh.stdout = "CTU loaded AST file: /out/ast/proj/b.c.ast\n".into();
        collect_ctu_involved_files(analyzer.as_ref(), &rh, &connections);
        let out = connections.join(rh.action_key());
        assert!(out.exists());
        assert!(fs::read_to_string(&out).unwrap().contains("/out/ast/proj/b.c.ast"));

        rh.stdout.clear();
        collect_ctu_involved_files(analyzer.as_ref(), &rh, &connections);
        assert!(!out.exists());
    }

    #[test]
    fn empty_result_dirs_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = OutputDirs::create(dir.path(), false).unwrap();
        assert!(dirs.success.exists() && dirs.failed.exists());
        assert!(!dirs.reproducer.exists());

        fs::write(dirs.failed.join("x.zip"), "z").unwrap();
        dirs.remove_empty();
        assert!(!dirs.success.exists());
        assert!(dirs.failed.exists());
    }
}

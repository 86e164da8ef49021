//! Per-invocation result container.

use crate::{buildlog::action::BuildAction, utils};
use std::path::{Path, PathBuf};

/// Holds and stores the results at runtime for one analyzer invocation:
/// the command, the exit code, stdout/stderr and the artifact path.
///
/// For each build action there is one result handler per attempt.
#[derive(Clone, Debug)]
pub struct ResultHandler {
    action: BuildAction,
    workspace: PathBuf,
    result_file: PathBuf,
    pub analyzer_cmd: Vec<String>,
    pub return_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ResultHandler {
    /// Creates the handler for the action, deriving the canonical artifact
    /// name `<source>_<analyzer>_<hash>.<ext>` in the workspace.
    ///
    /// The hash component is the action content hash, so two different
    /// actions can never target the same artifact while a rerun of the same
    /// action overwrites its earlier result.
    pub fn new(action: &BuildAction, workspace: &Path, extension: &str) -> Self {
        let file_name = format!(
            "{}_{}_{}.{}",
            utils::file_name(action.source()),
            action.analyzer(),
            &action.content_hash()[..8],
            extension,
        );
        Self {
            result_file: workspace.join(file_name),
            action: action.clone(),
            workspace: workspace.to_path_buf(),
            analyzer_cmd: Vec::new(),
            return_code: 1,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn action(&self) -> &BuildAction {
        &self.action
    }

    /// The report output directory.
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Where the analyzer is expected to put its result.
    pub fn analyzer_result_file(&self) -> &Path {
        &self.result_file
    }

    pub fn set_analyzer_result_file(&mut self, file: PathBuf) {
        self.result_file = file;
    }

    /// The currently analyzed source file.
    pub fn analyzed_source_file(&self) -> &Path {
        self.action.source()
    }

    /// Identifier of this invocation, used e.g. for the CTU connection
    /// lists.
    pub fn action_key(&self) -> String {
        format!(
            "{}_{}",
            utils::file_name(self.action.source()),
            &self.action.content_hash()[..8]
        )
    }
}

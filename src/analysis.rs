//! The main analysis phase.
//!
//! One task per (analyzer, action) runs on a fixed-size worker pool. Each
//! task builds the analyzer command, supervises the subprocess under an
//! optional timeout watchdog, post-processes the outcome and routes the
//! artifacts, then bumps the shared progress counter. Task results fold
//! commutatively into the run metadata after the pool drains.

use crate::{
    analyzers::{clangsa::ClangSa, Analyzer, AnalyzerConfig, AnalyzerKind, ResultHandler},
    buildlog::action::BuildAction,
    error::{DriverError, Result},
    metadata::MetadataTool,
    pre_analysis::StatisticsData,
    router::{self, OutputDirs},
    skiplist::SkipList,
    supervisor::{self, TimeoutWatch},
    utils,
};
use rayon::prelude::*;
use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

/// Read-only map from (source, target) to the action that builds it; used
/// by the reproducer packaging to resolve dependent files.
pub type ActionsMap = Arc<HashMap<(PathBuf, String), BuildAction>>;

/// Builds the action map of the run. A single (source, target) pair maps to
/// exactly one action; the deduplication in the log parser guarantees that.
pub fn build_actions_map(actions: &[BuildAction]) -> ActionsMap {
    Arc::new(actions.iter().map(|action| (action.map_key(), action.clone())).collect())
}

/// Settings of the main analysis phase.
#[derive(Clone, Debug)]
pub struct AnalysisOptions {
    pub jobs: usize,
    pub output_path: PathBuf,
    /// Wall-clock budget of one analyzer invocation.
    pub timeout: Option<Duration>,
    /// Save analyzer stdout/stderr next to successful results.
    pub capture_analysis_output: bool,
    /// Do not echo analyzer output to the log.
    pub quiet_output_on_stdout: bool,
    /// Pack a reproducer archive for every analysis, not only failures.
    pub generate_reproducer: bool,
    /// Rerun failing CTU analyses once with CTU disabled.
    pub ctu_reanalyze_on_failure: bool,
}

/// Outcome of one analysis task, folded into the run metadata.
#[derive(Clone, Debug)]
pub struct TaskResult {
    pub return_code: i32,
    pub skipped: bool,
    pub reanalyzed: bool,
    pub analyzer: String,
    /// The canonical artifact on success.
    pub artifact: Option<PathBuf>,
    pub source: PathBuf,
}

/// Shared progress counters; `checked` only ever grows.
struct Progress {
    checked: AtomicUsize,
    total: usize,
}

/// Constructs the analyzer for one attempt.
///
/// Clang SA additionally gets the statistics checker configuration when
/// collected statistics are available, and CTU locally disabled on the
/// retry attempt.
fn prepare_analyzer(
    action: &BuildAction,
    config: &Arc<AnalyzerConfig>,
    statistics: Option<&StatisticsData>,
    disable_ctu: bool,
) -> Box<dyn Analyzer> {
    if config.kind == AnalyzerKind::ClangSa {
        let mut analyzer = ClangSa::new(action.clone(), config.clone());
        if disable_ctu {
            analyzer.disable_ctu();
        }
        if let Some(statistics) = statistics {
            // Both statistics based checkers share one configuration
            // directory, adding it once is enough.
            if statistics.stats_file().exists() {
                analyzer.add_checker_config(statistics.checker_analyze_cfg());
            } else {
                debug!("No checker statistics file was found.");
            }
        }
        Box::new(analyzer)
    } else {
        config.kind.construct(action, config.clone())
    }
}

/// One finished subprocess attempt.
struct Attempt {
    result_handler: ResultHandler,
    reanalyzed: bool,
}

/// Runs the analyzer once: command construction, supervised subprocess,
/// timeout handling and the post-process hook.
fn run_attempt(
    analyzer: &dyn Analyzer,
    options: &AnalysisOptions,
) -> Result<Attempt> {
    let mut result_handler = analyzer.build_result_handler(&options.output_path);
    let reanalyzed = result_handler.analyzer_result_file().exists();

    let analyzer_cmd = analyzer.construct_command(&result_handler)?;
    result_handler.analyzer_cmd = analyzer_cmd.clone();

    let mut watch: Option<TimeoutWatch> = None;
    let out = supervisor::run_process(
        &analyzer_cmd,
        Some(analyzer.action().directory()),
        &analyzer.environment(),
        |pid| {
            if let Some(timeout) = options.timeout {
                watch = Some(supervisor::setup_process_timeout(pid, timeout));
            }
        },
    )?;
    result_handler.return_code = out.return_code;
    result_handler.stdout = out.stdout;
    result_handler.stderr = out.stderr;

    let killed = watch
        .map(|watch| {
            let killed = watch.was_killed();
            watch.cancel();
            killed
        })
        .unwrap_or(false);
    if killed {
        let timeout = options.timeout.unwrap_or_default().as_secs();
        warn!("Analyzer ran too long, exceeding time limit of {timeout} seconds.");
        warn!("Considering this analysis as failed...");
        result_handler.return_code = -1;
        result_handler.stderr = format!(
            ">>> Analysis timed out after {timeout} seconds. <<<\n{}",
            result_handler.stderr
        );
    }

    if let Err(err) = analyzer.post_process(&mut result_handler) {
        debug!("Result post-processing failed: {err}");
    }

    Ok(Attempt { result_handler, reanalyzed })
}

/// Routes the outcome of one attempt: reproducer archives, the success
/// artifact finalization or the failure packaging.
fn route_attempt(
    analyzer: &dyn Analyzer,
    attempt: &Attempt,
    zip_file: &str,
    result_file: &Path,
    dirs: &OutputDirs,
    actions_map: &ActionsMap,
    options: &AnalysisOptions,
) {
    let failed_zip = dirs.failed.join(zip_file);
    let reproducer_zip = dirs.reproducer.join(zip_file);

    // Remove the archives of any earlier run for this action.
    for stale in [&failed_zip, &reproducer_zip] {
        if stale.exists() {
            let _ = std::fs::remove_file(stale);
        }
    }

    let rh = &attempt.result_handler;
    let success = rh.return_code == 0;

    if options.generate_reproducer {
        if let Err(err) = router::handle_reproducer(analyzer, rh, &reproducer_zip, actions_map)
        {
            debug!("Failed to pack the reproducer archive: {err}");
        }
    }

    if success {
        if let Err(err) = router::handle_success(
            rh,
            result_file,
            options.capture_analysis_output,
            &dirs.success,
        ) {
            debug!("Failed to finalize the successful result: {err}");
        }
    } else if !options.generate_reproducer {
        router::handle_failure(analyzer, rh, &failed_zip, result_file, actions_map);
    }
}

/// Invokes the analyzer for one build action, retrying once without CTU
/// when requested. Internal errors are folded into a failure result; a
/// task never unwinds the pool.
fn check(
    actions_map: &ActionsMap,
    action: &BuildAction,
    config: Option<&Arc<AnalyzerConfig>>,
    options: &AnalysisOptions,
    dirs: &OutputDirs,
    statistics: Option<&StatisticsData>,
    progress: &Progress,
) -> TaskResult {
    let failure = TaskResult {
        return_code: 1,
        skipped: false,
        reanalyzed: false,
        analyzer: action.analyzer().to_string(),
        artifact: None,
        source: action.source().to_path_buf(),
    };

    let Some(config) = config else {
        error!("Analyzer configuration is missing for '{}'.", action.analyzer());
        return failure;
    };

    let source_file_name = utils::file_name(action.source());
    let ctu_active = config.kind == AnalyzerKind::ClangSa && config.ctu.is_some();

    let analyzer = prepare_analyzer(action, config, statistics, false);
    let attempt = match run_attempt(analyzer.as_ref(), options) {
        Ok(attempt) => attempt,
        Err(err) => {
            error!("Analysis of {source_file_name} failed: {err}");
            return failure;
        }
    };
    let reanalyzed = attempt.reanalyzed;

    // Clang SA strips escaped spaces when writing its result file; the
    // canonical artifact name always uses the collapsed form.
    let result_file = PathBuf::from(utils::unescape_spaces(
        &attempt.result_handler.analyzer_result_file().to_string_lossy(),
    ));
    let result_base = utils::file_name(&result_file);

    let zip_suffix = if ctu_active { "_CTU" } else { "" };
    let zip_file = format!(
        "{result_base}{zip_suffix}{}.zip",
        router::failure_type(attempt.result_handler.return_code)
    );

    route_attempt(
        analyzer.as_ref(),
        &attempt,
        &zip_file,
        &result_file,
        dirs,
        actions_map,
        options,
    );

    let mut return_code = attempt.result_handler.return_code;
    let mut artifact = (return_code == 0).then(|| result_file.clone());
    let mut last_attempt = attempt;
    let mut last_analyzer = analyzer;

    if return_code == 0 {
        let checked = progress.checked.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "[{}/{}] {} analyzed {} successfully.",
            checked, progress.total, action.analyzer(), source_file_name
        );
        if last_attempt.reanalyzed {
            warn!(
                "Previous analysis results in '{}' have been overwritten.",
                result_file.display()
            );
        }
    } else {
        error!(
            "Analyzing {} with {} {} failed!",
            source_file_name,
            action.analyzer(),
            if ctu_active { "CTU" } else { "" }
        );
        if !options.quiet_output_on_stdout {
            error!("\n{}", last_attempt.result_handler.stdout);
            error!("\n{}", last_attempt.result_handler.stderr);
        }

        if ctu_active && options.ctu_reanalyze_on_failure {
            error!("Try to reanalyze without CTU");
            let analyzer = prepare_analyzer(action, config, statistics, true);
            match run_attempt(analyzer.as_ref(), options) {
                Ok(retry) => {
                    return_code = retry.result_handler.return_code;
                    // The second attempt owns the unsuffixed archive name;
                    // the CTU-suffixed one from the first attempt is kept
                    // for forensics.
                    let zip_file = format!("{result_base}.zip");
                    route_attempt(
                        analyzer.as_ref(),
                        &retry,
                        &zip_file,
                        &result_file,
                        dirs,
                        actions_map,
                        options,
                    );
                    if return_code == 0 {
                        artifact = Some(result_file.clone());
                        let checked = progress.checked.fetch_add(1, Ordering::SeqCst) + 1;
                        info!(
                            "[{}/{}] {} analyzed {} without CTU successfully.",
                            checked, progress.total, action.analyzer(), source_file_name
                        );
                    } else {
                        error!(
                            "Analyzing '{}' with {} without CTU failed.",
                            source_file_name,
                            action.analyzer()
                        );
                    }
                    last_attempt = retry;
                    last_analyzer = analyzer;
                }
                Err(err) => error!("Reanalysis of {source_file_name} failed: {err}"),
            }
        }

        if return_code != 0 {
            progress.checked.fetch_add(1, Ordering::SeqCst);
        }
    }

    router::collect_ctu_involved_files(
        last_analyzer.as_ref(),
        &last_attempt.result_handler,
        &dirs.ctu_connections,
    );

    TaskResult {
        return_code,
        skipped: false,
        reanalyzed,
        analyzer: action.analyzer().to_string(),
        artifact,
        source: action.source().to_path_buf(),
    }
}

/// Prints the per-analyzer statistics summary for one status.
fn print_analyzer_statistic_summary(tool: &MetadataTool, successful: bool, msg: &str) {
    let counts: Vec<(String, u64)> = tool
        .analyzers
        .iter()
        .map(|(name, analyzer)| {
            let statistics = &analyzer.analyzer_statistics;
            (name.clone(), if successful { statistics.successful } else { statistics.failed })
        })
        .filter(|(_, count)| *count > 0)
        .collect();
    if counts.is_empty() {
        return;
    }
    info!("{msg}");
    for (analyzer, count) in counts {
        info!("  {analyzer}: {count}");
    }
}

/// Folds the task results into the run metadata and prints the summary.
fn worker_result_handler(
    results: &[TaskResult],
    tool: &mut MetadataTool,
    output_path: &Path,
    pre_skipped: usize,
) -> Result<()> {
    let mut skipped_num = 0u64;
    let mut reanalyzed_num = 0u64;

    for result in results {
        if result.skipped {
            skipped_num += 1;
            continue;
        }
        if result.reanalyzed {
            reanalyzed_num += 1;
        }
        let statistics = &mut tool.analyzer_mut(&result.analyzer).analyzer_statistics;
        if result.return_code == 0 {
            statistics.successful += 1;
            statistics.successful_sources.push(result.source.clone());
        } else {
            statistics.failed += 1;
            statistics.failed_sources.push(result.source.clone());
        }
    }

    info!("----==== Summary ====----");
    print_analyzer_statistic_summary(tool, true, "Successfully analyzed");
    print_analyzer_statistic_summary(tool, false, "Failed to analyze");
    if reanalyzed_num > 0 {
        info!("Reanalyzed compilation commands: {reanalyzed_num}");
    }
    let skipped_total = skipped_num + pre_skipped as u64;
    if skipped_total > 0 {
        info!("Skipped compilation commands: {skipped_total}");
    }
    info!("----=================----");

    tool.skipped = skipped_total;

    // The tasks left per-result `.source` sidecars next to the artifacts;
    // soak them into the metadata instead of keeping loose files around.
    router::fold_source_sidecars(output_path, tool)?;
    Ok(())
}

/// Runs the analysis pool: one worker task per build action.
///
/// Returns the folded task results after the pool has drained; the run
/// metadata is updated in place.
pub fn start_workers(
    actions_map: &ActionsMap,
    actions: &[BuildAction],
    configs: &BTreeMap<AnalyzerKind, Arc<AnalyzerConfig>>,
    options: &AnalysisOptions,
    skip: Option<&SkipList>,
    tool: &mut MetadataTool,
    statistics: Option<&StatisticsData>,
) -> Result<Vec<TaskResult>> {
    let (analyze, skipped_actions): (Vec<&BuildAction>, Vec<&BuildAction>) = actions
        .iter()
        .partition(|action| !skip.is_some_and(|s| s.should_skip(action.source())));

    let dirs = OutputDirs::create(&options.output_path, options.generate_reproducer)?;

    let progress = Progress { checked: AtomicUsize::new(0), total: analyze.len() };

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.jobs.max(1))
        .build()
        .map_err(|err| DriverError::msg(err))?;

    let results: Vec<TaskResult> = pool.install(|| {
        analyze
            .par_iter()
            .map(|action| {
                if supervisor::interrupted() {
                    return TaskResult {
                        return_code: 1,
                        skipped: true,
                        reanalyzed: false,
                        analyzer: action.analyzer().to_string(),
                        artifact: None,
                        source: action.source().to_path_buf(),
                    };
                }
                let config =
                    AnalyzerKind::parse(action.analyzer()).and_then(|kind| configs.get(&kind));
                check(actions_map, action, config, options, &dirs, statistics, &progress)
            })
            .collect()
    });

    for skipped in &skipped_actions {
        debug!("{} is skipped", skipped.source().display());
    }

    worker_result_handler(&results, tool, &options.output_path, skipped_actions.len())?;

    info!("Total analyzed compilation commands: {}", analyze.len());
    dirs.remove_empty();

    Ok(results)
}

//! Pre-analysis: CTU data collection and statistics collection.
//!
//! Runs a first-phase worker pool over the Clang SA actions before the
//! actual analysis, producing the CTU external definition maps and the raw
//! statistics the statistics-based checkers consume.

use crate::{
    analyzers::{AnalyzerConfig, AnalyzerKind},
    buildlog::action::BuildAction,
    ctu,
    error::{DriverError, Result},
    skiplist::SkipList,
    supervisor,
    utils,
};
use rayon::prelude::*;
use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

/// The post-processed statistics file consumed by the statistics based
/// checkers.
pub const STATS_FILE: &str = "SpecialReturn.yaml";

/// Statistics collection settings; the thresholds are forwarded verbatim
/// to the post-processing step.
#[derive(Clone, Debug)]
pub struct StatisticsData {
    pub stats_out_dir: PathBuf,
    pub stats_tmp_dir: PathBuf,
    pub min_sample_count: u64,
    pub relevance_threshold: f64,
}

impl StatisticsData {
    /// The post-processed statistics file of this run.
    pub fn stats_file(&self) -> PathBuf {
        self.stats_out_dir.join(STATS_FILE)
    }

    /// Checker configuration pointing the statistics based checkers at the
    /// collected data.
    pub fn checker_analyze_cfg(&self) -> Vec<String> {
        vec![
            "-Xclang".to_string(),
            "-analyzer-config".to_string(),
            "-Xclang".to_string(),
            format!("api-metadata-path={}", self.stats_out_dir.display()),
        ]
    }
}

/// Which pre-analysis passes to run.
#[derive(Clone, Copy, Debug, Default)]
pub struct PreAnalysisRequest {
    /// Collect CTU data (ASTs or the invocation list plus extdef maps).
    pub ctu_collect: bool,
}

/// Builds the statistics collector command: the standardized compile
/// command in analysis mode with only the statistics collector checkers
/// enabled. Returns `None` when the analyzer has no such checkers.
fn build_stat_coll_cmd(action: &BuildAction, config: &AnalyzerConfig) -> Option<Vec<String>> {
    let stat_checkers: Vec<String> = config
        .checkers
        .checkers()
        .filter(|(name, _, _)| name.contains("statisticscollector"))
        .map(|(name, _, _)| name.to_string())
        .collect();
    if stat_checkers.is_empty() {
        return None;
    }

    let mut cmd = vec![
        config.binary.to_string_lossy().into_owned(),
        "--analyze".to_string(),
        "-Qunused-arguments".to_string(),
    ];
    for checker in stat_checkers {
        cmd.push("-Xclang".to_string());
        cmd.push(format!("-analyzer-checker={checker}"));
    }
    if let Some(lang) = action.lang() {
        cmd.extend(["-x".to_string(), lang.to_string()]);
    }
    if !action.target().is_empty() {
        cmd.push(format!("--target={}", action.target()));
    }
    if !action.compiler_standard().is_empty() {
        cmd.push(action.compiler_standard().to_string());
    }
    cmd.extend(config.extra_arguments.iter().cloned());
    cmd.extend(action.analyzer_options().iter().cloned());
    cmd.extend(action.compiler_includes().iter().cloned());
    cmd.push(action.source().to_string_lossy().into_owned());
    Some(cmd)
}

/// Runs the statistics collection command and saves the combined output
/// into a unique file under the temporary statistics directory.
fn collect_statistics(
    action: &BuildAction,
    config: &AnalyzerConfig,
    statistics: &StatisticsData,
) -> Result<()> {
    let Some(cmd) = build_stat_coll_cmd(action, config) else {
        debug!("Can not collect statistical data.");
        return Ok(());
    };

    trace!("{}", shell_words::join(&cmd));
    let out =
        supervisor::run_process(&cmd, Some(action.directory()), &config.environment, |_| {})?;
    if !out.success() {
        error!("Failed to collect statistics for {}", action.source().display());
        return Ok(());
    }
    debug!("Running statistics collectors for {} was successful.", action.source().display());

    let mut stat_file = tempfile::Builder::new()
        .prefix(&format!("{}-", utils::file_name(action.source())))
        .suffix(".stat")
        .tempfile_in(&statistics.stats_tmp_dir)
        .map_err(|err| DriverError::io(err, &statistics.stats_tmp_dir))?;
    stat_file
        .write_all(out.stdout.as_bytes())
        .and_then(|_| stat_file.write_all(out.stderr.as_bytes()))
        .map_err(|err| DriverError::io(err, &statistics.stats_tmp_dir))?;
    stat_file.keep().map_err(|err| DriverError::io(err.error, &statistics.stats_tmp_dir))?;
    Ok(())
}

/// One pre-analysis task: CTU data generation and statistics collection for
/// a single action. Failures are logged and never abort the pool.
fn pre_analyze(
    action: &BuildAction,
    config: &AnalyzerConfig,
    skip: Option<&SkipList>,
    request: PreAnalysisRequest,
    statistics: Option<&StatisticsData>,
    checked: &AtomicUsize,
    total: usize,
) {
    let checked_num = checked.fetch_add(1, Ordering::SeqCst) + 1;

    if skip.is_some_and(|s| s.should_skip(action.source())) {
        return;
    }
    if action.analyzer() != AnalyzerKind::ClangSa.name() {
        return;
    }

    info!("[{}/{}] {}", checked_num, total, utils::file_name(action.source()));

    if request.ctu_collect {
        debug!("running CTU pre analysis");
        let collect = || -> Result<()> {
            let ctu_config = config.ctu.as_ref().expect("CTU is configured when collecting");
            let triple_arch = ctu::get_triple_arch(action, config)?;
            // Dump based analysis requires serialized ASTs; on-demand
            // analysis maps the function names to the original sources.
            if ctu_config.on_demand {
                ctu::generate_invocation_list(action, config, &triple_arch)?;
            } else {
                ctu::generate_ast(action, config, &triple_arch)?;
            }
            ctu::map_functions(action, config, &triple_arch)
        };
        if let Err(err) = collect() {
            error!("Pre-analysis failed for {}: {err}", action.source().display());
        }
    }

    if let Some(statistics) = statistics {
        debug!("running statistics pre analysis");
        if let Err(err) = collect_statistics(action, config, statistics) {
            error!("Statistics collection failed for {}: {err}", action.source().display());
        }
    }
}

/// Runs the pre-analysis jobs before the actual analysis.
///
/// The per-action tasks run on a bounded worker pool; the serial merge and
/// statistics post-processing steps run only after the pool has drained. A
/// failing merge is fatal: the main phase cannot start without the final
/// external definition map.
pub fn run_pre_analysis(
    actions: &[BuildAction],
    config: &Arc<AnalyzerConfig>,
    jobs: usize,
    skip: Option<&SkipList>,
    request: PreAnalysisRequest,
    statistics: Option<&StatisticsData>,
) -> Result<()> {
    info!("Pre-analysis started.");
    if request.ctu_collect {
        info!("Collecting data for ctu analysis.");
    }
    if statistics.is_some() {
        info!("Collecting data for statistical analysis.");
    }

    if let Some(statistics) = statistics {
        // Clean the outputs of any earlier run.
        if statistics.stats_tmp_dir.exists() {
            fs::remove_dir_all(&statistics.stats_tmp_dir)
                .map_err(|err| DriverError::io(err, &statistics.stats_tmp_dir))?;
        }
        fs::create_dir_all(&statistics.stats_tmp_dir)
            .map_err(|err| DriverError::io(err, &statistics.stats_tmp_dir))?;
    }

    let checked = AtomicUsize::new(0);
    let total = actions.len();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs.max(1))
        .build()
        .map_err(|err| DriverError::msg(err))?;
    pool.install(|| {
        actions.par_iter().for_each(|action| {
            if supervisor::interrupted() {
                return;
            }
            pre_analyze(action, config, skip, request, statistics, &checked, total);
        });
    });

    // Post-processing of the pre-analysis results.
    if request.ctu_collect {
        let ctu_dir =
            &config.ctu.as_ref().expect("CTU is configured when collecting").dir;
        ctu::merge_clang_extdef_mappings(ctu_dir)?;
    }

    if let Some(statistics) = statistics {
        post_process_stats(statistics)?;
        if statistics.stats_tmp_dir.exists() {
            debug!("Cleaning up temporary statistics directory");
            fs::remove_dir_all(&statistics.stats_tmp_dir)
                .map_err(|err| DriverError::io(err, &statistics.stats_tmp_dir))?;
        }
    }

    info!("Pre-analysis finished.");
    Ok(())
}

/// Aggregates the raw statistics outputs into the yield file.
///
/// A line of collector output is kept when it was seen in at least
/// `min_sample_count` samples and in at least `relevance_threshold` of all
/// samples; the thresholds themselves are opaque to the scheduler.
fn post_process_stats(statistics: &StatisticsData) -> Result<()> {
    fs::create_dir_all(&statistics.stats_out_dir)
        .map_err(|err| DriverError::io(err, &statistics.stats_out_dir))?;

    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    let mut samples = 0u64;
    for entry in walkdir::WalkDir::new(&statistics.stats_tmp_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().map(|ext| ext == "stat").unwrap_or(false))
    {
        samples += 1;
        let content = fs::read_to_string(entry.path())
            .map_err(|err| DriverError::io(err, entry.path()))?;
        for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
            *counts.entry(line.to_string()).or_default() += 1;
        }
    }

    let kept: BTreeMap<String, u64> = counts
        .into_iter()
        .filter(|(_, count)| *count >= statistics.min_sample_count)
        .filter(|(_, count)| {
            samples > 0 && (*count as f64 / samples as f64) >= statistics.relevance_threshold
        })
        .collect();

    let stats_file = statistics.stats_file();
    let content = serde_yaml::to_string(&kept)?;
    fs::write(&stats_file, content).map_err(|err| DriverError::io(err, &stats_file))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buildlog::action::{ActionDetails, Language};
    use crate::checkers::{CheckerGroups, CheckerRegistry};

    fn action() -> BuildAction {
        BuildAction::from(ActionDetails {
            original_command: "gcc -c a.c".into(),
            directory: "/proj".into(),
            source: "/proj/a.c".into(),
            lang: Some(Language::C),
            ..Default::default()
        })
        .with_analyzer("clangsa")
    }

    fn config_with_stat_checker(with: bool) -> AnalyzerConfig {
        let mut config =
            AnalyzerConfig::new(AnalyzerKind::ClangSa, PathBuf::from("clang"));
        let mut checkers = vec![("core.DivideZero".to_string(), String::new())];
        if with {
            checkers
                .push(("alpha.ericsson.statisticscollector.ReturnValueCheck".into(), String::new()));
        }
        let mut registry = CheckerRegistry::default();
        registry
            .initialize_checkers(&CheckerGroups::default(), &checkers, &vec![], false, false)
            .unwrap();
        config.checkers = registry;
        config
    }

    #[test]
    fn stat_command_enables_only_collector_checkers() {
        let cmd = build_stat_coll_cmd(&action(), &config_with_stat_checker(true)).unwrap();
        assert!(cmd
            .contains(&"-analyzer-checker=alpha.ericsson.statisticscollector.ReturnValueCheck"
                .to_string()));
        assert!(!cmd.iter().any(|a| a.contains("core.DivideZero")));
    }

    #[test]
    fn no_collector_checkers_means_no_collection() {
        assert!(build_stat_coll_cmd(&action(), &config_with_stat_checker(false)).is_none());
    }

    #[test]
    fn stats_post_processing_honors_thresholds() {
        let dir = tempfile::tempdir().unwrap();
        let statistics = StatisticsData {
            stats_out_dir: dir.path().join("stats"),
            stats_tmp_dir: dir.path().join("stats-tmp"),
            min_sample_count: 2,
            relevance_threshold: 0.5,
        };
        fs::create_dir_all(&statistics.stats_tmp_dir).unwrap();
        fs::write(statistics.stats_tmp_dir.join("a-1.stat"), "common\nrare\n").unwrap();
        fs::write(statistics.stats_tmp_dir.join("b-2.stat"), "common\n").unwrap();
        fs::write(statistics.stats_tmp_dir.join("c-3.stat"), "common\n").unwrap();

        post_process_stats(&statistics).unwrap();

        let content = fs::read_to_string(statistics.stats_file()).unwrap();
        assert!(content.contains("common"));
        assert!(!content.contains("rare"));
    }

    #[test]
    fn checker_cfg_points_at_the_stats_dir() {
        let statistics = StatisticsData {
            stats_out_dir: PathBuf::from("/out/stats"),
            stats_tmp_dir: PathBuf::from("/out/stats-tmp"),
            min_sample_count: 10,
            relevance_threshold: 0.85,
        };
        let cfg = statistics.checker_analyze_cfg();
        assert_eq!(cfg[0], "-Xclang");
        assert!(cfg.last().unwrap().contains("/out/stats"));
    }
}

//! Driver for running C/C++ static analyzers over a compilation database.
//!
//! The driver normalizes the raw compilation commands into deduplicated
//! build actions, seeds the checker enablement of every requested analyzer,
//! optionally runs a CTU/statistics pre-analysis phase, schedules the
//! analyzer invocations across a worker pool with per-process timeouts and
//! finally produces a report directory plus a run metadata document for the
//! downstream store and parse tooling.

#[macro_use]
extern crate tracing;

pub mod error;

pub mod utils;

pub mod buildlog;
pub use buildlog::{
    action::{ActionKind, BuildAction, Language},
    log_parser::{CompilationDbEntry, CompileUniqueing},
};

pub mod checkers;
pub use checkers::{CheckerGroups, CheckerOverrides, CheckerRegistry, CheckerState};

pub mod analyzers;
pub use analyzers::{Analyzer, AnalyzerConfig, AnalyzerKind, CtuConfig};

pub mod skiplist;
pub use skiplist::SkipList;

pub mod supervisor;
pub use supervisor::AnalyzerEnv;

pub mod ctu;

pub mod pre_analysis;
pub use pre_analysis::{PreAnalysisRequest, StatisticsData};

pub mod analysis;
pub use analysis::{AnalysisOptions, TaskResult};

pub mod router;

pub mod metadata;
pub use metadata::{Metadata, MetadataTool};

use crate::error::{DriverError, Result};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

/// Version of this tool as recorded in the run metadata.
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Statistics collection thresholds, forwarded verbatim to the
/// post-processing step.
#[derive(Clone, Copy, Debug)]
pub struct StatisticsThresholds {
    pub min_sample_count: u64,
    pub relevance_threshold: f64,
}

impl Default for StatisticsThresholds {
    fn default() -> Self {
        Self { min_sample_count: 10, relevance_threshold: 0.85 }
    }
}

/// Aggregate outcome of a finished run.
#[derive(Clone, Debug, Default)]
pub struct RunSummary {
    /// Number of analysis tasks executed.
    pub analyzed: usize,
    pub successful: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl RunSummary {
    /// The process exit code mandated for this outcome: `0` on completion
    /// with at least one analyzed translation unit.
    pub fn exit_code(&self) -> i32 {
        if self.analyzed > 0 {
            0
        } else {
            1
        }
    }
}

/// Represents one configured analysis run.
///
/// # Examples
///
/// ```no_run
/// use analysis_driver::{AnalyzerKind, Driver};
///
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let summary = Driver::new("compile_commands.json", "reports")
///     .analyzers(vec![AnalyzerKind::ClangSa, AnalyzerKind::ClangTidy])
///     .jobs(8)
///     .run()?;
/// std::process::exit(summary.exit_code());
/// # }
/// ```
#[derive(Debug)]
pub struct Driver {
    compilation_database: PathBuf,
    output_path: PathBuf,
    analyzers: Vec<AnalyzerKind>,
    /// Configured binary names or paths per analyzer; analyzers default to
    /// their own name.
    analyzer_binaries: BTreeMap<AnalyzerKind, String>,
    analyzer_extra_arguments: BTreeMap<AnalyzerKind, Vec<String>>,
    jobs: usize,
    timeout: Option<Duration>,
    skip_list: Option<SkipList>,
    compile_uniqueing: CompileUniqueing,
    checker_groups: CheckerGroups,
    ordered_checkers: CheckerOverrides,
    enable_all: bool,
    strict_checkers: bool,
    capture_analysis_output: bool,
    quiet_output_on_stdout: bool,
    generate_reproducer: bool,
    ctu_collect: bool,
    ctu_analyze: bool,
    ctu_on_demand: bool,
    ctu_reanalyze_on_failure: bool,
    enable_z3: bool,
    enable_z3_refutation: bool,
    statistics: Option<StatisticsThresholds>,
    compiler_info_file: Option<PathBuf>,
    environment: AnalyzerEnv,
}

impl Driver {
    pub fn new(compilation_database: impl Into<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            compilation_database: compilation_database.into(),
            output_path: output_path.into(),
            analyzers: vec![AnalyzerKind::ClangSa, AnalyzerKind::ClangTidy],
            analyzer_binaries: BTreeMap::new(),
            analyzer_extra_arguments: BTreeMap::new(),
            jobs: num_cpus::get(),
            timeout: None,
            skip_list: None,
            compile_uniqueing: CompileUniqueing::None,
            checker_groups: CheckerGroups::default(),
            ordered_checkers: Vec::new(),
            enable_all: false,
            strict_checkers: false,
            capture_analysis_output: false,
            quiet_output_on_stdout: false,
            generate_reproducer: false,
            ctu_collect: false,
            ctu_analyze: false,
            ctu_on_demand: false,
            ctu_reanalyze_on_failure: false,
            enable_z3: false,
            enable_z3_refutation: false,
            statistics: None,
            compiler_info_file: None,
            environment: AnalyzerEnv::default(),
        }
    }

    /// The analyzers to run; defaults to Clang SA and Clang-Tidy.
    pub fn analyzers(mut self, analyzers: Vec<AnalyzerKind>) -> Self {
        self.analyzers = analyzers;
        self
    }

    /// Overrides the binary name or path of one analyzer.
    pub fn analyzer_binary(mut self, analyzer: AnalyzerKind, binary: impl Into<String>) -> Self {
        self.analyzer_binaries.insert(analyzer, binary.into());
        self
    }

    /// Extra arguments forwarded verbatim to every invocation of the
    /// analyzer.
    pub fn analyzer_arguments(mut self, analyzer: AnalyzerKind, args: Vec<String>) -> Self {
        self.analyzer_extra_arguments.insert(analyzer, args);
        self
    }

    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    /// Wall-clock budget of one analyzer invocation.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn skip_list(mut self, skip_list: SkipList) -> Self {
        self.skip_list = Some(skip_list);
        self
    }

    pub fn compile_uniqueing(mut self, uniqueing: CompileUniqueing) -> Self {
        self.compile_uniqueing = uniqueing;
        self
    }

    /// Checker profiles and guideline/severity labels.
    pub fn checker_groups(mut self, groups: CheckerGroups) -> Self {
        self.checker_groups = groups;
        self
    }

    /// The ordered enable/disable overrides from the command line.
    pub fn ordered_checkers(mut self, overrides: CheckerOverrides) -> Self {
        self.ordered_checkers = overrides;
        self
    }

    /// Enables every checker except the `alpha.`/`debug.` families.
    pub fn enable_all(mut self, enable_all: bool) -> Self {
        self.enable_all = enable_all;
        self
    }

    /// Makes unresolved checker identifiers fatal.
    pub fn strict_checkers(mut self, strict: bool) -> Self {
        self.strict_checkers = strict;
        self
    }

    pub fn capture_analysis_output(mut self, capture: bool) -> Self {
        self.capture_analysis_output = capture;
        self
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet_output_on_stdout = quiet;
        self
    }

    /// Packs a reproducer archive for every analysis, not only failures.
    pub fn generate_reproducer(mut self, generate: bool) -> Self {
        self.generate_reproducer = generate;
        self
    }

    /// Runs the CTU collection pre-phase.
    pub fn ctu_collect(mut self, collect: bool) -> Self {
        self.ctu_collect = collect;
        self
    }

    /// Runs the main phase with CTU enabled, reusing the collected data.
    pub fn ctu_analyze(mut self, analyze: bool) -> Self {
        self.ctu_analyze = analyze;
        self
    }

    /// On-demand CTU: parse original sources instead of AST dumps.
    pub fn ctu_on_demand(mut self, on_demand: bool) -> Self {
        self.ctu_on_demand = on_demand;
        self
    }

    /// Retries a failed CTU analysis once with CTU disabled.
    pub fn ctu_reanalyze_on_failure(mut self, retry: bool) -> Self {
        self.ctu_reanalyze_on_failure = retry;
        self
    }

    pub fn enable_z3(mut self, enable: bool) -> Self {
        self.enable_z3 = enable;
        self
    }

    pub fn enable_z3_refutation(mut self, enable: bool) -> Self {
        self.enable_z3_refutation = enable;
        self
    }

    /// Enables the statistics collection pre-phase.
    pub fn statistics(mut self, thresholds: StatisticsThresholds) -> Self {
        self.statistics = Some(thresholds);
        self
    }

    /// Uses a previously recorded compiler info file instead of probing.
    pub fn compiler_info_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.compiler_info_file = Some(file.into());
        self
    }

    /// Extra `PATH`/`LD_LIBRARY_PATH` entries for the analyzer processes.
    pub fn environment(mut self, environment: AnalyzerEnv) -> Self {
        self.environment = environment;
        self
    }

    /// Checks the requested analyzers for executability and version
    /// compatibility and seeds their configurations.
    ///
    /// Unusable analyzers are dropped with a warning; it is fatal only if
    /// no analyzer remains.
    fn seed_analyzer_configs(
        &self,
        tool: &mut MetadataTool,
    ) -> Result<BTreeMap<AnalyzerKind, Arc<AnalyzerConfig>>> {
        let mut configs = BTreeMap::new();
        let mut failed: Vec<(AnalyzerKind, String)> = Vec::new();

        for &kind in &self.analyzers {
            let configured = self
                .analyzer_binaries
                .get(&kind)
                .cloned()
                .unwrap_or_else(|| kind.name().to_string());

            let binary = match kind.resolve_binary(&configured) {
                Ok(binary) => binary,
                Err(err) => {
                    failed.push((kind, err.to_string()));
                    continue;
                }
            };
            if let Some(reason) = kind.incompatibility(&binary) {
                failed.push((kind, reason));
                continue;
            }

            let mut config = AnalyzerConfig::new(kind, binary.clone());
            config.environment = self.environment.clone();
            config.extra_arguments =
                self.analyzer_extra_arguments.get(&kind).cloned().unwrap_or_default();

            if kind == AnalyzerKind::ClangSa {
                config.enable_z3 = self.enable_z3;
                config.enable_z3_refutation = self.enable_z3_refutation;
                if self.ctu_collect || self.ctu_analyze {
                    config.ctu = Some(CtuConfig {
                        dir: self.output_path.join("ctu-dir"),
                        on_demand: self.ctu_on_demand,
                        extdef_mapping_tool: extdef_mapping_tool(&binary),
                    });
                }
            }
            config.validate()?;

            let discovered = match kind.list_checkers(&binary) {
                Ok(checkers) => checkers,
                Err(err) => {
                    warn!("Failed to discover the checkers of {kind}: {err}");
                    Vec::new()
                }
            };
            config.checkers.initialize_checkers(
                &self.checker_groups,
                &discovered,
                &self.ordered_checkers,
                self.enable_all,
                self.strict_checkers,
            )?;

            let analyzer_metadata = tool.analyzer_mut(kind.name());
            for (name, state, _) in config.checkers.checkers() {
                analyzer_metadata.checkers.insert(name.to_string(), state.is_enabled());
            }
            analyzer_metadata.analyzer_statistics.version =
                kind.version(&binary, true).unwrap_or_default();

            configs.insert(kind, Arc::new(config));
        }

        for (kind, reason) in &failed {
            warn!("{kind} cannot be used: {reason}");
        }
        if configs.is_empty() {
            return Err(DriverError::config("no usable analyzer remained"));
        }
        Ok(configs)
    }

    /// Runs the configured analysis end to end and writes the metadata
    /// document.
    pub fn run(self) -> Result<RunSummary> {
        supervisor::install_interrupt_handler();

        fs::create_dir_all(&self.output_path)
            .map_err(|err| DriverError::io(err, &self.output_path))?;

        let entries: Vec<CompilationDbEntry> =
            utils::read_json_file(&self.compilation_database)?;

        // Keep a copy of the consumed compilation database in the report
        // directory.
        utils::write_json_file(self.output_path.join("compile_cmd.json"), &entries)?;

        let actions = buildlog::log_parser::parse_unique_log(
            &entries,
            &self.output_path,
            &self.compile_uniqueing,
            self.skip_list.as_ref(),
            self.compiler_info_file.as_deref(),
        )?;

        let mut tool = MetadataTool::new("analysis-driver", DRIVER_VERSION);
        tool.output_path = self.output_path.clone();

        let configs = self.seed_analyzer_configs(&mut tool)?;

        // One task per (analyzer, action).
        let assigned: Vec<BuildAction> = configs
            .keys()
            .flat_map(|&kind| {
                actions.iter().map(move |action| action.with_analyzer(kind.name()))
            })
            .collect();
        let actions_map = analysis::build_actions_map(&actions);

        let statistics = self.statistics.map(|thresholds| StatisticsData {
            stats_out_dir: self.output_path.join("stats"),
            stats_tmp_dir: self.output_path.join("stats").join("tmp"),
            min_sample_count: thresholds.min_sample_count,
            relevance_threshold: thresholds.relevance_threshold,
        });

        if let Some(clangsa_config) = configs.get(&AnalyzerKind::ClangSa) {
            if self.ctu_collect || statistics.is_some() {
                // Leftover CTU data of an earlier run must not leak into a
                // fresh collection; the invocation list in particular is
                // append-only.
                if self.ctu_collect {
                    if let Some(ctu) = &clangsa_config.ctu {
                        if ctu.dir.exists() {
                            fs::remove_dir_all(&ctu.dir)
                                .map_err(|err| DriverError::io(err, &ctu.dir))?;
                        }
                    }
                }
                let clangsa_actions: Vec<BuildAction> = actions
                    .iter()
                    .map(|action| action.with_analyzer(AnalyzerKind::ClangSa.name()))
                    .collect();
                pre_analysis::run_pre_analysis(
                    &clangsa_actions,
                    clangsa_config,
                    self.jobs,
                    self.skip_list.as_ref(),
                    PreAnalysisRequest { ctu_collect: self.ctu_collect },
                    statistics.as_ref(),
                )?;
            }
        }

        // A collect-only run stops after the pre-analysis phase; with
        // statistics collection requested the collected data feeds a main
        // phase that still has to run.
        let results = if self.ctu_collect && !self.ctu_analyze && statistics.is_none() {
            Vec::new()
        } else {
            let options = AnalysisOptions {
                jobs: self.jobs,
                output_path: self.output_path.clone(),
                timeout: self.timeout,
                capture_analysis_output: self.capture_analysis_output,
                quiet_output_on_stdout: self.quiet_output_on_stdout,
                generate_reproducer: self.generate_reproducer,
                ctu_reanalyze_on_failure: self.ctu_reanalyze_on_failure,
            };
            analysis::start_workers(
                &actions_map,
                &assigned,
                &configs,
                &options,
                self.skip_list.as_ref(),
                &mut tool,
                statistics.as_ref(),
            )?
        };

        tool.mark_finished();
        let summary = RunSummary {
            analyzed: results.iter().filter(|r| !r.skipped).count(),
            successful: tool
                .analyzers
                .values()
                .map(|a| a.analyzer_statistics.successful)
                .sum(),
            failed: tool.analyzers.values().map(|a| a.analyzer_statistics.failed).sum(),
            skipped: tool.skipped,
        };
        Metadata::new(tool).write(self.output_path.join("metadata.json"))?;

        Ok(summary)
    }
}

/// The external definition mapping tool belonging to a clang binary: the
/// sibling `clang-extdef-mapping` when it exists, the plain name otherwise.
fn extdef_mapping_tool(clang_binary: &Path) -> PathBuf {
    let sibling = clang_binary
        .parent()
        .map(|dir| dir.join("clang-extdef-mapping"))
        .filter(|path| path.exists());
    sibling.unwrap_or_else(|| PathBuf::from("clang-extdef-mapping"))
}

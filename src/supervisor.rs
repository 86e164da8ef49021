//! Subprocess supervision.
//!
//! Analyzer invocations run in their own process group so that the whole
//! descendant tree can be signalled atomically. A detached watchdog kills
//! trees that outlive their time budget, and a top-level interrupt tears
//! down every live group before the driver exits with `128 + signal`.

use crate::error::{DriverError, Result};
use std::{
    collections::HashSet,
    env,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        mpsc::{self, RecvTimeoutError},
        Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

/// Grace period between the termination and the kill signal.
const TERM_GRACE: Duration = Duration::from_secs(5);
/// How long to poll the parent process after killing its tree.
const PARENT_POLL: Duration = Duration::from_secs(10);

/// Captured result of one subprocess run.
#[derive(Clone, Debug, Default)]
pub struct ProcessOutput {
    /// The exit code; `-N` when the process was terminated by signal `N`.
    pub return_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.return_code == 0
    }
}

/// Extra `PATH` and `LD_LIBRARY_PATH` entries prepended for every analyzer
/// subprocess, plus fixed variable overrides.
#[derive(Clone, Debug, Default)]
pub struct AnalyzerEnv {
    pub path_extra: Vec<PathBuf>,
    pub ld_lib_path_extra: Vec<PathBuf>,
    pub overrides: Vec<(String, String)>,
}

impl AnalyzerEnv {
    /// The full environment of a child: the driver's own environment with
    /// the configured entries prepended.
    pub fn to_env(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> =
            env::vars().filter(|(k, _)| k != "PATH" && k != "LD_LIBRARY_PATH").collect();
        env.push(("PATH".to_string(), prepend_paths(&self.path_extra, env::var("PATH").ok())));
        let ld = prepend_paths(&self.ld_lib_path_extra, env::var("LD_LIBRARY_PATH").ok());
        if !ld.is_empty() {
            env.push(("LD_LIBRARY_PATH".to_string(), ld));
        }
        for (key, value) in &self.overrides {
            env.retain(|(k, _)| k != key);
            env.push((key.clone(), value.clone()));
        }
        env
    }

    /// Returns a copy of this environment with one more variable set.
    pub fn with_var(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut env = self.clone();
        env.overrides.push((key.into(), value.into()));
        env
    }
}

fn prepend_paths(extra: &[PathBuf], original: Option<String>) -> String {
    let mut parts: Vec<String> =
        extra.iter().map(|p| p.to_string_lossy().into_owned()).collect();
    if let Some(original) = original.filter(|s| !s.is_empty()) {
        parts.push(original);
    }
    parts.join(":")
}

/// Searches `PATH` for an executable with the given name. A name containing
/// a path separator is only checked for being executable.
pub fn find_executable(name: &str) -> Option<PathBuf> {
    fn is_executable(path: &Path) -> bool {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            path.is_file()
                && path.metadata().map(|m| m.permissions().mode() & 0o111 != 0).unwrap_or(false)
        }
        #[cfg(not(unix))]
        {
            path.is_file()
        }
    }

    if name.contains(std::path::MAIN_SEPARATOR) {
        let path = PathBuf::from(name);
        return is_executable(&path).then_some(path);
    }
    env::split_paths(&env::var_os("PATH")?)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

/// Searches the `PATH` directories for binaries whose file name matches
/// `pattern`, preferring the given plain names in order.
///
/// This resolves configured analyzer names like `clang` to versioned
/// installations such as `clang-14` or `clang++-15.0.1`.
pub fn get_binary_in_path(preferred: &[&str], pattern: &regex::Regex) -> Option<PathBuf> {
    for name in preferred {
        if let Some(path) = find_executable(name) {
            return Some(path);
        }
    }

    let mut matching: Vec<PathBuf> = Vec::new();
    for dir in env::split_paths(&env::var_os("PATH")?) {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            if pattern.is_match(&name.to_string_lossy()) {
                matching.push(dir.join(name));
            }
        }
    }
    // The lexicographically greatest name tends to be the newest version.
    matching.sort();
    matching.pop()
}

fn live_groups() -> &'static Mutex<HashSet<i32>> {
    static LIVE_GROUPS: OnceLock<Mutex<HashSet<i32>>> = OnceLock::new();
    LIVE_GROUPS.get_or_init(|| Mutex::new(HashSet::new()))
}

fn register_group(pgid: i32) {
    live_groups().lock().unwrap_or_else(|e| e.into_inner()).insert(pgid);
}

fn unregister_group(pgid: i32) {
    live_groups().lock().unwrap_or_else(|e| e.into_inner()).remove(&pgid);
}

static INTERRUPT_SIGNAL: AtomicI32 = AtomicI32::new(0);

#[cfg(unix)]
extern "C" fn record_interrupt(signum: libc::c_int) {
    INTERRUPT_SIGNAL.store(signum, Ordering::SeqCst);
}

/// Whether a top-level interrupt has been received.
pub fn interrupted() -> bool {
    INTERRUPT_SIGNAL.load(Ordering::SeqCst) != 0
}

/// Installs the top-level interrupt handler.
///
/// The handler itself only records the signal; a monitor thread kills every
/// registered live process group and exits the driver with `128 + signal`.
#[cfg(unix)]
pub fn install_interrupt_handler() {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    static INSTALLED: AtomicBool = AtomicBool::new(false);
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }

    let action = SigAction::new(
        SigHandler::Handler(record_interrupt),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe {
        let _ = sigaction(Signal::SIGINT, &action);
        let _ = sigaction(Signal::SIGTERM, &action);
    }

    thread::spawn(|| loop {
        let signum = INTERRUPT_SIGNAL.load(Ordering::SeqCst);
        if signum != 0 {
            let groups: Vec<i32> = {
                let lock = live_groups().lock().unwrap_or_else(|e| e.into_inner());
                lock.iter().copied().collect()
            };
            for pgid in groups {
                terminate_group(pgid);
            }
            std::process::exit(128 + signum);
        }
        thread::sleep(Duration::from_millis(100));
    });
}

#[cfg(not(unix))]
pub fn install_interrupt_handler() {}

/// Signals the whole process group: graceful termination first, a kill
/// shortly after.
#[cfg(unix)]
fn terminate_group(pgid: i32) {
    use nix::{
        sys::signal::{killpg, Signal},
        unistd::Pid,
    };
    let pgid = Pid::from_raw(pgid);
    let _ = killpg(pgid, Signal::SIGTERM);
    thread::sleep(Duration::from_millis(500));
    let _ = killpg(pgid, Signal::SIGKILL);
}

#[cfg(not(unix))]
fn terminate_group(_pgid: i32) {}

/// Lists the transitive child processes of `pid` by walking `/proc`.
#[cfg(target_os = "linux")]
fn descendant_pids(pid: i32) -> Vec<i32> {
    let mut by_parent: Vec<(i32, i32)> = Vec::new();
    let Ok(entries) = std::fs::read_dir("/proc") else { return Vec::new() };
    for entry in entries.filter_map(|e| e.ok()) {
        let Some(child) = entry.file_name().to_string_lossy().parse::<i32>().ok() else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else { continue };
        // Field 4 of /proc/<pid>/stat is the ppid; the comm field before it
        // is parenthesized and may contain spaces.
        let Some(rest) = stat.rsplit(')').next() else { continue };
        if let Some(ppid) = rest.split_whitespace().nth(1).and_then(|s| s.parse::<i32>().ok()) {
            by_parent.push((ppid, child));
        }
    }

    let mut result = Vec::new();
    let mut frontier = vec![pid];
    while let Some(parent) = frontier.pop() {
        for (ppid, child) in &by_parent {
            if *ppid == parent && !result.contains(child) {
                result.push(*child);
                frontier.push(*child);
            }
        }
    }
    result
}

#[cfg(not(target_os = "linux"))]
fn descendant_pids(_pid: i32) -> Vec<i32> {
    Vec::new()
}

fn pid_alive(pid: i32) -> bool {
    #[cfg(unix)]
    {
        use nix::{sys::signal::kill, unistd::Pid};
        kill(Pid::from_raw(pid), None).is_ok()
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Stops the process tree, trying gracefully first.
///
/// The parent and its descendants get a termination signal; descendants
/// that do not stop within the grace period are killed by force. The parent
/// is then polled for a bounded time and a warning is logged if it is still
/// running afterwards.
#[cfg(unix)]
pub fn kill_process_tree(pid: i32) {
    use nix::{
        sys::signal::{kill, killpg, Signal},
        unistd::Pid,
    };

    let children = descendant_pids(pid);

    // The child runs as its own process group leader, so the group signal
    // reaches the whole tree at once.
    if killpg(Pid::from_raw(pid), Signal::SIGTERM).is_err() {
        let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
    }

    let deadline = Instant::now() + TERM_GRACE;
    while Instant::now() < deadline && children.iter().any(|pid| pid_alive(*pid)) {
        thread::sleep(Duration::from_millis(200));
    }
    for child in children.iter().filter(|pid| pid_alive(**pid)) {
        let _ = kill(Pid::from_raw(*child), Signal::SIGKILL);
    }

    let deadline = Instant::now() + PARENT_POLL;
    while pid_alive(pid) {
        if Instant::now() >= deadline {
            warn!(
                "Waiting for process {pid} to stop has been timed out \
                 (timeout = {PARENT_POLL:?})! Process is still running!"
            );
            return;
        }
        thread::sleep(Duration::from_millis(500));
    }
}

#[cfg(not(unix))]
pub fn kill_process_tree(_pid: i32) {}

/// A cancellable timeout watch over a running subprocess.
///
/// Querying [`Self::was_killed`] is safe any number of times, and
/// cancellation is idempotent.
#[derive(Debug)]
pub struct TimeoutWatch {
    killed: Arc<AtomicBool>,
    cancel: mpsc::Sender<()>,
}

impl TimeoutWatch {
    /// Whether the watchdog fired and killed the process tree.
    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Stops the timer if the process finished within its budget.
    pub fn cancel(&self) {
        let _ = self.cancel.send(());
    }
}

/// Sets up a timeout on a started process. After `timeout` the whole
/// process tree is killed; the returned watch reports whether that
/// happened. Due to OS scheduling the countdown might not be exact.
pub fn setup_process_timeout(pid: i32, timeout: Duration) -> TimeoutWatch {
    let killed = Arc::new(AtomicBool::new(false));
    let (cancel, cancel_rx) = mpsc::channel();

    let killed_flag = killed.clone();
    thread::spawn(move || match cancel_rx.recv_timeout(timeout) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
        Err(RecvTimeoutError::Timeout) => {
            debug!("Process {pid} has ran for too long, killing it!");
            killed_flag.store(true, Ordering::SeqCst);
            kill_process_tree(pid);
        }
    });

    TimeoutWatch { killed, cancel }
}

/// Runs the given command and returns its exit code together with the
/// captured standard outputs.
///
/// The child is started in its own process group with the analyzer
/// environment; `on_spawn` receives its pid once it is running, which is
/// where timeout watchdogs attach.
pub fn run_process(
    argv: &[String],
    cwd: Option<&Path>,
    env: &AnalyzerEnv,
    on_spawn: impl FnOnce(i32),
) -> Result<ProcessOutput> {
    let (program, args) =
        argv.split_first().ok_or_else(|| DriverError::msg("empty command"))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .env_clear()
        .envs(env.to_env())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    trace!("Running analyzer process: {}", shell_words::join(argv));
    let child = cmd.spawn().map_err(|err| DriverError::io(err, program))?;
    let pid = child.id() as i32;
    register_group(pid);
    on_spawn(pid);

    let output = child.wait_with_output();
    unregister_group(pid);
    let output = output.map_err(|err| DriverError::io(err, program))?;

    let return_code = output.status.code().unwrap_or_else(|| {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            -output.status.signal().unwrap_or(1)
        }
        #[cfg(not(unix))]
        {
            1
        }
    });

    Ok(ProcessOutput {
        return_code,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepends_extra_paths() {
        assert_eq!(
            prepend_paths(&[PathBuf::from("/opt/bin")], Some("/usr/bin".into())),
            "/opt/bin:/usr/bin"
        );
        assert_eq!(prepend_paths(&[], Some("/usr/bin".into())), "/usr/bin");
        assert_eq!(prepend_paths(&[PathBuf::from("/opt/bin")], None), "/opt/bin");
    }

    #[test]
    fn env_overrides_replace_inherited_values() {
        let env = AnalyzerEnv::default().with_var("TZ", "UTC");
        let vars = env.to_env();
        let tz: Vec<_> = vars.iter().filter(|(k, _)| k == "TZ").collect();
        assert_eq!(tz.len(), 1);
        assert_eq!(tz[0].1, "UTC");
    }

    #[cfg(unix)]
    #[test]
    fn captures_process_output_and_exit_code() {
        let out = run_process(
            &["sh".into(), "-c".into(), "echo out; echo err >&2; exit 3".into()],
            None,
            &AnalyzerEnv::default(),
            |_| {},
        )
        .unwrap();
        assert_eq!(out.return_code, 3);
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[cfg(unix)]
    #[test]
    fn watchdog_kills_overlong_processes() {
        let started = Instant::now();
        let out = run_process(
            &["sh".into(), "-c".into(), "sleep 30".into()],
            None,
            &AnalyzerEnv::default(),
            |pid| {
                let watch = setup_process_timeout(pid, Duration::from_millis(300));
                // Leak the watch so the timer stays alive for this test.
                std::mem::forget(watch);
            },
        )
        .unwrap();
        assert!(started.elapsed() < Duration::from_secs(20));
        assert_ne!(out.return_code, 0);
    }

    #[cfg(unix)]
    #[test]
    fn cancelled_watchdog_reports_no_kill() {
        let out = run_process(
            &["true".into()],
            None,
            &AnalyzerEnv::default(),
            |pid| {
                let watch = setup_process_timeout(pid, Duration::from_secs(30));
                watch.cancel();
                assert!(!watch.was_killed());
                // Idempotent.
                watch.cancel();
                assert!(!watch.was_killed());
            },
        )
        .unwrap();
        assert_eq!(out.return_code, 0);
    }

    #[test]
    fn finds_executables_in_path() {
        #[cfg(unix)]
        assert!(find_executable("sh").is_some());
        assert!(find_executable("definitely-not-a-real-binary-0x1").is_none());
    }
}

//! Process lifecycle management (platform-agnostic).
//! Starts the daemon and transport helpers, captures their output into the
//! log sink, reaps exits as they happen and stops processes with a bounded
//! graceful-then-forced sequence.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use log::{debug, error, info, warn};

use crate::error::{Result, SupervisorError};
use crate::logsink::LogSink;

/// How often exits are reaped; `observe` is never staler than this.
const REAP_INTERVAL: Duration = Duration::from_millis(50);
const READY_POLL: Duration = Duration::from_millis(100);
const PROBE_TIMEOUT: Duration = Duration::from_millis(300);
/// Extra wait after a forced kill before giving up on confirmation.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Which managed process a handle refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProcessKind {
    Daemon,
    /// Pluggable-transport helper, keyed by transport name.
    Helper(String),
}

impl ProcessKind {
    fn log_origin(&self) -> Option<&str> {
        match self {
            ProcessKind::Daemon => None,
            ProcessKind::Helper(transport) => Some(transport),
        }
    }
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessKind::Daemon => f.write_str("daemon"),
            ProcessKind::Helper(transport) => write!(f, "{transport} helper"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Crashed)
    }

    pub fn is_live(self) -> bool {
        matches!(
            self,
            ProcessState::Starting | ProcessState::Running | ProcessState::Stopping
        )
    }
}

/// When a freshly spawned process counts as `Running`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Running once the grace period elapses without an exit.
    Grace(Duration),
    /// Running once `addr` accepts connections, or once `grace` elapses
    /// without an exit, whichever comes first.
    Reachable { addr: SocketAddr, grace: Duration },
    /// Running once a captured output line contains `marker`; the process is
    /// killed if that does not happen within `timeout`.
    Announce { marker: String, timeout: Duration },
}

/// Everything needed to launch one process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub kind: ProcessKind,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
    pub readiness: Readiness,
}

impl ProcessSpec {
    pub fn new(kind: ProcessKind, program: impl Into<PathBuf>, readiness: Readiness) -> Self {
        Self {
            kind,
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            readiness,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: ProcessState,
    exit_code: Option<i32>,
    stop_requested: bool,
}

struct ProcessCell {
    kind: ProcessKind,
    pid: u32,
    started_at: DateTime<Local>,
    lifecycle: Mutex<Lifecycle>,
    changed: Condvar,
    child: Mutex<Child>,
    startup_output: Mutex<Vec<String>>,
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ProcessCell {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        relock(&self.lifecycle)
    }

    fn state(&self) -> ProcessState {
        self.lifecycle().state
    }

    /// Record the exit seen by the reaper.
    fn finish(&self, exit_code: Option<i32>) -> ProcessState {
        let mut lifecycle = self.lifecycle();
        if !lifecycle.state.is_terminal() {
            lifecycle.state = if lifecycle.stop_requested {
                ProcessState::Stopped
            } else {
                ProcessState::Crashed
            };
            lifecycle.exit_code = exit_code;
        }
        self.changed.notify_all();
        lifecycle.state
    }

    /// Wait until the process reaches a terminal state, at most `timeout`.
    fn wait_terminal(&self, timeout: Duration) -> Option<ProcessState> {
        let guard = self.lifecycle();
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |l| !l.state.is_terminal())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.state.is_terminal().then_some(guard.state)
    }

    fn promote_running(&self) -> bool {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state == ProcessState::Starting {
            lifecycle.state = ProcessState::Running;
            self.changed.notify_all();
            true
        } else {
            false
        }
    }

    /// Mark a stop as requested; `false` when the process already ended.
    fn begin_stop(&self) -> bool {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state.is_terminal() {
            return false;
        }
        lifecycle.state = ProcessState::Stopping;
        lifecycle.stop_requested = true;
        self.changed.notify_all();
        true
    }

    fn force_stopped(&self) {
        let mut lifecycle = self.lifecycle();
        lifecycle.state = ProcessState::Stopped;
        self.changed.notify_all();
    }

    /// Ask the process to exit gracefully.
    fn terminate(&self) -> io::Result<()> {
        let mut child = relock(&self.child);
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        #[cfg(unix)]
        {
            // SAFETY: kill(2) is memory-safe for any pid; the child is not yet
            // reaped (checked above while holding the lock) so the pid is ours.
            let result = unsafe { libc::kill(self.pid as libc::pid_t, libc::SIGTERM) };
            if result == 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }
        #[cfg(not(unix))]
        {
            child.kill()
        }
    }

    fn kill(&self) {
        let mut child = relock(&self.child);
        if let Ok(None) = child.try_wait() {
            if let Err(e) = child.kill() {
                error!("Failed to kill {} (pid {}): {}", self.kind, self.pid, e);
            }
        }
    }
}

/// Reference to one launch of a managed process. Cloning is cheap; every
/// clone observes the same lifecycle.
#[derive(Clone)]
pub struct ProcessHandle {
    cell: Arc<ProcessCell>,
}

/// Point-in-time view of a managed process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSnapshot {
    pub kind: ProcessKind,
    pub state: ProcessState,
    /// Only set while the process is live.
    pub pid: Option<u32>,
    pub started_at: DateTime<Local>,
    pub exit_code: Option<i32>,
}

impl ProcessHandle {
    pub fn kind(&self) -> &ProcessKind {
        &self.cell.kind
    }

    pub fn state(&self) -> ProcessState {
        self.cell.state()
    }

    pub fn snapshot(&self) -> ProcessSnapshot {
        let lifecycle = self.cell.lifecycle();
        ProcessSnapshot {
            kind: self.cell.kind.clone(),
            state: lifecycle.state,
            pid: lifecycle.state.is_live().then_some(self.cell.pid),
            started_at: self.cell.started_at,
            exit_code: lifecycle.exit_code,
        }
    }

    /// Output lines captured while waiting for an `Announce` readiness signal.
    pub fn startup_output(&self) -> Vec<String> {
        relock(&self.cell.startup_output).clone()
    }

    pub fn same_process(&self, other: &ProcessHandle) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("kind", &self.cell.kind)
            .field("state", &self.state())
            .finish()
    }
}

/// Owns every managed process. At most one live process per kind.
pub struct ProcessSupervisor {
    sink: Arc<LogSink>,
    slots: Mutex<HashMap<ProcessKind, ProcessHandle>>,
}

impl ProcessSupervisor {
    pub fn new(sink: Arc<LogSink>) -> Self {
        Self {
            sink,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn a process and block until its readiness contract is met.
    pub fn start(&self, spec: ProcessSpec) -> Result<ProcessHandle> {
        let (handle, tap) = {
            let mut slots = relock(&self.slots);
            if let Some(existing) = slots.get(&spec.kind) {
                if !existing.state().is_terminal() {
                    return Err(SupervisorError::AlreadyRunning {
                        process: spec.kind.to_string(),
                    });
                }
            }
            let (handle, tap) = self.spawn(&spec)?;
            slots.insert(spec.kind.clone(), handle.clone());
            (handle, tap)
        };

        self.await_ready(&handle, &spec.readiness, tap)?;
        info!("{} is running (pid {})", spec.kind, handle.cell.pid);
        Ok(handle)
    }

    /// Stop a process: graceful request, wait up to `timeout`, then force.
    /// The handle always ends up terminal.
    pub fn stop(&self, handle: &ProcessHandle, timeout: Duration) -> Result<()> {
        let cell = &handle.cell;
        if !cell.begin_stop() {
            debug!("{} already ended ({:?})", cell.kind, cell.state());
            self.release(handle);
            return Ok(());
        }

        info!("Stopping {} (pid {})", cell.kind, cell.pid);
        if let Err(e) = cell.terminate() {
            warn!("Failed to signal {} (pid {}): {}", cell.kind, cell.pid, e);
        }

        let result = if cell.wait_terminal(timeout).is_some() {
            Ok(())
        } else {
            warn!(
                "{} did not exit within {:?}; killing it",
                cell.kind, timeout
            );
            cell.kill();
            if cell.wait_terminal(KILL_GRACE).is_some() {
                Ok(())
            } else {
                error!("{} (pid {}) survived a forced kill", cell.kind, cell.pid);
                cell.force_stopped();
                Err(SupervisorError::StopTimeout {
                    process: cell.kind.to_string(),
                    timeout_ms: (timeout + KILL_GRACE).as_millis() as u64,
                })
            }
        };

        self.release(handle);
        result
    }

    /// Stop helpers first, then the daemon. Every process is attempted; the
    /// first error is returned.
    pub fn stop_all(&self, timeout: Duration) -> Result<()> {
        let mut handles: Vec<ProcessHandle> = relock(&self.slots).values().cloned().collect();
        handles.sort_by_key(|h| matches!(h.kind(), ProcessKind::Daemon));

        let mut first_error = None;
        for handle in handles {
            if let Err(e) = self.stop(&handle, timeout) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Non-blocking read of a handle's state.
    pub fn observe(&self, handle: &ProcessHandle) -> ProcessState {
        handle.state()
    }

    /// State of the current process of `kind`; `NotStarted` once a stopped
    /// process has been released.
    pub fn observe_kind(&self, kind: &ProcessKind) -> ProcessState {
        relock(&self.slots)
            .get(kind)
            .map_or(ProcessState::NotStarted, ProcessHandle::state)
    }

    fn release(&self, handle: &ProcessHandle) {
        let mut slots = relock(&self.slots);
        if slots
            .get(handle.kind())
            .is_some_and(|current| current.same_process(handle))
        {
            slots.remove(handle.kind());
        }
    }

    fn spawn(&self, spec: &ProcessSpec) -> Result<(ProcessHandle, Option<Receiver<String>>)> {
        info!(
            "Spawning {}: {} {:?}",
            spec.kind,
            spec.program.display(),
            spec.args
        );

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group: a Ctrl-C aimed at the shell must not reach
            // the daemon before we stop it in order.
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|e| {
            SupervisorError::spawn(&spec.kind, format!("{}: {}", spec.program.display(), e))
        })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let cell = Arc::new(ProcessCell {
            kind: spec.kind.clone(),
            pid: child.id(),
            started_at: Local::now(),
            lifecycle: Mutex::new(Lifecycle {
                state: ProcessState::Starting,
                exit_code: None,
                stop_requested: false,
            }),
            changed: Condvar::new(),
            child: Mutex::new(child),
            startup_output: Mutex::new(Vec::new()),
        });

        let (tap, rx) = match spec.readiness {
            Readiness::Announce { .. } => {
                let (tx, rx) = mpsc::channel();
                (Some(tx), Some(rx))
            }
            _ => (None, None),
        };
        let origin = spec.kind.log_origin().map(str::to_string);
        if let Some(stdout) = stdout {
            self.capture(stdout, origin.clone(), tap.clone());
        }
        if let Some(stderr) = stderr {
            self.capture(stderr, origin, tap);
        }
        self.reap(Arc::clone(&cell));

        Ok((ProcessHandle { cell }, rx))
    }

    /// Forward every output line to the sink (and to the readiness tap while
    /// someone is listening).
    fn capture<R>(&self, stream: R, origin: Option<String>, tap: Option<Sender<String>>)
    where
        R: Read + Send + 'static,
    {
        let sink = Arc::clone(&self.sink);
        thread::spawn(move || {
            let mut reader = BufReader::new(stream);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        let line = line.trim_end_matches(['\r', '\n']);
                        match &origin {
                            Some(origin) => sink.append_from(origin, line),
                            None => sink.append(line),
                        }
                        if let Some(tap) = &tap {
                            let _ = tap.send(line.to_string());
                        }
                    }
                    Err(e) => {
                        debug!("Output capture ended: {e}");
                        break;
                    }
                }
            }
        });
    }

    fn reap(&self, cell: Arc<ProcessCell>) {
        let sink = Arc::clone(&self.sink);
        thread::spawn(move || {
            loop {
                let status = relock(&cell.child).try_wait();
                match status {
                    Ok(Some(status)) => {
                        let state = cell.finish(status.code());
                        if state == ProcessState::Crashed {
                            warn!("{} (pid {}) exited unexpectedly: {}", cell.kind, cell.pid, status);
                        } else {
                            info!("{} (pid {}) exited: {}", cell.kind, cell.pid, status);
                        }
                        sink.append(&format!("({} process exited: {})", cell.kind, status));
                        break;
                    }
                    Ok(None) => thread::sleep(REAP_INTERVAL),
                    Err(e) => {
                        error!("Failed to poll {} (pid {}): {}", cell.kind, cell.pid, e);
                        cell.finish(None);
                        break;
                    }
                }
            }
        });
    }

    fn await_ready(
        &self,
        handle: &ProcessHandle,
        readiness: &Readiness,
        tap: Option<Receiver<String>>,
    ) -> Result<()> {
        let cell = &handle.cell;
        match readiness {
            Readiness::Grace(grace) => {
                if cell.wait_terminal(*grace).is_some() {
                    return Err(exited_early(cell, None));
                }
            }
            Readiness::Reachable { addr, grace } => {
                let deadline = Instant::now() + *grace;
                loop {
                    if cell.state().is_terminal() {
                        return Err(exited_early(cell, None));
                    }
                    if TcpStream::connect_timeout(addr, PROBE_TIMEOUT).is_ok() {
                        debug!("{} accepts connections on {}", cell.kind, addr);
                        break;
                    }
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        debug!("{} survived its grace period without opening {}", cell.kind, addr);
                        break;
                    }
                    if cell.wait_terminal(READY_POLL.min(remaining)).is_some() {
                        return Err(exited_early(cell, None));
                    }
                }
            }
            Readiness::Announce { marker, timeout } => {
                let Some(tap) = tap else {
                    cell.kill();
                    return Err(SupervisorError::spawn(&cell.kind, "output capture unavailable"));
                };
                let deadline = Instant::now() + *timeout;
                let mut announced = Vec::new();
                loop {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        cell.kill();
                        cell.wait_terminal(KILL_GRACE);
                        *relock(&cell.startup_output) = announced;
                        return Err(SupervisorError::spawn(
                            &cell.kind,
                            format!("no '{marker}' within {timeout:?}"),
                        ));
                    }
                    match tap.recv_timeout(READY_POLL.min(remaining)) {
                        Ok(line) => {
                            let ready = line.contains(marker.as_str());
                            announced.push(line);
                            if ready {
                                break;
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            if cell.state().is_terminal() {
                                return Err(exited_early(cell, announced.last()));
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            // Both streams closed; a process that outlives them
                            // can never announce, so it is killed.
                            if cell.wait_terminal(remaining).is_none() {
                                cell.kill();
                                cell.wait_terminal(KILL_GRACE);
                            }
                            return Err(exited_early(cell, announced.last()));
                        }
                    }
                }
                *relock(&cell.startup_output) = announced;
            }
        }

        if cell.promote_running() {
            Ok(())
        } else {
            Err(exited_early(cell, None))
        }
    }
}

fn exited_early(cell: &ProcessCell, last_line: Option<&String>) -> SupervisorError {
    let exit_code = cell.lifecycle().exit_code;
    let mut reason = format!("exited before becoming ready (exit code {exit_code:?})");
    if let Some(line) = last_line {
        reason.push_str(&format!("; last output: {line}"));
    }
    SupervisorError::spawn(&cell.kind, reason)
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        for handle in relock(&self.slots).values() {
            if !handle.state().is_terminal() {
                warn!("Killing {} left running at shutdown", handle.kind());
                handle.cell.kill();
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use rstest::{fixture, rstest};
    use std::net::TcpListener;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        sink: Arc<LogSink>,
        supervisor: ProcessSupervisor,
    }

    #[fixture]
    fn fx() -> Fixture {
        let dir = tempfile::tempdir().expect("temp dir");
        let sink = Arc::new(LogSink::open(dir.path().join("tor.log"), 1000).expect("sink"));
        let supervisor = ProcessSupervisor::new(Arc::clone(&sink));
        Fixture {
            _dir: dir,
            sink,
            supervisor,
        }
    }

    fn shell(kind: ProcessKind, script: &str, readiness: Readiness) -> ProcessSpec {
        ProcessSpec::new(kind, "/bin/sh", readiness).args(["-c", script])
    }

    fn wait_for_state(handle: &ProcessHandle, wanted: ProcessState) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if handle.state() == wanted {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    fn wait_for_line(sink: &LogSink, needle: &str) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if sink.read().iter().any(|l| l.contains(needle)) {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[rstest]
    fn grace_readiness_runs_and_stops_gracefully(fx: Fixture) {
        let spec = shell(
            ProcessKind::Daemon,
            "echo hello from daemon; exec sleep 30",
            Readiness::Grace(Duration::from_millis(100)),
        );
        let handle = fx.supervisor.start(spec).expect("start");
        assert_eq!(handle.state(), ProcessState::Running);
        assert!(handle.snapshot().pid.is_some());
        assert!(wait_for_line(&fx.sink, "hello from daemon"));

        fx.supervisor
            .stop(&handle, Duration::from_secs(2))
            .expect("stop");
        assert_eq!(handle.state(), ProcessState::Stopped);
        assert_eq!(handle.snapshot().pid, None);
        assert_eq!(
            fx.supervisor.observe_kind(&ProcessKind::Daemon),
            ProcessState::NotStarted
        );
    }

    #[rstest]
    fn exit_before_ready_is_a_spawn_error(fx: Fixture) {
        let spec = shell(
            ProcessKind::Daemon,
            "exit 4",
            Readiness::Grace(Duration::from_secs(2)),
        );
        let err = fx.supervisor.start(spec).expect_err("exits early");
        assert_eq!(err.kind(), ErrorKind::SpawnError);
        assert_eq!(
            fx.supervisor.observe_kind(&ProcessKind::Daemon),
            ProcessState::Crashed
        );
    }

    #[rstest]
    fn missing_program_is_a_spawn_error(fx: Fixture) {
        let spec = ProcessSpec::new(
            ProcessKind::Daemon,
            "/nonexistent/tor",
            Readiness::Grace(Duration::from_millis(10)),
        );
        let err = fx.supervisor.start(spec).expect_err("no binary");
        assert_eq!(err.kind(), ErrorKind::SpawnError);
    }

    #[rstest]
    fn unexpected_exit_is_reported_as_crash(fx: Fixture) {
        let spec = shell(
            ProcessKind::Daemon,
            "sleep 0.3; exit 3",
            Readiness::Grace(Duration::from_millis(50)),
        );
        let handle = fx.supervisor.start(spec).expect("start");
        assert_eq!(fx.supervisor.observe(&handle), ProcessState::Running);
        assert!(wait_for_state(&handle, ProcessState::Crashed));
        assert_eq!(fx.supervisor.observe(&handle), ProcessState::Crashed);
        assert_eq!(handle.snapshot().exit_code, Some(3));
        assert!(wait_for_line(&fx.sink, "(daemon process exited"));
    }

    #[rstest]
    fn second_start_of_same_kind_is_rejected(fx: Fixture) {
        let spec = shell(
            ProcessKind::Helper("obfs4".into()),
            "exec sleep 30",
            Readiness::Grace(Duration::from_millis(50)),
        );
        let _first = fx.supervisor.start(spec.clone()).expect("first");
        let err = fx.supervisor.start(spec).expect_err("duplicate");
        assert_eq!(err.kind(), ErrorKind::AlreadyRunning);
    }

    #[rstest]
    fn stop_escalates_when_term_is_ignored(fx: Fixture) {
        let spec = shell(
            ProcessKind::Daemon,
            "trap '' TERM; while true; do sleep 0.1; done",
            Readiness::Grace(Duration::from_millis(100)),
        );
        let handle = fx.supervisor.start(spec).expect("start");
        let started = Instant::now();
        fx.supervisor
            .stop(&handle, Duration::from_millis(200))
            .expect("forced stop still succeeds");
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(handle.state(), ProcessState::Stopped);
    }

    #[rstest]
    fn announce_readiness_collects_startup_output(fx: Fixture) {
        let spec = shell(
            ProcessKind::Helper("obfs4".into()),
            "echo 'VERSION 1'; echo 'CMETHOD obfs4 socks5 127.0.0.1:40000'; echo 'CMETHODS DONE'; exec sleep 30",
            Readiness::Announce {
                marker: "CMETHODS DONE".into(),
                timeout: Duration::from_secs(5),
            },
        );
        let handle = fx.supervisor.start(spec).expect("start");
        assert_eq!(handle.state(), ProcessState::Running);
        assert!(
            handle
                .startup_output()
                .iter()
                .any(|l| l == "CMETHOD obfs4 socks5 127.0.0.1:40000")
        );
        assert!(wait_for_line(&fx.sink, "[obfs4] CMETHODS DONE"));
    }

    #[rstest]
    fn announce_timeout_kills_the_process(fx: Fixture) {
        let spec = shell(
            ProcessKind::Helper("snowflake".into()),
            "exec sleep 30",
            Readiness::Announce {
                marker: "CMETHODS DONE".into(),
                timeout: Duration::from_millis(300),
            },
        );
        let err = fx.supervisor.start(spec).expect_err("never ready");
        assert_eq!(err.kind(), ErrorKind::SpawnError);
        assert_eq!(
            fx.supervisor.observe_kind(&ProcessKind::Helper("snowflake".into())),
            ProcessState::Crashed
        );
    }

    #[rstest]
    fn helper_closing_its_output_is_killed_and_can_restart(fx: Fixture) {
        let kind = ProcessKind::Helper("obfs4".into());
        let silent = || {
            shell(
                kind.clone(),
                "exec >/dev/null 2>&1; exec sleep 30",
                Readiness::Announce {
                    marker: "CMETHODS DONE".into(),
                    timeout: Duration::from_millis(500),
                },
            )
        };
        let err = fx.supervisor.start(silent()).expect_err("never ready");
        assert_eq!(err.kind(), ErrorKind::SpawnError);
        assert!(fx.supervisor.observe_kind(&kind).is_terminal());

        let err = fx.supervisor.start(silent()).expect_err("still never ready");
        assert_eq!(err.kind(), ErrorKind::SpawnError);
    }

    #[rstest]
    fn reachable_readiness_returns_once_port_accepts(fx: Fixture) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let spec = shell(
            ProcessKind::Daemon,
            "exec sleep 30",
            Readiness::Reachable {
                addr,
                grace: Duration::from_secs(20),
            },
        );
        let started = Instant::now();
        let handle = fx.supervisor.start(spec).expect("start");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(handle.state(), ProcessState::Running);
    }

    #[rstest]
    fn stop_all_stops_helpers_and_daemon(fx: Fixture) {
        let helper = fx
            .supervisor
            .start(shell(
                ProcessKind::Helper("obfs4".into()),
                "exec sleep 30",
                Readiness::Grace(Duration::from_millis(50)),
            ))
            .expect("helper");
        let daemon = fx
            .supervisor
            .start(shell(
                ProcessKind::Daemon,
                "exec sleep 30",
                Readiness::Grace(Duration::from_millis(50)),
            ))
            .expect("daemon");

        fx.supervisor
            .stop_all(Duration::from_secs(2))
            .expect("stop all");
        assert_eq!(helper.state(), ProcessState::Stopped);
        assert_eq!(daemon.state(), ProcessState::Stopped);
    }
}

//! Connection health classification.
//!
//! A background thread probes the control channel on a fixed cadence and,
//! when the probe is unreachable, scans output captured since the monitor was
//! armed. It only ever publishes whole `ConnectionStatus` values; readers take
//! a copy and never wait on a probe.

use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::control::{self, ControlEndpoint};
use crate::logsink::{LogCursor, LogSink};
use crate::process::{ProcessHandle, ProcessState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Bootstrapping(u8),
    Connected,
    Failed(String),
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Disconnected => f.write_str("disconnected"),
            Phase::Bootstrapping(percent) => write!(f, "bootstrapping ({percent}%)"),
            Phase::Connected => f.write_str("connected"),
            Phase::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Derived, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub phase: Phase,
    /// Latest human-readable bootstrap summary, when the daemon gave one.
    pub summary: Option<String>,
}

impl ConnectionStatus {
    pub fn disconnected() -> Self {
        Self {
            phase: Phase::Disconnected,
            summary: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            phase: Phase::Failed(reason.into()),
            summary: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.phase == Phase::Connected
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::disconnected()
    }
}

/// One piece of health evidence, from a probe or a log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evidence {
    Progress {
        percent: u8,
        summary: Option<String>,
    },
    Established,
    Failure(String),
}

/// Severity tags the daemon writes in front of each message.
const DAEMON_SEVERITIES: [&str; 5] = ["debug", "info", "notice", "warn", "err"];

/// Classify one captured output line.
///
/// Recognizes `Bootstrapped N% (tag): Summary`, where 100% means the circuit
/// is established, and `[err]` lines, which are fatal. Lines whose first tag
/// is a helper origin such as `[obfs4]` say nothing about the daemon.
pub fn parse_log_line(line: &str) -> Option<Evidence> {
    if first_tag(line).is_some_and(|tag| !DAEMON_SEVERITIES.contains(&tag)) {
        return None;
    }
    if let Some((_, message)) = line.split_once("[err] ") {
        return Some(Evidence::Failure(message.trim().to_string()));
    }

    let (_, rest) = line.split_once("Bootstrapped ")?;
    let (number, rest) = rest.split_once('%')?;
    let percent = number.trim().parse::<u8>().ok()?.min(100);
    if percent == 100 || rest.trim_start().starts_with("(done)") {
        return Some(Evidence::Established);
    }
    let summary = rest
        .split_once("): ")
        .map(|(_, summary)| summary.trim().to_string())
        .filter(|summary| !summary.is_empty());
    Some(Evidence::Progress { percent, summary })
}

fn first_tag(line: &str) -> Option<&str> {
    let (_, rest) = line.split_once('[')?;
    let (tag, _) = rest.split_once(']')?;
    Some(tag)
}

/// Apply evidence to a status. Returns `None` when nothing changes.
///
/// Progress never regresses; `Failed` is terminal until the monitor is re-armed.
pub fn advance(current: &ConnectionStatus, evidence: &Evidence) -> Option<ConnectionStatus> {
    if matches!(current.phase, Phase::Failed(_)) {
        return None;
    }
    match evidence {
        Evidence::Failure(reason) => Some(ConnectionStatus::failed(reason.clone())),
        Evidence::Established => (current.phase != Phase::Connected).then(|| ConnectionStatus {
            phase: Phase::Connected,
            summary: Some("Done".to_string()),
        }),
        Evidence::Progress { percent, summary } => {
            let advances = match current.phase {
                Phase::Disconnected => true,
                Phase::Bootstrapping(previous) => *percent > previous,
                _ => false,
            };
            advances.then(|| ConnectionStatus {
                phase: Phase::Bootstrapping(*percent),
                summary: summary.clone().or_else(|| current.summary.clone()),
            })
        }
    }
}

/// Polling cadence and staleness window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    pub interval: Duration,
    /// How long the monitor tolerates neither a probe answer nor new output
    /// before reporting `Failed("no health signal")`.
    pub stale_after: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            stale_after: Duration::from_secs(120),
        }
    }
}

struct Worker {
    daemon: ProcessHandle,
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

pub struct HealthMonitor {
    status: Arc<RwLock<ConnectionStatus>>,
    sink: Arc<LogSink>,
    config: Mutex<MonitorConfig>,
    worker: Mutex<Option<Worker>>,
}

impl HealthMonitor {
    pub fn new(sink: Arc<LogSink>, config: MonitorConfig) -> Self {
        Self {
            status: Arc::new(RwLock::new(ConnectionStatus::disconnected())),
            sink,
            config: Mutex::new(config),
            worker: Mutex::new(None),
        }
    }

    /// Takes effect the next time the monitor is armed.
    pub fn set_config(&self, config: MonitorConfig) {
        *self.config.lock().unwrap_or_else(|p| p.into_inner()) = config;
    }

    /// Begin polling for `daemon`. Re-arming for the same handle is a no-op;
    /// arming for a different one replaces the previous worker and starts
    /// from `Disconnected`.
    pub fn start(&self, daemon: ProcessHandle, endpoint: ControlEndpoint) {
        self.start_from(daemon, endpoint, self.sink.cursor());
    }

    /// Like `start`, but the log scan also covers lines appended after
    /// `since`, e.g. output the daemon produced while it was starting.
    pub fn start_from(&self, daemon: ProcessHandle, endpoint: ControlEndpoint, since: LogCursor) {
        let mut worker = self.worker.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(current) = worker.as_ref() {
            if current.daemon.same_process(&daemon) && !current.thread.is_finished() {
                debug!("Health monitor already running for this daemon");
                return;
            }
        }
        if let Some(previous) = worker.take() {
            previous.halt();
        }

        self.publish(ConnectionStatus::disconnected());
        let config = *self.config.lock().unwrap_or_else(|p| p.into_inner());
        let (stop, stop_rx) = mpsc::channel();
        let mut poll = Poll {
            daemon: daemon.clone(),
            endpoint,
            sink: Arc::clone(&self.sink),
            status: Arc::clone(&self.status),
            cursor: since,
            last_signal: Instant::now(),
            stale_after: config.stale_after,
        };
        let thread = thread::spawn(move || {
            info!("Health monitor started");
            loop {
                if poll.tick().is_break() {
                    break;
                }
                match stop_rx.recv_timeout(config.interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            info!("Health monitor stopped");
        });

        *worker = Some(Worker {
            daemon,
            stop,
            thread,
        });
    }

    /// Halt polling. Safe to call when never started.
    pub fn stop(&self) {
        let worker = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(worker) = worker {
            worker.halt();
        }
    }

    /// Non-blocking snapshot of the latest status.
    pub fn current_status(&self) -> ConnectionStatus {
        self.status
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Publish a failure observed outside of polling (e.g. a failed launch).
    pub fn fail(&self, reason: impl Into<String>) {
        self.publish(ConnectionStatus::failed(reason));
    }

    /// Publish `Disconnected`, e.g. after an operator-requested stop.
    pub fn reset(&self) {
        self.publish(ConnectionStatus::disconnected());
    }

    fn publish(&self, status: ConnectionStatus) {
        *self.status.write().unwrap_or_else(|p| p.into_inner()) = status;
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Worker {
    fn halt(self) {
        let _ = self.stop.send(());
        if self.thread.join().is_err() {
            warn!("Health monitor thread panicked");
        }
    }
}

enum Flow {
    Continue,
    Break,
}

impl Flow {
    fn is_break(&self) -> bool {
        matches!(self, Flow::Break)
    }
}

/// State owned by the polling thread.
struct Poll {
    daemon: ProcessHandle,
    endpoint: ControlEndpoint,
    sink: Arc<LogSink>,
    status: Arc<RwLock<ConnectionStatus>>,
    cursor: LogCursor,
    last_signal: Instant,
    stale_after: Duration,
}

impl Poll {
    fn current(&self) -> ConnectionStatus {
        self.status
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn publish(&self, status: ConnectionStatus) {
        info!("Connection status: {}", status.phase);
        *self.status.write().unwrap_or_else(|p| p.into_inner()) = status;
    }

    fn apply(&self, evidence: &Evidence) {
        let current = self.current();
        if let Some(next) = advance(&current, evidence) {
            self.publish(next);
        }
    }

    fn tick(&mut self) -> Flow {
        let snapshot = self.daemon.snapshot();
        match snapshot.state {
            ProcessState::Crashed => {
                // Output captured right before the exit may explain it.
                self.scan_log();
                if !matches!(self.current().phase, Phase::Failed(_)) {
                    self.publish(ConnectionStatus::failed(format!(
                        "daemon exited unexpectedly (exit code {:?})",
                        snapshot.exit_code
                    )));
                }
                return Flow::Break;
            }
            ProcessState::Stopped => {
                self.publish(ConnectionStatus::disconnected());
                return Flow::Break;
            }
            ProcessState::NotStarted
            | ProcessState::Starting
            | ProcessState::Running
            | ProcessState::Stopping => {}
        }

        let signalled = match control::probe(&self.endpoint) {
            Ok(evidence) => {
                if let Some(evidence) = evidence {
                    self.apply(&evidence);
                }
                true
            }
            Err(e) => {
                debug!("{e}; falling back to log scan");
                self.scan_log()
            }
        };

        let now = Instant::now();
        if signalled {
            self.last_signal = now;
        } else if now.duration_since(self.last_signal) >= self.stale_after {
            let current = self.current();
            if !matches!(current.phase, Phase::Failed(_)) {
                warn!(
                    "No health signal from the daemon for {:?}",
                    self.stale_after
                );
                self.publish(ConnectionStatus::failed("no health signal"));
            }
        }
        Flow::Continue
    }

    /// Scan lines captured since the last scan; `true` if any arrived.
    fn scan_log(&mut self) -> bool {
        let (lines, next) = self.sink.read_since(self.cursor);
        self.cursor = next;
        for line in &lines {
            if let Some(evidence) = parse_log_line(line) {
                self.apply(&evidence);
            }
        }
        !lines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn progress(percent: u8) -> Evidence {
        Evidence::Progress {
            percent,
            summary: None,
        }
    }

    #[rstest]
    #[case(
        "Oct 18 12:00:00.000 [notice] Bootstrapped 10% (conn_done): Connected to a relay",
        Some(Evidence::Progress { percent: 10, summary: Some("Connected to a relay".into()) })
    )]
    #[case(
        "Oct 18 12:00:03.000 [notice] Bootstrapped 100% (done): Done",
        Some(Evidence::Established)
    )]
    #[case(
        "Oct 18 12:00:00.000 [err] Reading config failed--see warnings above.",
        Some(Evidence::Failure("Reading config failed--see warnings above.".into()))
    )]
    #[case("Oct 18 12:00:00.000 [notice] Opening Socks listener on 127.0.0.1:9050", None)]
    #[case("[obfs4] CMETHODS DONE", None)]
    #[case("Oct 18 12:00:00.000 [obfs4] [err] error parsing bridge line", None)]
    #[case("Oct 18 12:00:00.000 [snowflake] Bootstrapped 100% (done): Done", None)]
    fn classifies_log_lines(#[case] line: &str, #[case] expected: Option<Evidence>) {
        assert_eq!(parse_log_line(line), expected);
    }

    #[test]
    fn progress_is_monotonic() {
        let status = advance(&ConnectionStatus::disconnected(), &progress(40)).expect("first");
        assert_eq!(status.phase, Phase::Bootstrapping(40));
        assert_eq!(advance(&status, &progress(20)), None);
        assert_eq!(advance(&status, &progress(40)), None);
        let status = advance(&status, &progress(75)).expect("forward");
        assert_eq!(status.phase, Phase::Bootstrapping(75));
    }

    #[test]
    fn failure_is_terminal() {
        let failed = ConnectionStatus::failed("boom");
        assert_eq!(advance(&failed, &Evidence::Established), None);
        assert_eq!(advance(&failed, &progress(90)), None);
    }

    #[test]
    fn connected_ignores_late_progress() {
        let connected =
            advance(&ConnectionStatus::disconnected(), &Evidence::Established).expect("done");
        assert!(connected.is_connected());
        assert_eq!(advance(&connected, &progress(50)), None);
        let failed = advance(&connected, &Evidence::Failure("lost".into())).expect("failure");
        assert_eq!(failed.phase, Phase::Failed("lost".into()));
    }

    #[cfg(unix)]
    mod polling {
        use super::super::*;
        use crate::process::{ProcessKind, ProcessSpec, ProcessSupervisor, Readiness};
        use std::net::TcpListener;
        use tempfile::TempDir;

        struct Armed {
            _dir: TempDir,
            supervisor: ProcessSupervisor,
            monitor: HealthMonitor,
            daemon: ProcessHandle,
        }

        /// A port nothing listens on once the listener is dropped.
        fn closed_port() -> u16 {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr").port()
        }

        fn arm(script: &str, stale_after: Duration) -> Armed {
            let dir = tempfile::tempdir().expect("temp dir");
            let sink = Arc::new(LogSink::open(dir.path().join("tor.log"), 1000).expect("sink"));
            let supervisor = ProcessSupervisor::new(Arc::clone(&sink));
            let daemon = supervisor
                .start(
                    ProcessSpec::new(
                        ProcessKind::Daemon,
                        "/bin/sh",
                        Readiness::Grace(Duration::from_millis(50)),
                    )
                    .args(["-c", script]),
                )
                .expect("daemon");
            let monitor = HealthMonitor::new(
                sink,
                MonitorConfig {
                    interval: Duration::from_millis(100),
                    stale_after,
                },
            );
            monitor.start(daemon.clone(), ControlEndpoint::local(closed_port(), None));
            Armed {
                _dir: dir,
                supervisor,
                monitor,
                daemon,
            }
        }

        impl Drop for Armed {
            fn drop(&mut self) {
                self.monitor.stop();
                let _ = self.supervisor.stop(&self.daemon, Duration::from_secs(2));
            }
        }

        fn wait_for_phase(monitor: &HealthMonitor, wanted: &Phase) -> bool {
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                if &monitor.current_status().phase == wanted {
                    return true;
                }
                thread::sleep(Duration::from_millis(20));
            }
            false
        }

        const STALE: Duration = Duration::from_millis(300);

        #[test]
        fn silent_daemon_goes_stale() {
            let armed = arm("exec sleep 30", STALE);
            assert!(wait_for_phase(
                &armed.monitor,
                &Phase::Failed("no health signal".into())
            ));
        }

        #[test]
        fn fresh_output_keeps_the_status_alive() {
            let armed = arm(
                "echo '[notice] Bootstrapped 10% (conn): Connecting to a relay'; \
                 while true; do echo '[notice] still working'; sleep 0.05; done",
                STALE,
            );
            assert!(wait_for_phase(&armed.monitor, &Phase::Bootstrapping(10)));
            thread::sleep(Duration::from_millis(900));
            assert_eq!(armed.monitor.current_status().phase, Phase::Bootstrapping(10));
        }

        #[test]
        fn stop_halts_polling_and_keeps_the_last_status() {
            let armed = arm("exec sleep 30", STALE);
            armed.monitor.stop();
            thread::sleep(Duration::from_millis(600));
            assert_eq!(armed.monitor.current_status().phase, Phase::Disconnected);
        }

        #[test]
        fn daemon_exit_is_reported_as_failure() {
            let armed = arm("sleep 0.2; exit 7", Duration::from_secs(30));
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut phase = armed.monitor.current_status().phase;
            while Instant::now() < deadline && !matches!(phase, Phase::Failed(_)) {
                thread::sleep(Duration::from_millis(20));
                phase = armed.monitor.current_status().phase;
            }
            assert!(
                matches!(&phase, Phase::Failed(reason) if reason.contains("exited unexpectedly")),
                "{phase:?}"
            );
        }
    }

    fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head.clone());
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn bootstrap_percent_never_decreases_for_any_arrival_order() {
        let lines = [
            "[notice] Bootstrapped 5% (conn): Connecting to a relay",
            "[notice] Bootstrapped 14% (handshake): Handshaking with a relay",
            "[notice] Bootstrapped 45% (requesting_descriptors): Asking for relay descriptors",
            "[notice] Bootstrapped 75% (enough_dirinfo): Loaded enough directory info",
            "[notice] Bootstrapped 90% (ap_handshake_done): Handshake finished",
            "[notice] Bootstrapped 100% (done): Done",
        ];
        for order in permutations(&lines) {
            let mut status = ConnectionStatus::disconnected();
            let mut highest = 0u8;
            for line in order {
                let evidence = parse_log_line(line).expect("bootstrap line");
                if let Some(next) = advance(&status, &evidence) {
                    status = next;
                }
                let percent = match status.phase {
                    Phase::Bootstrapping(p) => p,
                    Phase::Connected => 100,
                    ref other => panic!("unexpected phase {other:?}"),
                };
                assert!(percent >= highest, "regressed from {highest} to {percent}");
                highest = percent;
            }
            assert!(status.is_connected());
        }
    }
}

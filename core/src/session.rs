//! The current connection and how it is brought up and torn down.
//!
//! `Session` is owned by the coordinator thread and only ever mutated there.
//! `Launcher` turns settings into running processes: it resolves executables
//! and the bridge profile first, so failures surface before anything running
//! is touched, then starts the helper, renders the daemon config and starts
//! the daemon.

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::bridge::{self, BridgeProfile, DaemonConfig, RuntimeLayout, TransportPlugin};
use crate::config::{BridgeMode, HelperLaunch, Settings, resolve_executable, write_atomically};
use crate::control::ControlEndpoint;
use crate::error::{Result, SupervisorError};
use crate::health::{HealthMonitor, MonitorConfig};
use crate::logsink::{LogCursor, LogSink};
use crate::process::{ProcessHandle, ProcessKind, ProcessSpec, ProcessSupervisor, Readiness};

const HELPER_READY_MARKER: &str = "CMETHODS DONE";

/// The active connection: process handles plus the bridge mode they run with.
#[derive(Debug, Default)]
pub struct Session {
    pub daemon: Option<ProcessHandle>,
    pub helper: Option<ProcessHandle>,
    pub mode: BridgeMode,
    /// Log position just before this session's processes were started.
    pub log_mark: LogCursor,
}

/// Settings that passed resolution, ready to be launched.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub settings: Settings,
    pub daemon: PathBuf,
    pub profile: BridgeProfile,
}

pub struct Launcher {
    supervisor: Arc<ProcessSupervisor>,
    monitor: Arc<HealthMonitor>,
    sink: Arc<LogSink>,
    layout: RuntimeLayout,
}

impl Launcher {
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        monitor: Arc<HealthMonitor>,
        sink: Arc<LogSink>,
        layout: RuntimeLayout,
    ) -> Self {
        Self {
            supervisor,
            monitor,
            sink,
            layout,
        }
    }

    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    /// Whether the daemon of `session` is still alive.
    pub fn is_running(&self, session: &Session) -> bool {
        session
            .daemon
            .as_ref()
            .is_some_and(|daemon| self.supervisor.observe(daemon).is_live())
    }

    /// Resolve the daemon executable, the helper and the bridge profile.
    /// Touches no process.
    pub fn prepare(&self, settings: Settings) -> Result<Prepared> {
        let search_path = settings.search_path();
        let daemon = resolve_executable(
            "tor",
            Some(Path::new(&settings.daemon_path)),
            &[],
            &search_path,
        )?;

        let helper = match bridge::helper_binary(settings.bridge_mode) {
            Some(name) => {
                match resolve_executable(name, None, settings.transport_candidates(name), &search_path)
                {
                    Ok(path) => Some(path),
                    Err(SupervisorError::ExecutableNotFound { .. }) => None,
                    Err(e) => return Err(e),
                }
            }
            None => None,
        };
        let profile = bridge::resolve(
            settings.bridge_mode,
            &settings.effective_obfs4_bridges(),
            helper.as_deref(),
        )?;

        debug!(
            "Prepared launch of {:?} with bridge mode '{}'",
            daemon, settings.bridge_mode
        );
        Ok(Prepared {
            settings,
            daemon,
            profile,
        })
    }

    /// Start processes and arm the monitor.
    pub fn launch(&self, session: &mut Session, prepared: &Prepared) -> Result<()> {
        self.start(session, prepared)?;
        self.arm(session, &prepared.settings);
        Ok(())
    }

    /// Start the helper (when the mode needs a supervised one), write the
    /// daemon config and start the daemon. On failure nothing started here is
    /// left running.
    pub fn start(&self, session: &mut Session, prepared: &Prepared) -> Result<()> {
        let settings = &prepared.settings;
        self.prepare_runtime_dir().map_err(|e| {
            SupervisorError::spawn(
                ProcessKind::Daemon,
                format!("runtime directory {:?}: {e}", self.layout.dir),
            )
        })?;
        let log_mark = self.sink.cursor();
        self.sink.append(&format!(
            "Starting tor with bridge mode: {}",
            settings.bridge_mode
        ));

        let mut helper = None;
        let mut proxy = None;
        if let Some(plugin) = &prepared.profile.plugin {
            if settings.supervisor.helper_launch == HelperLaunch::Supervised {
                let (handle, addr) = self.start_helper(plugin, settings)?;
                helper = Some(handle);
                proxy = Some(addr);
            }
        }

        let daemon = self.write_config(settings, &prepared.profile, proxy).and_then(|torrc| {
            self.supervisor
                .start(self.daemon_spec(&prepared.daemon, &torrc, settings))
        });
        let daemon = match daemon {
            Ok(daemon) => daemon,
            Err(e) => {
                if let Some(helper) = &helper {
                    self.stop_quietly(helper, settings);
                }
                return Err(e);
            }
        };

        session.daemon = Some(daemon);
        session.helper = helper;
        session.mode = settings.bridge_mode;
        session.log_mark = log_mark;
        Ok(())
    }

    /// Point the health monitor at the session's daemon.
    pub fn arm(&self, session: &Session, settings: &Settings) {
        let Some(daemon) = &session.daemon else {
            return;
        };
        self.monitor.set_config(MonitorConfig {
            interval: settings.supervisor.poll_interval(),
            stale_after: settings.supervisor.stale_after(),
        });
        self.monitor.start_from(
            daemon.clone(),
            ControlEndpoint::local(settings.control_port, Some(self.layout.cookie())),
            session.log_mark,
        );
    }

    /// Stop the monitor, then the helper, then the daemon. Every process is
    /// stopped even if an earlier stop fails; the first error is returned.
    pub fn teardown(&self, session: &mut Session, settings: &Settings) -> Result<()> {
        self.monitor.stop();
        let timeout = settings.supervisor.stop_timeout();
        let had_processes = session.daemon.is_some() || session.helper.is_some();
        if self.is_running(session) {
            self.sink.append("Disconnecting tor...");
        }

        let mut first_error = None;
        for handle in [session.helper.take(), session.daemon.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = self.supervisor.stop(&handle, timeout) {
                first_error.get_or_insert(e);
            }
        }
        if had_processes {
            self.monitor.reset();
        }
        first_error.map_or(Ok(()), Err)
    }

    fn prepare_runtime_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.layout.dir)?;
        fs::create_dir_all(self.layout.transport_state())?;
        let data_dir = self.layout.data_dir();
        #[cfg(unix)]
        {
            use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
            // The daemon refuses a data directory others can read.
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(&data_dir)?;
            fs::set_permissions(&data_dir, fs::Permissions::from_mode(0o700))?;
        }
        #[cfg(not(unix))]
        fs::create_dir_all(&data_dir)?;
        Ok(())
    }

    fn write_config(
        &self,
        settings: &Settings,
        profile: &BridgeProfile,
        proxy: Option<SocketAddr>,
    ) -> Result<PathBuf> {
        let torrc = self.layout.torrc();
        let rendered = DaemonConfig {
            settings,
            layout: &self.layout,
            profile,
            proxy,
        }
        .render();
        write_atomically(&torrc, rendered.as_bytes())?;
        self.sink.append(&format!("Torrc file: {}", torrc.display()));
        Ok(torrc)
    }

    fn daemon_spec(&self, program: &Path, torrc: &Path, settings: &Settings) -> ProcessSpec {
        ProcessSpec::new(
            ProcessKind::Daemon,
            program,
            Readiness::Reachable {
                addr: SocketAddr::from(([127, 0, 0, 1], settings.control_port)),
                grace: settings.supervisor.startup_grace(),
            },
        )
        .args(["-f".to_string(), torrc.display().to_string()])
        .env("PATH", settings.search_path())
        .working_dir(&self.layout.dir)
    }

    /// Launch a managed transport proxy and wait for the SOCKS listener it
    /// announces.
    fn start_helper(
        &self,
        plugin: &TransportPlugin,
        settings: &Settings,
    ) -> Result<(ProcessHandle, SocketAddr)> {
        let kind = ProcessKind::Helper(plugin.transport.to_string());
        let spec = ProcessSpec::new(
            kind.clone(),
            &plugin.helper,
            Readiness::Announce {
                marker: HELPER_READY_MARKER.to_string(),
                timeout: settings.supervisor.helper_ready_timeout(),
            },
        )
        .args(plugin.args.iter().cloned())
        .env("TOR_PT_MANAGED_TRANSPORT_VER", "1")
        .env("TOR_PT_CLIENT_TRANSPORTS", plugin.transport)
        .env(
            "TOR_PT_STATE_LOCATION",
            self.layout.transport_state().display().to_string(),
        )
        .working_dir(&self.layout.dir);

        let handle = self.supervisor.start(spec)?;
        match proxy_address(&handle.startup_output(), plugin.transport) {
            Ok(addr) => {
                info!("{kind} listening on {addr}");
                Ok((handle, addr))
            }
            Err(reason) => {
                self.stop_quietly(&handle, settings);
                Err(SupervisorError::spawn(kind, reason))
            }
        }
    }

    fn stop_quietly(&self, handle: &ProcessHandle, settings: &Settings) {
        if let Err(e) = self
            .supervisor
            .stop(handle, settings.supervisor.stop_timeout())
        {
            warn!("Failed to stop {}: {}", handle.kind(), e);
        }
    }
}

/// Find the `CMETHOD <transport> socks5 <addr>` announcement, or the reason
/// the helper gave for not providing one.
pub fn proxy_address(lines: &[String], transport: &str) -> std::result::Result<SocketAddr, String> {
    for line in lines {
        let mut words = line.split_whitespace();
        match words.next() {
            Some("CMETHOD-ERROR") => {
                let rest: Vec<&str> = words.collect();
                return Err(format!("helper reported: {}", rest.join(" ")));
            }
            Some("CMETHOD") => {
                let (Some(name), Some(protocol), Some(addr)) =
                    (words.next(), words.next(), words.next())
                else {
                    continue;
                };
                if name != transport {
                    continue;
                }
                if protocol != "socks5" {
                    return Err(format!("unsupported proxy protocol '{protocol}'"));
                }
                return addr
                    .parse()
                    .map_err(|e| format!("bad listener address '{addr}': {e}"));
            }
            _ => {}
        }
    }
    Err(format!("no listener announced for transport '{transport}'"))
}

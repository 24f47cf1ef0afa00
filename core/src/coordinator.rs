//! Command interface and the coordinator thread behind it.
//!
//! Every command that changes process or config state is queued to a single
//! thread that owns the `Session`, so commands never interleave. Status and
//! log reads are served from snapshots without going through the queue.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};

use crate::bridge::RuntimeLayout;
use crate::config::{BridgeMode, ConfigStore, Settings, SettingsPatch};
use crate::error::{Result, SupervisorError};
use crate::health::{ConnectionStatus, HealthMonitor, MonitorConfig};
use crate::logsink::LogSink;
use crate::platform::{AppPaths, Autostart, ConfigEditor, Notifier};
use crate::process::ProcessSupervisor;
use crate::session::{Launcher, Session};
use crate::switcher::{BridgeSwitcher, SwitchGate, SwitchGuard, SwitchOutcome};

const APP_NAME: &str = "TorTray";

type Reply<T> = Sender<Result<T>>;

enum Command {
    Connect(Reply<()>),
    Disconnect(Reply<()>),
    Switch {
        mode: BridgeMode,
        patch: SettingsPatch,
        guard: SwitchGuard,
        reply: Reply<SwitchOutcome>,
    },
    ClearLogs(Reply<()>),
    EditConfig(Reply<()>),
    SetRunOnLaunch(bool, Reply<()>),
    Shutdown(Reply<()>),
}

/// Platform collaborators the coordinator delegates to.
#[derive(Clone)]
pub struct Collaborators {
    pub notifier: Arc<dyn Notifier>,
    pub autostart: Arc<dyn Autostart>,
    pub editor: Arc<dyn ConfigEditor>,
}

/// Cloneable handle for issuing commands from any thread.
#[derive(Clone)]
pub struct Controller {
    commands: Sender<Command>,
    gate: SwitchGate,
    monitor: Arc<HealthMonitor>,
    sink: Arc<LogSink>,
    config_path: PathBuf,
}

impl Controller {
    /// Start the daemon with the stored settings.
    pub fn connect(&self) -> Result<()> {
        self.request(Command::Connect)
    }

    /// Stop the monitor, helpers and daemon. A no-op when nothing runs.
    pub fn disconnect(&self) -> Result<()> {
        self.request(Command::Disconnect)
    }

    /// Switch to `mode`. Fails immediately with `SwitchInProgress` while
    /// another switch is queued or running.
    pub fn switch_bridge(&self, mode: BridgeMode, patch: SettingsPatch) -> Result<SwitchOutcome> {
        let guard = self.gate.try_begin()?;
        self.request(|reply| Command::Switch {
            mode,
            patch,
            guard,
            reply,
        })
    }

    pub fn status(&self) -> ConnectionStatus {
        self.monitor.current_status()
    }

    pub fn view_logs(&self) -> Vec<String> {
        self.sink.read()
    }

    pub fn clear_logs(&self) -> Result<()> {
        self.request(Command::ClearLogs)
    }

    pub fn edit_config(&self) -> Result<()> {
        self.request(Command::EditConfig)
    }

    pub fn set_run_on_launch(&self, enabled: bool) -> Result<()> {
        self.request(|reply| Command::SetRunOnLaunch(enabled, reply))
    }

    /// Tear everything down and end the coordinator thread.
    pub fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown)
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn log_path(&self) -> &Path {
        self.sink.path()
    }

    /// The gate switch requests go through; exposed so callers can tell
    /// whether a switch is in flight.
    pub fn switch_gate(&self) -> &SwitchGate {
        &self.gate
    }

    fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, response) = mpsc::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| coordinator_gone())?;
        response.recv().map_err(|_| coordinator_gone())?
    }
}

fn coordinator_gone() -> SupervisorError {
    SupervisorError::spawn("command", "the coordinator has shut down")
}

/// Load settings, open the log and start the coordinator thread.
pub fn spawn(
    paths: &dyn AppPaths,
    collaborators: Collaborators,
) -> Result<(Controller, JoinHandle<()>)> {
    let store = ConfigStore::with_paths(paths);
    let settings = match store.load() {
        Ok(settings) => settings,
        Err(e) => {
            // Keep running so the file can still be fixed through edit_config.
            error!("{e}");
            collaborators.notifier.error(APP_NAME, &e.to_string());
            Settings::default()
        }
    };

    let log_path = paths.log_path();
    let sink = Arc::new(
        LogSink::open(&log_path, settings.supervisor.log_max_lines).map_err(|source| {
            SupervisorError::ConfigWrite {
                path: log_path.clone(),
                source,
            }
        })?,
    );
    let supervisor = Arc::new(ProcessSupervisor::new(Arc::clone(&sink)));
    let monitor = Arc::new(HealthMonitor::new(
        Arc::clone(&sink),
        MonitorConfig {
            interval: settings.supervisor.poll_interval(),
            stale_after: settings.supervisor.stale_after(),
        },
    ));
    let launcher = Launcher::new(
        Arc::clone(&supervisor),
        Arc::clone(&monitor),
        Arc::clone(&sink),
        RuntimeLayout::new(paths.runtime_dir()),
    );

    let (commands, queue) = mpsc::channel();
    let controller = Controller {
        commands,
        gate: SwitchGate::new(),
        monitor,
        sink: Arc::clone(&sink),
        config_path: store.path().to_path_buf(),
    };

    let mut coordinator = Coordinator {
        store,
        launcher,
        supervisor,
        sink,
        collaborators,
        session: Session {
            mode: settings.bridge_mode,
            ..Session::default()
        },
        settings,
    };
    let thread = thread::Builder::new()
        .name("tortray-coordinator".into())
        .spawn(move || coordinator.run(queue))
        .map_err(|e| SupervisorError::spawn("coordinator thread", e.to_string()))?;

    info!("Coordinator started");
    Ok((controller, thread))
}

struct Coordinator {
    store: ConfigStore,
    launcher: Launcher,
    supervisor: Arc<ProcessSupervisor>,
    sink: Arc<LogSink>,
    collaborators: Collaborators,
    session: Session,
    /// Last settings that loaded cleanly; supplies timeouts when the file is
    /// broken.
    settings: Settings,
}

impl Coordinator {
    fn run(&mut self, queue: Receiver<Command>) {
        while let Ok(command) = queue.recv() {
            match command {
                Command::Connect(reply) => {
                    let result = self.connect();
                    self.report("Connect failed", &result);
                    let _ = reply.send(result);
                }
                Command::Disconnect(reply) => {
                    let result = self.disconnect();
                    self.report("Disconnect failed", &result);
                    let _ = reply.send(result);
                }
                Command::Switch {
                    mode,
                    patch,
                    guard,
                    reply,
                } => {
                    let result = BridgeSwitcher::new(&self.store, &self.launcher).switch_bridge(
                        &guard,
                        &mut self.session,
                        mode,
                        patch,
                    );
                    drop(guard);
                    if let Ok(settings) = self.store.load() {
                        self.settings = settings;
                    }
                    self.report("Bridge switch failed", &result);
                    let _ = reply.send(result);
                }
                Command::ClearLogs(reply) => {
                    let result = self.sink.clear().map_err(|source| SupervisorError::ConfigWrite {
                        path: self.sink.path().to_path_buf(),
                        source,
                    });
                    match &result {
                        Ok(()) => self
                            .collaborators
                            .notifier
                            .info(APP_NAME, "The log file has been cleared"),
                        Err(e) => self.notify_error("Clearing logs failed", e),
                    }
                    let _ = reply.send(result);
                }
                Command::EditConfig(reply) => {
                    let result = self.edit_config();
                    self.report("Opening the config failed", &result);
                    let _ = reply.send(result);
                }
                Command::SetRunOnLaunch(enabled, reply) => {
                    let result = self.set_run_on_launch(enabled);
                    self.report("Run on launch failed", &result);
                    let _ = reply.send(result);
                }
                Command::Shutdown(reply) => {
                    let _ = reply.send(self.shutdown());
                    return;
                }
            }
        }

        debug!("All controllers dropped");
        if let Err(e) = self.shutdown() {
            warn!("Shutdown incomplete: {e}");
        }
    }

    fn connect(&mut self) -> Result<()> {
        if self.launcher.is_running(&self.session) {
            return Err(SupervisorError::AlreadyRunning {
                process: "daemon".into(),
            });
        }
        let settings = self.load_settings()?;
        settings.validate()?;
        let prepared = self.launcher.prepare(settings)?;

        // A previous attempt may have left crashed handles behind.
        self.launcher.teardown(&mut self.session, &self.settings)?;
        match self.launcher.launch(&mut self.session, &prepared) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.launcher.monitor().fail(e.to_string());
                Err(e)
            }
        }
    }

    fn disconnect(&mut self) -> Result<()> {
        let settings = self.load_settings().unwrap_or_else(|_| self.settings.clone());
        self.launcher.teardown(&mut self.session, &settings)
    }

    fn edit_config(&self) -> Result<()> {
        let path = self.store.path();
        if !path.exists() {
            // Materialize defaults so the editor has something to open.
            self.store.load()?;
        }
        self.collaborators
            .editor
            .open(path)
            .map_err(|e| SupervisorError::spawn("config editor", e.to_string()))
    }

    fn set_run_on_launch(&mut self, enabled: bool) -> Result<()> {
        let autostart = &self.collaborators.autostart;
        let registered = if enabled {
            autostart.enable()
        } else {
            autostart.disable()
        };
        registered.map_err(|source| SupervisorError::ConfigWrite {
            path: autostart.entry_path(),
            source,
        })?;

        self.settings = self.store.update(|settings| settings.run_on_launch = enabled)?;
        info!("Run on launch {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Monitor, helpers, daemon, then the log.
    fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down");
        self.sink.append("TorTray shutting down");
        let timeout = self.settings.supervisor.stop_timeout();
        let torn_down = self.launcher.teardown(&mut self.session, &self.settings);
        let stopped = self.supervisor.stop_all(timeout);
        let flushed = self.sink.flush().map_err(|source| SupervisorError::ConfigWrite {
            path: self.sink.path().to_path_buf(),
            source,
        });
        torn_down.and(stopped).and(flushed)
    }

    fn load_settings(&mut self) -> Result<Settings> {
        let settings = self.store.load()?;
        self.settings = settings.clone();
        Ok(settings)
    }

    fn report<T>(&self, title: &str, result: &Result<T>) {
        if let Err(e) = result {
            self.notify_error(title, e);
        }
    }

    fn notify_error(&self, title: &str, error: &SupervisorError) {
        error!("{title}: {error}");
        self.sink.append(&format!("{title}: {error}"));
        self.collaborators
            .notifier
            .error(&format!("{APP_NAME}: {title}"), &error.to_string());
    }
}

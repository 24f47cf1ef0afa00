//! Bridge switching.
//!
//! A switch runs six steps in a fixed order and stops at the first failure.
//! Validation and resolution happen before anything is stopped, so a bad
//! request never takes down a working connection.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{info, warn};

use crate::config::{BridgeMode, ConfigStore, SettingsPatch};
use crate::error::{Result, SupervisorError};
use crate::session::{Launcher, Session};

/// Step of a bridge switch, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchStep {
    Validate,
    Resolve,
    StopPrevious,
    Commit,
    StartNew,
    ArmMonitor,
}

impl fmt::Display for SwitchStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            Self::Validate => "validating the new settings",
            Self::Resolve => "resolving the bridge profile",
            Self::StopPrevious => "stopping the previous connection",
            Self::Commit => "saving the new settings",
            Self::StartNew => "starting the new connection",
            Self::ArmMonitor => "re-arming the health monitor",
        };
        f.write_str(step)
    }
}

/// Admits one switch at a time.
#[derive(Debug, Clone, Default)]
pub struct SwitchGate {
    busy: Arc<AtomicBool>,
}

/// Held for the duration of one switch; releases the gate when dropped.
#[derive(Debug)]
pub struct SwitchGuard {
    busy: Arc<AtomicBool>,
}

impl SwitchGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the gate, or fail right away if a switch is in flight.
    pub fn try_begin(&self) -> Result<SwitchGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SupervisorError::SwitchInProgress)?;
        Ok(SwitchGuard {
            busy: Arc::clone(&self.busy),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl Drop for SwitchGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// What a successful switch did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// The daemon was restarted with the new mode.
    Restarted,
    /// Nothing was running; the mode applies on the next connect.
    Saved,
}

pub struct BridgeSwitcher<'a> {
    store: &'a ConfigStore,
    launcher: &'a Launcher,
}

impl<'a> BridgeSwitcher<'a> {
    pub fn new(store: &'a ConfigStore, launcher: &'a Launcher) -> Self {
        Self { store, launcher }
    }

    /// Switch `session` to `mode`, applying `patch` to the stored settings.
    ///
    /// The guard proves the caller owns the switch gate. Errors carry the
    /// step that failed; when that step comes after the old connection was
    /// stopped, the system is left stopped and the monitor reports the
    /// failure.
    pub fn switch_bridge(
        &self,
        _guard: &SwitchGuard,
        session: &mut Session,
        mode: BridgeMode,
        patch: SettingsPatch,
    ) -> Result<SwitchOutcome> {
        info!("Switching bridge mode from '{}' to '{}'", session.mode, mode);

        let current = self
            .store
            .load()
            .map_err(|e| failed(SwitchStep::Validate, e))?;
        let mut staged = current.clone();
        patch.apply_to(&mut staged);
        staged.bridge_mode = mode;
        staged
            .validate()
            .map_err(|e| failed(SwitchStep::Validate, e))?;

        let prepared = self
            .launcher
            .prepare(staged)
            .map_err(|e| failed(SwitchStep::Resolve, e))?;

        let restart = self.launcher.is_running(session);
        if let Err(e) = self.launcher.teardown(session, &current) {
            return Err(self.abort(SwitchStep::StopPrevious, e));
        }

        if let Err(e) = self.store.save(&prepared.settings) {
            if restart {
                return Err(self.abort(SwitchStep::Commit, e));
            }
            return Err(failed(SwitchStep::Commit, e));
        }

        if !restart {
            session.mode = mode;
            info!("Bridge mode '{mode}' saved; it applies on the next connect");
            return Ok(SwitchOutcome::Saved);
        }

        if let Err(e) = self.launcher.start(session, &prepared) {
            return Err(self.abort(SwitchStep::StartNew, e));
        }

        self.launcher.arm(session, &prepared.settings);
        info!("Bridge mode switched to '{mode}'");
        Ok(SwitchOutcome::Restarted)
    }

    fn abort(&self, step: SwitchStep, error: SupervisorError) -> SupervisorError {
        warn!("Bridge switch failed while {step}: {error}");
        self.launcher.monitor().fail(format!("{step}: {error}"));
        failed(step, error)
    }
}

fn failed(step: SwitchStep, source: SupervisorError) -> SupervisorError {
    SupervisorError::SwitchFailed {
        step,
        source: Box::new(source),
    }
}

//! Linux shell for TorTray.
//! Takes commands on stdin and prints connection status changes.

mod paths;
mod platform;

use std::io::{self, BufRead};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::thread;
use std::time::Duration;

use log::{error, info, warn};
use tortray_core::config::{BridgeMode, SettingsPatch};
use tortray_core::coordinator::{self, Collaborators, Controller};
use tortray_core::health::Phase;
use tortray_core::switcher::SwitchOutcome;

use crate::paths::LinuxPaths;
use crate::platform::{DesktopNotifier, XdgAutostart, XdgOpenEditor};

const HELP: &str = "commands: connect | disconnect | bridge <none|obfs4|snowflake|meek-azure> | \
status | logs [N] | clear-logs | edit | autostart <on|off> | help | quit";

fn main() {
    env_logger::init();
    info!("starting tortray (linux console)");

    let collaborators = Collaborators {
        notifier: Arc::new(DesktopNotifier),
        autostart: Arc::new(XdgAutostart::new()),
        editor: Arc::new(XdgOpenEditor),
    };
    let (controller, coordinator) = match coordinator::spawn(&LinuxPaths, collaborators) {
        Ok(started) => started,
        Err(e) => {
            error!("failed to start: {e}");
            std::process::exit(1);
        }
    };
    let running = Arc::new(AtomicBool::new(true));

    // Ctrl+C cleanup happens on the event loop once it sees the flag.
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            info!("received signal, stopping tor and exiting");
            running.store(false, Ordering::SeqCst);
        })
        .expect("Error setting Ctrl-C handler");
    }

    println!("{HELP}");
    let mut looper = EventLoop {
        controller,
        commands: Some(read_commands()),
        running,
        last_phase: None,
    };
    looper.run();

    if coordinator.join().is_err() {
        error!("coordinator thread panicked");
    }
}

/// Forward stdin lines so the event loop never blocks on input.
fn read_commands() -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

struct EventLoop {
    controller: Controller,
    commands: Option<Receiver<String>>,
    running: Arc<AtomicBool>,
    last_phase: Option<Phase>,
}

impl EventLoop {
    fn run(&mut self) {
        info!("console ready; entering event loop");

        while self.running.load(Ordering::SeqCst) {
            // Process pending commands (non-blocking)
            while let Some(line) = self.next_command() {
                self.handle_command(line.trim());
            }

            self.refresh_status();
            thread::sleep(Duration::from_millis(50));
        }

        info!("exiting event loop; cleaning up");
        if let Err(e) = self.controller.shutdown() {
            warn!("shutdown incomplete: {e}");
        }
    }

    fn next_command(&mut self) -> Option<String> {
        let commands = self.commands.as_ref()?;
        match commands.try_recv() {
            Ok(line) => Some(line),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                info!("stdin closed; still supervising until interrupted");
                self.commands = None;
                None
            }
        }
    }

    fn handle_command(&mut self, line: &str) {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            return;
        };
        let argument = words.next();

        let result = match (command, argument) {
            ("connect", _) => self.controller.connect(),
            ("disconnect", _) => self.controller.disconnect(),
            ("bridge", Some(mode)) => match mode.parse::<BridgeMode>() {
                Ok(mode) => self
                    .controller
                    .switch_bridge(mode, SettingsPatch::default())
                    .map(|outcome| match outcome {
                        SwitchOutcome::Restarted => println!("restarted with bridge mode {mode}"),
                        SwitchOutcome::Saved => {
                            println!("bridge mode {mode} saved; it applies on the next connect")
                        }
                    }),
                Err(e) => Err(e),
            },
            ("status", _) => {
                let status = self.controller.status();
                match status.summary {
                    Some(summary) => println!("status: {} ({summary})", status.phase),
                    None => println!("status: {}", status.phase),
                }
                Ok(())
            }
            ("logs", count) => {
                let count = count.and_then(|n| n.parse().ok()).unwrap_or(40);
                let lines = self.controller.view_logs();
                for entry in &lines[lines.len().saturating_sub(count)..] {
                    println!("{entry}");
                }
                Ok(())
            }
            ("clear-logs", _) => self.controller.clear_logs(),
            ("edit", _) => self.controller.edit_config(),
            ("autostart", Some("on")) => self.controller.set_run_on_launch(true),
            ("autostart", Some("off")) => self.controller.set_run_on_launch(false),
            ("quit" | "exit", _) => {
                self.running.store(false, Ordering::SeqCst);
                Ok(())
            }
            _ => {
                println!("{HELP}");
                Ok(())
            }
        };

        if let Err(e) = result {
            println!("error ({}): {e}", e.kind());
        }
    }

    fn refresh_status(&mut self) {
        let phase = self.controller.status().phase;
        if self.last_phase.as_ref() != Some(&phase) {
            println!("status: {phase}");
            self.last_phase = Some(phase);
        }
    }
}

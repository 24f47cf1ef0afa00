//! Desktop integration: XDG autostart, xdg-open and notify-send.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::{debug, info, warn};
use tortray_core::platform::{Autostart, ConfigEditor, Notifier};

const DESKTOP_ENTRY: &str = "tortray.desktop";

/// Launch-at-login through `~/.config/autostart`.
pub struct XdgAutostart {
    entry: PathBuf,
}

impl XdgAutostart {
    pub fn new() -> Self {
        let entry = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("autostart")
            .join(DESKTOP_ENTRY);
        Self { entry }
    }
}

impl Autostart for XdgAutostart {
    fn enable(&self) -> io::Result<()> {
        let exe = std::env::current_exe()?;
        if let Some(parent) = self.entry.parent() {
            fs::create_dir_all(parent)?;
        }
        let entry = format!(
            "[Desktop Entry]\n\
             Type=Application\n\
             Name=TorTray\n\
             Comment=Supervise the tor daemon\n\
             Exec=\"{}\"\n\
             Terminal=false\n\
             X-GNOME-Autostart-enabled=true\n",
            exe.display()
        );
        fs::write(&self.entry, entry)?;
        info!("installed autostart entry at {:?}", self.entry);
        Ok(())
    }

    fn disable(&self) -> io::Result<()> {
        match fs::remove_file(&self.entry) {
            Ok(()) => {
                info!("removed autostart entry {:?}", self.entry);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn entry_path(&self) -> PathBuf {
        self.entry.clone()
    }
}

/// Opens files with the desktop's default handler.
#[derive(Default)]
pub struct XdgOpenEditor;

impl ConfigEditor for XdgOpenEditor {
    fn open(&self, path: &Path) -> io::Result<()> {
        info!("opening {:?} with xdg-open", path);
        Command::new("xdg-open")
            .arg(path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map(|_| ())
    }
}

/// Desktop notifications via `notify-send`, always mirrored to the log.
#[derive(Default)]
pub struct DesktopNotifier;

impl DesktopNotifier {
    fn send(&self, urgency: &str, title: &str, body: &str) {
        let sent = Command::new("notify-send")
            .args(["--app-name", "TorTray", "--urgency", urgency, title, body])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        if let Err(e) = sent {
            debug!("notify-send unavailable: {e}");
        }
    }
}

impl Notifier for DesktopNotifier {
    fn info(&self, title: &str, body: &str) {
        info!("{title}: {body}");
        self.send("low", title, body);
    }

    fn warn(&self, title: &str, body: &str) {
        warn!("{title}: {body}");
        self.send("normal", title, body);
    }

    fn error(&self, title: &str, body: &str) {
        log::error!("{title}: {body}");
        self.send("critical", title, body);
    }
}

//! Settings loading, validation and persistence.
//! Uses injected `AppPaths` so platform shells control where files live.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, SupervisorError};
use crate::platform::AppPaths;

pub const DEFAULT_SOCKS_PORT: u16 = 9050;
pub const DEFAULT_CONTROL_PORT: u16 = 9051;

/// Lowest port accepted for the SOCKS and control listeners.
pub const MIN_PORT: u16 = 1024;

/// Transport strategy the daemon is configured with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BridgeMode {
    #[default]
    None,
    Obfs4,
    Snowflake,
    MeekAzure,
}

impl BridgeMode {
    pub const ALL: [BridgeMode; 4] = [
        BridgeMode::None,
        BridgeMode::Obfs4,
        BridgeMode::Snowflake,
        BridgeMode::MeekAzure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeMode::None => "none",
            BridgeMode::Obfs4 => "obfs4",
            BridgeMode::Snowflake => "snowflake",
            BridgeMode::MeekAzure => "meek-azure",
        }
    }
}

impl fmt::Display for BridgeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BridgeMode {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase().replace(' ', "");
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str() == wanted)
            .ok_or_else(|| SupervisorError::Validation(format!("unknown bridge mode '{s}'")))
    }
}

/// Who launches the pluggable-transport helper.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HelperLaunch {
    /// The supervisor spawns and watches the helper, then points the daemon
    /// at the SOCKS listener the helper announces.
    #[default]
    Supervised,
    /// The daemon spawns the helper itself through `ClientTransportPlugin exec`.
    Daemon,
}

/// Tuning knobs for the supervisor; every key is optional in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub stop_timeout_ms: u64,
    pub startup_grace_ms: u64,
    pub helper_ready_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub stale_after_secs: u64,
    pub log_max_lines: usize,
    pub helper_launch: HelperLaunch,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            stop_timeout_ms: 5_000,
            startup_grace_ms: 3_000,
            helper_ready_timeout_ms: 10_000,
            poll_interval_ms: 1_000,
            stale_after_secs: 120,
            log_max_lines: 5_000,
            helper_launch: HelperLaunch::Supervised,
        }
    }
}

impl SupervisorSettings {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn helper_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.helper_ready_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

/// Persisted settings; the single source of truth for every component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub run_on_launch: bool,
    pub bridge_mode: BridgeMode,
    pub daemon_path: String,
    pub socks_port: u16,
    pub control_port: u16,
    /// Search PATH for executables and spawned processes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub obfs4_bridges: Vec<String>,
    pub transport_paths: BTreeMap<String, Vec<PathBuf>>,
    #[serde(default)]
    pub supervisor: SupervisorSettings,
}

impl Default for Settings {
    fn default() -> Self {
        let candidates = |name: &str| {
            ["/opt/homebrew/bin", "/usr/local/bin", "/usr/bin"]
                .iter()
                .map(|dir| Path::new(dir).join(name))
                .collect::<Vec<_>>()
        };
        let transport_paths = ["obfs4proxy", "snowflake-client", "meek-client"]
            .into_iter()
            .map(|name| (name.to_string(), candidates(name)))
            .collect();

        Self {
            run_on_launch: false,
            bridge_mode: BridgeMode::None,
            daemon_path: "tor".to_string(),
            socks_port: DEFAULT_SOCKS_PORT,
            control_port: DEFAULT_CONTROL_PORT,
            path: None,
            obfs4_bridges: vec![
                "# Paste your obfs4 Bridge lines here".to_string(),
                "# Example format:".to_string(),
                "# obfs4 IP:PORT FINGERPRINT cert=CERT iat-mode=0".to_string(),
            ],
            transport_paths,
            supervisor: SupervisorSettings::default(),
        }
    }
}

impl Settings {
    /// Bridge lines with blanks and `#` comments removed, order preserved.
    pub fn effective_obfs4_bridges(&self) -> Vec<String> {
        self.obfs4_bridges
            .iter()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect()
    }

    /// Return configured PATH or fall back to current process PATH.
    pub fn search_path(&self) -> String {
        if let Some(path) = &self.path {
            return path.clone();
        }
        std::env::var("PATH").unwrap_or_default()
    }

    pub fn transport_candidates(&self, helper: &str) -> &[PathBuf] {
        self.transport_paths
            .get(helper)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Invariants that must hold for any file we accept on load.
    pub fn validate_structure(&self) -> Result<()> {
        if self.socks_port == self.control_port {
            return Err(SupervisorError::Validation(format!(
                "socks_port and control_port must differ (both are {})",
                self.socks_port
            )));
        }
        for (key, port) in [
            ("socks_port", self.socks_port),
            ("control_port", self.control_port),
        ] {
            if port < MIN_PORT {
                return Err(SupervisorError::Validation(format!(
                    "{key} {port} is below {MIN_PORT}"
                )));
            }
        }
        if self.daemon_path.trim().is_empty() {
            return Err(SupervisorError::Validation(
                "daemon_path must not be empty".into(),
            ));
        }
        let tuning = &self.supervisor;
        if !(100..=5_000).contains(&tuning.poll_interval_ms) {
            return Err(SupervisorError::Validation(format!(
                "supervisor.poll_interval_ms {} is outside 100..=5000",
                tuning.poll_interval_ms
            )));
        }
        if tuning.stale_after_secs == 0 {
            return Err(SupervisorError::Validation(
                "supervisor.stale_after_secs must be at least 1".into(),
            ));
        }
        if tuning.log_max_lines < 100 {
            return Err(SupervisorError::Validation(format!(
                "supervisor.log_max_lines {} is below 100",
                tuning.log_max_lines
            )));
        }
        Ok(())
    }

    /// Every invariant, including the ones that only matter when the
    /// selected bridge mode is applied.
    pub fn validate(&self) -> Result<()> {
        self.validate_structure()?;
        if self.bridge_mode == BridgeMode::Obfs4 && self.effective_obfs4_bridges().is_empty() {
            return Err(SupervisorError::Validation(
                "no obfs4 bridges configured; add obfs4 bridge lines to use this option".into(),
            ));
        }
        Ok(())
    }
}

/// Fields a bridge switch may update alongside the mode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsPatch {
    pub daemon_path: Option<String>,
    pub socks_port: Option<u16>,
    pub control_port: Option<u16>,
    pub transport_paths: Option<BTreeMap<String, Vec<PathBuf>>>,
    pub obfs4_bridges: Option<Vec<String>>,
}

impl SettingsPatch {
    pub fn with_obfs4_bridges(bridges: Vec<String>) -> Self {
        Self {
            obfs4_bridges: Some(bridges),
            ..Default::default()
        }
    }

    pub fn apply_to(self, settings: &mut Settings) {
        if let Some(daemon_path) = self.daemon_path {
            settings.daemon_path = daemon_path;
        }
        if let Some(port) = self.socks_port {
            settings.socks_port = port;
        }
        if let Some(port) = self.control_port {
            settings.control_port = port;
        }
        if let Some(paths) = self.transport_paths {
            settings.transport_paths = paths;
        }
        if let Some(bridges) = self.obfs4_bridges {
            settings.obfs4_bridges = bridges;
        }
    }
}

/// Reads and writes the settings file. Every load re-reads and re-validates
/// the file because external editors may change it at any time.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn with_paths(paths: &dyn AppPaths) -> Self {
        Self::new(paths.config_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings, creating a default file if missing.
    pub fn load(&self) -> Result<Settings> {
        if !self.path.exists() {
            info!(
                "Config file not found at {:?}, creating default config",
                self.path
            );
            let settings = Settings::default();
            self.save(&settings)?;
            return Ok(settings);
        }

        debug!("Loading config from {:?}", self.path);
        let content = fs::read_to_string(&self.path).map_err(|e| self.corrupt(e))?;
        let settings: Settings = toml::from_str(&content).map_err(|e| self.corrupt(e))?;
        settings.validate_structure().map_err(|e| self.corrupt(e))?;

        info!("Loaded config with bridge mode '{}'", settings.bridge_mode);
        Ok(settings)
    }

    /// Validate and atomically replace the settings file.
    pub fn save(&self, settings: &Settings) -> Result<()> {
        settings.validate()?;
        let content = toml::to_string_pretty(settings).map_err(|e| SupervisorError::ConfigWrite {
            path: self.path.clone(),
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })?;
        write_atomically(&self.path, content.as_bytes())?;

        info!("Saved config to {:?}", self.path);
        Ok(())
    }

    /// Read the current settings, let `change` compute the new value, commit it.
    pub fn update<F>(&self, change: F) -> Result<Settings>
    where
        F: FnOnce(&mut Settings),
    {
        let mut settings = self.load()?;
        change(&mut settings);
        self.save(&settings)?;
        Ok(settings)
    }

    fn corrupt(&self, reason: impl fmt::Display) -> SupervisorError {
        SupervisorError::ConfigCorrupt {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Write `contents` to a sibling temp file, fsync it and rename it over
/// `path`; a crash leaves either the old file or the new one.
pub fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let write_error = |source: io::Error| SupervisorError::ConfigWrite {
        path: path.to_path_buf(),
        source,
    };
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(write_error)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(write_error)?;
    tmp.write_all(contents).map_err(write_error)?;
    tmp.as_file().sync_all().map_err(write_error)?;
    tmp.persist(path).map_err(|e| write_error(e.error))?;
    Ok(())
}

/// Find an executable: the configured path first, then each candidate in
/// order, then the bare `name` on the search path. First existing executable
/// file wins.
pub fn resolve_executable(
    name: &str,
    configured: Option<&Path>,
    candidates: &[PathBuf],
    search_path: &str,
) -> Result<PathBuf> {
    let mut tried = Vec::new();

    let mut direct: Vec<&Path> = Vec::new();
    let mut bare_names: Vec<&OsStr> = Vec::new();
    if let Some(configured) = configured {
        if configured.components().count() > 1 || configured.is_absolute() {
            direct.push(configured);
        } else {
            bare_names.push(configured.as_os_str());
        }
    }
    direct.extend(candidates.iter().map(PathBuf::as_path));
    bare_names.push(OsStr::new(name));

    for path in direct {
        if is_executable(path) {
            debug!("Resolved '{name}' to {path:?}");
            return Ok(path.to_path_buf());
        }
        tried.push(path.to_path_buf());
    }

    for bare in bare_names {
        for dir in std::env::split_paths(OsStr::new(search_path)) {
            let path = dir.join(bare);
            if is_executable(&path) {
                debug!("Resolved '{name}' to {path:?} via search path");
                return Ok(path);
            }
        }
    }

    warn!("No executable found for '{name}'");
    Err(SupervisorError::ExecutableNotFound {
        name: name.to_string(),
        tried,
    })
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    #[fixture]
    fn store() -> (TempDir, ConfigStore) {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = ConfigStore::new(dir.path().join("nested").join("config.toml"));
        (dir, store)
    }

    #[cfg(unix)]
    fn make_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        fs::write(path, "#!/bin/sh\n").expect("write script");
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("chmod");
    }

    #[rstest]
    fn load_materializes_defaults(store: (TempDir, ConfigStore)) {
        let (_dir, store) = store;
        let settings = store.load().expect("load defaults");
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.bridge_mode, BridgeMode::None);
        assert!(store.path().exists());
    }

    #[rstest]
    fn save_then_load_round_trips(store: (TempDir, ConfigStore)) {
        let (_dir, store) = store;
        let mut settings = Settings::default();
        settings.bridge_mode = BridgeMode::Obfs4;
        settings.obfs4_bridges = vec!["obfs4 192.0.2.1:443 ABCDEF cert=xyz iat-mode=0".into()];
        settings.socks_port = 19050;
        settings.control_port = 19051;
        settings.path = Some("/usr/bin:/bin".into());
        settings.supervisor.helper_launch = HelperLaunch::Daemon;
        settings.run_on_launch = true;

        store.save(&settings).expect("save");
        assert_eq!(store.load().expect("load"), settings);
    }

    #[rstest]
    #[case::wrong_type("run_on_launch = \"yes\"\n")]
    #[case::not_toml("{ \"bridge_mode\": \"none\" ")]
    #[case::missing_keys("run_on_launch = false\nbridge_mode = \"none\"\n")]
    #[case::unknown_mode(
        "run_on_launch = false\nbridge_mode = \"carrier-pigeon\"\ndaemon_path = \"tor\"\nsocks_port = 9050\ncontrol_port = 9051\nobfs4_bridges = []\n[transport_paths]\n"
    )]
    #[case::same_ports(
        "run_on_launch = false\nbridge_mode = \"none\"\ndaemon_path = \"tor\"\nsocks_port = 9050\ncontrol_port = 9050\nobfs4_bridges = []\n[transport_paths]\n"
    )]
    fn load_rejects_corrupt_files(store: (TempDir, ConfigStore), #[case] content: &str) {
        let (_dir, store) = store;
        fs::create_dir_all(store.path().parent().expect("parent")).expect("mkdir");
        fs::write(store.path(), content).expect("write");
        let err = store.load().expect_err("corrupt file must not load");
        assert_eq!(err.kind(), ErrorKind::ConfigCorrupt);
    }

    #[rstest]
    fn load_accepts_obfs4_mode_without_bridges(store: (TempDir, ConfigStore)) {
        let (_dir, store) = store;
        let mut settings = Settings::default();
        settings.bridge_mode = BridgeMode::Obfs4;
        let content = toml::to_string_pretty(&settings).expect("serialize");
        fs::create_dir_all(store.path().parent().expect("parent")).expect("mkdir");
        fs::write(store.path(), content).expect("write");

        let loaded = store.load().expect("structure is valid");
        assert_eq!(
            loaded.validate().expect_err("bridges missing").kind(),
            ErrorKind::ValidationError
        );
    }

    #[rstest]
    fn save_rejects_invalid_settings_without_touching_the_file(store: (TempDir, ConfigStore)) {
        let (_dir, store) = store;
        store.load().expect("defaults");
        let before = fs::read_to_string(store.path()).expect("read");

        let mut settings = Settings::default();
        settings.bridge_mode = BridgeMode::Obfs4;
        let err = store.save(&settings).expect_err("comment-only bridges");
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert_eq!(fs::read_to_string(store.path()).expect("read"), before);
    }

    #[rstest]
    fn update_commits_the_computed_value(store: (TempDir, ConfigStore)) {
        let (_dir, store) = store;
        let updated = store
            .update(|settings| settings.run_on_launch = true)
            .expect("update");
        assert!(updated.run_on_launch);
        assert!(store.load().expect("reload").run_on_launch);
    }

    #[rstest]
    #[case::poll_too_fast(|t: &mut SupervisorSettings| t.poll_interval_ms = 50)]
    #[case::never_stale(|t: &mut SupervisorSettings| t.stale_after_secs = 0)]
    #[case::tiny_log(|t: &mut SupervisorSettings| t.log_max_lines = 10)]
    fn out_of_range_tuning_is_rejected(#[case] tweak: fn(&mut SupervisorSettings)) {
        let mut settings = Settings::default();
        tweak(&mut settings.supervisor);
        assert_eq!(
            settings.validate().expect_err("out of range").kind(),
            ErrorKind::ValidationError
        );
    }

    #[test]
    fn effective_bridges_skip_comments_and_blanks() {
        let mut settings = Settings::default();
        settings.obfs4_bridges = vec![
            "# heading".into(),
            "  ".into(),
            " obfs4 192.0.2.1:443 AAAA cert=x iat-mode=0 ".into(),
            "obfs4 192.0.2.2:443 BBBB cert=y iat-mode=0".into(),
        ];
        assert_eq!(
            settings.effective_obfs4_bridges(),
            vec![
                "obfs4 192.0.2.1:443 AAAA cert=x iat-mode=0".to_string(),
                "obfs4 192.0.2.2:443 BBBB cert=y iat-mode=0".to_string(),
            ]
        );
    }

    #[rstest]
    #[case("obfs4", BridgeMode::Obfs4)]
    #[case("Snowflake", BridgeMode::Snowflake)]
    #[case("meek-azure", BridgeMode::MeekAzure)]
    #[case("None", BridgeMode::None)]
    fn bridge_mode_parses_menu_titles(#[case] input: &str, #[case] expected: BridgeMode) {
        assert_eq!(input.parse::<BridgeMode>().expect("parse"), expected);
    }

    #[test]
    fn patch_only_touches_given_fields() {
        let mut settings = Settings::default();
        SettingsPatch {
            socks_port: Some(29050),
            ..Default::default()
        }
        .apply_to(&mut settings);
        assert_eq!(settings.socks_port, 29050);
        assert_eq!(settings.control_port, DEFAULT_CONTROL_PORT);
        assert_eq!(settings.obfs4_bridges, Settings::default().obfs4_bridges);
    }

    #[cfg(unix)]
    #[test]
    fn resolve_prefers_configured_then_candidates_then_search_path() {
        let dir = tempfile::tempdir().expect("temp dir");
        let configured = dir.path().join("configured-tor");
        let candidate = dir.path().join("candidate-tor");
        let bin = dir.path().join("bin");
        fs::create_dir(&bin).expect("mkdir");
        let on_path = bin.join("tor");
        make_executable(&candidate);
        make_executable(&on_path);
        let search = bin.display().to_string();

        let found = resolve_executable("tor", Some(&configured), &[candidate.clone()], &search)
            .expect("candidate");
        assert_eq!(found, candidate);

        make_executable(&configured);
        let found = resolve_executable("tor", Some(&configured), &[candidate.clone()], &search)
            .expect("configured");
        assert_eq!(found, configured);

        let found = resolve_executable("tor", None, &[], &search).expect("search path");
        assert_eq!(found, on_path);
    }

    #[cfg(unix)]
    #[test]
    fn resolve_skips_files_without_execute_bit() {
        let dir = tempfile::tempdir().expect("temp dir");
        let plain = dir.path().join("obfs4proxy");
        fs::write(&plain, "not executable").expect("write");

        let err = resolve_executable("obfs4proxy", None, &[plain.clone()], "")
            .expect_err("not executable");
        match err {
            SupervisorError::ExecutableNotFound { name, tried } => {
                assert_eq!(name, "obfs4proxy");
                assert_eq!(tried, vec![plain]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn resolve_treats_bare_configured_name_as_search_path_lookup() {
        let dir = tempfile::tempdir().expect("temp dir");
        let custom = dir.path().join("tor-nightly");
        make_executable(&custom);
        let search = dir.path().display().to_string();

        let found = resolve_executable("tor", Some(Path::new("tor-nightly")), &[], &search)
            .expect("bare configured name");
        assert_eq!(found, custom);
    }
}

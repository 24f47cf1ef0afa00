pub mod bridge;
pub mod config;
pub mod control;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod logsink;
pub mod process;
pub mod session;
pub mod switcher;

pub use error::{ErrorKind, Result, SupervisorError};

/// Interfaces that platform shells implement to adapt the core library
/// without pulling in platform-specific dependencies.
pub mod platform {
    use std::io;
    use std::path::{Path, PathBuf};

    /// Trait for platform-correct config/log/runtime paths.
    pub trait AppPaths {
        fn config_path(&self) -> PathBuf;
        fn log_path(&self) -> PathBuf;
        /// Directory holding the rendered daemon config, its data directory
        /// and transport state.
        fn runtime_dir(&self) -> PathBuf;
    }

    /// Trait for dispatching user-visible notifications.
    pub trait Notifier: Send + Sync {
        fn info(&self, title: &str, body: &str);
        fn warn(&self, title: &str, body: &str);
        fn error(&self, title: &str, body: &str);
    }

    /// Launch-at-login registration.
    pub trait Autostart: Send + Sync {
        fn enable(&self) -> io::Result<()>;
        fn disable(&self) -> io::Result<()>;
        /// Location of the registration entry, used in error reports.
        fn entry_path(&self) -> PathBuf;
    }

    /// Opens the settings file in the user's editor.
    pub trait ConfigEditor: Send + Sync {
        fn open(&self, path: &Path) -> io::Result<()>;
    }

}

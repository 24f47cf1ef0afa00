use std::path::PathBuf;

use tortray_core::platform::AppPaths;

const APP_DIR: &str = "tortray";

#[derive(Default)]
pub struct LinuxPaths;

impl LinuxPaths {
    fn data_dir(&self) -> PathBuf {
        dirs::data_local_dir()
            .or_else(dirs::data_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

impl AppPaths for LinuxPaths {
    fn config_path(&self) -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    fn log_path(&self) -> PathBuf {
        self.data_dir().join("tor.log")
    }

    fn runtime_dir(&self) -> PathBuf {
        dirs::runtime_dir()
            .map(|dir| dir.join(APP_DIR))
            .unwrap_or_else(|| self.data_dir().join("run"))
    }
}

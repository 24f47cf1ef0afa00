//! Bridge profiles and the daemon configuration they render into.
//!
//! Resolution is a pure mapping: executable lookup happens before, in the
//! session layer, so a missing helper is reported before anything is stopped.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::config::{BridgeMode, Settings};
use crate::error::{Result, SupervisorError};

const SNOWFLAKE_BRIDGE: &str = "snowflake 192.0.2.4:80 8838024498816A039FCBBAB14E6F40A0843051FA fingerprint=8838024498816A039FCBBAB14E6F40A0843051FA url=https://1098762253.rsc.cdn77.org/ fronts=www.cdn77.com,www.phpmyadmin.net ice=stun:stun.l.google.com:19302,stun:stun.altar.com.pl:3478,stun:stun.antisip.com:3478,stun:stun.bluesip.net:3478,stun:stun.dus.net:3478,stun:stun.epygi.com:3478,stun:stun.sonetel.com:3478,stun:stun.uls.co.za:3478,stun:stun.voipgate.com:3478,stun:stun.voys.nl:3478 utls-imitate=hellorandomizedalpn";

const MEEK_AZURE_BRIDGE: &str = "meek_lite 192.0.2.18:80 BE776A53492E1E044A26F17306E1BC46A55A1625 url=https://meek.azureedge.net/ front=ajax.aspnetcdn.com";

/// Helper executable a mode depends on, if any.
pub fn helper_binary(mode: BridgeMode) -> Option<&'static str> {
    match mode {
        BridgeMode::None => None,
        BridgeMode::Obfs4 => Some("obfs4proxy"),
        BridgeMode::Snowflake => Some("snowflake-client"),
        BridgeMode::MeekAzure => Some("meek-client"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportPlugin {
    pub transport: &'static str,
    pub helper: PathBuf,
    pub args: Vec<String>,
}

/// Configuration fragment for one bridge mode. Recomputed on every switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeProfile {
    pub mode: BridgeMode,
    pub plugin: Option<TransportPlugin>,
    pub bridges: Vec<String>,
}

impl BridgeProfile {
    /// Render the fragment. `proxy` is the SOCKS listener of a supervised
    /// helper; without one the daemon is told to exec the helper itself.
    pub fn fragment(&self, proxy: Option<SocketAddr>) -> Vec<String> {
        let Some(plugin) = &self.plugin else {
            return Vec::new();
        };

        let plugin_line = match proxy {
            Some(addr) => format!("ClientTransportPlugin {} socks5 {}", plugin.transport, addr),
            None => {
                let mut line = format!(
                    "ClientTransportPlugin {} exec {}",
                    plugin.transport,
                    plugin.helper.display()
                );
                for arg in &plugin.args {
                    line.push(' ');
                    line.push_str(arg);
                }
                line
            }
        };

        let mut lines = vec!["UseBridges 1".to_string(), plugin_line];
        lines.extend(self.bridges.iter().map(|bridge| format!("Bridge {bridge}")));
        lines
    }
}

/// Map a bridge selection to its profile. `helper` is the resolved helper
/// executable, `None` when lookup found nothing.
pub fn resolve(mode: BridgeMode, obfs4_bridges: &[String], helper: Option<&Path>) -> Result<BridgeProfile> {
    let (transport, args, bridges) = match mode {
        BridgeMode::None => {
            return Ok(BridgeProfile {
                mode,
                plugin: None,
                bridges: Vec::new(),
            });
        }
        BridgeMode::Obfs4 => ("obfs4", Vec::new(), obfs4_bridges.to_vec()),
        BridgeMode::Snowflake => (
            "snowflake",
            vec!["-log".to_string(), "/dev/null".to_string()],
            vec![SNOWFLAKE_BRIDGE.to_string()],
        ),
        BridgeMode::MeekAzure => ("meek_lite", Vec::new(), vec![MEEK_AZURE_BRIDGE.to_string()]),
    };

    let helper = helper.ok_or_else(|| SupervisorError::UnresolvedTransport {
        mode,
        helper: helper_binary(mode).unwrap_or_default().to_string(),
    })?;
    if bridges.is_empty() {
        return Err(SupervisorError::Validation(format!(
            "no {mode} bridges configured; add bridge lines to use this option"
        )));
    }

    Ok(BridgeProfile {
        mode,
        plugin: Some(TransportPlugin {
            transport,
            helper: helper.to_path_buf(),
            args,
        }),
        bridges,
    })
}

/// Files the daemon is pointed at, all under the runtime directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeLayout {
    pub dir: PathBuf,
}

impl RuntimeLayout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn torrc(&self) -> PathBuf {
        self.dir.join("torrc")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.dir.join("data")
    }

    pub fn cookie(&self) -> PathBuf {
        self.dir.join("control_auth_cookie")
    }

    pub fn transport_state(&self) -> PathBuf {
        self.dir.join("pt_state")
    }
}

/// Complete daemon configuration for one launch.
pub struct DaemonConfig<'a> {
    pub settings: &'a Settings,
    pub layout: &'a RuntimeLayout,
    pub profile: &'a BridgeProfile,
    pub proxy: Option<SocketAddr>,
}

impl DaemonConfig<'_> {
    pub fn render(&self) -> String {
        let mut lines = vec![
            format!("SOCKSPort {}", self.settings.socks_port),
            format!("ControlPort {}", self.settings.control_port),
            "CookieAuthentication 1".to_string(),
            format!("CookieAuthFile {}", self.layout.cookie().display()),
            format!("DataDirectory {}", self.layout.data_dir().display()),
            "Log notice stdout".to_string(),
            "ClientOnly 1".to_string(),
            format!("__OwningControllerProcess {}", std::process::id()),
        ];
        lines.extend(self.profile.fragment(self.proxy));

        let mut rendered = lines.join("\n");
        rendered.push('\n');
        rendered
    }
}

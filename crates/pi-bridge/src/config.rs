use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    backend::{BrokerConfig, SuperuserConfig},
    descriptor::DEFAULT_PACKAGE_NAME,
    manager::ManagerOptions,
};

const BRIDGE_CONFIG_FILE: &str = "bridge-config.json";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub broker_addr: String,
    pub daemon_addr: String,
    pub su_path: String,
    pub daemon_path: String,
    pub package_name: String,
    pub connect_timeout_ms: u64,
    pub teardown_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub delegate_only: bool,
    pub auto_reconnect: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            broker_addr: pi_util::DEFAULT_BROKER_ADDR.into(),
            daemon_addr: pi_util::DEFAULT_DAEMON_ADDR.into(),
            su_path: "su".into(),
            daemon_path: "pi-daemon".into(),
            package_name: DEFAULT_PACKAGE_NAME.into(),
            connect_timeout_ms: 15_000,
            teardown_timeout_ms: 5_000,
            heartbeat_interval_ms: 2_000,
            delegate_only: false,
            auto_reconnect: false,
        }
    }
}

impl BridgeConfig {
    pub fn path() -> PathBuf {
        pi_util::state_file_path(BRIDGE_CONFIG_FILE)
    }

    pub fn load() -> Self {
        Self::load_from(&Self::path())
    }

    /// Defaults, then the file at `path`, then `PI_*` environment variables.
    pub fn load_from(path: &Path) -> Self {
        Self::load_with_env(path, |key| std::env::var(key).ok())
    }

    fn load_with_env(path: &Path, env: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = match fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str::<BridgeConfig>(&data) {
                Ok(file_cfg) => file_cfg,
                Err(err) => {
                    warn!("Failed to parse {}: {err}", path.display());
                    BridgeConfig::default()
                }
            },
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to read {}: {err}", path.display());
                }
                BridgeConfig::default()
            }
        };

        let text = |key: &str, slot: &mut String| {
            if let Some(value) = env(key).filter(|v| !v.trim().is_empty()) {
                *slot = value;
            }
        };
        text("PI_BROKER_ADDR", &mut cfg.broker_addr);
        text("PI_DAEMON_ADDR", &mut cfg.daemon_addr);
        text("PI_SU_PATH", &mut cfg.su_path);
        text("PI_DAEMON_PATH", &mut cfg.daemon_path);
        text("PI_PACKAGE_NAME", &mut cfg.package_name);

        if let Some(ms) = env("PI_CONNECT_TIMEOUT_MS").and_then(|v| v.trim().parse().ok()) {
            cfg.connect_timeout_ms = ms;
        }
        if let Some(flag) = env("PI_DELEGATE_ONLY").map(|v| parse_flag(&v)) {
            cfg.delegate_only = flag;
        }
        if let Some(flag) = env("PI_AUTO_RECONNECT").map(|v| parse_flag(&v)) {
            cfg.auto_reconnect = flag;
        }
        cfg
    }

    pub fn save(&self) -> io::Result<()> {
        self.save_to(&Self::path())
    }

    pub fn save_to(&self, path: &Path) -> io::Result<()> {
        pi_util::write_json_atomic(path, self)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn broker(&self) -> BrokerConfig {
        BrokerConfig {
            addr: self.broker_addr.clone(),
            package_name: self.package_name.clone(),
            connect_timeout: self.connect_timeout(),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms.max(100)),
            delegate_only: self.delegate_only,
        }
    }

    pub fn superuser(&self) -> SuperuserConfig {
        SuperuserConfig {
            su_path: PathBuf::from(&self.su_path),
            daemon_path: PathBuf::from(&self.daemon_path),
            addr: self.daemon_addr.clone(),
            connect_timeout: self.connect_timeout(),
            ..SuperuserConfig::default()
        }
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            connect_timeout: self.connect_timeout(),
            teardown_timeout: Duration::from_millis(self.teardown_timeout_ms),
            auto_reconnect: self.auto_reconnect,
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

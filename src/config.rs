use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::device::{
    parse_aes_key, parse_eui, EndDevice, EndDeviceIds, EuiPrefix, MacVersion, RootKeys,
};
use crate::server::JoinServerConfig;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub join: JoinConfig,
    /// KEK table: label to 32-hex-digit key-encryption key.
    #[serde(default)]
    pub keks: HashMap<String, String>,
    /// KEK label applied when wrapping session keys for a peer address.
    #[serde(default)]
    pub kek_labels: HashMap<String, String>,
    /// Devices provisioned at startup.
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceConfig>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub bind: String,
    /// Shared secret presented by cluster peers on every request.
    pub cluster_auth_token: String,
}

#[derive(Debug, Deserialize)]
pub struct JoinConfig {
    /// JoinEUI prefixes served by this Join Server, as `<eui>/<bits>`.
    pub join_eui_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub join_eui: String,
    pub dev_eui: String,
    pub lorawan_version: String,
    pub app_key: String,
    pub nwk_key: Option<String>,
    pub network_server_address: String,
    pub application_server_address: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;
        Ok(config)
    }

    /// Parses the join-core portion of the configuration.
    pub fn join_server_config(&self) -> anyhow::Result<JoinServerConfig> {
        let join_eui_prefixes = self
            .join
            .join_eui_prefixes
            .iter()
            .map(|p| p.parse())
            .collect::<Result<Vec<EuiPrefix>, _>>()?;

        let mut keks = HashMap::new();
        for (label, key) in &self.keks {
            keks.insert(label.clone(), parse_aes_key(key)?);
        }

        Ok(JoinServerConfig {
            join_eui_prefixes,
            keks,
            kek_labels: self.kek_labels.clone(),
        })
    }
}

impl DeviceConfig {
    pub fn to_end_device(&self, now: DateTime<Utc>) -> anyhow::Result<EndDevice> {
        let lorawan_version: MacVersion = self.lorawan_version.parse()?;
        let nwk_key = self.nwk_key.as_deref().map(parse_aes_key).transpose()?;
        if lorawan_version.is_1_1() && nwk_key.is_none() {
            anyhow::bail!("1.1 device {} has no nwk_key", self.dev_eui);
        }
        Ok(EndDevice {
            ids: EndDeviceIds {
                join_eui: parse_eui(&self.join_eui)?,
                dev_eui: parse_eui(&self.dev_eui)?,
                dev_addr: None,
            },
            lorawan_version,
            root_keys: RootKeys {
                app_key: parse_aes_key(&self.app_key)?,
                nwk_key,
            },
            next_dev_nonce: 0,
            used_dev_nonces: vec![],
            next_join_nonce: 0,
            network_server_address: self.network_server_address.clone(),
            application_server_address: self.application_server_address.clone(),
            session: None,
            created_at: now,
            updated_at: now,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind: "0.0.0.0:1790".to_string(),
                cluster_auth_token: String::new(),
            },
            join: JoinConfig {
                join_eui_prefixes: vec![],
            },
            keks: HashMap::new(),
            kek_labels: HashMap::new(),
            devices: vec![],
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
        [server]
        bind = "0.0.0.0:1790"
        cluster_auth_token = "secret"

        [join]
        join_eui_prefixes = ["42ffffffffffff00/56", "1000ffffffffffff/12"]

        [keks]
        ns-kek = "00112233445566778899aabbccddeeff"

        [kek_labels]
        "66.66.66.66" = "ns-kek"

        [[device]]
        join_eui = "42ffffffffffffff"
        dev_eui = "4242ffffffffffff"
        lorawan_version = "1.1"
        app_key = "42ffffffffffffffffffffffffffffff"
        nwk_key = "4242ffffffffffffffffffffffffffff"
        network_server_address = "66.66.66.66"

        [logging]
        level = "debug"
    "#;

    #[test]
    fn test_parse_example() {
        let config: Config = toml::from_str(EXAMPLE).unwrap();
        assert_eq!(config.server.cluster_auth_token, "secret");
        assert_eq!(config.devices.len(), 1);

        let js = config.join_server_config().unwrap();
        assert_eq!(js.join_eui_prefixes.len(), 2);
        assert!(js.join_eui_prefixes[0].matches(0x42ff_ffff_ffff_ffff));
        assert_eq!(js.kek_labels.get("66.66.66.66").unwrap(), "ns-kek");
        assert!(js.keks.contains_key("ns-kek"));
    }

    #[test]
    fn test_provisioned_device() {
        let config: Config = toml::from_str(EXAMPLE).unwrap();
        let device = config.devices[0].to_end_device(Utc::now()).unwrap();
        assert_eq!(device.ids.dev_eui, 0x4242_ffff_ffff_ffff);
        assert_eq!(device.lorawan_version, MacVersion::V1_1);
        assert!(device.root_keys.nwk_key.is_some());
        assert_eq!(device.next_join_nonce, 0);
    }

    #[test]
    fn test_1_1_device_requires_nwk_key() {
        let config: Config = toml::from_str(EXAMPLE).unwrap();
        let mut dc = config.devices[0].clone();
        dc.nwk_key = None;
        assert!(dc.to_end_device(Utc::now()).is_err());
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.bind, "0.0.0.0:1790");
        assert!(config.join.join_eui_prefixes.is_empty());
        assert_eq!(config.logging.level, "info");
    }
}

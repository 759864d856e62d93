//! Daemon configuration: interfaces, RIP settings, authentication, and
//! optional raw-socket receivers.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use serde::Deserialize;

use ridgeline_net::{IfTree, IfTreeAddr, IfTreeInterface, IfTreeVif};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {err}")]
    Io { path: String, err: std::io::Error },

    #[error("parsing {path}: {err}")]
    Parse { path: String, err: toml::de::Error },

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
    #[serde(default)]
    pub rip: RipConfig,
    #[serde(default)]
    pub raw_receivers: Vec<RawReceiverConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct InterfaceConfig {
    pub name: String,
    /// Defaults to the interface name.
    pub vif: Option<String>,
    pub address: Ipv4Addr,
    pub prefix: u8,
    #[serde(default)]
    pub pif_index: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_mtu")]
    pub mtu: u32,
}

impl InterfaceConfig {
    pub fn vifname(&self) -> &str {
        self.vif.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct RipConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cost")]
    pub cost: u32,
    #[serde(default = "default_horizon")]
    pub horizon: String,
    #[serde(default = "default_true")]
    pub advertise: bool,
    #[serde(default)]
    pub accept_default_route: bool,
    #[serde(default)]
    pub advertise_default_route: bool,
    pub expiry_secs: Option<u32>,
    pub deletion_secs: Option<u32>,
    pub unsolicited_response_secs: Option<u32>,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for RipConfig {
    fn default() -> Self {
        RipConfig {
            enabled: true,
            cost: default_cost(),
            horizon: default_horizon(),
            advertise: true,
            accept_default_route: false,
            advertise_default_route: false,
            expiry_secs: None,
            deletion_secs: None,
            unsolicited_response_secs: None,
            auth: AuthConfig::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct AuthConfig {
    /// "none", "simple", or "md5".
    #[serde(default)]
    pub r#type: Option<String>,
    /// Password for the simple scheme.
    pub password: Option<String>,
    /// Keychain for the md5 scheme.
    #[serde(default)]
    pub keys: Vec<AuthKeyConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct AuthKeyConfig {
    pub id: u8,
    pub password: String,
    /// Validity window as offsets from daemon start; omitted end means
    /// no expiry.
    #[serde(default)]
    pub start_secs: i64,
    pub end_secs: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct RawReceiverConfig {
    pub name: String,
    pub interface: String,
    pub vif: Option<String>,
    pub protocol: u8,
    #[serde(default)]
    pub multicast_loopback: bool,
    /// Multicast groups to join on registration.
    #[serde(default)]
    pub groups: Vec<IpAddr>,
    /// Optional payload decoder for logging: currently "olsrv1"
    /// (UDP-encapsulated OLSR).
    pub decode: Option<String>,
}

impl RawReceiverConfig {
    pub fn vifname(&self) -> &str {
        self.vif.as_deref().unwrap_or(&self.interface)
    }
}

fn default_true() -> bool {
    true
}

fn default_cost() -> u32 {
    1
}

fn default_horizon() -> String {
    "split-horizon-poison-reverse".to_string()
}

fn default_mtu() -> u32 {
    1500
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|err| ConfigError::Io {
            path: path.display().to_string(),
            err,
        })?;
        let config: Config = toml::from_str(&text).map_err(|err| ConfigError::Parse {
            path: path.display().to_string(),
            err,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for iface in &self.interfaces {
            if iface.prefix > 32 {
                return Err(ConfigError::Invalid(format!(
                    "interface {}: prefix {} is out of range",
                    iface.name, iface.prefix
                )));
            }
        }
        match self.rip.auth.r#type.as_deref() {
            None | Some("none") => {}
            Some("simple") => {
                if self.rip.auth.password.is_none() {
                    return Err(ConfigError::Invalid(
                        "simple authentication needs a password".to_string(),
                    ));
                }
            }
            Some("md5") => {
                if self.rip.auth.keys.is_empty() {
                    return Err(ConfigError::Invalid(
                        "md5 authentication needs at least one key".to_string(),
                    ));
                }
            }
            Some(other) => {
                return Err(ConfigError::Invalid(format!(
                    "unknown authentication type {other:?}"
                )));
            }
        }
        Ok(())
    }

    /// Materialize the interface tree the port manager subscribes to.
    pub fn build_iftree(&self) -> IfTree {
        let mut tree = IfTree::new();
        for iface in &self.interfaces {
            if tree.find_interface(&iface.name).is_none() {
                tree.set_interface(
                    &iface.name,
                    IfTreeInterface {
                        enabled: true,
                        mac: None,
                        mtu: iface.mtu,
                        vifs: BTreeMap::new(),
                    },
                );
            }
            if tree.find_vif(&iface.name, iface.vifname()).is_none() {
                tree.set_vif(
                    &iface.name,
                    iface.vifname(),
                    IfTreeVif {
                        enabled: true,
                        pif_index: iface.pif_index,
                        addrs: BTreeMap::new(),
                    },
                );
            }
            tree.set_address(
                &iface.name,
                iface.vifname(),
                IfTreeAddr {
                    addr: IpAddr::V4(iface.address),
                    enabled: iface.enabled,
                    prefix_len: iface.prefix,
                    multicast_capable: true,
                },
            );
        }
        tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn load_str(text: &str) -> Result<Config, ConfigError> {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(text.as_bytes()).expect("write");
        Config::load(file.path())
    }

    #[test]
    fn minimal_config_parses() {
        let config = load_str(
            r#"
            [[interfaces]]
            name = "eth0"
            address = "10.0.0.1"
            prefix = 24
            pif-index = 2
            "#,
        )
        .expect("config");
        assert_eq!(config.interfaces.len(), 1);
        assert_eq!(config.interfaces[0].vifname(), "eth0");
        assert!(config.rip.enabled);
        let tree = config.build_iftree();
        assert!(tree.address_enabled("eth0", "eth0", &IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
    }

    #[test]
    fn md5_auth_requires_keys() {
        let result = load_str(
            r#"
            [rip.auth]
            type = "md5"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn simple_auth_requires_password() {
        let result = load_str(
            r#"
            [rip.auth]
            type = "simple"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn full_config_parses() {
        let config = load_str(
            r#"
            [[interfaces]]
            name = "eth0"
            address = "10.0.0.1"
            prefix = 24
            pif-index = 2

            [rip]
            cost = 2
            horizon = "split-horizon"
            accept-default-route = true
            expiry-secs = 90

            [rip.auth]
            type = "md5"

            [[rip.auth.keys]]
            id = 1
            password = "s3cret"
            end-secs = 3600

            [[raw-receivers]]
            name = "ospf-probe"
            interface = "eth0"
            protocol = 89
            groups = ["224.0.0.5"]
            "#,
        )
        .expect("config");
        assert_eq!(config.rip.cost, 2);
        assert_eq!(config.rip.expiry_secs, Some(90));
        assert_eq!(config.rip.auth.keys.len(), 1);
        assert_eq!(config.raw_receivers.len(), 1);
        assert_eq!(config.raw_receivers[0].groups.len(), 1);
    }
}

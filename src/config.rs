//! Network configuration and per-invocation arguments
//!
//! The network configuration arrives as JSON on stdin and is parsed once per
//! command. The raw bytes are kept as well, since IPAM must receive the
//! exact payload the runtime sent.

use crate::error::{CniError, Result};
use crate::link::MacvlanMode;
use crate::types::Dns;
use serde::Deserialize;
use serde_json::{Map, Value};

/// Environment variable overriding the metadata service used for MAC lookup.
pub const METADATA_URL_ENV: &str = "CNI_MACVLAN_METADATA_URL";
/// Metadata service queried when no override is set.
pub const DEFAULT_METADATA_URL: &str = "http://rancher-metadata/2015-12-19";

/// Parsed network configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NetConf {
    #[serde(rename = "cniVersion", default)]
    pub cni_version: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    #[serde(default)]
    pub ipam: Option<IpamConf>,
    #[serde(default)]
    pub dns: Dns,
    /// Host interface the macvlan is stacked on.
    #[serde(default)]
    pub master: String,
    #[serde(default)]
    pub mode: String,
    /// 0 inherits the master's MTU.
    #[serde(default)]
    pub mtu: u32,
    #[serde(rename = "isDefaultGateway", default)]
    pub is_default_gateway: bool,
}

/// IPAM section; only `type` is interpreted, the rest belongs to IPAM.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IpamConf {
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

impl NetConf {
    /// Parse and validate a network configuration document.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let conf: NetConf = serde_json::from_slice(bytes)?;
        if conf.master.is_empty() {
            return Err(CniError::InvalidConfig(
                r#""master" field is required. It specifies the host interface name to virtualize"#
                    .to_string(),
            ));
        }
        Ok(conf)
    }

    /// Kernel macvlan mode; an empty string selects bridge mode.
    pub fn macvlan_mode(&self) -> Result<MacvlanMode> {
        self.mode.parse().map_err(CniError::InvalidConfig)
    }

    /// Name of the IPAM plugin executable.
    pub fn ipam_type(&self) -> Result<&str> {
        match &self.ipam {
            Some(ipam) if !ipam.plugin_type.is_empty() => Ok(&ipam.plugin_type),
            _ => Err(CniError::InvalidConfig(
                r#""ipam.type" field is required"#.to_string(),
            )),
        }
    }

    /// CNI version echoed in results and error documents.
    pub fn version(&self) -> &str {
        self.cni_version.as_deref().unwrap_or(crate::skel::LEGACY_VERSION)
    }
}

/// Recognized `CNI_ARGS` keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetArgs {
    pub ignore_unknown: bool,
    /// Legacy container UUID used as a secondary MAC lookup key.
    pub rancher_container_uuid: String,
    /// Accepted for compatibility; not acted on.
    pub link_mtu_overhead: String,
    /// Explicit MAC address; skips the metadata lookup when set.
    pub mac_address: String,
}

impl NetArgs {
    /// Parse a `KEY=VALUE;KEY=VALUE` argument string.
    ///
    /// Unknown keys are rejected unless `IgnoreUnknown` is true somewhere in
    /// the string.
    pub fn parse(args: &str) -> Result<Self> {
        let mut parsed = NetArgs::default();
        if args.is_empty() {
            return Ok(parsed);
        }

        let mut pairs = Vec::new();
        for pair in args.split(';').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                CniError::InvalidConfig(format!("ARGS: invalid pair {pair:?}"))
            })?;
            pairs.push((key, value));
        }

        if let Some((_, value)) = pairs.iter().find(|(key, _)| *key == "IgnoreUnknown") {
            parsed.ignore_unknown = parse_bool(value)?;
        }

        for (key, value) in pairs {
            match key {
                "IgnoreUnknown" => {}
                "RancherContainerUUID" => parsed.rancher_container_uuid = value.to_string(),
                "LinkMTUOverhead" => parsed.link_mtu_overhead = value.to_string(),
                "MACAddress" => parsed.mac_address = value.to_string(),
                _ if parsed.ignore_unknown => {}
                _ => {
                    return Err(CniError::InvalidConfig(format!(
                        "ARGS: unknown args {key:?}"
                    )))
                }
            }
        }

        Ok(parsed)
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(CniError::InvalidConfig(format!(
            "boolean unmarshal error: invalid input {value}"
        ))),
    }
}

/// Base URL of the container metadata service.
pub fn metadata_url() -> String {
    std::env::var(METADATA_URL_ENV)
        .ok()
        .filter(|url| !url.is_empty())
        .unwrap_or_else(|| DEFAULT_METADATA_URL.to_string())
}

//! Error types for the macvlan plugin
//!
//! Every failure a command can hit is a [`CniError`]. The variant names the
//! step that failed; the CNI error code reported to the runtime is derived
//! from it by [`CniError::code`].

use crate::link::LinkError;
use crate::netns::NetNsError;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use thiserror::Error;

/// CNI error code for incompatible or malformed environment variables.
pub const CODE_INVALID_ENVIRONMENT: u32 = 4;
/// CNI error code for I/O failures.
pub const CODE_IO_FAILURE: u32 = 5;
/// CNI error code for content that failed to decode.
pub const CODE_DECODING_FAILURE: u32 = 6;
/// CNI error code for semantically invalid network configuration.
pub const CODE_INVALID_NETWORK_CONFIG: u32 = 7;
/// First code reserved for plugin specific errors.
pub const CODE_PLUGIN_SPECIFIC: u32 = 100;

#[derive(Error, Debug)]
pub enum CniError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load netconf: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid environment: {0}")]
    InvalidEnvironment(String),

    #[error("Failed to lookup master {master:?}: {source}")]
    MasterNotFound { master: String, source: LinkError },

    #[error("Failed to create macvlan: {0}")]
    LinkCreationFailed(LinkError),

    #[error("Failed to set proxy_arp on newly added interface {name:?}: {source}")]
    ProxyArpSetupFailed {
        name: String,
        source: std::io::Error,
    },

    #[error("Failed to rename macvlan to {name:?}: {source}")]
    RenameFailed { name: String, source: LinkError },

    #[error("Failed to open netns {path:?}: {source}")]
    NamespaceNotFound { path: PathBuf, source: NetNsError },

    #[error("Failed to switch network namespace: {0}")]
    NamespaceSwitchFailed(NetNsError),

    #[error("IPAM plugin returned missing IPv4 config")]
    MissingIPv4Config,

    #[error("Failed to find MAC address for container {container_id}: {reason}")]
    MacAddressLookupFailed {
        container_id: String,
        reason: String,
    },

    #[error("Couldn't set the MAC address of interface {name:?}: {reason}")]
    MacAddressSetFailed { name: String, reason: String },

    #[error("isDefaultGateway ineffective because IPAM sets default route via {0}")]
    GatewayConflict(Ipv4Addr),

    #[error("Failed to configure interface {name:?}: {source}")]
    InterfaceConfigFailed { name: String, source: LinkError },

    #[error("Failed to delete interface {name:?}: {source}")]
    LinkDeleteFailed { name: String, source: LinkError },

    #[error("IPAM plugin failed: {0}")]
    IpamFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CniError>;

impl CniError {
    /// CNI error code reported in the error document.
    pub fn code(&self) -> u32 {
        match self {
            CniError::InvalidEnvironment(_) => CODE_INVALID_ENVIRONMENT,
            CniError::Io(_) => CODE_IO_FAILURE,
            CniError::Decode(_) => CODE_DECODING_FAILURE,
            CniError::InvalidConfig(_) => CODE_INVALID_NETWORK_CONFIG,
            _ => CODE_PLUGIN_SPECIFIC,
        }
    }

    /// Build the document written to stdout when a command fails.
    pub fn to_document(&self, cni_version: &str) -> ErrorDocument {
        ErrorDocument {
            cni_version: cni_version.to_string(),
            code: self.code(),
            msg: self.to_string(),
            details: None,
        }
    }
}

/// Error document of the CNI protocol.
///
/// Also used to decode failures reported by a delegated IPAM plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDocument {
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    pub code: u32,
    #[serde(default)]
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(CniError::InvalidEnvironment("x".into()).code(), 4);
        assert_eq!(
            CniError::Io(std::io::Error::other("broken pipe")).code(),
            5
        );
        let decode = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(CniError::Decode(decode).code(), 6);
        assert_eq!(CniError::InvalidConfig("x".into()).code(), 7);
        assert_eq!(CniError::MissingIPv4Config.code(), 100);
        assert_eq!(
            CniError::GatewayConflict(Ipv4Addr::new(10, 0, 0, 254)).code(),
            100
        );
    }

    #[test]
    fn test_error_document_shape() {
        let doc = CniError::GatewayConflict(Ipv4Addr::new(10, 0, 0, 254)).to_document("0.2.0");
        let json = serde_json::to_value(&doc).unwrap();

        assert_eq!(json["cniVersion"], "0.2.0");
        assert_eq!(json["code"], 100);
        assert_eq!(
            json["msg"],
            "isDefaultGateway ineffective because IPAM sets default route via 10.0.0.254"
        );
        assert!(json.get("details").is_none());
    }

    #[test]
    fn test_error_document_decodes_delegate_failure() {
        let doc: ErrorDocument =
            serde_json::from_str(r#"{"code":11,"msg":"no addresses left"}"#).unwrap();
        assert_eq!(doc.code, 11);
        assert_eq!(doc.msg, "no addresses left");
        assert_eq!(doc.cni_version, "");
    }
}

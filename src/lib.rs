//! Macvlan CNI plugin
//!
//! Attaches a container to the host network through a macvlan sub-interface
//! of a host "master" interface. The container gets an address from a
//! delegated IPAM plugin and a MAC address pre-assigned by the container
//! metadata service.
//!
//! The binary entry point lives in [`skel`]; [`plugin::Plugin`] holds the ADD
//! and DEL logic over the [`link::Links`], [`netns::Namespace`],
//! [`ipam::Ipam`] and [`mac::MacLookup`] capabilities.

pub mod config;
pub mod configure;
pub mod error;
pub mod ipam;
pub mod link;
pub mod mac;
pub mod netns;
pub mod plugin;
pub mod provision;
pub mod runtime;
pub mod skel;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::{NetArgs, NetConf};
pub use error::{CniError, ErrorDocument, Result};
pub use link::{Link, LinkError, Links, MacvlanMode, Netlink};
pub use netns::{NetNs, NetNsError, Namespace};
pub use plugin::{Host, LinuxHost, Plugin};
pub use skel::{CmdArgs, Invocation};
pub use types::{IpConfig, IpamResult, MacAddr, Route};

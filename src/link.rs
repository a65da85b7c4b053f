//! Link capability
//!
//! This module provides the primitive link operations the plugin needs:
//! lookup by name, macvlan creation, rename, delete, and the attribute
//! changes used while configuring an interface. Every operation acts on the
//! network namespace the handle was opened in.

use async_trait::async_trait;
use futures::TryStreamExt;
use ipnetwork::Ipv4Network;
use netlink_packet_route::link::{InfoKind, LinkAttribute, LinkInfo, LinkMessage};
use nix::errno::Errno;
use rtnetlink::{new_connection, Handle};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::io::RawFd;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

use crate::types::MacAddr;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(std::io::Error),

    #[error("Link '{0}' not found")]
    NotFound(String),

    #[error("'{0}' already exists")]
    Exists(String),

    #[error("Netlink request failed: {0}")]
    Netlink(rtnetlink::Error),
}

/// Kernel `MACVLAN_MODE_*` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacvlanMode {
    Private = 1,
    Vepa = 2,
    Bridge = 4,
    Passthru = 8,
}

impl FromStr for MacvlanMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "bridge" => Ok(MacvlanMode::Bridge),
            "private" => Ok(MacvlanMode::Private),
            "vepa" => Ok(MacvlanMode::Vepa),
            "passthru" => Ok(MacvlanMode::Passthru),
            _ => Err(format!("unknown macvlan mode: {s:?}")),
        }
    }
}

impl fmt::Display for MacvlanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MacvlanMode::Private => "private",
            MacvlanMode::Vepa => "vepa",
            MacvlanMode::Bridge => "bridge",
            MacvlanMode::Passthru => "passthru",
        };
        f.write_str(name)
    }
}

/// Snapshot of a link as reported by the kernel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub mtu: Option<u32>,
    /// `IFLA_LINK`; for a macvlan this is the master's index.
    pub parent_index: Option<u32>,
    pub is_macvlan: bool,
}

/// Parameters of a macvlan creation request.
#[derive(Clone, Debug)]
pub struct MacvlanRequest {
    pub name: String,
    pub parent_index: u32,
    pub mode: MacvlanMode,
    /// 0 leaves the MTU to the kernel.
    pub mtu: u32,
    /// Namespace the link is created in, instead of the caller's.
    pub netns_fd: Option<RawFd>,
}

/// Primitive link operations scoped to one network namespace.
#[async_trait]
pub trait Links: Send + Sync {
    /// Look up a link; `Ok(None)` when no link has that name.
    async fn find_by_name(&self, name: &str) -> Result<Option<Link>, LinkError>;

    /// Create a macvlan link in a single request.
    async fn add_macvlan(&self, request: &MacvlanRequest) -> Result<(), LinkError>;

    async fn rename(&self, index: u32, name: &str) -> Result<(), LinkError>;

    async fn delete(&self, index: u32) -> Result<(), LinkError>;

    async fn set_up(&self, index: u32) -> Result<(), LinkError>;

    async fn set_down(&self, index: u32) -> Result<(), LinkError>;

    async fn set_mac(&self, index: u32, mac: MacAddr) -> Result<(), LinkError>;

    async fn add_address(&self, index: u32, address: Ipv4Network) -> Result<(), LinkError>;

    async fn add_route(
        &self,
        index: u32,
        destination: Ipv4Network,
        gateway: Option<Ipv4Addr>,
    ) -> Result<(), LinkError>;
}

/// rtnetlink-backed [`Links`].
///
/// The netlink socket is bound to the namespace of the thread that opened
/// it, so a `Netlink` keeps addressing that namespace even after the thread
/// switches elsewhere.
#[derive(Clone)]
pub struct Netlink {
    handle: Handle,
}

impl Netlink {
    /// Open a netlink connection in the calling thread's current namespace.
    ///
    /// Must be called from within a Tokio runtime; the connection task is
    /// spawned onto it.
    pub fn connect() -> Result<Self, LinkError> {
        let (connection, handle, _) = new_connection().map_err(LinkError::Io)?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }
}

#[async_trait]
impl Links for Netlink {
    async fn find_by_name(&self, name: &str) -> Result<Option<Link>, LinkError> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();

        match links.try_next().await {
            Ok(Some(message)) => Ok(Some(link_from_message(message))),
            Ok(None) => Ok(None),
            Err(e) if errno(&e) == Some(Errno::ENODEV) => Ok(None),
            Err(e) => Err(LinkError::Netlink(e)),
        }
    }

    async fn add_macvlan(&self, request: &MacvlanRequest) -> Result<(), LinkError> {
        debug!(
            "Creating macvlan {} on parent {} (mode {}, mtu {})",
            request.name, request.parent_index, request.mode, request.mtu
        );

        let mut add = self.handle.link().add().macvlan(
            request.name.clone(),
            request.parent_index,
            request.mode as u32,
        );
        let attributes = &mut add.message_mut().attributes;
        if request.mtu > 0 {
            attributes.push(LinkAttribute::Mtu(request.mtu));
        }
        if let Some(fd) = request.netns_fd {
            attributes.push(LinkAttribute::NetNsFd(fd));
        }

        add.execute()
            .await
            .map_err(|e| classify(e, &request.name))
    }

    async fn rename(&self, index: u32, name: &str) -> Result<(), LinkError> {
        self.handle
            .link()
            .set(index)
            .name(name.to_string())
            .execute()
            .await
            .map_err(|e| classify(e, name))
    }

    async fn delete(&self, index: u32) -> Result<(), LinkError> {
        self.handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(|e| classify(e, &format!("link #{index}")))
    }

    async fn set_up(&self, index: u32) -> Result<(), LinkError> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|e| classify(e, &format!("link #{index}")))
    }

    async fn set_down(&self, index: u32) -> Result<(), LinkError> {
        self.handle
            .link()
            .set(index)
            .down()
            .execute()
            .await
            .map_err(|e| classify(e, &format!("link #{index}")))
    }

    async fn set_mac(&self, index: u32, mac: MacAddr) -> Result<(), LinkError> {
        self.handle
            .link()
            .set(index)
            .address(mac.octets().to_vec())
            .execute()
            .await
            .map_err(|e| classify(e, &format!("link #{index}")))
    }

    async fn add_address(&self, index: u32, address: Ipv4Network) -> Result<(), LinkError> {
        self.handle
            .address()
            .add(index, IpAddr::V4(address.ip()), address.prefix())
            .execute()
            .await
            .map_err(|e| classify(e, &format!("address {address}")))
    }

    async fn add_route(
        &self,
        index: u32,
        destination: Ipv4Network,
        gateway: Option<Ipv4Addr>,
    ) -> Result<(), LinkError> {
        let mut route = self
            .handle
            .route()
            .add()
            .v4()
            .destination_prefix(destination.network(), destination.prefix())
            .output_interface(index);
        if let Some(gw) = gateway {
            route = route.gateway(gw);
        }
        route
            .execute()
            .await
            .map_err(|e| classify(e, &format!("route {destination}")))
    }
}

fn link_from_message(message: LinkMessage) -> Link {
    let mut link = Link {
        index: message.header.index,
        name: String::new(),
        mtu: None,
        parent_index: None,
        is_macvlan: false,
    };
    for attribute in message.attributes {
        match attribute {
            LinkAttribute::IfName(name) => link.name = name,
            LinkAttribute::Mtu(mtu) => link.mtu = Some(mtu),
            LinkAttribute::Link(parent) => link.parent_index = Some(parent),
            LinkAttribute::LinkInfo(infos) => {
                link.is_macvlan = infos
                    .iter()
                    .any(|info| matches!(info, LinkInfo::Kind(InfoKind::MacVlan)));
            }
            _ => {}
        }
    }
    link
}

/// Errno carried by a kernel rejection, if any.
fn errno(err: &rtnetlink::Error) -> Option<Errno> {
    match err {
        rtnetlink::Error::NetlinkError(message) => {
            message.code.map(|code| Errno::from_raw(-code.get()))
        }
        _ => None,
    }
}

fn classify(err: rtnetlink::Error, subject: &str) -> LinkError {
    match errno(&err) {
        Some(Errno::EEXIST) => LinkError::Exists(subject.to_string()),
        Some(Errno::ENODEV) => LinkError::NotFound(subject.to_string()),
        _ => LinkError::Netlink(err),
    }
}

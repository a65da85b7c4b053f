//! ADD and DEL commands
//!
//! ADD walks the container through interface creation (or reuse), address
//! allocation, MAC resolution and configuration. DEL releases the addresses
//! and removes the interface. Neither command retries or rolls back IPAM;
//! the runtime follows a failed ADD with a DEL.

use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::{NetArgs, NetConf};
use crate::configure::configure;
use crate::error::{CniError, Result};
use crate::ipam::Ipam;
use crate::link::{Link, LinkError, Links, Netlink};
use crate::mac::{resolve, MacLookup};
use crate::netns::{NetNs, NetNsError, Namespace};
use crate::provision::provision;
use crate::skel::CmdArgs;
use crate::types::IpamResult;

/// Kernel access from the plugin's own namespace.
pub trait Host {
    type Links: Links;
    type Namespace: Namespace;

    /// Links of the calling namespace, where the master lives.
    fn links(&self) -> &Self::Links;

    fn open_namespace(&self, path: &Path) -> std::result::Result<Self::Namespace, NetNsError>;
}

/// The real kernel, reached over netlink.
pub struct LinuxHost {
    links: Netlink,
}

impl LinuxHost {
    /// Connect from the calling thread's namespace.
    pub fn connect() -> std::result::Result<Self, LinkError> {
        Ok(Self {
            links: Netlink::connect()?,
        })
    }
}

impl Host for LinuxHost {
    type Links = Netlink;
    type Namespace = NetNs;

    fn links(&self) -> &Netlink {
        &self.links
    }

    fn open_namespace(&self, path: &Path) -> std::result::Result<NetNs, NetNsError> {
        NetNs::open(path)
    }
}

/// The macvlan plugin wired to its collaborators.
pub struct Plugin<H, I, M> {
    host: H,
    ipam: I,
    macs: M,
}

impl<H, I, M> Plugin<H, I, M>
where
    H: Host,
    I: Ipam,
    M: MacLookup,
{
    pub fn new(host: H, ipam: I, macs: M) -> Self {
        Self { host, ipam, macs }
    }

    /// Attach a macvlan to the container and configure it.
    pub async fn add(&self, args: &CmdArgs, stdin: &[u8]) -> Result<IpamResult> {
        let conf = NetConf::parse(stdin)?;
        let net_args = NetArgs::parse(&args.args)?;
        let ipam_type = conf.ipam_type()?;

        let path = args.netns.as_deref().ok_or_else(|| {
            CniError::InvalidEnvironment("CNI_NETNS is required for ADD".to_string())
        })?;
        let netns = self
            .host
            .open_namespace(path)
            .map_err(|source| CniError::NamespaceNotFound {
                path: path.to_path_buf(),
                source,
            })?;

        match self.existing_interface(&netns, &args.if_name).await? {
            None => {
                provision(self.host.links(), &conf, &args.if_name, &netns).await?;
            }
            Some(link) => {
                info!(
                    "Container {} already has interface {}, reusing it",
                    args.container_id, args.if_name
                );
                self.reuse_interface(&netns, &conf, link).await;
            }
        }

        let mut result = self.ipam.add(ipam_type, args, stdin).await?;
        let mut ip4 = result.ip4.take().ok_or(CniError::MissingIPv4Config)?;

        let mac = resolve(
            &self.macs,
            &args.container_id,
            &net_args.mac_address,
            &net_args.rancher_container_uuid,
        )
        .await?;

        {
            let context = netns.enter().map_err(CniError::NamespaceSwitchFailed)?;
            configure(
                context.links(),
                &args.if_name,
                &mac,
                &mut ip4,
                conf.is_default_gateway,
            )
            .await?;
        }

        result.ip4 = Some(ip4);
        result.dns = conf.dns.clone();
        result.cni_version = Some(conf.version().to_string());
        info!(
            "ADD complete for {} ({} in {})",
            args.container_id,
            args.if_name,
            path.display()
        );
        Ok(result)
    }

    /// Release the container's addresses and remove its interface.
    pub async fn del(&self, args: &CmdArgs, stdin: &[u8]) -> Result<()> {
        let conf = NetConf::parse(stdin)?;
        let ipam_type = conf.ipam_type()?;

        self.ipam.del(ipam_type, args, stdin).await?;

        let Some(path) = args.netns.as_deref() else {
            debug!("No namespace for {}, nothing to remove", args.container_id);
            return Ok(());
        };

        let netns = match self.host.open_namespace(path) {
            Ok(netns) => netns,
            Err(e) if e.is_not_found() => {
                info!("Namespace {} is already gone", path.display());
                return Ok(());
            }
            Err(source) => {
                return Err(CniError::NamespaceNotFound {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let context = netns.enter().map_err(CniError::NamespaceSwitchFailed)?;
        let links = context.links();
        let delete_failed = |source: LinkError| CniError::LinkDeleteFailed {
            name: args.if_name.clone(),
            source,
        };

        let Some(link) = links.find_by_name(&args.if_name).await.map_err(delete_failed)? else {
            info!("Interface {} is already gone", args.if_name);
            return Ok(());
        };

        match links.delete(link.index).await {
            Ok(()) | Err(LinkError::NotFound(_)) => {
                info!("Deleted {} from {}", args.if_name, path.display());
                Ok(())
            }
            Err(e) => Err(delete_failed(e)),
        }
    }

    async fn existing_interface(
        &self,
        netns: &H::Namespace,
        if_name: &str,
    ) -> Result<Option<Link>> {
        let context = netns.enter().map_err(CniError::NamespaceSwitchFailed)?;
        context
            .links()
            .find_by_name(if_name)
            .await
            .map_err(|source| CniError::InterfaceConfigFailed {
                name: if_name.to_string(),
                source,
            })
    }

    /// Prepare an interface left by an earlier ADD for reconfiguration.
    ///
    /// Nothing here fails the command.
    async fn reuse_interface(&self, netns: &H::Namespace, conf: &NetConf, link: Link) {
        let master = self.host.links().find_by_name(&conf.master).await.ok().flatten();
        let same_parent = master.map(|m| Some(m.index) == link.parent_index);
        if !link.is_macvlan || same_parent == Some(false) {
            warn!(
                "Existing interface {} is not a macvlan on {}; configuring it anyway",
                link.name, conf.master
            );
        }

        let outcome = match netns.enter() {
            Ok(context) => context.links().set_down(link.index).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = outcome {
            info!("Failed to set interface {} down: {}", link.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeHost, FakeIpam, FakeKernel, FakeMacLookup, FakeOp, Side};
    use std::net::Ipv4Addr;
    use std::path::PathBuf;

    const CONF: &[u8] = br#"{
        "cniVersion": "0.2.0",
        "name": "macvlan-net",
        "type": "macvlan",
        "master": "eth0",
        "mode": "bridge",
        "isDefaultGateway": true,
        "ipam": {"type": "host-local"},
        "dns": {"nameservers": ["10.0.0.2"]}
    }"#;

    fn args(netns: Option<&str>) -> CmdArgs {
        CmdArgs {
            container_id: "c0ffee".to_string(),
            netns: netns.map(PathBuf::from),
            if_name: "eth1".to_string(),
            args: String::new(),
            path: "/opt/cni/bin".to_string(),
        }
    }

    fn in_container() -> CmdArgs {
        args(Some("/var/run/netns/c0ffee"))
    }

    fn assigning() -> FakeIpam {
        FakeIpam::assigning("10.0.0.5/24", "10.0.0.1")
    }

    fn known_mac() -> FakeMacLookup {
        FakeMacLookup::returning("02:00:00:00:00:01")
    }

    fn plugin(
        kernel: &FakeKernel,
        ipam: FakeIpam,
        macs: FakeMacLookup,
    ) -> Plugin<FakeHost, FakeIpam, FakeMacLookup> {
        Plugin::new(kernel.host(), ipam, macs)
    }

    #[tokio::test]
    async fn test_add_creates_and_configures() {
        let kernel = FakeKernel::with_master("eth0");
        let ipam = assigning();
        let macs = FakeMacLookup::returning("02:00:0a:00:00:05");
        let plugin = plugin(&kernel, ipam.clone(), macs.clone());

        let result = plugin.add(&in_container(), CONF).await.unwrap();

        let ip4 = result.ip4.unwrap();
        assert_eq!(ip4.ip, "10.0.0.5/24".parse().unwrap());
        assert_eq!(ip4.routes.len(), 1);
        assert!(ip4.routes[0].is_default());
        assert_eq!(ip4.routes[0].gw, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(result.dns.nameservers, vec!["10.0.0.2".to_string()]);
        assert_eq!(result.cni_version.as_deref(), Some("0.2.0"));

        assert_eq!(kernel.link_names(Side::Container), vec!["eth1".to_string()]);
        assert_eq!(kernel.mac_of("eth1"), Some("02:00:0a:00:00:05".parse().unwrap()));
        assert_eq!(kernel.addresses_of("eth1"), vec!["10.0.0.5/24".parse().unwrap()]);
        assert_eq!(kernel.routes_of("eth1").len(), 1);
        assert_eq!(ipam.adds(), 1);
        assert_eq!(macs.calls(), 1);
    }

    #[tokio::test]
    async fn test_add_reuses_existing_interface() {
        let kernel = FakeKernel::with_master("eth0");
        kernel.add_container_link("eth1");
        kernel.fail(FakeOp::SetDown);
        let plugin = plugin(
            &kernel,
            assigning(),
            FakeMacLookup::returning("02:00:0a:00:00:05"),
        );

        let result = plugin.add(&in_container(), CONF).await.unwrap();

        assert!(result.ip4.is_some());
        assert!(kernel.created().is_empty());
        assert_eq!(kernel.link_names(Side::Container), vec!["eth1".to_string()]);
        assert!(kernel.attempted(FakeOp::SetDown));
        assert_eq!(kernel.addresses_of("eth1"), vec!["10.0.0.5/24".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_add_uses_mac_argument() {
        let kernel = FakeKernel::with_master("eth0");
        let macs = FakeMacLookup::failing();
        let plugin = plugin(&kernel, assigning(), macs.clone());

        let mut cmd = in_container();
        cmd.args = "IgnoreUnknown=1;MACAddress=aa:bb:cc:dd:ee:ff;K8S_POD_NAME=web".to_string();
        plugin.add(&cmd, CONF).await.unwrap();

        assert_eq!(macs.calls(), 0);
        assert_eq!(kernel.mac_of("eth1"), Some("aa:bb:cc:dd:ee:ff".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_add_without_ipv4_fails() {
        let kernel = FakeKernel::with_master("eth0");
        let plugin = plugin(&kernel, FakeIpam::ipv6_only(), known_mac());

        let err = plugin.add(&in_container(), CONF).await.unwrap_err();
        assert!(matches!(err, CniError::MissingIPv4Config));
    }

    #[tokio::test]
    async fn test_add_missing_namespace() {
        let kernel = FakeKernel::with_master("eth0");
        kernel.remove_namespace();
        let ipam = assigning();
        let plugin = plugin(&kernel, ipam.clone(), known_mac());

        let err = plugin.add(&args(Some("/var/run/netns/gone")), CONF).await.unwrap_err();

        assert!(matches!(err, CniError::NamespaceNotFound { .. }));
        assert_eq!(ipam.adds(), 0);
    }

    #[tokio::test]
    async fn test_add_provision_failure_skips_ipam() {
        let kernel = FakeKernel::with_master("eth0");
        kernel.fail(FakeOp::Rename);
        let ipam = assigning();
        let plugin = plugin(&kernel, ipam.clone(), known_mac());

        let err = plugin.add(&in_container(), CONF).await.unwrap_err();

        assert!(matches!(err, CniError::RenameFailed { .. }));
        assert_eq!(ipam.adds(), 0);
        assert!(kernel.link_names(Side::Container).is_empty());
    }

    #[tokio::test]
    async fn test_add_mac_lookup_failure_is_fatal() {
        let kernel = FakeKernel::with_master("eth0");
        let plugin = plugin(&kernel, assigning(), FakeMacLookup::failing());

        let err = plugin.add(&in_container(), CONF).await.unwrap_err();

        assert!(matches!(err, CniError::MacAddressLookupFailed { .. }));
        assert!(kernel.addresses_of("eth1").is_empty());
    }

    #[tokio::test]
    async fn test_add_gateway_conflict() {
        let kernel = FakeKernel::with_master("eth0");
        let ipam = assigning()
            .with_route("0.0.0.0/0", Some(Ipv4Addr::new(10, 0, 0, 254)));
        let plugin = plugin(&kernel, ipam, known_mac());

        let err = plugin.add(&in_container(), CONF).await.unwrap_err();

        assert!(matches!(err, CniError::GatewayConflict(_)));
        assert!(kernel.routes_of("eth1").is_empty());
    }

    #[tokio::test]
    async fn test_add_invalid_config() {
        let kernel = FakeKernel::with_master("eth0");
        let plugin = plugin(&kernel, assigning(), known_mac());

        let no_master = br#"{"ipam": {"type": "host-local"}}"#;
        let err = plugin.add(&in_container(), no_master).await.unwrap_err();
        assert!(matches!(err, CniError::InvalidConfig(_)));
        assert_eq!(kernel.enters(), 0);
    }

    #[tokio::test]
    async fn test_del_removes_interface() {
        let kernel = FakeKernel::with_master("eth0");
        kernel.add_container_link("eth1");
        let ipam = assigning();
        let plugin = plugin(&kernel, ipam.clone(), known_mac());

        plugin.del(&in_container(), CONF).await.unwrap();

        assert!(kernel.link_names(Side::Container).is_empty());
        assert_eq!(ipam.dels(), 1);
    }

    #[tokio::test]
    async fn test_del_without_namespace_path() {
        let kernel = FakeKernel::with_master("eth0");
        kernel.add_container_link("eth1");
        let ipam = assigning();
        let plugin = plugin(&kernel, ipam.clone(), known_mac());

        plugin.del(&args(None), CONF).await.unwrap();

        assert_eq!(ipam.dels(), 1);
        assert!(!kernel.attempted(FakeOp::Delete));
        assert_eq!(kernel.enters(), 0);
    }

    #[tokio::test]
    async fn test_del_vanished_namespace_succeeds() {
        let kernel = FakeKernel::with_master("eth0");
        kernel.remove_namespace();
        let plugin = plugin(&kernel, assigning(), known_mac());

        plugin.del(&args(Some("/var/run/netns/gone")), CONF).await.unwrap();
        assert!(!kernel.attempted(FakeOp::Delete));
    }

    #[tokio::test]
    async fn test_del_missing_interface_succeeds() {
        let kernel = FakeKernel::with_master("eth0");
        let plugin = plugin(&kernel, assigning(), known_mac());

        plugin.del(&in_container(), CONF).await.unwrap();
    }

    #[tokio::test]
    async fn test_del_ipam_failure_propagates() {
        let kernel = FakeKernel::with_master("eth0");
        kernel.add_container_link("eth1");
        let plugin = plugin(&kernel, FakeIpam::failing(), known_mac());

        let err = plugin.del(&in_container(), CONF).await.unwrap_err();

        assert!(matches!(err, CniError::IpamFailed(_)));
        assert_eq!(kernel.link_names(Side::Container), vec!["eth1".to_string()]);
    }

    #[tokio::test]
    async fn test_del_delete_failure_propagates() {
        let kernel = FakeKernel::with_master("eth0");
        kernel.add_container_link("eth1");
        kernel.fail(FakeOp::Delete);
        let plugin = plugin(&kernel, assigning(), known_mac());

        let err = plugin.del(&in_container(), CONF).await.unwrap_err();
        assert!(matches!(err, CniError::LinkDeleteFailed { .. }));
    }
}

//! In-memory stand-ins for the kernel, IPAM and the metadata service
//!
//! A [`FakeKernel`] models two namespaces, the host side holding the master
//! and the container side the plugin configures. Every handle it gives out
//! shares one state, so a test drives the plugin through the handles and
//! then inspects the kernel directly. Any operation can be made to fail
//! with [`FakeKernel::fail`].

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{CniError, Result};
use crate::ipam::Ipam;
use crate::link::{Link, LinkError, Links, MacvlanRequest};
use crate::mac::MacLookup;
use crate::netns::{NetNsError, Namespace, NsContext, Sysctl};
use crate::plugin::Host;
use crate::skel::CmdArgs;
use crate::types::{IpConfig, IpamResult, MacAddr, Route};

/// Descriptor handed out for the fake container namespace.
pub const FAKE_NETNS_FD: RawFd = 42;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Host,
    Container,
}

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    AddMacvlan,
    Rename,
    Delete,
    SetUp,
    SetDown,
    SetMac,
    AddAddress,
    AddRoute,
    Sysctl,
    Enter,
}

#[derive(Debug, Clone)]
struct FakeLink {
    index: u32,
    name: String,
    side: Side,
    mtu: Option<u32>,
    parent_index: Option<u32>,
    is_macvlan: bool,
    up: bool,
    mac: Option<MacAddr>,
    addresses: Vec<Ipv4Network>,
    routes: Vec<(Ipv4Network, Option<Ipv4Addr>)>,
}

impl FakeLink {
    fn snapshot(&self) -> Link {
        Link {
            index: self.index,
            name: self.name.clone(),
            mtu: self.mtu,
            parent_index: self.parent_index,
            is_macvlan: self.is_macvlan,
        }
    }
}

#[derive(Debug, Default)]
struct KernelState {
    links: Vec<FakeLink>,
    next_index: u32,
    master_index: u32,
    created: Vec<MacvlanRequest>,
    sysctls: Vec<(String, String)>,
    enters: usize,
    failing: HashSet<FakeOp>,
    attempted: HashSet<FakeOp>,
    namespace_gone: bool,
}

impl KernelState {
    /// Record `op` and report whether it should fail.
    fn check(&mut self, op: FakeOp) -> std::result::Result<(), LinkError> {
        self.attempted.insert(op);
        if self.failing.contains(&op) {
            return Err(LinkError::Io(std::io::Error::other(format!(
                "injected {op:?} failure"
            ))));
        }
        Ok(())
    }

    fn find(&self, side: Side, name: &str) -> Option<&FakeLink> {
        self.links.iter().find(|l| l.side == side && l.name == name)
    }

    fn by_index(
        &mut self,
        side: Side,
        index: u32,
    ) -> std::result::Result<&mut FakeLink, LinkError> {
        self.links
            .iter_mut()
            .find(|l| l.side == side && l.index == index)
            .ok_or_else(|| LinkError::NotFound(format!("link #{index}")))
    }

    fn insert(
        &mut self,
        side: Side,
        name: &str,
        parent_index: Option<u32>,
        mtu: Option<u32>,
    ) -> u32 {
        self.next_index += 1;
        let index = self.next_index;
        self.links.push(FakeLink {
            index,
            name: name.to_string(),
            side,
            mtu,
            parent_index,
            is_macvlan: parent_index.is_some(),
            up: false,
            mac: None,
            addresses: Vec::new(),
            routes: Vec::new(),
        });
        index
    }
}

/// Shared fake kernel; clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct FakeKernel {
    state: Arc<Mutex<KernelState>>,
}

impl FakeKernel {
    /// A kernel whose host side holds only `master`.
    pub fn with_master(master: &str) -> Self {
        let kernel = Self::default();
        {
            let mut state = kernel.lock();
            state.next_index = 1;
            let index = state.insert(Side::Host, master, None, Some(1500));
            state.master_index = index;
        }
        kernel
    }

    fn lock(&self) -> MutexGuard<'_, KernelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn host_links(&self) -> FakeLinks {
        FakeLinks {
            kernel: self.clone(),
            side: Side::Host,
        }
    }

    pub fn container_links(&self) -> FakeLinks {
        FakeLinks {
            kernel: self.clone(),
            side: Side::Container,
        }
    }

    pub fn namespace(&self) -> FakeNamespace {
        FakeNamespace {
            kernel: self.clone(),
            path: PathBuf::from("/var/run/netns/fake"),
        }
    }

    pub fn host(&self) -> FakeHost {
        FakeHost {
            kernel: self.clone(),
            links: self.host_links(),
        }
    }

    /// Put a macvlan on the master straight into the container namespace.
    pub fn add_container_link(&self, name: &str) {
        let mut state = self.lock();
        let master = state.master_index;
        state.insert(Side::Container, name, Some(master), Some(1500));
    }

    /// Make every later attempt of `op` fail.
    pub fn fail(&self, op: FakeOp) {
        self.lock().failing.insert(op);
    }

    /// Whether `op` was ever attempted, successfully or not.
    pub fn attempted(&self, op: FakeOp) -> bool {
        self.lock().attempted.contains(&op)
    }

    /// Make the container namespace disappear.
    pub fn remove_namespace(&self) {
        let mut state = self.lock();
        state.namespace_gone = true;
        state.links.retain(|l| l.side == Side::Host);
    }

    pub fn link_names(&self, side: Side) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .links
            .iter()
            .filter(|l| l.side == side)
            .map(|l| l.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn master_index(&self) -> u32 {
        self.lock().master_index
    }

    /// Every macvlan creation request that succeeded.
    pub fn created(&self) -> Vec<MacvlanRequest> {
        self.lock().created.clone()
    }

    pub fn sysctls(&self) -> Vec<(String, String)> {
        self.lock().sysctls.clone()
    }

    /// Number of namespace entries, failed ones included.
    pub fn enters(&self) -> usize {
        self.lock().enters
    }

    fn container_link<T>(&self, name: &str, read: impl FnOnce(&FakeLink) -> T) -> Option<T> {
        self.lock().find(Side::Container, name).map(read)
    }

    pub fn mac_of(&self, name: &str) -> Option<MacAddr> {
        self.container_link(name, |l| l.mac).flatten()
    }

    pub fn is_up(&self, name: &str) -> bool {
        self.container_link(name, |l| l.up).unwrap_or(false)
    }

    pub fn addresses_of(&self, name: &str) -> Vec<Ipv4Network> {
        self.container_link(name, |l| l.addresses.clone())
            .unwrap_or_default()
    }

    pub fn routes_of(&self, name: &str) -> Vec<(Ipv4Network, Option<Ipv4Addr>)> {
        self.container_link(name, |l| l.routes.clone())
            .unwrap_or_default()
    }
}

/// [`Links`] view of one side of a [`FakeKernel`].
#[derive(Debug, Clone)]
pub struct FakeLinks {
    kernel: FakeKernel,
    side: Side,
}

impl FakeLinks {
    fn modify(
        &self,
        op: FakeOp,
        index: u32,
        change: impl FnOnce(&mut FakeLink) -> std::result::Result<(), LinkError>,
    ) -> std::result::Result<(), LinkError> {
        let mut state = self.kernel.lock();
        state.check(op)?;
        change(state.by_index(self.side, index)?)
    }
}

#[async_trait]
impl Links for FakeLinks {
    async fn find_by_name(&self, name: &str) -> std::result::Result<Option<Link>, LinkError> {
        Ok(self.kernel.lock().find(self.side, name).map(FakeLink::snapshot))
    }

    async fn add_macvlan(&self, request: &MacvlanRequest) -> std::result::Result<(), LinkError> {
        let mut state = self.kernel.lock();
        state.check(FakeOp::AddMacvlan)?;

        let side = match request.netns_fd {
            Some(_) => Side::Container,
            None => self.side,
        };
        // A create-and-move is also refused when the name is taken in the
        // calling namespace, even though it only has to be free in the target.
        if state.find(side, &request.name).is_some()
            || state.find(self.side, &request.name).is_some()
        {
            return Err(LinkError::Exists(request.name.clone()));
        }
        if !state
            .links
            .iter()
            .any(|l| l.side == self.side && l.index == request.parent_index)
        {
            return Err(LinkError::NotFound(format!("link #{}", request.parent_index)));
        }

        let mtu = (request.mtu > 0).then_some(request.mtu).or(Some(1500));
        state.insert(side, &request.name, Some(request.parent_index), mtu);
        state.created.push(request.clone());
        Ok(())
    }

    async fn rename(&self, index: u32, name: &str) -> std::result::Result<(), LinkError> {
        let taken = self
            .kernel
            .lock()
            .find(self.side, name)
            .is_some_and(|l| l.index != index);
        if taken {
            return Err(LinkError::Exists(name.to_string()));
        }
        self.modify(FakeOp::Rename, index, |link| {
            link.name = name.to_string();
            Ok(())
        })
    }

    async fn delete(&self, index: u32) -> std::result::Result<(), LinkError> {
        let mut state = self.kernel.lock();
        state.check(FakeOp::Delete)?;
        state.by_index(self.side, index)?;
        let side = self.side;
        state.links.retain(|l| !(l.side == side && l.index == index));
        Ok(())
    }

    async fn set_up(&self, index: u32) -> std::result::Result<(), LinkError> {
        self.modify(FakeOp::SetUp, index, |link| {
            link.up = true;
            Ok(())
        })
    }

    async fn set_down(&self, index: u32) -> std::result::Result<(), LinkError> {
        self.modify(FakeOp::SetDown, index, |link| {
            link.up = false;
            Ok(())
        })
    }

    async fn set_mac(&self, index: u32, mac: MacAddr) -> std::result::Result<(), LinkError> {
        self.modify(FakeOp::SetMac, index, |link| {
            link.mac = Some(mac);
            Ok(())
        })
    }

    async fn add_address(
        &self,
        index: u32,
        address: Ipv4Network,
    ) -> std::result::Result<(), LinkError> {
        self.modify(FakeOp::AddAddress, index, |link| {
            if link.addresses.contains(&address) {
                return Err(LinkError::Exists(format!("address {address}")));
            }
            link.addresses.push(address);
            Ok(())
        })
    }

    async fn add_route(
        &self,
        index: u32,
        destination: Ipv4Network,
        gateway: Option<Ipv4Addr>,
    ) -> std::result::Result<(), LinkError> {
        self.modify(FakeOp::AddRoute, index, |link| {
            if link.routes.iter().any(|(dst, _)| *dst == destination) {
                return Err(LinkError::Exists(format!("route {destination}")));
            }
            link.routes.push((destination, gateway));
            Ok(())
        })
    }
}

/// Records sysctl writes on the kernel.
#[derive(Debug, Clone)]
pub struct FakeSysctl {
    kernel: FakeKernel,
}

impl Sysctl for FakeSysctl {
    fn set(&self, key: &str, value: &str) -> std::io::Result<()> {
        let mut state = self.kernel.lock();
        state
            .check(FakeOp::Sysctl)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        state.sysctls.push((key.to_string(), value.to_string()));
        Ok(())
    }
}

/// The container side of a [`FakeKernel`] as a [`Namespace`].
#[derive(Debug, Clone)]
pub struct FakeNamespace {
    kernel: FakeKernel,
    path: PathBuf,
}

impl Namespace for FakeNamespace {
    type Links = FakeLinks;
    type Sysctl = FakeSysctl;

    fn fd(&self) -> RawFd {
        FAKE_NETNS_FD
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn enter(&self) -> std::result::Result<NsContext<FakeLinks, FakeSysctl>, NetNsError> {
        {
            let mut state = self.kernel.lock();
            state.enters += 1;
            if state.namespace_gone {
                return Err(NetNsError::NotFound(self.path.clone()));
            }
            if state.check(FakeOp::Enter).is_err() {
                return Err(NetNsError::SetNs(nix::Error::EPERM));
            }
        }
        Ok(NsContext::detached(
            self.kernel.container_links(),
            FakeSysctl {
                kernel: self.kernel.clone(),
            },
        ))
    }
}

/// [`Host`] over a [`FakeKernel`].
#[derive(Debug, Clone)]
pub struct FakeHost {
    kernel: FakeKernel,
    links: FakeLinks,
}

impl Host for FakeHost {
    type Links = FakeLinks;
    type Namespace = FakeNamespace;

    fn links(&self) -> &FakeLinks {
        &self.links
    }

    fn open_namespace(&self, path: &Path) -> std::result::Result<FakeNamespace, NetNsError> {
        if self.kernel.lock().namespace_gone {
            return Err(NetNsError::NotFound(path.to_path_buf()));
        }
        Ok(FakeNamespace {
            kernel: self.kernel.clone(),
            path: path.to_path_buf(),
        })
    }
}

#[derive(Debug, Default)]
struct IpamState {
    result: Option<IpamResult>,
    adds: usize,
    dels: usize,
}

/// [`Ipam`] answering with a fixed result; fails when built without one.
#[derive(Debug, Clone, Default)]
pub struct FakeIpam {
    state: Arc<Mutex<IpamState>>,
}

impl FakeIpam {
    fn with_result(result: Option<IpamResult>) -> Self {
        Self {
            state: Arc::new(Mutex::new(IpamState {
                result,
                ..IpamState::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, IpamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand out `ip` with `gateway` and no routes.
    pub fn assigning(ip: &str, gateway: &str) -> Self {
        Self::with_result(Some(IpamResult {
            ip4: Some(IpConfig {
                ip: ip.parse().expect("valid test address"),
                gateway: Some(gateway.parse().expect("valid test gateway")),
                routes: Vec::new(),
            }),
            ..IpamResult::default()
        }))
    }

    pub fn ipv6_only() -> Self {
        Self::with_result(Some(IpamResult {
            ip6: Some(serde_json::json!({"ip": "fd00::5/64"})),
            ..IpamResult::default()
        }))
    }

    pub fn failing() -> Self {
        Self::with_result(None)
    }

    /// Add a route to the IPv4 result.
    pub fn with_route(self, dst: &str, gw: Option<Ipv4Addr>) -> Self {
        if let Some(ip4) = self.lock().result.as_mut().and_then(|r| r.ip4.as_mut()) {
            ip4.routes.push(Route {
                dst: dst.parse().expect("valid test route"),
                gw,
            });
        }
        self
    }

    pub fn adds(&self) -> usize {
        self.lock().adds
    }

    pub fn dels(&self) -> usize {
        self.lock().dels
    }
}

#[async_trait]
impl Ipam for FakeIpam {
    async fn add(&self, plugin: &str, _args: &CmdArgs, _config: &[u8]) -> Result<IpamResult> {
        let mut state = self.lock();
        state.adds += 1;
        state
            .result
            .clone()
            .ok_or_else(|| CniError::IpamFailed(format!("{plugin}: injected failure")))
    }

    async fn del(&self, plugin: &str, _args: &CmdArgs, _config: &[u8]) -> Result<()> {
        let mut state = self.lock();
        state.dels += 1;
        match state.result {
            Some(_) => Ok(()),
            None => Err(CniError::IpamFailed(format!("{plugin}: injected failure"))),
        }
    }
}

#[derive(Debug, Default)]
struct LookupState {
    mac: Option<String>,
    calls: usize,
    last_query: Option<(String, String)>,
}

/// [`MacLookup`] answering with a fixed MAC; fails when built without one.
#[derive(Debug, Clone, Default)]
pub struct FakeMacLookup {
    state: Arc<Mutex<LookupState>>,
}

impl FakeMacLookup {
    pub fn returning(mac: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(LookupState {
                mac: Some(mac.to_string()),
                ..LookupState::default()
            })),
        }
    }

    pub fn failing() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LookupState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn calls(&self) -> usize {
        self.lock().calls
    }

    /// `(container_id, uuid_hint)` of the latest lookup.
    pub fn last_query(&self) -> Option<(String, String)> {
        self.lock().last_query.clone()
    }
}

#[async_trait]
impl MacLookup for FakeMacLookup {
    async fn lookup(&self, container_id: &str, uuid_hint: &str) -> Result<String> {
        let mut state = self.lock();
        state.calls += 1;
        state.last_query = Some((container_id.to_string(), uuid_hint.to_string()));
        state
            .mac
            .clone()
            .ok_or_else(|| CniError::MacAddressLookupFailed {
                container_id: container_id.to_string(),
                reason: "no matching container in metadata".to_string(),
            })
    }
}

//! Network namespace handles and the namespace context
//!
//! Namespaces are never created here; the runtime hands us a path to an
//! existing one (`/var/run/netns/<name>`, `/proc/<pid>/ns/net`). Entering a
//! namespace yields an [`NsContext`], an RAII scope that carries the link and
//! sysctl capabilities valid inside it and switches the thread back when
//! dropped.

use nix::sched::{setns, CloneFlags};
use nix::sys::statfs::{fstatfs, NSFS_MAGIC, PROC_SUPER_MAGIC};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::link::{LinkError, Links, Netlink};

#[derive(Error, Debug)]
pub enum NetNsError {
    #[error("Namespace '{0}' not found")]
    NotFound(PathBuf),

    #[error("Failed to open namespace file: {0}")]
    OpenNs(std::io::Error),

    #[error("'{0}' is not a network namespace")]
    NotNamespace(PathBuf),

    #[error("Failed to enter namespace: {0}")]
    SetNs(nix::Error),

    #[error("Failed to connect to netlink inside namespace: {0}")]
    Netlink(LinkError),
}

impl NetNsError {
    /// The namespace is gone, as opposed to being unusable.
    pub fn is_not_found(&self) -> bool {
        matches!(self, NetNsError::NotFound(_))
    }
}

/// Writes kernel parameters.
pub trait Sysctl {
    /// Set `key` (dotted form, e.g. `net.ipv4.ip_forward`) to `value`.
    fn set(&self, key: &str, value: &str) -> std::io::Result<()>;
}

/// [`Sysctl`] over `/proc/sys`.
///
/// `/proc/sys/net` reflects the namespace of the thread that opens the
/// file, so this must be used while the thread is inside the namespace.
#[derive(Clone, Debug)]
pub struct ProcSysctl {
    root: PathBuf,
}

impl ProcSysctl {
    pub fn new() -> Self {
        Self::with_root("/proc/sys")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key.replace('.', "/"))
    }
}

impl Default for ProcSysctl {
    fn default() -> Self {
        Self::new()
    }
}

impl Sysctl for ProcSysctl {
    fn set(&self, key: &str, value: &str) -> std::io::Result<()> {
        let path = self.path_for(key);
        debug!("Setting sysctl {} = {}", key, value);
        std::fs::write(&path, value)
    }
}

/// A namespace that can be entered.
pub trait Namespace {
    type Links: Links;
    type Sysctl: Sysctl;

    /// Descriptor used to place new links in this namespace.
    fn fd(&self) -> RawFd;

    fn path(&self) -> &Path;

    /// Switch the calling thread into the namespace.
    ///
    /// The thread stays inside until the returned context is dropped.
    fn enter(&self) -> Result<NsContext<Self::Links, Self::Sysctl>, NetNsError>;
}

/// Capabilities valid while the thread is inside a namespace.
///
/// Fields drop in declaration order, so the capabilities are released
/// before the guard restores the original namespace.
pub struct NsContext<L, S> {
    links: L,
    sysctl: S,
    _guard: Option<NamespaceGuard>,
}

impl<L: Links, S: Sysctl> NsContext<L, S> {
    pub fn new(links: L, sysctl: S, guard: NamespaceGuard) -> Self {
        Self {
            links,
            sysctl,
            _guard: Some(guard),
        }
    }

    /// A context that performs no thread switch, for backends whose
    /// capabilities are already bound to the namespace.
    pub fn detached(links: L, sysctl: S) -> Self {
        Self {
            links,
            sysctl,
            _guard: None,
        }
    }

    pub fn links(&self) -> &L {
        &self.links
    }

    pub fn sysctl(&self) -> &S {
        &self.sysctl
    }
}

/// An opened network namespace.
#[derive(Debug)]
pub struct NetNs {
    file: File,
    path: PathBuf,
}

impl NetNs {
    /// Open the namespace at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, NetNsError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).open(&path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                NetNsError::NotFound(path.clone())
            } else {
                NetNsError::OpenNs(e)
            }
        })?;

        let fs = fstatfs(&file).map_err(|e| NetNsError::OpenNs(e.into()))?;
        let fs_type = fs.filesystem_type();
        if fs_type != NSFS_MAGIC && fs_type != PROC_SUPER_MAGIC {
            return Err(NetNsError::NotNamespace(path));
        }

        debug!("Opened namespace: {}", path.display());
        Ok(Self { file, path })
    }
}

impl Namespace for NetNs {
    type Links = Netlink;
    type Sysctl = ProcSysctl;

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn enter(&self) -> Result<NsContext<Netlink, ProcSysctl>, NetNsError> {
        let guard = NamespaceGuard::enter(&self.file, &self.path)?;
        // Opened after the switch so the socket belongs to the target.
        let links = Netlink::connect().map_err(NetNsError::Netlink)?;
        Ok(NsContext::new(links, ProcSysctl::new(), guard))
    }
}

/// RAII guard for namespace entry/exit
///
/// Not `Send`: namespace membership belongs to an OS thread, so the guard
/// must be dropped on the thread that created it.
pub struct NamespaceGuard {
    original_ns: File,
    current: PathBuf,
    _thread_bound: PhantomData<*const ()>,
}

impl NamespaceGuard {
    /// Record the current namespace and switch the thread into `target`.
    pub fn enter(target: &File, path: &Path) -> Result<Self, NetNsError> {
        let original_ns = OpenOptions::new()
            .read(true)
            .open("/proc/thread-self/ns/net")
            .map_err(NetNsError::OpenNs)?;

        setns(target, CloneFlags::CLONE_NEWNET).map_err(NetNsError::SetNs)?;
        debug!("Entered namespace: {}", path.display());

        Ok(Self {
            original_ns,
            current: path.to_path_buf(),
            _thread_bound: PhantomData,
        })
    }
}

impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        if let Err(e) = setns(&self.original_ns, CloneFlags::CLONE_NEWNET) {
            warn!(
                "Failed to restore original namespace from {}: {}",
                self.current.display(),
                e
            );
        } else {
            debug!("Restored original namespace from {}", self.current.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_namespace() {
        let err = NetNs::open("/var/run/netns/does-not-exist-7f3a").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_open_regular_file_is_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = NetNs::open(file.path()).unwrap_err();
        assert!(matches!(err, NetNsError::NotNamespace(_)));
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_open_own_namespace() {
        let ns = NetNs::open("/proc/self/ns/net").unwrap();
        assert!(ns.fd() >= 0);
        assert_eq!(ns.path(), Path::new("/proc/self/ns/net"));
    }

    #[test]
    fn test_sysctl_key_to_path() {
        let dir = tempfile::tempdir().unwrap();
        let knob = dir.path().join("net/ipv4/conf/veth1a2b3c4d");
        std::fs::create_dir_all(&knob).unwrap();
        std::fs::write(knob.join("proxy_arp"), "0").unwrap();

        let sysctl = ProcSysctl::with_root(dir.path());
        sysctl
            .set("net.ipv4.conf.veth1a2b3c4d.proxy_arp", "1")
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(knob.join("proxy_arp")).unwrap(),
            "1"
        );
    }

    #[test]
    fn test_sysctl_missing_knob_fails() {
        let dir = tempfile::tempdir().unwrap();
        let sysctl = ProcSysctl::with_root(dir.path());
        assert!(sysctl.set("net.ipv4.conf.nope.proxy_arp", "1").is_err());
    }

    #[tokio::test]
    #[cfg(feature = "sudo-tests")]
    async fn test_enter_restores_namespace() -> Result<(), NetNsError> {
        let before = std::fs::read_link("/proc/thread-self/ns/net").unwrap();
        let ns = NetNs::open("/proc/1/ns/net")?;
        {
            let _context = ns.enter()?;
        }
        let after = std::fs::read_link("/proc/thread-self/ns/net").unwrap();
        assert_eq!(before, after);
        Ok(())
    }
}

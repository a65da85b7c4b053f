//! Macvlan creation and namespace placement
//!
//! The link is created under a random temporary name with the namespace move
//! folded into the creation request. Creating it directly under its final
//! name can fail when that name is taken in the *calling* namespace, even
//! though it only has to be unique in the target. Proxy-ARP and the final
//! name are then set from inside the target namespace.

use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::NetConf;
use crate::error::{CniError, Result};
use crate::link::{Link, LinkError, Links, MacvlanRequest};
use crate::netns::{Namespace, Sysctl};

/// Sysctl knob enabling proxy-ARP on one IPv4 interface.
pub fn proxy_arp_key(if_name: &str) -> String {
    format!("net.ipv4.conf.{if_name}.proxy_arp")
}

const TEMP_NAME_ATTEMPTS: usize = 16;

/// Random `vethXXXXXXXX` name, unused in the namespace `links` addresses.
pub async fn temporary_name<L: Links>(links: &L) -> Result<String> {
    for _ in 0..TEMP_NAME_ATTEMPTS {
        let candidate = format!("veth{:08x}", rand::thread_rng().gen::<u32>());
        match links.find_by_name(&candidate).await {
            Ok(None) => return Ok(candidate),
            Ok(Some(_)) => debug!("Temporary name {} is taken, retrying", candidate),
            Err(e) => return Err(CniError::LinkCreationFailed(e)),
        }
    }
    Err(CniError::LinkCreationFailed(LinkError::Exists(
        "every generated temporary name".to_string(),
    )))
}

/// Create a macvlan on `conf.master` and install it in `netns` as `if_name`.
///
/// `links` must address the calling namespace, where the master lives. On
/// error no link created by this call is left behind, unless the target
/// namespace cannot be entered after creation: the link then stays there
/// under its temporary name, since removing it requires entering too.
pub async fn provision<L, N>(links: &L, conf: &NetConf, if_name: &str, netns: &N) -> Result<Link>
where
    L: Links,
    N: Namespace,
{
    let mode = conf.macvlan_mode()?;

    let master = links
        .find_by_name(&conf.master)
        .await
        .and_then(|found| found.ok_or_else(|| LinkError::NotFound(conf.master.clone())))
        .map_err(|source| CniError::MasterNotFound {
            master: conf.master.clone(),
            source,
        })?;

    let tmp_name = temporary_name(links).await?;

    links
        .add_macvlan(&MacvlanRequest {
            name: tmp_name.clone(),
            parent_index: master.index,
            mode,
            mtu: conf.mtu,
            netns_fd: Some(netns.fd()),
        })
        .await
        .map_err(CniError::LinkCreationFailed)?;

    debug!(
        "Created macvlan {} on {} in {}",
        tmp_name,
        conf.master,
        netns.path().display()
    );

    let context = netns.enter().map_err(|e| {
        warn!(
            "Cannot enter {} to finish {}; the link stays behind",
            netns.path().display(),
            tmp_name
        );
        CniError::NamespaceSwitchFailed(e)
    })?;

    let link = finish_inside(context.links(), context.sysctl(), &tmp_name, if_name).await?;

    info!(
        "Provisioned macvlan {} (master {}, mode {}) in {}",
        if_name,
        conf.master,
        mode,
        netns.path().display()
    );
    Ok(link)
}

/// Enable proxy-ARP and apply the final name, discarding the link on failure.
async fn finish_inside<L: Links, S: Sysctl>(
    links: &L,
    sysctl: &S,
    tmp_name: &str,
    if_name: &str,
) -> Result<Link> {
    if let Err(source) = sysctl.set(&proxy_arp_key(tmp_name), "1") {
        discard(links, tmp_name).await;
        return Err(CniError::ProxyArpSetupFailed {
            name: tmp_name.to_string(),
            source,
        });
    }

    let renamed = match links.find_by_name(tmp_name).await {
        Ok(Some(link)) => links.rename(link.index, if_name).await.map(|()| link),
        Ok(None) => Err(LinkError::NotFound(tmp_name.to_string())),
        Err(e) => Err(e),
    };

    match renamed {
        Ok(link) => Ok(Link {
            name: if_name.to_string(),
            ..link
        }),
        Err(source) => {
            discard(links, tmp_name).await;
            Err(CniError::RenameFailed {
                name: if_name.to_string(),
                source,
            })
        }
    }
}

/// Best-effort removal of a partially configured link.
///
/// Never fails; the error that triggered the rollback is the one reported.
async fn discard<L: Links>(links: &L, name: &str) {
    let outcome = match links.find_by_name(name).await {
        Ok(Some(link)) => links.delete(link.index).await,
        Ok(None) => Ok(()),
        Err(e) => Err(e),
    };
    match outcome {
        Ok(()) => debug!("Removed partially configured link {}", name),
        Err(e) => warn!("Failed to remove partially configured link {}: {}", name, e),
    }
}

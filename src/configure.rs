//! Interface configuration inside the container namespace
//!
//! Applies the resolved MAC address, the default-gateway policy and the IPAM
//! addresses and routes to an interface that already exists. Callers run
//! this with a [`Links`] bound to the target namespace.

use tracing::{debug, info};

use crate::error::{CniError, Result};
use crate::link::{LinkError, Links};
use crate::types::{IpConfig, MacAddr, Route};

/// Apply `mac`, the gateway policy and `ip4` to `if_name`.
///
/// `ip4.routes` gains the injected default route when `is_default_gateway`
/// is set, so the caller can report exactly what was configured.
pub async fn configure<L: Links>(
    links: &L,
    if_name: &str,
    mac: &str,
    ip4: &mut IpConfig,
    is_default_gateway: bool,
) -> Result<()> {
    set_mac_address(links, if_name, mac).await?;

    if is_default_gateway {
        inject_default_route(ip4)?;
    }

    configure_interface(links, if_name, ip4).await
}

async fn set_mac_address<L: Links>(links: &L, if_name: &str, mac: &str) -> Result<()> {
    let set_failed = |reason: String| CniError::MacAddressSetFailed {
        name: if_name.to_string(),
        reason,
    };

    let address: MacAddr = mac.parse().map_err(set_failed)?;
    let link = links
        .find_by_name(if_name)
        .await
        .map_err(|e| set_failed(e.to_string()))?
        .ok_or_else(|| set_failed(LinkError::NotFound(if_name.to_string()).to_string()))?;

    links
        .set_mac(link.index, address)
        .await
        .map_err(|e| set_failed(e.to_string()))?;

    debug!("Set MAC address of {} to {}", if_name, address);
    Ok(())
}

/// Add a default route via the IPAM gateway.
///
/// Fails without touching the route list when IPAM already routes the
/// default destination through a different gateway.
pub fn inject_default_route(ip4: &mut IpConfig) -> Result<()> {
    let conflicting = ip4.routes.iter().find_map(|route| match route.gw {
        Some(gw) if route.is_default() && Some(gw) != ip4.gateway => Some(gw),
        _ => None,
    });
    if let Some(gw) = conflicting {
        return Err(CniError::GatewayConflict(gw));
    }

    ip4.routes.push(Route::default_via(ip4.gateway));
    Ok(())
}

/// Bring the link up and add the address and routes.
///
/// Routes without their own gateway use the IPAM gateway. An address or
/// route the kernel already has is skipped: the first one wins.
pub async fn configure_interface<L: Links>(links: &L, if_name: &str, ip4: &IpConfig) -> Result<()> {
    let config_failed = |source: LinkError| CniError::InterfaceConfigFailed {
        name: if_name.to_string(),
        source,
    };

    let link = links
        .find_by_name(if_name)
        .await
        .map_err(config_failed)?
        .ok_or_else(|| config_failed(LinkError::NotFound(if_name.to_string())))?;

    links.set_up(link.index).await.map_err(config_failed)?;
    match links.add_address(link.index, ip4.ip).await {
        Ok(()) => {}
        Err(LinkError::Exists(_)) => debug!("{} already has {}", if_name, ip4.ip),
        Err(e) => return Err(config_failed(e)),
    }

    for route in &ip4.routes {
        let gateway = route.gw.or(ip4.gateway);
        match links.add_route(link.index, route.dst, gateway).await {
            Ok(()) => debug!("Added route {} via {:?} dev {}", route.dst, gateway, if_name),
            Err(LinkError::Exists(_)) => {
                debug!("Route {} already present on {}, skipping", route.dst, if_name)
            }
            Err(e) => return Err(config_failed(e)),
        }
    }

    info!(
        "Configured {} with {} and {} route(s)",
        if_name,
        ip4.ip,
        ip4.routes.len()
    );
    Ok(())
}

//! MAC address resolution
//!
//! The MAC to apply comes either from the `MACAddress` argument or from the
//! container metadata service, which knows the address pre-assigned to each
//! container.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{CniError, Result};

/// Maps a container to its pre-assigned MAC address.
#[async_trait]
pub trait MacLookup: Send + Sync {
    async fn lookup(&self, container_id: &str, uuid_hint: &str) -> Result<String>;
}

/// Pick the MAC for `container_id`.
///
/// A non-empty `explicit` address wins and `lookup` is not consulted.
pub async fn resolve<M: MacLookup>(
    lookup: &M,
    container_id: &str,
    explicit: &str,
    uuid_hint: &str,
) -> Result<String> {
    if !explicit.is_empty() {
        info!("Using MAC address {} from arguments for {}", explicit, container_id);
        return Ok(explicit.to_string());
    }

    let mac = lookup.lookup(container_id, uuid_hint).await?;
    info!("Found MAC address {} for {}", mac, container_id);
    Ok(mac)
}

/// Container record as served by the metadata service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetadataContainer {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub external_id: String,
    #[serde(default)]
    pub primary_mac_address: String,
}

/// [`MacLookup`] backed by the metadata service's container listing.
pub struct MetadataClient {
    client: reqwest::Client,
    base_url: String,
}

impl MetadataClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn containers(&self) -> std::result::Result<Vec<MetadataContainer>, reqwest::Error> {
        let url = format!("{}/containers", self.base_url);
        debug!("Fetching container metadata from {}", url);
        self.client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
}

#[async_trait]
impl MacLookup for MetadataClient {
    async fn lookup(&self, container_id: &str, uuid_hint: &str) -> Result<String> {
        let lookup_failed = |reason: String| CniError::MacAddressLookupFailed {
            container_id: container_id.to_string(),
            reason,
        };

        let containers = self
            .containers()
            .await
            .map_err(|e| lookup_failed(e.to_string()))?;

        select_mac(&containers, container_id, uuid_hint)
            .map(str::to_string)
            .ok_or_else(|| lookup_failed("no matching container in metadata".to_string()))
    }
}

/// MAC of the container matching by external ID, or by UUID when a hint is
/// given. Containers without a MAC never match.
pub fn select_mac<'a>(
    containers: &'a [MetadataContainer],
    container_id: &str,
    uuid_hint: &str,
) -> Option<&'a str> {
    containers
        .iter()
        .find(|c| {
            !c.primary_mac_address.is_empty()
                && (c.external_id == container_id || (!uuid_hint.is_empty() && c.uuid == uuid_hint))
        })
        .map(|c| c.primary_mac_address.as_str())
}

//! Result documents exchanged with IPAM and the container runtime
//!
//! These follow the legacy (0.1.0 / 0.2.0) CNI result layout: a single
//! `ip4` block with its own gateway and route list.

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// DNS settings attached to the result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dns {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub dst: Ipv4Network,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<Ipv4Addr>,
}

impl Route {
    /// The catch-all `0.0.0.0/0` route via `gw`.
    pub fn default_via(gw: Option<Ipv4Addr>) -> Self {
        Self {
            dst: default_destination(),
            gw,
        }
    }

    /// Whether this route covers every destination.
    ///
    /// Host bits are ignored, so `1.2.3.4/0` is a default route too.
    pub fn is_default(&self) -> bool {
        self.dst.prefix() == 0
    }
}

/// `0.0.0.0/0`
pub fn default_destination() -> Ipv4Network {
    match Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0) {
        Ok(net) => net,
        Err(_) => unreachable!("a zero prefix is always valid"),
    }
}

/// IPv4 configuration handed out by IPAM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpConfig {
    pub ip: Ipv4Network,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
}

/// Result produced by IPAM and, once completed, by the ADD command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpamResult {
    #[serde(rename = "cniVersion", default, skip_serializing_if = "Option::is_none")]
    pub cni_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip4: Option<IpConfig>,
    /// IPv6 is passed through untouched; it is never configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip6: Option<serde_json::Value>,
    #[serde(default)]
    pub dns: Dns,
}

/// A 48-bit Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let sep = if s.contains('-') { '-' } else { ':' };
        let mut octets = [0u8; 6];
        let mut parts = s.split(sep);
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| format!("invalid MAC address {s:?}"))?;
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(format!("invalid MAC address {s:?}"));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| format!("invalid MAC address {s:?}"))?;
        }
        if parts.next().is_some() {
            return Err(format!("invalid MAC address {s:?}"));
        }
        Ok(MacAddr(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_legacy_ipam_result() {
        let raw = r#"{
            "cniVersion": "0.2.0",
            "ip4": {
                "ip": "10.0.0.5/24",
                "gateway": "10.0.0.1",
                "routes": [{"dst": "192.168.0.0/16"}, {"dst": "0.0.0.0/0", "gw": "10.0.0.254"}]
            },
            "dns": {"nameservers": ["10.0.0.2"]}
        }"#;
        let result: IpamResult = serde_json::from_str(raw).unwrap();
        let ip4 = result.ip4.unwrap();

        assert_eq!(ip4.ip.ip(), Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(ip4.ip.prefix(), 24);
        assert_eq!(ip4.gateway, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(ip4.routes.len(), 2);
        assert!(!ip4.routes[0].is_default());
        assert_eq!(ip4.routes[0].gw, None);
        assert!(ip4.routes[1].is_default());
        assert_eq!(result.dns.nameservers, vec!["10.0.0.2".to_string()]);
    }

    #[test]
    fn test_ipv6_only_result_has_no_ip4() {
        let raw = r#"{"ip6": {"ip": "fd00::5/64"}}"#;
        let result: IpamResult = serde_json::from_str(raw).unwrap();
        assert!(result.ip4.is_none());
        assert!(result.ip6.is_some());
    }

    #[test]
    fn test_result_serialization_skips_empty_fields() {
        let result = IpamResult {
            cni_version: Some("0.2.0".into()),
            ip4: Some(IpConfig {
                ip: "10.0.0.5/24".parse().unwrap(),
                gateway: None,
                routes: vec![Route::default_via(Some(Ipv4Addr::new(10, 0, 0, 1)))],
            }),
            ..Default::default()
        };
        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(json["ip4"]["ip"], "10.0.0.5/24");
        assert!(json["ip4"].get("gateway").is_none());
        assert_eq!(json["ip4"]["routes"][0]["dst"], "0.0.0.0/0");
        assert_eq!(json["ip4"]["routes"][0]["gw"], "10.0.0.1");
        assert!(json.get("ip6").is_none());
        assert_eq!(json["dns"], serde_json::json!({}));
    }

    #[test]
    fn test_default_route_detection_ignores_host_bits() {
        let route = Route {
            dst: Ipv4Network::new(Ipv4Addr::new(1, 2, 3, 4), 0).unwrap(),
            gw: None,
        };
        assert!(route.is_default());
        assert_eq!(default_destination().to_string(), "0.0.0.0/0");
    }

    #[test]
    fn test_mac_address_parsing() {
        let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(mac.octets(), [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:ff");

        let dashed: MacAddr = "02-42-AC-11-00-02".parse().unwrap();
        assert_eq!(dashed.to_string(), "02:42:ac:11:00:02");

        assert!("aa:bb:cc:dd:ee".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:ff:00".parse::<MacAddr>().is_err());
        assert!("zz:bb:cc:dd:ee:ff".parse::<MacAddr>().is_err());
        assert!("".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_mac_address_rejects_signed_octets() {
        assert!("+a:bb:cc:dd:ee:ff".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:-f".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee: f".parse::<MacAddr>().is_err());
    }
}

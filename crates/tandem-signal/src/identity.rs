//! Peer identity resolution
//!
//! Turns connection metadata (socket address, proxy headers, user agent and
//! the query string of the upgrade request) into a peer id, the address
//! used for grouping, and a human-readable name.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::handshake::server::Request;
use tracing::debug;
use uuid::Uuid;

use tandem_core::{IdentityKey, SignalConfig};

/// Address all private, loopback and link-local peers are grouped under
pub const LOCAL_SENTINEL: &str = "127.0.0.1";

const ADJECTIVES: &[&str] = &[
    "Amber", "Brave", "Calm", "Clever", "Cosmic", "Eager", "Gentle", "Golden", "Happy", "Jolly",
    "Lucky", "Mellow", "Nimble", "Quiet", "Rapid", "Silver", "Sunny", "Swift", "Tidy", "Witty",
];

const NOUNS: &[&str] = &[
    "Badger", "Crane", "Dolphin", "Falcon", "Ferret", "Gecko", "Heron", "Koala", "Lynx", "Marten",
    "Narwhal", "Otter", "Panda", "Puffin", "Raven", "Salmon", "Tapir", "Walrus", "Wombat", "Yak",
];

/// Rough device class parsed from the user agent
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Mobile,
    Tablet,
}

/// How a peer is presented to others
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerName {
    /// Stable name derived from the peer id (e.g. "Swift Otter")
    pub display_name: String,
    /// "<os> <browser>", or a generic label when the user agent is unknown
    pub device_name: String,
    pub os: Option<String>,
    pub browser: Option<String>,
    pub device_type: DeviceType,
}

/// Metadata captured from the WebSocket upgrade request
#[derive(Clone, Debug)]
pub struct ConnectionMeta {
    pub remote: SocketAddr,
    pub cf_connecting_ip: Option<String>,
    pub forwarded_for: Option<String>,
    pub user_agent: Option<String>,
    pub query: Option<String>,
}

impl ConnectionMeta {
    /// Metadata for a connection without an upgrade request (tests, raw sockets)
    pub fn bare(remote: SocketAddr) -> Self {
        Self {
            remote,
            cf_connecting_ip: None,
            forwarded_for: None,
            user_agent: None,
            query: None,
        }
    }

    /// Capture headers and query string from an upgrade request
    pub fn from_request(request: &Request, remote: SocketAddr) -> Self {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };
        Self {
            remote,
            cf_connecting_ip: header("cf-connecting-ip"),
            forwarded_for: header("x-forwarded-for"),
            user_agent: header("user-agent"),
            query: request.uri().query().map(str::to_owned),
        }
    }

    fn query_param(&self, name: &str) -> Option<String> {
        let query = self.query.as_deref()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }
}

/// Everything the hub needs to register a new peer
#[derive(Clone, Debug)]
pub struct ResolvedIdentity {
    pub id: String,
    pub id_hash: String,
    pub address: String,
    pub rtc_capable: bool,
    pub name: PeerName,
}

/// Derives identities from connection metadata
#[derive(Debug)]
pub struct IdentityResolver {
    key: IdentityKey,
    ipv6_localize: Option<u8>,
    trust_proxy_headers: bool,
}

impl IdentityResolver {
    pub fn new(key: IdentityKey, config: &SignalConfig) -> Self {
        Self {
            key,
            ipv6_localize: config.ipv6_localize,
            trust_proxy_headers: config.trust_proxy_headers,
        }
    }

    /// Resolve id, grouping address, capability flag and name for a connection
    pub fn resolve(&self, meta: &ConnectionMeta) -> ResolvedIdentity {
        let id = self.resolve_id(
            meta.query_param("peer_id").as_deref(),
            meta.query_param("peer_id_hash").as_deref(),
        );
        let id_hash = self.key.sign(&id);
        let address = normalize_address(&self.select_address(meta), self.ipv6_localize);
        let rtc_capable = meta.query_param("webrtc_supported").as_deref() == Some("true");
        let name = peer_name(&id, meta.user_agent.as_deref());

        ResolvedIdentity {
            id,
            id_hash,
            address,
            rtc_capable,
            name,
        }
    }

    /// Honor a resumed id only if it is a UUID signed by this process
    pub fn resolve_id(&self, claimed: Option<&str>, claimed_hash: Option<&str>) -> String {
        if let (Some(id), Some(hash)) = (claimed, claimed_hash) {
            if Uuid::try_parse(id).is_ok() && self.key.verify(id, hash) {
                return id.to_string();
            }
            debug!("Rejected resumed peer id {}", id);
        }
        Uuid::new_v4().to_string()
    }

    fn select_address(&self, meta: &ConnectionMeta) -> String {
        if self.trust_proxy_headers {
            if let Some(ip) = meta.cf_connecting_ip.as_deref().map(str::trim) {
                if !ip.is_empty() {
                    return ip.to_string();
                }
            }
            if let Some(first) = meta
                .forwarded_for
                .as_deref()
                .and_then(|v| v.split(',').next())
                .map(str::trim)
            {
                if !first.is_empty() {
                    return first.to_string();
                }
            }
        }
        meta.remote.ip().to_string()
    }
}

/// Normalize an address for grouping
///
/// Strips IPv4-mapped prefixes, folds local ranges to `LOCAL_SENTINEL` and
/// optionally keeps only the first `ipv6_localize` groups of IPv6 addresses.
pub fn normalize_address(raw: &str, ipv6_localize: Option<u8>) -> String {
    let trimmed = raw.trim();
    let stripped = trimmed
        .strip_prefix("::ffff:")
        .or_else(|| trimmed.strip_prefix("::FFFF:"))
        .unwrap_or(trimmed);

    if let Ok(ip) = stripped.parse::<IpAddr>() {
        let ip = match ip {
            IpAddr::V6(v6) => v6
                .to_ipv4_mapped()
                .map(IpAddr::V4)
                .unwrap_or(IpAddr::V6(v6)),
            v4 => v4,
        };
        if is_local_address(ip) {
            return LOCAL_SENTINEL.to_string();
        }
        if let (IpAddr::V6(v6), Some(groups)) = (ip, ipv6_localize) {
            // Expanded segments, so "2001:db8::1" and "2001:db8:0:0::1" group together
            return v6
                .segments()
                .iter()
                .take(groups as usize)
                .map(|segment| format!("{:x}", segment))
                .collect::<Vec<_>>()
                .join(":");
        }
        return ip.to_string();
    }

    stripped.to_string()
}

/// Private, loopback, unique-local and link-local ranges
pub fn is_local_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4 == Ipv4Addr::UNSPECIFIED
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
    }
}

/// Stable display name for a peer id
pub fn display_name(peer_id: &str) -> String {
    let digest = blake3::hash(peer_id.as_bytes());
    let bytes = digest.as_bytes();
    let adjective = ADJECTIVES[bytes[0] as usize % ADJECTIVES.len()];
    let noun = NOUNS[bytes[1] as usize % NOUNS.len()];
    format!("{} {}", adjective, noun)
}

/// Build the public name of a peer from its id and user agent
pub fn peer_name(peer_id: &str, user_agent: Option<&str>) -> PeerName {
    let ua = user_agent.unwrap_or("");

    let os = if ua.contains("iPhone") || ua.contains("iPad") || ua.contains("iPod") {
        Some("iOS")
    } else if ua.contains("Android") {
        Some("Android")
    } else if ua.contains("Windows") {
        Some("Windows")
    } else if ua.contains("Mac OS X") || ua.contains("Macintosh") {
        Some("macOS")
    } else if ua.contains("CrOS") {
        Some("ChromeOS")
    } else if ua.contains("Linux") {
        Some("Linux")
    } else {
        None
    };

    // Order matters: Edge and Opera also advertise Chrome, Chrome advertises Safari
    let browser = if ua.contains("Edg/") {
        Some("Edge")
    } else if ua.contains("OPR/") {
        Some("Opera")
    } else if ua.contains("Firefox/") || ua.contains("FxiOS/") {
        Some("Firefox")
    } else if ua.contains("Chrome/") || ua.contains("CriOS/") {
        Some("Chrome")
    } else if ua.contains("Safari/") {
        Some("Safari")
    } else {
        None
    };

    let device_type = if ua.contains("iPad") || ua.contains("Tablet") {
        DeviceType::Tablet
    } else if ua.contains("Mobi") || ua.contains("iPhone") {
        DeviceType::Mobile
    } else {
        DeviceType::Desktop
    };

    let device_name = match (os, browser) {
        (Some(os), Some(browser)) => format!("{} {}", os, browser),
        (Some(os), None) => os.to_string(),
        (None, Some(browser)) => browser.to_string(),
        (None, None) => "Unknown Device".to_string(),
    };

    PeerName {
        display_name: display_name(peer_id),
        device_name,
        os: os.map(str::to_owned),
        browser: browser.map(str::to_owned),
        device_type,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(config: &SignalConfig) -> IdentityResolver {
        IdentityResolver::new(IdentityKey::from_bytes([3u8; 32]), config)
    }

    fn meta(remote: &str) -> ConnectionMeta {
        ConnectionMeta::bare(remote.parse().unwrap())
    }

    #[test]
    fn test_private_ranges_fold_to_sentinel() {
        for raw in [
            "10.1.2.3",
            "172.16.0.9",
            "172.31.255.1",
            "192.168.1.100",
            "127.0.0.1",
            "::1",
            "fd12:3456::1",
            "fe80::1",
            "::ffff:192.168.0.4",
        ] {
            assert_eq!(normalize_address(raw, None), LOCAL_SENTINEL, "{raw}");
        }
    }

    #[test]
    fn test_public_addresses_kept() {
        assert_eq!(normalize_address("8.8.8.8", None), "8.8.8.8");
        assert_eq!(normalize_address("172.32.0.1", None), "172.32.0.1");
        assert_eq!(normalize_address("::ffff:1.2.3.4", None), "1.2.3.4");
        assert_eq!(
            normalize_address("2001:db8:1:2:3:4:5:6", None),
            "2001:db8:1:2:3:4:5:6"
        );
    }

    #[test]
    fn test_ipv6_localize_truncates_groups() {
        assert_eq!(
            normalize_address("2001:db8:1:2:3:4:5:6", Some(4)),
            "2001:db8:1:2"
        );
        assert_eq!(normalize_address("2001:db8::7", Some(3)), "2001:db8:0");
        // IPv4 is never truncated
        assert_eq!(normalize_address("8.8.8.8", Some(2)), "8.8.8.8");
    }

    #[test]
    fn test_proxy_header_priority() {
        let config = SignalConfig::default();
        let r = resolver(&config);

        let mut m = meta("203.0.113.1:5000");
        m.forwarded_for = Some("198.51.100.7, 10.0.0.1".into());
        assert_eq!(r.resolve(&m).address, "198.51.100.7");

        m.cf_connecting_ip = Some("198.51.100.9".into());
        assert_eq!(r.resolve(&m).address, "198.51.100.9");

        let untrusting = resolver(&SignalConfig {
            trust_proxy_headers: false,
            ..SignalConfig::default()
        });
        assert_eq!(untrusting.resolve(&m).address, "203.0.113.1");
    }

    #[test]
    fn test_fresh_id_without_resumption() {
        let r = resolver(&SignalConfig::default());
        let identity = r.resolve(&meta("8.8.8.8:1"));
        assert!(Uuid::try_parse(&identity.id).is_ok());
        assert!(!identity.rtc_capable);
    }

    #[test]
    fn test_resumption_requires_matching_hash() {
        let r = resolver(&SignalConfig::default());
        let id = "0f8fad5b-d9cb-469f-a165-70867728950e";
        let hash = r.key.sign(id);

        let mut m = meta("8.8.8.8:1");
        m.query = Some(format!("peer_id={}&peer_id_hash={}&webrtc_supported=true", id, hash));
        let identity = r.resolve(&m);
        assert_eq!(identity.id, id);
        assert_eq!(identity.id_hash, hash);
        assert!(identity.rtc_capable);

        m.query = Some(format!("peer_id={}&peer_id_hash={}", id, "0".repeat(64)));
        assert_ne!(r.resolve(&m).id, id);
    }

    #[test]
    fn test_resumption_rejects_non_uuid() {
        let r = resolver(&SignalConfig::default());
        let id = "not-a-uuid";
        let hash = r.key.sign(id);
        assert_ne!(r.resolve_id(Some(id), Some(&hash)), id);
    }

    #[test]
    fn test_display_name_is_stable() {
        let id = "0f8fad5b-d9cb-469f-a165-70867728950e";
        assert_eq!(display_name(id), display_name(id));
        assert_eq!(display_name(id).split(' ').count(), 2);
    }

    #[test]
    fn test_user_agent_parsing() {
        let name = peer_name(
            "x",
            Some("Mozilla/5.0 (X11; Linux x86_64; rv:120.0) Gecko/20100101 Firefox/120.0"),
        );
        assert_eq!(name.device_name, "Linux Firefox");
        assert_eq!(name.device_type, DeviceType::Desktop);

        let name = peer_name(
            "x",
            Some("Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1"),
        );
        assert_eq!(name.device_name, "iOS Safari");
        assert_eq!(name.device_type, DeviceType::Mobile);

        let name = peer_name("x", None);
        assert_eq!(name.device_name, "Unknown Device");
        assert_eq!(name.os, None);
    }
}

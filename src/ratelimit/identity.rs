//! Client identity resolution.
//!
//! Produces the per-client part of a counter key from request headers alone,
//! without requiring authentication.

use axum::http::HeaderMap;

/// Marker prepended to keys synthesized from browser headers, so they can
/// never be mistaken for an address.
pub const FINGERPRINT_PREFIX: &str = "fingerprint:";

/// Address hint headers, consulted in order when proxy trust is enabled.
const FORWARDED_FOR: &str = "x-forwarded-for";
const REAL_IP: &str = "x-real-ip";
const CDN_CONNECTING_IP: &str = "cf-connecting-ip";

const USER_AGENT: &str = "user-agent";
const ACCEPT_LANGUAGE: &str = "accept-language";

/// Derives a stable key for the client behind a request.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientIdentityResolver {
    trust_proxy: bool,
}

impl ClientIdentityResolver {
    pub fn new(trust_proxy: bool) -> Self {
        Self { trust_proxy }
    }

    pub fn trusts_proxy(&self) -> bool {
        self.trust_proxy
    }

    /// Resolve the client key for a set of request headers.
    ///
    /// With proxy trust enabled, the first non-empty address hint wins. Otherwise
    /// (or when no hint is present) a fingerprint of the User-Agent and
    /// Accept-Language headers is returned.
    pub fn resolve(&self, headers: &HeaderMap) -> String {
        if self.trust_proxy {
            if let Some(address) = forwarded_address(headers) {
                return address;
            }
        }

        fingerprint(header_str(headers, USER_AGENT), header_str(headers, ACCEPT_LANGUAGE))
    }
}

fn forwarded_address(headers: &HeaderMap) -> Option<String> {
    let forwarded_for = header_str(headers, FORWARDED_FOR)
        .split(',')
        .next()
        .unwrap_or_default()
        .trim();
    if !forwarded_for.is_empty() {
        return Some(forwarded_for.to_string());
    }

    [REAL_IP, CDN_CONNECTING_IP]
        .iter()
        .map(|name| header_str(headers, name).trim())
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// Build the synthetic key for a User-Agent / Accept-Language pair.
pub fn fingerprint(user_agent: &str, accept_language: &str) -> String {
    let hash = rolling_hash(user_agent.encode_utf16().chain(accept_language.encode_utf16()));
    format!("{}{}", FINGERPRINT_PREFIX, to_base36(hash.unsigned_abs() as u64))
}

/// `hash = hash * 31 + unit`, wrapping at signed 32 bits, over UTF-16 code units.
fn rolling_hash(units: impl Iterator<Item = u16>) -> i32 {
    units.fold(0i32, |hash, unit| {
        hash.wrapping_mul(31).wrapping_add(i32::from(unit))
    })
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    if value == 0 {
        return "0".to_string();
    }

    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    // Only ASCII digits were pushed.
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_forwarded_for_first_entry() {
        let resolver = ClientIdentityResolver::new(true);
        let map = headers(&[("x-forwarded-for", "203.0.113.5, 10.0.0.1")]);
        assert_eq!(resolver.resolve(&map), "203.0.113.5");
    }

    #[test]
    fn test_real_ip_then_cdn_header() {
        let resolver = ClientIdentityResolver::new(true);

        let map = headers(&[("x-real-ip", "198.51.100.7"), ("cf-connecting-ip", "192.0.2.1")]);
        assert_eq!(resolver.resolve(&map), "198.51.100.7");

        let map = headers(&[("x-forwarded-for", "  "), ("cf-connecting-ip", "192.0.2.1")]);
        assert_eq!(resolver.resolve(&map), "192.0.2.1");
    }

    #[test]
    fn test_proxy_headers_ignored_without_trust() {
        let resolver = ClientIdentityResolver::new(false);
        let map = headers(&[
            ("x-forwarded-for", "203.0.113.5"),
            ("user-agent", "curl/8.4.0"),
        ]);
        assert_eq!(resolver.resolve(&map), "fingerprint:9k3tlp");
    }

    #[test]
    fn test_trusted_proxy_without_hints_falls_back_to_fingerprint() {
        let resolver = ClientIdentityResolver::new(true);
        let map = headers(&[("user-agent", "Mozilla/5.0"), ("accept-language", "en-US")]);
        assert_eq!(resolver.resolve(&map), "fingerprint:xju34a");
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let resolver = ClientIdentityResolver::new(false);
        let map = headers(&[("user-agent", "Mozilla/5.0"), ("accept-language", "en-US")]);

        let first = resolver.resolve(&map);
        let second = resolver.resolve(&map.clone());
        assert!(first.starts_with(FINGERPRINT_PREFIX));
        assert_eq!(first, second);
    }

    #[test]
    fn test_fingerprint_distinguishes_clients() {
        assert_ne!(fingerprint("Mozilla/5.0", "en-US"), fingerprint("Mozilla/5.0", "de-DE"));
    }

    #[test]
    fn test_fingerprint_without_headers() {
        assert_eq!(fingerprint("", ""), "fingerprint:0");
        assert_eq!(fingerprint("a", "b"), "fingerprint:2e9");
    }

    #[test]
    fn test_hash_wraps_and_takes_magnitude() {
        assert_eq!(rolling_hash("ab".encode_utf16()), 3105);
        assert_eq!(to_base36(i32::MIN.unsigned_abs() as u64), "zik0zk");
    }
}

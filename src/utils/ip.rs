use std::collections::HashMap;
use std::net::IpAddr;

use regex::Regex;
use sqlx::types::ipnetwork::IpNetwork;

/// Headers consulted for the caller address, most trusted first.
pub const CLIENT_IP_HEADERS: [&str; 3] = ["cf-connecting-ip", "x-forwarded-for", "x-real-ip"];

/// First non-empty value among `names`, then the socket address. A
/// forwarded-for list yields its first hop. Stored header names are expected
/// lowercase.
pub fn client_ip<S: AsRef<str>>(
    headers: &HashMap<String, String>,
    names: &[S],
    remote: Option<IpAddr>,
) -> Option<String> {
    for name in names {
        let name = name.as_ref().to_ascii_lowercase();
        let Some(raw) = headers.get(&name) else {
            continue;
        };
        let candidate = if name == "x-forwarded-for" {
            raw.split(',').next().unwrap_or("").trim()
        } else {
            raw.trim()
        };
        if !candidate.is_empty() {
            return Some(candidate.to_string());
        }
    }
    remote.map(|ip| ip.to_string())
}

/// Exact address, CIDR block (`10.0.0.0/8`) or wildcard (`192.168.*`).
pub fn ip_matches(ip: &str, pattern: &str) -> bool {
    let pattern = pattern.trim();
    if pattern == ip {
        return true;
    }

    if pattern.contains('/') {
        let (Ok(network), Ok(addr)) = (pattern.parse::<IpNetwork>(), ip.parse::<IpAddr>()) else {
            tracing::warn!(pattern, "invalid CIDR in whitelist");
            return false;
        };
        return network.contains(addr);
    }

    if pattern.contains('*') {
        let expr = format!("^{}$", regex::escape(pattern).replace(r"\*", ".*"));
        return Regex::new(&expr).map(|re| re.is_match(ip)).unwrap_or(false);
    }

    false
}

/// An empty whitelist admits everyone.
pub fn ip_allowed(ip: Option<&str>, whitelist: &[String]) -> bool {
    if whitelist.is_empty() {
        return true;
    }
    let Some(ip) = ip else {
        return false;
    };
    whitelist.iter().any(|pattern| ip_matches(ip, pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_membership() {
        assert!(ip_matches("192.168.1.5", "192.168.1.0/24"));
        assert!(!ip_matches("192.168.2.5", "192.168.1.0/24"));
        assert!(ip_matches("10.20.30.40", "10.0.0.0/8"));
        assert!(!ip_matches("not-an-ip", "10.0.0.0/8"));
    }

    #[test]
    fn wildcard_and_exact() {
        assert!(ip_matches("192.168.7.9", "192.168.*"));
        assert!(!ip_matches("10.168.7.9", "192.168.*"));
        assert!(ip_matches("127.0.0.1", "127.0.0.1"));
        assert!(!ip_matches("127.0.0.2", "127.0.0.1"));
    }

    #[test]
    fn empty_whitelist_allows_all() {
        assert!(ip_allowed(Some("1.2.3.4"), &[]));
        assert!(ip_allowed(None, &[]));
        assert!(!ip_allowed(None, &["1.2.3.4".to_string()]));
    }

    #[test]
    fn client_ip_resolution_order() {
        let remote: Option<IpAddr> = "9.9.9.9".parse().ok();
        let mut headers = HashMap::new();
        assert_eq!(client_ip(&headers, &CLIENT_IP_HEADERS[..], remote).as_deref(), Some("9.9.9.9"));

        headers.insert("x-real-ip".to_string(), "3.3.3.3".to_string());
        assert_eq!(client_ip(&headers, &CLIENT_IP_HEADERS[..], remote).as_deref(), Some("3.3.3.3"));

        headers.insert(
            "x-forwarded-for".to_string(),
            "2.2.2.2, 10.0.0.1".to_string(),
        );
        assert_eq!(client_ip(&headers, &CLIENT_IP_HEADERS[..], remote).as_deref(), Some("2.2.2.2"));

        headers.insert("cf-connecting-ip".to_string(), "1.1.1.1".to_string());
        assert_eq!(client_ip(&headers, &CLIENT_IP_HEADERS[..], remote).as_deref(), Some("1.1.1.1"));

        headers.insert("cf-connecting-ip".to_string(), " ".to_string());
        assert_eq!(client_ip(&headers, &CLIENT_IP_HEADERS[..], remote).as_deref(), Some("2.2.2.2"));
    }

    #[test]
    fn configured_headers_replace_the_defaults() {
        let mut headers = HashMap::new();
        headers.insert("x-real-ip".to_string(), "3.3.3.3".to_string());
        headers.insert("x-client".to_string(), "4.4.4.4".to_string());
        let names = vec!["X-Client".to_string()];
        assert_eq!(client_ip(&headers, &names, None).as_deref(), Some("4.4.4.4"));
        assert_eq!(client_ip(&headers, &Vec::<String>::new(), None), None);
    }
}

//! Guard applied to every outbound request towards an upstream.
//!
//! Rejects non-HTTP schemes, loopback and internal addresses and well-known
//! metadata endpoints unless local requests are explicitly allowed (dev/test)
//! or the host is on the allow list.

use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;
use url::{Host, Url};

const BLOCKED_HOSTS: &[&str] = &["localhost", "metadata.google.internal", "metadata"];

/// Outcome for a permitted URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Allowed {
    pub url: Url,
}

/// Outcome for a rejected URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Denied(pub String);

impl fmt::Display for Denied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Denied {}

#[derive(Clone, Debug, Default)]
pub struct OutboundGuard {
    allow_local: bool,
    allowed_hosts: Vec<String>,
    allowed_networks: Vec<IpNet>,
}

impl OutboundGuard {
    pub fn new(allow_local: bool, allowed_hosts: &[String]) -> Self {
        let mut hosts = Vec::new();
        let mut networks = Vec::new();
        for entry in allowed_hosts {
            let entry = entry.trim();
            if let Ok(net) = entry.parse::<IpNet>() {
                networks.push(net);
            } else if let Ok(ip) = entry.parse::<IpAddr>() {
                networks.push(IpNet::from(ip));
            } else if !entry.is_empty() {
                hosts.push(entry.to_ascii_lowercase());
            }
        }
        Self {
            allow_local,
            allowed_hosts: hosts,
            allowed_networks: networks,
        }
    }

    /// Guard that permits loopback targets. For tests and local development.
    pub fn permissive() -> Self {
        Self::new(true, &[])
    }

    /// Check a URL before any request is issued.
    pub fn check(&self, raw: &str) -> Result<Allowed, Denied> {
        let url = Url::parse(raw).map_err(|e| Denied(format!("invalid url: {e}")))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(Denied(format!("scheme {} is not allowed", url.scheme())));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(Denied("credentials must not be embedded in the url".into()));
        }

        match url.host() {
            None => Err(Denied("url has no host".into())),
            Some(Host::Domain(domain)) => {
                let domain = domain.to_ascii_lowercase();
                if self.allowed_hosts.iter().any(|h| *h == domain) || self.allow_local {
                    return Ok(Allowed { url });
                }
                if BLOCKED_HOSTS.contains(&domain.as_str()) || domain.ends_with(".localhost") {
                    return Err(Denied(format!("host {domain} is not allowed")));
                }
                Ok(Allowed { url })
            }
            Some(Host::Ipv4(ip)) => {
                self.check_ip(IpAddr::V4(ip))?;
                Ok(Allowed { url })
            }
            Some(Host::Ipv6(ip)) => {
                self.check_ip(IpAddr::V6(ip))?;
                Ok(Allowed { url })
            }
        }
    }

    /// Check a resolved address. Used after DNS resolution of a hostname.
    pub fn check_ip(&self, ip: IpAddr) -> Result<(), Denied> {
        if self.allow_local || self.allowed_networks.iter().any(|n| n.contains(&ip)) {
            return Ok(());
        }
        if is_internal(ip) {
            return Err(Denied(format!("address {ip} is internal")));
        }
        Ok(())
    }

    /// Whether a hostname is exempt from resolved-address checks.
    pub fn host_is_allow_listed(&self, host: &str) -> bool {
        self.allow_local || self.allowed_hosts.iter().any(|h| h.eq_ignore_ascii_case(host))
    }
}

fn is_internal(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.octets()[0] == 0
                // carrier-grade NAT 100.64.0.0/10
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xc0) == 64)
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_internal(IpAddr::V4(mapped));
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_public_https() {
        let guard = OutboundGuard::default();
        assert!(guard.check("https://repo1.maven.org/maven2").is_ok());
        assert!(guard.check("http://8.8.8.8/v2/").is_ok());
    }

    #[test]
    fn test_denies_internal_targets() {
        let guard = OutboundGuard::default();
        for url in [
            "http://127.0.0.1:8080/",
            "http://localhost/",
            "http://api.localhost/",
            "http://10.0.0.5/",
            "http://192.168.1.1/",
            "http://169.254.169.254/latest/meta-data",
            "http://metadata.google.internal/",
            "http://[::1]/",
            "http://[fd00::1]/",
            "http://[::ffff:127.0.0.1]/",
            "http://0.0.0.0/",
            "ftp://example.com/",
            "file:///etc/passwd",
            "https://user:pw@example.com/",
        ] {
            assert!(guard.check(url).is_err(), "{url} should be denied");
        }
    }

    #[test]
    fn test_allow_local_and_allow_list() {
        assert!(OutboundGuard::permissive().check("http://127.0.0.1:9000/").is_ok());

        let guard = OutboundGuard::new(
            false,
            &["registry.internal".to_string(), "10.1.0.0/16".to_string()],
        );
        assert!(guard.check("https://registry.internal/").is_ok());
        assert!(guard.check("http://10.1.2.3/").is_ok());
        assert!(guard.check("http://10.2.0.1/").is_err());
        assert!(guard.host_is_allow_listed("REGISTRY.internal"));
    }
}

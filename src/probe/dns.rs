//! Timed host name resolution through the system resolver.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use super::ProbeError;

/// Addresses a host name resolved to, and how long the lookup took.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub addrs: Vec<IpAddr>,
    pub elapsed: Duration,
}

impl Resolution {
    /// The address to probe, IPv4 preferred.
    pub fn preferred(&self) -> Option<IpAddr> {
        self.addrs
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| self.addrs.first())
            .copied()
    }
}

/// Resolve `host` and time the lookup. IP literals resolve instantly.
pub async fn resolve_timed(host: &str, timeout: Duration) -> Result<Resolution, ProbeError> {
    if host.is_empty() {
        return Err(ProbeError::Config("empty host".to_string()));
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(Resolution {
            addrs: vec![ip],
            elapsed: Duration::ZERO,
        });
    }

    let start = Instant::now();
    let addrs: Vec<IpAddr> = tokio::time::timeout(timeout, tokio::net::lookup_host((host, 0u16)))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed for {}: {}", host, e)))?
        .map(|sa| sa.ip())
        .collect();
    let elapsed = start.elapsed();

    if addrs.is_empty() {
        return Err(ProbeError::Network(format!("No addresses found for {}", host)));
    }

    Ok(Resolution { addrs, elapsed })
}

/// Resolve `host` to the single address a probe should target.
pub async fn resolve_address(host: &str, timeout: Duration) -> Result<IpAddr, ProbeError> {
    let resolution = resolve_timed(host, timeout).await?;
    resolution
        .preferred()
        .ok_or_else(|| ProbeError::Network(format!("No addresses found for {}", host)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[tokio::test]
    async fn test_ip_literal_resolves_instantly() {
        let res = resolve_timed("8.8.8.8", Duration::from_secs(1)).await.unwrap();
        assert_eq!(res.addrs, vec![IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))]);
        assert_eq!(res.elapsed, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_empty_host_is_rejected() {
        let result = resolve_timed("", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ProbeError::Config(_))));
    }

    #[test]
    fn test_preferred_is_ipv4_first() {
        let res = Resolution {
            addrs: vec![
                IpAddr::V6(Ipv6Addr::LOCALHOST),
                IpAddr::V4(Ipv4Addr::LOCALHOST),
            ],
            elapsed: Duration::from_millis(2),
        };
        assert_eq!(res.preferred(), Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));

        let v6_only = Resolution {
            addrs: vec![IpAddr::V6(Ipv6Addr::LOCALHOST)],
            elapsed: Duration::ZERO,
        };
        assert_eq!(v6_only.preferred(), Some(IpAddr::V6(Ipv6Addr::LOCALHOST)));
    }

    #[tokio::test]
    #[ignore = "requires network access"]
    async fn test_resolve_public_name() {
        let res = resolve_timed("www.example.com", Duration::from_secs(5)).await.unwrap();
        assert!(!res.addrs.is_empty());
    }
}

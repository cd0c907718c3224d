//! Probe module for network monitoring.
//!
//! A probe cycle runs an ICMP burst and an HTTP/DNS request against the same
//! host concurrently and merges both into one [`Sample`].

mod dns;
mod http;
mod ping;

pub use dns::*;
pub use http::*;
pub use ping::*;

use chrono::Utc;
use reqwest::Url;
use std::time::Duration;
use thiserror::Error;

use crate::db::Sample;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// Tunables for one probe cycle.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    /// Echo requests sent per burst.
    pub packet_count: u16,
    /// Payload bytes per echo request.
    pub packet_size: usize,
    /// Spacing between echo requests.
    pub packet_interval: Duration,
    /// Deadline for the whole ICMP burst.
    pub ping_timeout: Duration,
    pub dns_timeout: Duration,
    pub http_connect_timeout: Duration,
    /// Deadline for the whole HTTP exchange.
    pub http_timeout: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            packet_count: 3,
            packet_size: 512,
            packet_interval: Duration::from_secs(1),
            ping_timeout: Duration::from_secs(10),
            dns_timeout: Duration::from_secs(5),
            http_connect_timeout: Duration::from_secs(5),
            http_timeout: Duration::from_secs(10),
        }
    }
}

/// Build the URL a host is probed at. Hosts without a scheme use HTTPS.
pub fn target_url(host: &str) -> Result<Url, ProbeError> {
    let host = host.trim();
    if host.is_empty() {
        return Err(ProbeError::Config("empty host".to_string()));
    }

    let raw = if host.contains("://") {
        host.to_string()
    } else {
        format!("https://{}", host)
    };

    let url = Url::parse(&raw)
        .map_err(|e| ProbeError::Config(format!("invalid host {}: {}", host, e)))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(ProbeError::Config(format!("unsupported scheme: {}", other))),
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ProbeError::Config(format!("no host name in {}", host)));
    }

    Ok(url)
}

/// The bare host name (or IP literal) used for ICMP and DNS.
pub fn host_name(url: &Url) -> Result<String, ProbeError> {
    match url.host_str() {
        // IPv6 literals come back bracketed.
        Some(h) if !h.is_empty() => {
            Ok(h.trim_start_matches('[').trim_end_matches(']').to_string())
        }
        _ => Err(ProbeError::Config(format!("no host name in {}", url))),
    }
}

/// Bits per millisecond transferred over the burst. Zero when no round-trip
/// time was accumulated.
pub fn calculate_throughput(total_bytes: u64, total_rtt_ms: u64) -> f64 {
    if total_rtt_ms == 0 {
        return 0.0;
    }
    total_bytes as f64 * 8.0 / total_rtt_ms as f64
}

/// Run one probe cycle against `host`.
///
/// Both sub-probes always run to completion or failure; a failed sub-probe
/// leaves its fields empty instead of failing the whole cycle.
pub async fn probe(host: &str, settings: &ProbeSettings) -> Sample {
    let start_time = Utc::now();

    let url = match target_url(host) {
        Ok(url) => url,
        Err(e) => {
            tracing::debug!("Probe skipped for {:?}: {}", host, e);
            return Sample::empty(start_time);
        }
    };

    let icmp = {
        let url = url.clone();
        let settings = settings.clone();
        tokio::spawn(async move {
            let name = host_name(&url)?;
            run_ping_probe(&name, &settings).await
        })
    };
    let http = {
        let settings = settings.clone();
        tokio::spawn(async move { run_http_probe(&url, &settings).await })
    };

    let (icmp, http) = tokio::join!(icmp, http);

    let ping_stats = match icmp {
        Ok(Ok(stats)) => Some(stats),
        Ok(Err(e)) => {
            tracing::debug!("ICMP probe failed for {}: {}", host, e);
            None
        }
        Err(e) => {
            tracing::error!("ICMP probe task failed for {}: {}", host, e);
            None
        }
    };
    let http_stats = match http {
        Ok(Ok(stats)) => Some(stats),
        Ok(Err(e)) => {
            tracing::debug!("HTTP probe failed for {}: {}", host, e);
            None
        }
        Err(e) => {
            tracing::error!("HTTP probe task failed for {}: {}", host, e);
            None
        }
    };

    merge_stats(start_time, ping_stats.as_ref(), http_stats.as_ref())
}

/// Combine the two sub-probe results into one sample.
pub fn merge_stats(
    time: chrono::DateTime<Utc>,
    ping: Option<&PingStats>,
    http: Option<&HttpStats>,
) -> Sample {
    let mut sample = Sample::empty(time);

    if let Some(p) = ping {
        sample.latency = Some(p.avg_rtt.as_millis() as i64);
        sample.packet_loss = Some(p.packet_loss());
        sample.throughput = Some(p.throughput());
        sample.rtt = Some(p.mean_rtt_ms() as i64);
    }

    if let Some(h) = http {
        sample.dns_resolve_time = Some(h.dns_resolve_time.as_millis() as i64);
        sample.status_code = Some(h.status_code);
    }

    sample
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping_stats() -> PingStats {
        PingStats {
            transmitted: 4,
            received: 3,
            avg_rtt: Duration::from_millis(12),
            replies: 4,
            total_bytes: 4 * 520,
            total_rtt_ms: 52,
        }
    }

    fn http_stats() -> HttpStats {
        HttpStats {
            dns_resolve_time: Duration::from_millis(5),
            status_code: 200,
        }
    }

    #[test]
    fn test_calculate_throughput() {
        assert_eq!(calculate_throughput(1024, 0), 0.0);
        assert_eq!(calculate_throughput(0, 0), 0.0);
        assert_eq!(calculate_throughput(u64::MAX / 16, 0), 0.0);
        assert_eq!(calculate_throughput(1024, 10), 819.2);
        assert_eq!(calculate_throughput(1_048_576, 1000), 8388.608);
        assert_eq!(calculate_throughput(1, 1), 8.0);
    }

    #[test]
    fn test_calculate_throughput_of_huge_byte_count() {
        let throughput = calculate_throughput(u64::MAX, 1);
        assert!(throughput.is_finite());
        assert!(throughput > u64::MAX as f64);
    }

    #[test]
    fn test_merge_both_missing() {
        let sample = merge_stats(Utc::now(), None, None);
        assert!(sample.is_empty());
    }

    #[test]
    fn test_merge_ping_only() {
        let sample = merge_stats(Utc::now(), Some(&ping_stats()), None);
        assert_eq!(sample.latency, Some(12));
        assert_eq!(sample.packet_loss, Some(25.0));
        // Mean over all four replies, the duplicate included
        assert_eq!(sample.rtt, Some(13));
        assert!(sample.throughput.unwrap() > 0.0);
        assert_eq!(sample.status_code, None);
        assert_eq!(sample.dns_resolve_time, None);
    }

    #[test]
    fn test_merge_http_only() {
        let sample = merge_stats(Utc::now(), None, Some(&http_stats()));
        assert_eq!(sample.status_code, Some(200));
        assert_eq!(sample.dns_resolve_time, Some(5));
        assert_eq!(sample.latency, None);
        assert_eq!(sample.packet_loss, None);
        assert_eq!(sample.throughput, None);
        assert_eq!(sample.rtt, None);
    }

    #[test]
    fn test_merge_both() {
        let sample = merge_stats(Utc::now(), Some(&ping_stats()), Some(&http_stats()));
        assert!(sample.is_reachable());
        assert_eq!(sample.throughput, Some(calculate_throughput(4 * 520, 52)));
    }

    #[test]
    fn test_target_url() {
        assert_eq!(target_url("example.com").unwrap().as_str(), "https://example.com/");
        assert_eq!(target_url("http://example.com").unwrap().scheme(), "http");
        assert_eq!(target_url("  8.8.8.8 ").unwrap().as_str(), "https://8.8.8.8/");
        assert!(target_url("").is_err());
        assert!(target_url("   ").is_err());
        assert!(target_url("ftp://example.com").is_err());
        assert!(target_url("https://").is_err());
    }

    #[test]
    fn test_host_name() {
        let url = target_url("https://www.example.com:8443/health").unwrap();
        assert_eq!(host_name(&url).unwrap(), "www.example.com");

        let url = target_url("http://[::1]/").unwrap();
        assert_eq!(host_name(&url).unwrap(), "::1");
    }

    #[tokio::test]
    async fn test_probe_empty_host_yields_empty_sample() {
        let before = Utc::now();
        let sample = probe("", &ProbeSettings::default()).await;
        assert!(sample.is_empty());
        assert!(sample.time >= before);
    }

    #[tokio::test]
    async fn test_probe_malformed_host_yields_empty_sample() {
        let sample = probe("https://", &ProbeSettings::default()).await;
        assert!(sample.is_empty());
    }

    #[tokio::test]
    #[ignore = "requires network access and ICMP"]
    async fn test_probe_reachable_host() {
        let sample = probe("google.com", &ProbeSettings::default()).await;
        assert!(sample.packet_loss.unwrap() < 100.0);
        assert!(sample.throughput.unwrap() > 0.0);
        assert!(sample.rtt.unwrap() > 0);
        assert!(sample.dns_resolve_time.unwrap() >= 0);
        assert_eq!(sample.status_code, Some(200));
    }
}

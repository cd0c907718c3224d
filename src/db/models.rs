//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A monitored host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// 36-character UUID chosen by the client.
    pub id: String,
    pub hostname: String,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub favorite: bool,
}

/// The result of one probe cycle against a host.
///
/// Metric fields are `None` when the sub-probe that produces them failed, so a
/// missing measurement is never confused with a measured zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub time: DateTime<Utc>,
    /// Average ICMP round-trip time in milliseconds.
    pub latency: Option<i64>,
    /// Percentage of unanswered echo requests, 0-100.
    pub packet_loss: Option<f64>,
    /// Bits per millisecond over the ICMP burst.
    pub throughput: Option<f64>,
    /// Milliseconds spent resolving the host name.
    pub dns_resolve_time: Option<i64>,
    /// Mean ICMP round-trip time in milliseconds over every reply of the
    /// burst, duplicates included. `latency` counts first replies only.
    pub rtt: Option<i64>,
    pub status_code: Option<u16>,
}

impl Sample {
    /// A sample taken at `time` with nothing measured.
    pub fn empty(time: DateTime<Utc>) -> Self {
        Self {
            time,
            latency: None,
            packet_loss: None,
            throughput: None,
            dns_resolve_time: None,
            rtt: None,
            status_code: None,
        }
    }

    /// Whether the HTTP sub-probe got any response from the host.
    pub fn is_reachable(&self) -> bool {
        self.status_code.is_some()
    }

    /// True when no field was measured.
    pub fn is_empty(&self) -> bool {
        self.latency.is_none()
            && self.packet_loss.is_none()
            && self.throughput.is_none()
            && self.dns_resolve_time.is_none()
            && self.rtt.is_none()
            && self.status_code.is_none()
    }
}

macro_rules! series_point {
    ($name:ident, $field:ident, $ty:ty) => {
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        pub struct $name {
            pub date: DateTime<Utc>,
            pub $field: $ty,
        }
    };
}

series_point!(LatencyPoint, latency, i64);
series_point!(PacketLossPoint, packet_loss, f64);
series_point!(ThroughputPoint, throughput, f64);
series_point!(DnsResolvedPoint, dns_resolved, i64);
series_point!(StatusCodePoint, status_code, u16);
series_point!(RttPoint, rtt, i64);

/// Metric history of one host, split into one time series per metric.
///
/// A series only holds the cycles where its metric was measured.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub latency: Vec<LatencyPoint>,
    pub packet_loss: Vec<PacketLossPoint>,
    pub throughput: Vec<ThroughputPoint>,
    pub dns_resolved: Vec<DnsResolvedPoint>,
    pub status_code: Vec<StatusCodePoint>,
    pub rtt: Vec<RttPoint>,
}

impl Metrics {
    pub fn from_samples(samples: &[Sample]) -> Self {
        let mut metrics = Self::default();

        for s in samples {
            let date = s.time;
            if let Some(latency) = s.latency {
                metrics.latency.push(LatencyPoint { date, latency });
            }
            if let Some(packet_loss) = s.packet_loss {
                metrics.packet_loss.push(PacketLossPoint { date, packet_loss });
            }
            if let Some(throughput) = s.throughput {
                metrics.throughput.push(ThroughputPoint { date, throughput });
            }
            if let Some(dns_resolved) = s.dns_resolve_time {
                metrics.dns_resolved.push(DnsResolvedPoint { date, dns_resolved });
            }
            if let Some(status_code) = s.status_code {
                metrics.status_code.push(StatusCodePoint { date, status_code });
            }
            if let Some(rtt) = s.rtt {
                metrics.rtt.push(RttPoint { date, rtt });
            }
        }

        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_sample() {
        let sample = Sample::empty(Utc::now());
        assert!(sample.is_empty());
        assert!(!sample.is_reachable());
    }

    #[test]
    fn test_metrics_skip_unmeasured_fields() {
        let now = Utc::now();
        let samples = vec![
            Sample {
                latency: Some(12),
                packet_loss: Some(0.0),
                throughput: Some(341.3),
                rtt: Some(36),
                ..Sample::empty(now)
            },
            Sample {
                dns_resolve_time: Some(4),
                status_code: Some(200),
                ..Sample::empty(now)
            },
        ];

        let metrics = Metrics::from_samples(&samples);
        assert_eq!(metrics.latency.len(), 1);
        assert_eq!(metrics.packet_loss.len(), 1);
        assert_eq!(metrics.throughput.len(), 1);
        assert_eq!(metrics.rtt.len(), 1);
        assert_eq!(metrics.dns_resolved.len(), 1);
        assert_eq!(metrics.status_code[0].status_code, 200);
    }

    #[test]
    fn test_metrics_json_shape() {
        let now = Utc::now();
        let metrics = Metrics::from_samples(&[Sample {
            dns_resolve_time: Some(7),
            ..Sample::empty(now)
        }]);

        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["dns_resolved"][0]["dns_resolved"], 7);
        assert!(json["latency"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_host_wire_names() {
        let host: Host = serde_json::from_str(
            r#"{"id":"3f2b8c1e-9a4d-4e6f-8b7a-1c2d3e4f5a6b","hostname":"a.com","online":true,"favorite":false}"#,
        )
        .unwrap();
        assert_eq!(host.hostname, "a.com");
        assert!(host.online);
    }
}

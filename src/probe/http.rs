//! HTTP probe implementation.

use reqwest::header::{CACHE_CONTROL, PRAGMA};
use reqwest::Url;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use super::{host_name, resolve_timed, ProbeError, ProbeSettings};

/// What the HTTP/DNS sub-probe measured.
#[derive(Debug, Clone)]
pub struct HttpStats {
    pub dns_resolve_time: Duration,
    pub status_code: u16,
}

/// Resolve the host, then issue one uncached GET against `url`.
///
/// Any HTTP response counts as success, whatever its status code.
pub async fn run_http_probe(url: &Url, settings: &ProbeSettings) -> Result<HttpStats, ProbeError> {
    let host = host_name(url)?;
    let resolution = resolve_timed(&host, settings.dns_timeout).await?;

    let mut builder = reqwest::Client::builder()
        .no_proxy()
        .connect_timeout(settings.http_connect_timeout)
        .timeout(settings.http_timeout);

    // Pin the request to the lookup we just timed so it is not resolved twice.
    if host.parse::<IpAddr>().is_err() {
        if let Some(ip) = resolution.preferred() {
            builder = builder.resolve(&host, SocketAddr::new(ip, 0));
        }
    }

    let client = builder
        .build()
        .map_err(|e| ProbeError::Network(e.to_string()))?;

    let response = client
        .get(url.clone())
        .header(CACHE_CONTROL, "no-cache")
        .header(PRAGMA, "no-cache")
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(settings.http_timeout)
            } else {
                ProbeError::Network(e.to_string())
            }
        })?;

    Ok(HttpStats {
        dns_resolve_time: resolution.elapsed,
        status_code: response.status().as_u16(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn quick_settings() -> ProbeSettings {
        ProbeSettings {
            http_connect_timeout: Duration::from_millis(500),
            http_timeout: Duration::from_secs(2),
            ..ProbeSettings::default()
        }
    }

    #[tokio::test]
    async fn test_http_probe_connection_refused() {
        let url = Url::parse("http://127.0.0.1:1/").unwrap();
        let result = run_http_probe(&url, &quick_settings()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_http_probe_records_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_lowercase();
            let response = concat!(
                "HTTP/1.1 503 Service Unavailable\r\n",
                "content-length: 0\r\nconnection: close\r\n\r\n",
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            request
        });

        let url = Url::parse(&format!("http://{}/", addr)).unwrap();
        let stats = run_http_probe(&url, &quick_settings()).await.unwrap();
        assert_eq!(stats.status_code, 503);
        assert_eq!(stats.dns_resolve_time, Duration::ZERO);

        let request = server.await.unwrap();
        assert!(request.starts_with("get / http/1.1"));
        assert!(request.contains("cache-control: no-cache"));
    }
}

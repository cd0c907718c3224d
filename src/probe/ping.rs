//! Ping probe implementation with native ICMP (high-precision) and command fallback.
//!
//! A burst sends several echo requests on one blocking socket inside
//! spawn_blocking, so send and receive timestamps stay sub-millisecond.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{calculate_throughput, resolve_address, ProbeError, ProbeSettings};

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    /// Native ICMP sockets are available
    Native,
    /// Only command fallback is available
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

/// Sequence counter shared by all bursts so concurrent bursts to the same
/// destination never reuse a sequence number.
static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Reserve `count` consecutive sequence numbers; returns the first.
fn next_sequence_block(count: u16) -> u16 {
    PING_SEQUENCE.fetch_add(count, Ordering::Relaxed)
}

/// Statistics of one ICMP burst.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PingStats {
    pub transmitted: u32,
    /// Requests that got at least one reply; duplicates are not counted.
    pub received: u32,
    pub avg_rtt: Duration,
    /// Every reply, duplicates included.
    pub replies: u32,
    /// Bytes of every reply, duplicates included.
    pub total_bytes: u64,
    /// Sum of every reply's round-trip time, each truncated to whole
    /// milliseconds before it is added.
    pub total_rtt_ms: u64,
}

impl PingStats {
    /// Percentage of requests that got no reply.
    pub fn packet_loss(&self) -> f64 {
        if self.transmitted == 0 {
            return 100.0;
        }
        let lost = self.transmitted - self.received.min(self.transmitted);
        lost as f64 / self.transmitted as f64 * 100.0
    }

    /// Mean round-trip time in whole milliseconds over every reply.
    pub fn mean_rtt_ms(&self) -> u64 {
        if self.replies == 0 {
            return 0;
        }
        self.total_rtt_ms / u64::from(self.replies)
    }

    /// Zero when every reply came back in under a millisecond.
    pub fn throughput(&self) -> f64 {
        calculate_throughput(self.total_bytes, self.total_rtt_ms)
    }
}

/// Running totals while a burst is in progress.
#[derive(Debug, Default)]
struct BurstTally {
    transmitted: u32,
    received: u32,
    reply_rtt: Duration,
    replies: u32,
    total_bytes: u64,
    total_rtt_ms: u64,
    reported_avg: Option<Duration>,
}

impl BurstTally {
    fn record_reply(&mut self, bytes: usize, rtt: Duration, duplicate: bool) {
        self.replies += 1;
        self.total_bytes += bytes as u64;
        self.total_rtt_ms += rtt.as_millis() as u64;
        if !duplicate {
            self.received += 1;
            self.reply_rtt += rtt;
        }
    }

    /// A burst without a single reply is a failed probe, not a measurement.
    fn finish(self, timeout: Duration) -> Result<PingStats, ProbeError> {
        if self.received == 0 {
            return Err(ProbeError::Timeout(timeout));
        }

        Ok(PingStats {
            transmitted: self.transmitted.max(self.received),
            received: self.received,
            avg_rtt: self
                .reported_avg
                .unwrap_or(self.reply_rtt / self.received),
            replies: self.replies,
            total_bytes: self.total_bytes,
            total_rtt_ms: self.total_rtt_ms,
        })
    }
}

/// Detect ICMP capability by attempting to create a socket.
fn detect_icmp_capability() -> IcmpCapability {
    // RAW needs CAP_NET_RAW or root
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }

    // DGRAM works unprivileged on macOS, and on Linux within ping_group_range
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }

    tracing::info!("Ping probe: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// Run an ICMP burst against the given address.
///
/// The address is resolved first, so an unknown or malformed host fails
/// before any packet is sent.
pub async fn run_ping_probe(
    address: &str,
    settings: &ProbeSettings,
) -> Result<PingStats, ProbeError> {
    if address.is_empty() {
        return Err(ProbeError::Config("empty host".to_string()));
    }

    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);
    let ip = resolve_address(address, settings.dns_timeout).await?;

    if capability == IcmpCapability::Native {
        let burst_settings = settings.clone();
        let result = tokio::task::spawn_blocking(move || run_blocking_burst(ip, &burst_settings))
            .await
            .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

        match result {
            Err(ProbeError::Network(msg)) if is_permission_error(&msg) => {
                tracing::warn!(
                    "Native ping failed with permission error for {}, falling back to command: {}",
                    address,
                    msg
                );
            }
            other => return other,
        }
    }

    run_ping_command(ip, settings).await
}

fn is_permission_error(msg: &str) -> bool {
    msg.contains("Permission") || msg.contains("Operation not permitted") || msg.contains("denied")
}

/// Open an ICMP socket for `ip`. Returns the socket and whether it is RAW.
fn open_icmp_socket(ip: IpAddr) -> Result<(Socket, bool), ProbeError> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };

    // Try RAW first (privileged), then DGRAM (unprivileged)
    if let Ok(socket) = Socket::new(domain, Type::RAW, Some(protocol)) {
        return Ok((socket, true));
    }
    Socket::new(domain, Type::DGRAM, Some(protocol))
        .map(|socket| (socket, false))
        .map_err(|e| ProbeError::Network(format!("Failed to create ICMP socket: {}", e)))
}

/// Send `packet_count` echo requests spaced by `packet_interval` and collect
/// replies until every request is answered or `ping_timeout` elapses.
fn run_blocking_burst(ip: IpAddr, settings: &ProbeSettings) -> Result<PingStats, ProbeError> {
    let (socket, raw) = open_icmp_socket(ip)?;

    socket
        .set_write_timeout(Some(settings.ping_timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;

    let dest = SocketAddr::new(ip, 0);
    socket
        .connect(&dest.into())
        .map_err(|e| ProbeError::Network(format!("Failed to connect: {}", e)))?;

    let count = settings.packet_count.max(1);
    let identifier: u16 = rand::random();
    let first_sequence = next_sequence_block(count);

    let mut sent_at: Vec<Instant> = Vec::with_capacity(count as usize);
    let mut answered = vec![false; count as usize];
    let mut tally = BurstTally::default();

    let start = Instant::now();
    let deadline = start + settings.ping_timeout;

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }

        let sent = sent_at.len();
        let next_due = start + settings.packet_interval * sent as u32;

        if sent < count as usize {
            if now >= next_due {
                let sequence = first_sequence.wrapping_add(sent as u16);
                let packet = build_echo_request(ip, identifier, sequence, settings.packet_size);
                socket.send(&packet).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::PermissionDenied {
                        ProbeError::Network(format!("Permission denied: {}", e))
                    } else {
                        ProbeError::Network(format!("Failed to send: {}", e))
                    }
                })?;
                sent_at.push(Instant::now());
                tally.transmitted += 1;
                continue;
            }
        } else if tally.received == u32::from(count) {
            break;
        }

        let wake = if sent < count as usize {
            next_due.min(deadline)
        } else {
            deadline
        };
        let wait = wake.saturating_duration_since(Instant::now());
        if wait.is_zero() {
            continue;
        }

        socket
            .set_read_timeout(Some(wait))
            .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;

        let reply = match recv_echo_reply(&socket, ip)? {
            Some(reply) => reply,
            None => continue,
        };

        // The kernel rewrites the identifier on DGRAM sockets and already
        // demultiplexes replies per socket.
        if raw && reply.identifier != identifier {
            continue;
        }

        let index = reply.sequence.wrapping_sub(first_sequence) as usize;
        if index >= sent_at.len() {
            continue;
        }

        let rtt = reply.received_at.saturating_duration_since(sent_at[index]);
        tally.record_reply(reply.len, rtt, answered[index]);
        answered[index] = true;
    }

    tally.finish(settings.ping_timeout)
}

#[derive(Debug)]
struct EchoReply {
    identifier: u16,
    sequence: u16,
    /// Length of the ICMP message, IP header excluded.
    len: usize,
    received_at: Instant,
}

/// Receive one datagram. `None` when the read timed out or was not an echo reply.
fn recv_echo_reply(socket: &Socket, ip: IpAddr) -> Result<Option<EchoReply>, ProbeError> {
    let mut buf: [MaybeUninit<u8>; 2048] = unsafe { MaybeUninit::uninit().assume_init() };
    let len = match socket.recv(&mut buf) {
        Ok(len) => len,
        Err(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ) =>
        {
            return Ok(None)
        }
        Err(e) => return Err(ProbeError::Network(format!("Failed to receive: {}", e))),
    };
    let received_at = Instant::now();

    // SAFETY: recv initialized `len` bytes
    let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

    Ok(parse_echo_reply(buf, ip.is_ipv6(), received_at))
}

/// Decode an echo reply. IPv4 datagrams may carry the IP header in front
/// (RAW sockets, and DGRAM sockets on macOS); ICMPv6 never does.
fn parse_echo_reply(buf: &[u8], v6: bool, received_at: Instant) -> Option<EchoReply> {
    let offset = match buf.first() {
        Some(first) if !v6 && first >> 4 == 4 => usize::from(first & 0x0f) * 4,
        _ => 0,
    };

    let icmp = buf.get(offset..)?;
    if icmp.len() < 8 {
        return None;
    }

    // Echo Reply: type 0 for ICMP, 129 for ICMPv6
    let expected_type = if v6 { 129 } else { 0 };
    if icmp[0] != expected_type {
        return None;
    }

    Some(EchoReply {
        identifier: u16::from_be_bytes([icmp[4], icmp[5]]),
        sequence: u16::from_be_bytes([icmp[6], icmp[7]]),
        len: icmp.len(),
        received_at,
    })
}

/// Build an Echo Request (ICMP type 8, or ICMPv6 type 128) with
/// `payload_size` bytes of payload.
fn build_echo_request(ip: IpAddr, identifier: u16, sequence: u16, payload_size: usize) -> Vec<u8> {
    // Payload always has room for the send timestamp
    let mut packet = vec![0u8; 8 + payload_size.max(8)];

    packet[0] = if ip.is_ipv6() { 128 } else { 8 };
    packet[1] = 0; // Code: 0
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());
    for (i, byte) in packet[16..].iter_mut().enumerate() {
        *byte = (i % 256) as u8;
    }

    // ICMPv6 checksums are filled in by the kernel
    if ip.is_ipv4() {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    for chunk in data.chunks(2) {
        let word = match chunk {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            [hi] => u16::from_be_bytes([*hi, 0]),
            _ => 0,
        };
        sum += u32::from(word);
    }

    // Fold 32-bit sum to 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// Run the burst through the system `ping` command (fallback).
async fn run_ping_command(ip: IpAddr, settings: &ProbeSettings) -> Result<PingStats, ProbeError> {
    let count = settings.packet_count.max(1).to_string();
    let size = settings.packet_size.to_string();
    // Unprivileged ping refuses intervals below 0.2s
    let interval = format!("{:.1}", settings.packet_interval.as_secs_f64().max(0.2));
    let deadline = settings.ping_timeout.as_secs().max(1).to_string();
    let deadline_flag = if cfg!(target_os = "macos") { "-t" } else { "-w" };
    let program = if ip.is_ipv6() && cfg!(target_os = "macos") {
        "ping6"
    } else {
        "ping"
    };

    let child = Command::new(program)
        .args(["-n", "-c", count.as_str(), "-s", size.as_str(), "-i", interval.as_str()])
        .args([deadline_flag, deadline.as_str()])
        .arg(ip.to_string())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let grace = settings.ping_timeout + Duration::from_secs(2);
    let output = tokio::time::timeout(grace, child)
        .await
        .map_err(|_| ProbeError::Timeout(settings.ping_timeout))?
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    // ping exits non-zero on partial loss, so the output decides.
    let stdout = String::from_utf8_lossy(&output.stdout);
    match parse_ping_output(&stdout) {
        Ok(tally) => tally.finish(settings.ping_timeout),
        Err(e) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.trim().is_empty() {
                Err(e)
            } else {
                Err(ProbeError::Command(format!("ping failed: {}", stderr.trim())))
            }
        }
    }
}

/// A `ping` time field in milliseconds. `None` unless it is a finite,
/// non-negative number of a representable size.
fn parse_millis(ms: &str) -> Option<Duration> {
    let ms: f64 = ms.parse().ok()?;
    Duration::try_from_secs_f64(ms / 1000.0).ok()
}

/// Parse `ping` output into burst totals.
fn parse_ping_output(output: &str) -> Result<BurstTally, ProbeError> {
    // Per-reply line: "520 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.3 ms (DUP!)"
    static REPLY: OnceLock<Regex> = OnceLock::new();
    let reply_re = REPLY.get_or_init(|| {
        Regex::new(concat!(
            r"(?m)^(?P<bytes>\d+) bytes from .*?",
            r"time[=<](?P<ms>[0-9.]+)\s*ms(?P<dup>.*DUP!)?",
        ))
        .unwrap()
    });

    // "3 packets transmitted, 3 received" (Linux) / "3 packets received" (macOS)
    static SUMMARY: OnceLock<Regex> = OnceLock::new();
    let summary_re = SUMMARY.get_or_init(|| {
        Regex::new(r"(?P<tx>\d+) packets transmitted, (?P<rx>\d+) (?:packets )?received").unwrap()
    });

    // "rtt min/avg/max/mdev = ..." (Linux) / "round-trip min/avg/max/stddev = ..." (macOS)
    static AVG: OnceLock<Regex> = OnceLock::new();
    let avg_re = AVG.get_or_init(|| {
        Regex::new(concat!(
            r"(?:rtt|round-trip)\s+min/avg/max/(?:mdev|stddev)\s*=\s*",
            r"([0-9.]+)/([0-9.]+)/([0-9.]+)",
        ))
        .unwrap()
    });

    let summary = summary_re.captures(output).ok_or_else(|| {
        ProbeError::Command(format!("failed to parse ping output: {}", output))
    })?;

    let mut tally = BurstTally {
        transmitted: summary["tx"].parse().unwrap_or(0),
        ..BurstTally::default()
    };

    for caps in reply_re.captures_iter(output) {
        let bytes: usize = caps["bytes"].parse().unwrap_or(0);
        let Some(rtt) = parse_millis(&caps["ms"]) else {
            tracing::debug!("Skipping ping reply with unusable time {:?}", &caps["ms"]);
            continue;
        };
        tally.record_reply(bytes, rtt, caps.name("dup").is_some());
    }

    tally.reported_avg = avg_re
        .captures(output)
        .and_then(|caps| caps.get(2))
        .and_then(|avg| parse_millis(avg.as_str()));

    Ok(tally)
}

//! ICMP ping prober with native sockets (high-precision) and command fallback.
//!
//! Uses blocking sockets in spawn_blocking for sub-millisecond timing precision.

use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{ProbeError, ProbeSample, Prober};

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    /// Native ICMP sockets are available
    Native,
    /// Only command fallback is available
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

/// Echo sequence counter for unique identification
static ECHO_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Generate a unique identifier for each echo request.
/// This ensures concurrent probes can be distinguished even to the same
/// destination.
fn generate_echo_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = ECHO_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

/// Detect ICMP capability by attempting to create a socket.
fn detect_icmp_capability() -> IcmpCapability {
    // Try RAW socket first (requires CAP_NET_RAW or root)
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping prober: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }

    // Try DGRAM (unprivileged on Linux with ping_group_range set, or macOS)
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping prober: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }

    tracing::info!("Ping prober: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// ICMP echo prober.
///
/// Sends echo requests over native sockets where the host allows it and
/// falls back to the system `ping` command otherwise. Each echo becomes one
/// sample; a lost echo is an undelivered sample, not an error.
pub struct PingProber;

impl PingProber {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PingProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prober for PingProber {
    async fn send_probes(
        &self,
        address: &str,
        count: u32,
        timeout: Duration,
    ) -> Result<Vec<ProbeSample>, ProbeError> {
        let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

        if capability == IcmpCapability::Native {
            // Resolve before spawn_blocking (DNS is async)
            let ip = resolve_address(address).await?;

            match native_probes(ip, count, timeout).await {
                Ok(samples) => return Ok(samples),
                Err(e) if is_permission_error(&e) => {
                    tracing::warn!(
                        "Native ping lost permissions for {}, falling back to command: {}",
                        address,
                        e
                    );
                }
                Err(e) => return Err(e),
            }
        }

        command_probes(address, count, timeout).await
    }
}

/// Resolve hostname to IP address.
async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    // Try direct parse first
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    let addrs: Vec<_> = tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?
        .collect();

    addrs
        .into_iter()
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("No addresses found for {}", address)))
}

fn is_permission_error(e: &ProbeError) -> bool {
    let text = e.to_string();
    text.contains("Permission")
        || text.contains("Operation not permitted")
        || text.contains("denied")
}

/// Send `count` echoes over native sockets, one sample per echo.
async fn native_probes(
    ip: IpAddr,
    count: u32,
    timeout: Duration,
) -> Result<Vec<ProbeSample>, ProbeError> {
    let mut samples = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let sent_at = Utc::now();

        // Each echo runs blocking in a dedicated thread for precise timing.
        let outcome = tokio::task::spawn_blocking(move || run_blocking_echo(ip, timeout))
            .await
            .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

        match outcome {
            Ok(rtt) => samples.push(ProbeSample {
                sent_at,
                rtt: Some(rtt),
                delivered: true,
            }),
            Err(ProbeError::Timeout(_)) => samples.push(ProbeSample {
                sent_at,
                rtt: None,
                delivered: false,
            }),
            Err(e) => return Err(e),
        }
    }

    Ok(samples)
}

/// Run one blocking ICMP echo with precise timing.
/// This runs in a dedicated thread via spawn_blocking.
fn run_blocking_echo(ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
    match ip {
        IpAddr::V4(v4) => run_blocking_echo_v4(v4, timeout),
        IpAddr::V6(v6) => run_blocking_echo_v6(v6, timeout),
    }
}

/// ICMP Echo Request for IPv4
fn run_blocking_echo_v4(ip: Ipv4Addr, timeout: Duration) -> Result<Duration, ProbeError> {
    // Try RAW first (privileged), then DGRAM (unprivileged)
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
        .or_else(|_| Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)))
        .map_err(|e| ProbeError::Network(format!("Failed to create ICMP socket: {}", e)))?;

    socket
        .set_read_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;
    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;

    let dest = SocketAddr::new(IpAddr::V4(ip), 0);
    socket
        .connect(&dest.into())
        .map_err(|e| ProbeError::Network(format!("Failed to connect: {}", e)))?;

    let (identifier, sequence) = generate_echo_id();
    let packet = build_icmp_echo_request(identifier, sequence);

    // Start timing just before send
    let start = Instant::now();

    socket.send(&packet).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ProbeError::Network(format!("Permission denied: {}", e))
        } else {
            ProbeError::Network(format!("Failed to send: {}", e))
        }
    })?;

    // Receive reply - loop until we get OUR reply or timeout
    loop {
        let mut buf: [MaybeUninit<u8>; 1500] = unsafe { MaybeUninit::uninit().assume_init() };
        let len = socket.recv(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut
            {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::Network(format!("Failed to receive: {}", e))
            }
        })?;
        // SAFETY: recv initialized `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        // Stop timing immediately after receive
        let elapsed = start.elapsed();

        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        // Verify this is our echo reply.
        // For DGRAM sockets we get just the ICMP header; RAW includes the
        // IP header in front.
        if len >= 8 {
            let icmp_offset = if buf[0] >> 4 == 4 { 20 } else { 0 };
            if len > icmp_offset + 7 {
                let reply_type = buf[icmp_offset];
                let reply_id = u16::from_be_bytes([buf[icmp_offset + 4], buf[icmp_offset + 5]]);
                let reply_seq = u16::from_be_bytes([buf[icmp_offset + 6], buf[icmp_offset + 7]]);

                // ICMP type 0 = Echo Reply
                if reply_type == 0 && reply_id == identifier && reply_seq == sequence {
                    return Ok(elapsed);
                }
                // Wrong packet - continue waiting for the right one
            }
        }
    }
}

/// ICMP Echo Request for IPv6
fn run_blocking_echo_v6(ip: Ipv6Addr, timeout: Duration) -> Result<Duration, ProbeError> {
    let socket = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6))
        .or_else(|_| Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::ICMPV6)))
        .map_err(|e| ProbeError::Network(format!("Failed to create ICMPv6 socket: {}", e)))?;

    socket
        .set_read_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;
    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;

    let dest = SocketAddr::new(IpAddr::V6(ip), 0);
    socket
        .connect(&dest.into())
        .map_err(|e| ProbeError::Network(format!("Failed to connect: {}", e)))?;

    let (identifier, sequence) = generate_echo_id();
    let packet = build_icmpv6_echo_request(identifier, sequence);

    let start = Instant::now();

    socket.send(&packet).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ProbeError::Network(format!("Permission denied: {}", e))
        } else {
            ProbeError::Network(format!("Failed to send: {}", e))
        }
    })?;

    loop {
        let mut buf: [MaybeUninit<u8>; 1500] = unsafe { MaybeUninit::uninit().assume_init() };
        let len = socket.recv(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut
            {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::Network(format!("Failed to receive: {}", e))
            }
        })?;
        // SAFETY: recv initialized `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let elapsed = start.elapsed();

        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        // ICMPv6 type 129 = Echo Reply
        if len >= 8 {
            let reply_type = buf[0];
            let reply_id = u16::from_be_bytes([buf[4], buf[5]]);
            let reply_seq = u16::from_be_bytes([buf[6], buf[7]]);

            if reply_type == 129 && reply_id == identifier && reply_seq == sequence {
                return Ok(elapsed);
            }
        }
    }
}

/// Build an ICMP Echo Request packet (type 8, code 0).
fn build_icmp_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64]; // 8 byte header + 56 byte payload

    packet[0] = 8; // Type: Echo Request
    packet[1] = 0; // Code: 0
    // Checksum at [2..4], computed below
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());

    packet
}

/// Build an ICMPv6 Echo Request packet (type 128, code 0).
/// The checksum stays zero; the kernel fills it in for datagram sockets.
fn build_icmpv6_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];

    packet[0] = 128; // Type: Echo Request
    packet[1] = 0; // Code: 0
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;

    while i < data.len() - 1 {
        sum += u16::from_be_bytes([data[i], data[i + 1]]) as u32;
        i += 2;
    }

    // Handle odd byte
    if i < data.len() {
        sum += (data[i] as u32) << 8;
    }

    // Fold 32-bit sum to 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// Send echoes via the system ping command (fallback).
async fn command_probes(
    address: &str,
    count: u32,
    timeout: Duration,
) -> Result<Vec<ProbeSample>, ProbeError> {
    let timeout_secs = timeout.as_secs().max(1);
    let sent_at = Utc::now();

    let output = Command::new("ping")
        .args([
            "-c",
            &count.to_string(),
            "-W",
            &timeout_secs.to_string(),
            address,
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    // A non-zero exit just means lost packets; the missing replies become
    // undelivered samples below. Only an unspawnable process is an error.
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_reply_lines(&stdout, count, sent_at))
}

/// Turn per-packet reply lines into samples.
///
/// Delivered/lost counts come from the reply lines themselves, never from
/// the summary line. A reply whose time field does not parse still counts
/// as delivered, just without a round-trip time.
fn parse_reply_lines(output: &str, count: u32, sent_at: DateTime<Utc>) -> Vec<ProbeSample> {
    static REPLY: OnceLock<Regex> = OnceLock::new();
    let reply = REPLY.get_or_init(|| Regex::new(r"bytes from .*(?:icmp_seq|seq)[=:]\d+").unwrap());

    static TIME: OnceLock<Regex> = OnceLock::new();
    let time = TIME.get_or_init(|| Regex::new(r"time[=<](?P<val>[0-9.]+)\s*ms").unwrap());

    let mut samples = Vec::with_capacity(count as usize);

    for line in output.lines() {
        if !reply.is_match(line) {
            continue;
        }

        let rtt = time
            .captures(line)
            .and_then(|caps| caps.name("val"))
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .map(|ms| Duration::from_secs_f64(ms / 1000.0));

        samples.push(ProbeSample {
            sent_at,
            rtt,
            delivered: true,
        });
    }

    // Duplicate replies (DUP!) can exceed the request count
    samples.truncate(count as usize);

    while samples.len() < count as usize {
        samples.push(ProbeSample {
            sent_at,
            rtt: None,
            delivered: false,
        });
    }

    samples
}

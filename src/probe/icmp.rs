//! Native ICMP echo transport.
//!
//! Uses blocking sockets; the monitor loop runs each cycle in spawn_blocking.
//! A transport keeps one socket and one identifier for the lifetime of its
//! host monitor, and bumps the sequence number on every send.

use std::io::{self, ErrorKind};
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use super::{ProbeError, ProbeOutcome, ProbeParams, Transport};

const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_DEST_UNREACHABLE: u8 = 3;
const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_TIME_EXCEEDED: u8 = 11;

const ICMP_HEADER_LEN: usize = 8;
const MIN_IPV4_HEADER_LEN: usize = 20;
const RECV_BUFFER_LEN: usize = 1 << 16;

/// Kind of ICMP socket the platform let us open.
#[derive(Debug, Clone, Copy, PartialEq)]
enum SocketKind {
    /// RAW socket (CAP_NET_RAW or root). Replies include the IP header.
    Raw,
    /// DGRAM socket (unprivileged ping). The kernel owns the identifier.
    Datagram,
}

/// Source of incoming ICMP datagrams.
trait PacketSource {
    /// Wait up to `wait` for one datagram and its sender.
    fn recv_packet(&mut self, wait: Duration) -> io::Result<(&[u8], Option<Ipv4Addr>)>;
}

struct SocketReader {
    socket: Socket,
    buffer: Vec<MaybeUninit<u8>>,
}

impl PacketSource for SocketReader {
    fn recv_packet(&mut self, wait: Duration) -> io::Result<(&[u8], Option<Ipv4Addr>)> {
        self.socket.set_read_timeout(Some(wait))?;
        let (len, from) = self.socket.recv_from(&mut self.buffer)?;
        // SAFETY: recv_from initialized the first `len` bytes
        let buf: &[u8] =
            unsafe { std::slice::from_raw_parts(self.buffer.as_ptr() as *const u8, len) };
        Ok((buf, from.as_socket_ipv4().map(|addr| *addr.ip())))
    }
}

/// The request a reply has to answer.
#[derive(Debug, Clone, Copy)]
struct Pending {
    identifier: u16,
    sequence: u16,
    check_identifier: bool,
    sent_at: Instant,
    deadline: Instant,
    packet_len: usize,
    address: Ipv4Addr,
}

/// Read datagrams until the reply to `pending` shows up or its deadline
/// passes. Stale, foreign and malformed datagrams are skipped.
fn await_reply<S: PacketSource>(source: &mut S, pending: &Pending) -> ProbeOutcome {
    loop {
        let now = Instant::now();
        if now >= pending.deadline {
            return ProbeOutcome::timed_out();
        }
        let remaining = (pending.deadline - now).max(Duration::from_millis(1));

        let (buf, from) = match source.recv_packet(remaining) {
            Ok(received) => received,
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                continue
            }
            Err(e) => return ProbeOutcome::failure(format!("General failure: {}", e)),
        };
        let elapsed = pending.sent_at.elapsed();

        let Some(reply) = parse_reply(buf) else {
            continue;
        };
        if !reply_matches(
            &reply,
            pending.identifier,
            pending.sequence,
            pending.check_identifier,
        ) {
            continue;
        }

        let source = from.unwrap_or(pending.address);
        return describe_reply(&reply, source, pending.packet_len, elapsed);
    }
}

/// ICMP echo transport for a single target.
pub struct IcmpTransport {
    reader: SocketReader,
    kind: SocketKind,
    address: Ipv4Addr,
    identifier: u16,
    sequence: u16,
    packet_len: usize,
    timeout: Duration,
    sent_at: Option<Instant>,
}

impl IcmpTransport {
    /// Open an ICMP socket, RAW first and DGRAM as the unprivileged fallback.
    ///
    /// Failing both is a privilege problem the caller has to surface; it is
    /// never retried here.
    pub fn open(identifier: u16) -> Result<Self, ProbeError> {
        let (socket, kind) = match Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)) {
            Ok(socket) => (socket, SocketKind::Raw),
            Err(raw_err) => {
                match Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)) {
                    Ok(socket) => (socket, SocketKind::Datagram),
                    Err(_) => return Err(ProbeError::Privilege(raw_err.to_string())),
                }
            }
        };
        tracing::debug!(identifier, ?kind, "opened ICMP socket");

        Ok(Self {
            reader: SocketReader {
                socket,
                buffer: vec![MaybeUninit::uninit(); RECV_BUFFER_LEN],
            },
            kind,
            address: Ipv4Addr::UNSPECIFIED,
            identifier,
            sequence: 0,
            packet_len: 0,
            timeout: Duration::ZERO,
            sent_at: None,
        })
    }
}

impl Transport for IcmpTransport {
    fn set_address(&mut self, address: Ipv4Addr) {
        self.address = address;
    }

    fn send(&mut self, params: &ProbeParams) -> Result<(), ProbeError> {
        self.sequence = self.sequence.wrapping_add(1);
        let packet = build_echo_request(self.identifier, self.sequence, params.buffer_size);

        self.reader
            .socket
            .set_ttl(params.ttl)
            .map_err(|e| ProbeError::Network(format!("failed to set ttl: {}", e)))?;
        self.timeout = params.timeout;
        self.packet_len = packet.len();

        let dest = SockAddr::from(SocketAddrV4::new(self.address, 0));
        self.sent_at = Some(Instant::now());
        self.reader.socket.send_to(&packet, &dest).map_err(|e| {
            self.sent_at = None;
            if e.kind() == ErrorKind::PermissionDenied {
                ProbeError::Privilege(e.to_string())
            } else {
                ProbeError::Network(format!("failed to send: {}", e))
            }
        })?;
        Ok(())
    }

    fn receive(&mut self) -> ProbeOutcome {
        let Some(sent_at) = self.sent_at.take() else {
            return ProbeOutcome::failure("General failure.");
        };
        let pending = Pending {
            identifier: self.identifier,
            sequence: self.sequence,
            // DGRAM sockets get their identifier rewritten by the kernel, which
            // also demultiplexes replies per socket.
            check_identifier: self.kind == SocketKind::Raw,
            sent_at,
            deadline: sent_at + self.timeout,
            packet_len: self.packet_len,
            address: self.address,
        };
        await_reply(&mut self.reader, &pending)
    }
}

/// The fields of an incoming ICMP message that matter for matching.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Reply {
    pub icmp_type: u8,
    pub identifier: u16,
    pub sequence: u16,
    pub ttl: Option<u8>,
}

/// Build an ICMP Echo Request packet (type 8, code 0) with `payload_len`
/// bytes of `i % 256` filler.
pub fn build_echo_request(identifier: u16, sequence: u16, payload_len: usize) -> Vec<u8> {
    let mut packet = vec![0u8; ICMP_HEADER_LEN + payload_len];

    packet[0] = ICMP_ECHO_REQUEST;
    packet[1] = 0;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    for (i, byte) in packet[ICMP_HEADER_LEN..].iter_mut().enumerate() {
        *byte = (i % 256) as u8;
    }

    let checksum = internet_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());

    packet
}

/// Compute the Internet checksum (RFC 1071).
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            &[hi, lo] => u32::from(u16::from_be_bytes([hi, lo])),
            &[hi] => u32::from(hi) << 8,
            _ => 0,
        })
        .fold(0u32, |acc, word| acc.wrapping_add(word));

    // Fold 32-bit sum to 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

/// Strip a leading IPv4 header if present, returning the payload and the
/// header's TTL.
fn strip_ip_header(buf: &[u8]) -> Option<(&[u8], Option<u8>)> {
    let first = *buf.first()?;
    if first >> 4 != 4 {
        return Some((buf, None));
    }
    let header_len = usize::from(first & 0x0f) * 4;
    if header_len < MIN_IPV4_HEADER_LEN || buf.len() < header_len {
        return None;
    }
    Some((&buf[header_len..], Some(buf[8])))
}

/// Parse an incoming datagram. Returns `None` for anything malformed or for
/// our own echo requests looped back on a raw socket.
///
/// Error messages (unreachable, time exceeded) quote the original datagram;
/// identifier and sequence are taken from the quoted echo header.
pub(crate) fn parse_reply(buf: &[u8]) -> Option<Reply> {
    let (icmp, ttl) = strip_ip_header(buf)?;
    if icmp.len() < ICMP_HEADER_LEN {
        return None;
    }

    let icmp_type = icmp[0];
    let echo = match icmp_type {
        ICMP_ECHO_REQUEST => return None,
        ICMP_DEST_UNREACHABLE | ICMP_TIME_EXCEEDED => {
            let (quoted, _) = strip_ip_header(&icmp[ICMP_HEADER_LEN..])?;
            if quoted.len() < ICMP_HEADER_LEN || quoted[0] != ICMP_ECHO_REQUEST {
                return None;
            }
            quoted
        }
        _ => icmp,
    };

    Some(Reply {
        icmp_type,
        identifier: u16::from_be_bytes([echo[4], echo[5]]),
        sequence: u16::from_be_bytes([echo[6], echo[7]]),
        ttl,
    })
}

/// Whether `reply` answers the request identified by `identifier`/`sequence`.
pub(crate) fn reply_matches(
    reply: &Reply,
    identifier: u16,
    sequence: u16,
    check_identifier: bool,
) -> bool {
    reply.sequence == sequence && (!check_identifier || reply.identifier == identifier)
}

fn elapsed_ms(elapsed: Duration) -> u32 {
    u32::try_from(elapsed.as_millis()).unwrap_or(u32::MAX).max(1)
}

/// Turn a matched reply into an outcome.
pub(crate) fn describe_reply(
    reply: &Reply,
    source: Ipv4Addr,
    packet_len: usize,
    elapsed: Duration,
) -> ProbeOutcome {
    match reply.icmp_type {
        ICMP_ECHO_REPLY => {
            let rtt = elapsed_ms(elapsed);
            let ttl = reply
                .ttl
                .map(|ttl| format!(" TTL={}", ttl))
                .unwrap_or_default();
            ProbeOutcome::reply(
                rtt,
                format!("Reply from {}: bytes={} time={}ms{}", source, packet_len, rtt, ttl),
            )
        }
        ICMP_DEST_UNREACHABLE => {
            ProbeOutcome::failure(format!("Reply from {}: Destination host unreachable.", source))
        }
        ICMP_TIME_EXCEEDED => {
            ProbeOutcome::failure(format!("Reply from {}: TTL expired in transit.", source))
        }
        _ => ProbeOutcome::failure("Unknown response."),
    }
}

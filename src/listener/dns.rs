//! Authoritative DNS listener over UDP and TCP
//!
//! Queries for names under a live zone are answered from the parent
//! domain's public addresses, or from a matching rule, and recorded. The
//! bare domain apex answers the same way without being recorded. Anything
//! else gets NXDOMAIN.

use async_trait::async_trait;
use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, CNAME, MX, NS, PTR, TXT};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, info};

use super::{Capture, CaptureContext, Listener};
use crate::error::{Result, VigilError};
use crate::models::{DnsQuery, DnsResponse, Domain, ParsedProbe, Probe, ProbeResponse, Protocol, Rcode};
use crate::registry::normalize_name;

const HEADER_LEN: usize = 12;
const MAX_UDP_QUERY: usize = 4096;

/// Largest UDP response to a client that sent no EDNS record
pub const UDP_MAX_RESPONSE: usize = 512;

/// UDP payload size advertised to EDNS clients, and the most we ever send
pub const EDNS_MAX_PAYLOAD: u16 = 4096;

const TCP_MAX_RESPONSE: usize = u16::MAX as usize;

/// Default answer TTL in seconds
pub const DEFAULT_TTL: u32 = 60;

/// Mnemonic of a record type, `TYPE<n>` when unknown
pub fn type_name(code: u16) -> String {
    match RecordType::from(code) {
        RecordType::Unknown(_) => format!("TYPE{code}"),
        known => known.to_string(),
    }
}

/// Transport a query arrived on; bounds the reply size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

/// A query plus the question and EDNS size it was decoded with
#[derive(Debug, Clone)]
pub struct ParsedQuery {
    pub query: DnsQuery,
    question: Query,
    edns_payload: Option<u16>,
}

impl ParsedQuery {
    /// Largest UDP reply the client accepts
    pub fn udp_limit(&self) -> usize {
        self.edns_payload.map_or(UDP_MAX_RESPONSE, |size| {
            usize::from(size.clamp(UDP_MAX_RESPONSE as u16, EDNS_MAX_PAYLOAD))
        })
    }
}

fn malformed(reason: impl std::fmt::Display) -> VigilError {
    VigilError::MalformedInput(format!("DNS: {reason}"))
}

/// Decodes a standard query and keeps its first question
pub fn parse_query(packet: &[u8]) -> Result<ParsedQuery> {
    if packet.len() < HEADER_LEN {
        return Err(malformed("packet shorter than header"));
    }
    let message = Message::from_vec(packet).map_err(malformed)?;
    if message.message_type() != MessageType::Query {
        return Err(malformed("not a query"));
    }
    if message.op_code() != OpCode::Query {
        return Err(malformed("unsupported opcode"));
    }
    let question = message
        .queries()
        .first()
        .cloned()
        .ok_or_else(|| malformed("no question"))?;

    let qtype_code = u16::from(question.query_type());
    let name = question.name().to_ascii();
    Ok(ParsedQuery {
        query: DnsQuery {
            id: message.id(),
            name: name.trim_end_matches('.').to_string(),
            qtype: type_name(qtype_code),
            qtype_code,
            qclass: u16::from(question.query_class()),
            recursion_desired: message.recursion_desired(),
        },
        edns_payload: message.extensions().as_ref().map(Edns::max_payload),
        question,
    })
}

/// A reply on the wire and the answer values it carries
#[derive(Debug, Clone)]
pub struct EncodedResponse {
    pub wire: Vec<u8>,
    pub answers: Vec<String>,
    pub truncated: bool,
}

/// Encodes a response to `parsed`
///
/// Answers that cannot be expressed as the queried type are skipped. When
/// the message would exceed `max_len` the answers are dropped and TC is set.
pub fn build_response(
    parsed: &ParsedQuery,
    response: &DnsResponse,
    authoritative: bool,
    max_len: usize,
) -> Result<EncodedResponse> {
    let qtype = parsed.question.query_type();
    let owner = parsed.question.name().clone();

    let mut message = Message::new();
    message
        .set_id(parsed.query.id)
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_authoritative(authoritative)
        .set_recursion_desired(parsed.query.recursion_desired)
        .set_recursion_available(false)
        .set_response_code(response_code(response.rcode))
        .add_query(parsed.question.clone());
    if parsed.edns_payload.is_some() {
        let mut edns = Edns::new();
        edns.set_max_payload(EDNS_MAX_PAYLOAD);
        message.set_edns(edns);
    }

    let mut answers = Vec::new();
    if response.rcode == Rcode::NoError {
        for value in &response.answers {
            match answer_rdata(qtype, value) {
                Some(rdata) => {
                    message.add_answer(Record::from_rdata(owner.clone(), response.ttl, rdata));
                    answers.push(value.trim().to_string());
                }
                None => debug!("Skipping answer '{}' for {} query", value, parsed.query.qtype),
            }
        }
    }

    let wire = encode(&message)?;
    if wire.len() <= max_len {
        return Ok(EncodedResponse {
            wire,
            answers,
            truncated: false,
        });
    }

    message.take_answers();
    message.set_truncated(true);
    Ok(EncodedResponse {
        wire: encode(&message)?,
        answers: Vec::new(),
        truncated: true,
    })
}

fn encode(message: &Message) -> Result<Vec<u8>> {
    message
        .to_vec()
        .map_err(|e| VigilError::ListenerError(format!("cannot encode DNS reply: {e}")))
}

fn response_code(rcode: Rcode) -> ResponseCode {
    match rcode {
        Rcode::NoError => ResponseCode::NoError,
        Rcode::ServFail => ResponseCode::ServFail,
        Rcode::NxDomain => ResponseCode::NXDomain,
        Rcode::Refused => ResponseCode::Refused,
    }
}

/// Record data for one presentation-format answer, if it fits the type
fn answer_rdata(qtype: RecordType, value: &str) -> Option<RData> {
    let value = value.trim();
    match qtype {
        RecordType::A => value.parse::<Ipv4Addr>().ok().map(|ip| RData::A(A::from(ip))),
        RecordType::AAAA => value
            .parse::<Ipv6Addr>()
            .ok()
            .map(|ip| RData::AAAA(AAAA::from(ip))),
        RecordType::TXT => Some(RData::TXT(txt_rdata(value))),
        RecordType::CNAME => target_name(value).map(|n| RData::CNAME(CNAME(n))),
        RecordType::NS => target_name(value).map(|n| RData::NS(NS(n))),
        RecordType::PTR => target_name(value).map(|n| RData::PTR(PTR(n))),
        RecordType::MX => {
            let (preference, host) = match value.split_once(char::is_whitespace) {
                Some((pref, host)) => (pref.parse::<u16>().ok()?, host.trim()),
                None => (10, value),
            };
            Some(RData::MX(MX::new(preference, target_name(host)?)))
        }
        _ => None,
    }
}

/// Splits text into 255-byte character strings
fn txt_rdata(value: &str) -> TXT {
    let bytes = value.as_bytes();
    if bytes.is_empty() {
        return TXT::from_bytes(vec![&b""[..]]);
    }
    TXT::from_bytes(bytes.chunks(255).collect())
}

fn target_name(value: &str) -> Option<Name> {
    let value = value.trim_end_matches('.');
    Name::from_ascii(format!("{value}.")).ok()
}

/// A/AAAA answers from the domain's public addresses; NODATA for other types
pub fn default_answer(query: &DnsQuery, domain: &Domain, ttl: u32) -> DnsResponse {
    let qtype = RecordType::from(query.qtype_code);
    let answers = domain
        .public_ips
        .iter()
        .filter(|ip| {
            matches!(
                (qtype, ip),
                (RecordType::A, IpAddr::V4(_)) | (RecordType::AAAA, IpAddr::V6(_))
            )
        })
        .map(ToString::to_string)
        .collect();
    DnsResponse {
        rcode: Rcode::NoError,
        ttl,
        answers,
    }
}

fn nxdomain(ttl: u32) -> DnsResponse {
    DnsResponse {
        rcode: Rcode::NxDomain,
        ttl,
        answers: Vec::new(),
    }
}

/// Answers one raw query; `None` means the packet is dropped unanswered
///
/// The recorded response carries only the answers that were encoded.
pub fn answer_query(
    ctx: &CaptureContext,
    packet: &[u8],
    remote: SocketAddr,
    ttl: u32,
    transport: Transport,
) -> Option<(Vec<u8>, Option<Capture>)> {
    let parsed = match parse_query(packet) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!("Dropping packet from {}: {}", remote, e);
            return None;
        }
    };
    let max_len = match transport {
        Transport::Udp => parsed.udp_limit(),
        Transport::Tcp => TCP_MAX_RESPONSE,
    };
    let hostname = normalize_name(&parsed.query.name);

    if let Some(zone) = ctx.resolve(&hostname) {
        debug!(
            "DNS {} {} from {} (zone {})",
            parsed.query.qtype, hostname, remote, zone.zone.fqdn
        );
        let default = ProbeResponse::Dns(default_answer(&parsed.query, &zone.domain, ttl));
        let probe = ParsedProbe::new(hostname, remote, Probe::Dns(parsed.query.clone()));
        let (mut response, matched) = ctx.respond(&zone, &probe.payload, default);
        let encoded = match &response {
            ProbeResponse::Dns(dns) => build_response(&parsed, dns, true, max_len),
            _ => build_response(&parsed, &nxdomain(ttl), true, max_len),
        };
        let encoded = match encoded {
            Ok(encoded) => encoded,
            Err(e) => {
                debug!("Dropping reply to {}: {}", remote, e);
                return None;
            }
        };
        if let ProbeResponse::Dns(dns) = &mut response {
            dns.answers = encoded.answers;
        }
        let capture = Capture {
            zone,
            probe,
            response,
            matched,
        };
        return Some((encoded.wire, Some(capture)));
    }

    let domain = ctx.registry.domain_for(&hostname);
    let answer = match &domain {
        Some(d) if d.domain == hostname => default_answer(&parsed.query, d, ttl),
        _ => nxdomain(ttl),
    };
    match build_response(&parsed, &answer, domain.is_some(), max_len) {
        Ok(encoded) => Some((encoded.wire, None)),
        Err(e) => {
            debug!("Dropping reply to {}: {}", remote, e);
            None
        }
    }
}

/// DNS over UDP, one task per datagram
pub struct DnsUdpListener {
    socket: Arc<UdpSocket>,
    addr: SocketAddr,
    ctx: Arc<CaptureContext>,
    ttl: u32,
}

impl DnsUdpListener {
    pub async fn bind(addr: SocketAddr, ctx: Arc<CaptureContext>, ttl: u32) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await.map_err(|e| {
            VigilError::ListenerError(format!("cannot bind DNS/UDP on {addr}: {e}"))
        })?;
        Self::from_socket(socket, ctx, ttl)
    }

    pub fn from_socket(socket: UdpSocket, ctx: Arc<CaptureContext>, ttl: u32) -> Result<Self> {
        let addr = socket.local_addr()?;
        Ok(Self {
            socket: Arc::new(socket),
            addr,
            ctx,
            ttl,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl Listener for DnsUdpListener {
    fn name(&self) -> String {
        format!("dns/udp {}", self.addr)
    }

    fn protocol(&self) -> Protocol {
        Protocol::Dns
    }

    async fn run(&self) -> Result<()> {
        info!("DNS listening on udp://{}", self.addr);
        let mut buf = vec![0u8; MAX_UDP_QUERY];

        loop {
            let (len, remote) = match self.socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    debug!("DNS recv error: {}", e);
                    continue;
                }
            };
            let Some(permit) = self.ctx.limiter.try_acquire(remote.ip()) else {
                continue;
            };

            let packet = buf[..len].to_vec();
            let socket = Arc::clone(&self.socket);
            let ctx = Arc::clone(&self.ctx);
            let ttl = self.ttl;
            tokio::spawn(async move {
                let _permit = permit;
                let Some((reply, capture)) =
                    answer_query(&ctx, &packet, remote, ttl, Transport::Udp)
                else {
                    return;
                };
                if let Err(e) = socket.send_to(&reply, remote).await {
                    debug!("DNS send to {} failed: {}", remote, e);
                }
                if let Some(capture) = capture {
                    ctx.record(capture).await;
                }
            });
        }
    }
}

/// DNS over TCP with two-byte length framing
pub struct DnsTcpListener {
    listener: TcpListener,
    addr: SocketAddr,
    ctx: Arc<CaptureContext>,
    ttl: u32,
}

impl DnsTcpListener {
    pub async fn bind(addr: SocketAddr, ctx: Arc<CaptureContext>, ttl: u32) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            VigilError::ListenerError(format!("cannot bind DNS/TCP on {addr}: {e}"))
        })?;
        Self::from_listener(listener, ctx, ttl)
    }

    pub fn from_listener(
        listener: TcpListener,
        ctx: Arc<CaptureContext>,
        ttl: u32,
    ) -> Result<Self> {
        let addr = listener.local_addr()?;
        Ok(Self {
            listener,
            addr,
            ctx,
            ttl,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl Listener for DnsTcpListener {
    fn name(&self) -> String {
        format!("dns/tcp {}", self.addr)
    }

    fn protocol(&self) -> Protocol {
        Protocol::Dns
    }

    async fn run(&self) -> Result<()> {
        info!("DNS listening on tcp://{}", self.addr);

        loop {
            let (stream, remote) = match self.listener.accept().await {
                Ok(r) => r,
                Err(e) => {
                    debug!("DNS accept error: {}", e);
                    continue;
                }
            };
            let Some(permit) = self.ctx.limiter.try_acquire(remote.ip()) else {
                continue;
            };

            let ctx = Arc::clone(&self.ctx);
            let ttl = self.ttl;
            tokio::spawn(async move {
                let _permit = permit;
                let session = serve_tcp_connection(stream, remote, &ctx, ttl);
                match timeout(ctx.limits.max_session, session).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("DNS/TCP connection from {} failed: {}", remote, e),
                    Err(_) => debug!("DNS/TCP connection from {} hit the session cap", remote),
                }
            });
        }
    }
}

async fn serve_tcp_connection(
    mut stream: TcpStream,
    remote: SocketAddr,
    ctx: &CaptureContext,
    ttl: u32,
) -> Result<()> {
    let idle = ctx.limits.idle_timeout;
    loop {
        let len = match timeout(idle, stream.read_u16()).await {
            Err(_) => return Ok(()),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(len)) => len as usize,
        };
        if len < HEADER_LEN {
            return Ok(());
        }

        let mut packet = vec![0u8; len];
        timeout(idle, stream.read_exact(&mut packet))
            .await
            .map_err(|_| VigilError::ListenerError("timed out reading DNS/TCP message".into()))??;

        let Some((reply, capture)) = answer_query(ctx, &packet, remote, ttl, Transport::Tcp)
        else {
            return Ok(());
        };
        let mut framed = Vec::with_capacity(reply.len() + 2);
        framed.extend_from_slice(&(reply.len() as u16).to_be_bytes());
        framed.extend(reply);
        stream.write_all(&framed).await?;

        if let Some(capture) = capture {
            ctx.record(capture).await;
        }
    }
}

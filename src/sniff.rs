//! Protocol sniffers.
//!
//! Each sniffer is a pure function over the bytes seen so far. It answers
//! [`SniffResult::NeedMoreData`] while the input is a plausible but
//! incomplete prefix, so the caller can read more before giving up.
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::BytesMut;
use log::*;
use serde::*;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::model::{is_domain_name, normalize_domain};

pub const PROTOCOL_HTTP: &str = "http";
pub const PROTOCOL_TLS: &str = "tls";
pub const PROTOCOL_DNS: &str = "dns";
pub const PROTOCOL_QUIC: &str = "quic";

/// Ports whose server talks first; there is nothing to sniff.
pub const SERVER_FIRST_PORTS: [u16; 11] = [21, 22, 25, 110, 143, 465, 587, 993, 995, 3306, 5432];

/// Timeout for sniff actions that do not name one.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_millis(300);

/// upper bound of bytes buffered while sniffing a stream
const MAX_PEEK_SIZE: usize = 16 * 1024 + 5;
const READ_CHUNK: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sniffed {
    pub protocol: &'static str,
    pub domain: Option<String>,
    pub client: Option<String>,
}

impl Sniffed {
    fn new(protocol: &'static str) -> Self {
        Self {
            protocol,
            domain: None,
            client: None,
        }
    }

    pub fn apply(self, metadata: &mut Metadata) {
        metadata.protocol = Some(self.protocol.to_owned());
        if self.domain.is_some() {
            metadata.domain = self.domain;
        }
        if self.client.is_some() {
            metadata.client = self.client;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniffResult {
    Matched(Sniffed),
    NeedMoreData,
    NoMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamSniffer {
    Http,
    Tls,
    Dns,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketSniffer {
    Dns,
}

impl StreamSniffer {
    pub const ALL: [StreamSniffer; 3] = [StreamSniffer::Http, StreamSniffer::Tls, StreamSniffer::Dns];

    pub fn sniff(&self, data: &[u8]) -> SniffResult {
        match self {
            StreamSniffer::Http => sniff_http(data),
            StreamSniffer::Tls => sniff_tls(data),
            StreamSniffer::Dns => sniff_dns_stream(data),
        }
    }
}

impl PacketSniffer {
    pub const ALL: [PacketSniffer; 1] = [PacketSniffer::Dns];

    pub fn sniff(&self, packet: &[u8]) -> SniffResult {
        match self {
            PacketSniffer::Dns => sniff_dns_packet(packet),
        }
    }
}

impl fmt::Display for StreamSniffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StreamSniffer::Http => write!(f, "{}", PROTOCOL_HTTP),
            StreamSniffer::Tls => write!(f, "{}", PROTOCOL_TLS),
            StreamSniffer::Dns => write!(f, "{}", PROTOCOL_DNS),
        }
    }
}

impl FromStr for StreamSniffer {
    type Err = ();
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            PROTOCOL_HTTP => Ok(StreamSniffer::Http),
            PROTOCOL_TLS => Ok(StreamSniffer::Tls),
            PROTOCOL_DNS => Ok(StreamSniffer::Dns),
            _ => Err(()),
        }
    }
}

impl FromStr for PacketSniffer {
    type Err = ();
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            PROTOCOL_DNS => Ok(PacketSniffer::Dns),
            _ => Err(()),
        }
    }
}

/// Splits configured sniffer names into the stream and packet sets.
/// No names selects every sniffer.
pub fn parse_sniffers(names: &[String]) -> Result<(Vec<StreamSniffer>, Vec<PacketSniffer>)> {
    if names.is_empty() {
        return Ok((StreamSniffer::ALL.to_vec(), PacketSniffer::ALL.to_vec()));
    }
    let mut stream = vec![];
    let mut packet = vec![];
    for name in names {
        let as_stream = name.parse::<StreamSniffer>().ok();
        let as_packet = name.parse::<PacketSniffer>().ok();
        if as_stream.is_none() && as_packet.is_none() {
            return Err(Error::config_fmt(format_args!("unknown sniffer: {}", name)));
        }
        stream.extend(as_stream);
        packet.extend(as_packet);
    }
    Ok((stream, packet))
}

/// Whether sniffing is pointless for this flow.
pub fn skip(metadata: &Metadata) -> bool {
    metadata.protocol.is_some() || SERVER_FIRST_PORTS.contains(&metadata.destination.port())
}

pub fn sniff_stream(data: &[u8], sniffers: &[StreamSniffer]) -> SniffResult {
    let mut need_more = false;
    for sniffer in sniffers {
        match sniffer.sniff(data) {
            SniffResult::Matched(sniffed) => return SniffResult::Matched(sniffed),
            SniffResult::NeedMoreData => need_more = true,
            SniffResult::NoMatch => {}
        }
    }
    if need_more {
        SniffResult::NeedMoreData
    } else {
        SniffResult::NoMatch
    }
}

pub fn sniff_packet(packet: &[u8], sniffers: &[PacketSniffer]) -> SniffResult {
    let mut need_more = false;
    for sniffer in sniffers {
        match sniffer.sniff(packet) {
            SniffResult::Matched(sniffed) => return SniffResult::Matched(sniffed),
            SniffResult::NeedMoreData => need_more = true,
            SniffResult::NoMatch => {}
        }
    }
    if need_more {
        SniffResult::NeedMoreData
    } else {
        SniffResult::NoMatch
    }
}

/// Reads from `strm` into `buffer` until a sniffer decides or `timeout`
/// elapses. Everything read stays in `buffer` for replay.
pub async fn peek_stream<R>(
    strm: &mut R,
    buffer: &mut BytesMut,
    timeout: Duration,
    sniffers: &[StreamSniffer],
) -> Option<Sniffed>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if buffer.len() >= MAX_PEEK_SIZE {
            return None;
        }
        buffer.reserve(READ_CHUNK);
        match tokio::time::timeout_at(deadline, strm.read_buf(buffer)).await {
            Err(_) => {
                trace!("sniff timed out after {} bytes", buffer.len());
                return None;
            }
            Ok(Err(err)) => {
                debug!("read while sniffing: {}", err);
                return None;
            }
            Ok(Ok(0)) => return None,
            Ok(Ok(_)) => {}
        }
        match sniff_stream(buffer, sniffers) {
            SniffResult::Matched(sniffed) => return Some(sniffed),
            SniffResult::NoMatch => return None,
            SniffResult::NeedMoreData => {}
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.buf.len() < n {
            return None;
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        self.take(3)
            .map(|b| (b[0] as usize) << 16 | (b[1] as usize) << 8 | b[2] as usize)
    }

    fn vec8(&mut self) -> Option<&'a [u8]> {
        let n = self.u8()? as usize;
        self.take(n)
    }

    fn vec16(&mut self) -> Option<&'a [u8]> {
        let n = self.u16()? as usize;
        self.take(n)
    }
}

/// Host header or SNI value to a domain; ip literals yield nothing.
fn host_to_domain(host: &str) -> Option<String> {
    if host.starts_with('[') {
        return None;
    }
    let host = match host.rsplit_once(':') {
        Some((name, port)) if port.parse::<u16>().is_ok() => name,
        _ => host,
    };
    if is_domain_name(host) {
        Some(normalize_domain(host))
    } else {
        None
    }
}

const HTTP_METHODS: [&str; 9] = [
    "GET", "POST", "HEAD", "PUT", "DELETE", "OPTIONS", "CONNECT", "PATCH", "TRACE",
];

fn sniff_http(data: &[u8]) -> SniffResult {
    match data.iter().position(|b| *b == b' ') {
        None => {
            let prefix = HTTP_METHODS.iter().any(|m| m.as_bytes().starts_with(data));
            return if prefix {
                SniffResult::NeedMoreData
            } else {
                SniffResult::NoMatch
            };
        }
        Some(n) => {
            if !HTTP_METHODS.iter().any(|m| m.as_bytes() == &data[..n]) {
                return SniffResult::NoMatch;
            }
        }
    }

    let head_end = data.windows(4).position(|w| w == b"\r\n\r\n");
    let head = String::from_utf8_lossy(&data[..head_end.unwrap_or(data.len())]);
    let mut lines: Vec<&str> = head.split("\r\n").collect();
    if head_end.is_none() {
        // last line may be cut short
        lines.pop();
    }
    let mut lines = lines.into_iter();
    let request_line = match lines.next() {
        Some(line) => line,
        None => return SniffResult::NeedMoreData,
    };
    match request_line.rsplit(' ').next() {
        Some(version) if version.starts_with("HTTP/1.") => {}
        _ => return SniffResult::NoMatch,
    }
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("host") {
                return SniffResult::Matched(Sniffed {
                    domain: host_to_domain(value.trim()),
                    ..Sniffed::new(PROTOCOL_HTTP)
                });
            }
        }
    }
    if head_end.is_some() {
        SniffResult::Matched(Sniffed::new(PROTOCOL_HTTP))
    } else {
        SniffResult::NeedMoreData
    }
}

const TLS_CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const TLS_HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const TLS_MAX_RECORD: usize = 16 * 1024;
const TLS_EXT_SERVER_NAME: u16 = 0;

fn sniff_tls(data: &[u8]) -> SniffResult {
    match data.first() {
        None => return SniffResult::NeedMoreData,
        Some(&TLS_CONTENT_TYPE_HANDSHAKE) => {}
        Some(_) => return SniffResult::NoMatch,
    }
    if data.len() < 5 {
        return SniffResult::NeedMoreData;
    }
    if data[1] != 0x03 {
        return SniffResult::NoMatch;
    }
    let record_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    if record_len > TLS_MAX_RECORD {
        return SniffResult::NoMatch;
    }
    if data.len() < 5 + record_len {
        return SniffResult::NeedMoreData;
    }
    match parse_client_hello(&data[5..5 + record_len]) {
        Some(server_name) => SniffResult::Matched(Sniffed {
            domain: server_name,
            ..Sniffed::new(PROTOCOL_TLS)
        }),
        None => SniffResult::NoMatch,
    }
}

/// `Some(server_name)` for a well-formed ClientHello
fn parse_client_hello(fragment: &[u8]) -> Option<Option<String>> {
    let mut r = Reader::new(fragment);
    if r.u8()? != TLS_HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    let len = r.u24()?;
    let mut hello = Reader::new(r.take(len)?);
    // version, random
    hello.take(2 + 32)?;
    // session id, cipher suites, compression methods
    hello.vec8()?;
    hello.vec16()?;
    hello.vec8()?;
    if hello.is_empty() {
        return Some(None);
    }
    let mut exts = Reader::new(hello.vec16()?);
    while !exts.is_empty() {
        let kind = exts.u16()?;
        let body = exts.vec16()?;
        if kind != TLS_EXT_SERVER_NAME {
            continue;
        }
        let mut names = Reader::new(Reader::new(body).vec16()?);
        while !names.is_empty() {
            let name_type = names.u8()?;
            let name = names.vec16()?;
            if name_type == 0 {
                let name = std::str::from_utf8(name).ok()?;
                return Some(host_to_domain(name));
            }
        }
    }
    Some(None)
}

const DNS_MAX_TCP_MESSAGE: usize = 4096;

/// Whether `msg` starts like a standard DNS query.
fn is_dns_query(msg: &[u8]) -> bool {
    let mut r = Reader::new(msg);
    let header = match r.take(12) {
        Some(header) => header,
        None => return false,
    };
    let flags = u16::from_be_bytes([header[2], header[3]]);
    let qdcount = u16::from_be_bytes([header[4], header[5]]);
    // QR must be 0 and OPCODE standard query
    if flags & 0x8000 != 0 || (flags >> 11) & 0x0f != 0 || qdcount == 0 {
        return false;
    }
    loop {
        let label = match r.u8() {
            Some(label) => label as usize,
            None => return false,
        };
        if label == 0 {
            break;
        }
        if label & 0xc0 != 0 || r.take(label).is_none() {
            return false;
        }
    }
    // qtype, qclass
    r.take(4).is_some()
}

fn sniff_dns_stream(data: &[u8]) -> SniffResult {
    if data.len() < 2 {
        return SniffResult::NeedMoreData;
    }
    let msg_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if msg_len < 12 || msg_len > DNS_MAX_TCP_MESSAGE {
        return SniffResult::NoMatch;
    }
    if data.len() < 2 + msg_len {
        if data.len() >= 2 + 4 {
            let flags = u16::from_be_bytes([data[4], data[5]]);
            if flags & 0x8000 != 0 {
                return SniffResult::NoMatch;
            }
        }
        return SniffResult::NeedMoreData;
    }
    if is_dns_query(&data[2..2 + msg_len]) {
        SniffResult::Matched(Sniffed::new(PROTOCOL_DNS))
    } else {
        SniffResult::NoMatch
    }
}

fn sniff_dns_packet(packet: &[u8]) -> SniffResult {
    if is_dns_query(packet) {
        SniffResult::Matched(Sniffed::new(PROTOCOL_DNS))
    } else {
        SniffResult::NoMatch
    }
}

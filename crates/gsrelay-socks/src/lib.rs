//! Server-side SOCKS4/4a/5 handshake parser.
//!
//! The relay feeds inbound rendezvous bytes into [`SocksParser::advance`]
//! until it yields a connect target. The parser never performs IO itself;
//! it reports how many input bytes it consumed and which reply bytes the
//! caller should send back to the client. Replies are generated
//! optimistically, before the outbound connect finishes.
//!
//! Only the CONNECT command is supported; BIND and UDP-associate are
//! protocol errors here.

use std::net::{Ipv4Addr, ToSocketAddrs};

use thiserror::Error;
use tracing::debug;

const SOCKS4_VERSION: u8 = 4;
const SOCKS5_VERSION: u8 = 5;
const CMD_CONNECT: u8 = 1;
const ATYP_IPV4: u8 = 1;
const ATYP_DOMAIN: u8 = 3;
const METHOD_NO_AUTH: u8 = 0;
/// Longest null-terminated field (user id / 4a hostname) we will scan for.
const MAX_FIELD: usize = 512;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SocksError {
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
    #[error("client offers no acceptable auth method")]
    NoAcceptableAuth,
    #[error("unsupported command {0}")]
    UnsupportedCommand(u8),
    #[error("unsupported address type {0}")]
    UnsupportedAddressType(u8),
    #[error("handshake field exceeds {MAX_FIELD} bytes")]
    FieldTooLong,
    #[error("cannot resolve {0}")]
    Resolve(String),
}

/// Where the client asked to be connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksTarget {
    pub ip: Ipv4Addr,
    pub port: u16,
    /// As given by the client; the dotted quad when none was.
    pub hostname: String,
}

/// Result of feeding bytes to the parser. `consumed` input bytes are done
/// with; `reply` must be written back to the client; `target` is set once
/// the handshake is complete.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Advance {
    pub consumed: usize,
    pub reply: Vec<u8>,
    pub target: Option<SocksTarget>,
}

#[derive(Clone, Copy, PartialEq)]
enum Phase {
    Greeting,
    Request,
    Finished,
}

pub struct SocksParser {
    phase: Phase,
}

impl Default for SocksParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SocksParser {
    pub fn new() -> Self {
        Self { phase: Phase::Greeting }
    }

    /// Feeds buffered client bytes. Call again with the unconsumed
    /// remainder (plus anything newly received) until a target comes back.
    pub fn advance(&mut self, input: &[u8]) -> Result<Advance, SocksError> {
        match self.phase {
            Phase::Greeting => match input.first() {
                None => Ok(Advance::default()),
                Some(&SOCKS4_VERSION) => self.request_v4(input),
                Some(&SOCKS5_VERSION) => self.greeting_v5(input),
                Some(&v) => Err(SocksError::BadVersion(v)),
            },
            Phase::Request => self.request_v5(input),
            Phase::Finished => Ok(Advance::default()),
        }
    }

    fn greeting_v5(&mut self, input: &[u8]) -> Result<Advance, SocksError> {
        let Some(&nmethods) = input.get(1) else {
            return Ok(Advance::default());
        };
        let len = 2 + nmethods as usize;
        if input.len() < len {
            return Ok(Advance::default());
        }
        if !input[2..len].contains(&METHOD_NO_AUTH) {
            return Err(SocksError::NoAcceptableAuth);
        }
        self.phase = Phase::Request;
        let mut out = Advance { consumed: len, ..Advance::default() };
        out.reply.extend_from_slice(&[SOCKS5_VERSION, METHOD_NO_AUTH]);

        // The request may already sit behind the greeting.
        if input.len() > len {
            let rest = self.request_v5(&input[len..])?;
            out.consumed += rest.consumed;
            out.reply.extend_from_slice(&rest.reply);
            out.target = rest.target;
        }
        Ok(out)
    }

    fn request_v5(&mut self, input: &[u8]) -> Result<Advance, SocksError> {
        if input.len() < 4 {
            return Ok(Advance::default());
        }
        if input[0] != SOCKS5_VERSION {
            return Err(SocksError::BadVersion(input[0]));
        }
        if input[1] != CMD_CONNECT {
            return Err(SocksError::UnsupportedCommand(input[1]));
        }
        let (target, consumed) = match input[3] {
            ATYP_IPV4 => {
                if input.len() < 10 {
                    return Ok(Advance::default());
                }
                let ip = Ipv4Addr::new(input[4], input[5], input[6], input[7]);
                let port = u16::from_be_bytes([input[8], input[9]]);
                (SocksTarget { ip, port, hostname: ip.to_string() }, 10)
            }
            ATYP_DOMAIN => {
                let Some(&name_len) = input.get(4) else {
                    return Ok(Advance::default());
                };
                let end = 5 + name_len as usize;
                if input.len() < end + 2 {
                    return Ok(Advance::default());
                }
                let hostname = String::from_utf8_lossy(&input[5..end]).into_owned();
                let port = u16::from_be_bytes([input[end], input[end + 1]]);
                let ip = resolve(&hostname, port)?;
                (SocksTarget { ip, port, hostname }, end + 2)
            }
            atyp => return Err(SocksError::UnsupportedAddressType(atyp)),
        };

        debug!(host = %target.hostname, port = target.port, "socks5 connect request");
        self.phase = Phase::Finished;
        let mut reply = vec![SOCKS5_VERSION, 0, 0, ATYP_IPV4];
        reply.extend_from_slice(&target.ip.octets());
        reply.extend_from_slice(&target.port.to_be_bytes());
        Ok(Advance { consumed, reply, target: Some(target) })
    }

    fn request_v4(&mut self, input: &[u8]) -> Result<Advance, SocksError> {
        if input.len() < 8 {
            return Ok(Advance::default());
        }
        if input[1] != CMD_CONNECT {
            return Err(SocksError::UnsupportedCommand(input[1]));
        }
        let port = u16::from_be_bytes([input[2], input[3]]);
        let raw_ip = Ipv4Addr::new(input[4], input[5], input[6], input[7]);

        let Some(user_end) = find_nul(&input[8..])? else {
            return Ok(Advance::default());
        };
        let mut consumed = 8 + user_end + 1;

        // 4a: 0.0.0.x with x != 0 means a hostname follows the user id.
        let octets = raw_ip.octets();
        let is_4a = octets[0] == 0 && octets[1] == 0 && octets[2] == 0 && octets[3] != 0;
        let target = if is_4a {
            let Some(host_end) = find_nul(&input[consumed..])? else {
                return Ok(Advance::default());
            };
            let hostname = String::from_utf8_lossy(&input[consumed..consumed + host_end])
                .into_owned();
            consumed += host_end + 1;
            let ip = resolve(&hostname, port)?;
            SocksTarget { ip, port, hostname }
        } else {
            SocksTarget { ip: raw_ip, port, hostname: raw_ip.to_string() }
        };

        debug!(host = %target.hostname, port = target.port, "socks4 connect request");
        self.phase = Phase::Finished;
        let mut reply = vec![0, 0x5A];
        reply.extend_from_slice(&target.port.to_be_bytes());
        reply.extend_from_slice(&target.ip.octets());
        Ok(Advance { consumed, reply, target: Some(target) })
    }
}

fn find_nul(input: &[u8]) -> Result<Option<usize>, SocksError> {
    match input.iter().position(|&b| b == 0) {
        Some(i) if i > MAX_FIELD => Err(SocksError::FieldTooLong),
        Some(i) => Ok(Some(i)),
        None if input.len() > MAX_FIELD => Err(SocksError::FieldTooLong),
        None => Ok(None),
    }
}

fn resolve(hostname: &str, port: u16) -> Result<Ipv4Addr, SocksError> {
    let addrs = (hostname, port)
        .to_socket_addrs()
        .map_err(|_| SocksError::Resolve(hostname.to_string()))?;
    for addr in addrs {
        if let std::net::SocketAddr::V4(v4) = addr {
            return Ok(*v4.ip());
        }
    }
    Err(SocksError::Resolve(hostname.to_string()))
}

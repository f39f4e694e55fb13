//! Native-protocol probe: a database counts as accepting sessions once it
//! answers an `OPTIONS` request with `SUPPORTED`.

use std::collections::BTreeMap;
use std::net::IpAddr;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use harness::{BootstrapError, Bootstrapper, ProbeResult, ServiceTarget};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::CqlProbeConfig;

pub const PROTOCOL_VERSION: u8 = 0x04;
const RESPONSE_FLAG: u8 = 0x80;
pub const HEADER_LEN: usize = 9;
/// Upper bound for response bodies this probe is willing to read.
const MAX_BODY_LEN: u32 = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Error,
    Startup,
    Ready,
    Authenticate,
    Options,
    Supported,
    Other(u8),
}

impl From<u8> for Opcode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Opcode::Error,
            0x01 => Opcode::Startup,
            0x02 => Opcode::Ready,
            0x03 => Opcode::Authenticate,
            0x05 => Opcode::Options,
            0x06 => Opcode::Supported,
            other => Opcode::Other(other),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(opcode: Opcode) -> Self {
        match opcode {
            Opcode::Error => 0x00,
            Opcode::Startup => 0x01,
            Opcode::Ready => 0x02,
            Opcode::Authenticate => 0x03,
            Opcode::Options => 0x05,
            Opcode::Supported => 0x06,
            Opcode::Other(other) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("truncated frame: needed {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },
    #[error("expected a response frame, got version byte {0:#04x}")]
    NotAResponse(u8),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("body of {0} bytes exceeds the probe limit")]
    BodyTooLarge(u32),
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub flags: u8,
    pub stream: i16,
    pub opcode: Opcode,
    pub length: u32,
}

/// Options the server advertised in its `SUPPORTED` response.
pub type SupportedOptions = BTreeMap<String, Vec<String>>;

pub fn encode_options(stream: i16) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_LEN);
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(0);
    buf.put_i16(stream);
    buf.put_u8(Opcode::Options.into());
    buf.put_u32(0);
    buf
}

pub fn decode_header(mut buf: &[u8]) -> Result<FrameHeader, FrameError> {
    ensure(buf, HEADER_LEN)?;
    let version = buf.get_u8();
    if version & RESPONSE_FLAG == 0 {
        return Err(FrameError::NotAResponse(version));
    }
    if version & !RESPONSE_FLAG != PROTOCOL_VERSION {
        return Err(FrameError::UnsupportedVersion(version & !RESPONSE_FLAG));
    }
    let header = FrameHeader {
        version,
        flags: buf.get_u8(),
        stream: buf.get_i16(),
        opcode: Opcode::from(buf.get_u8()),
        length: buf.get_u32(),
    };
    if header.length > MAX_BODY_LEN {
        return Err(FrameError::BodyTooLarge(header.length));
    }
    Ok(header)
}

/// Parses the `[string multimap]` body of a `SUPPORTED` response.
pub fn decode_supported(mut buf: &[u8]) -> Result<SupportedOptions, FrameError> {
    let entries = read_u16(&mut buf)?;
    let mut options = SupportedOptions::new();
    for _ in 0..entries {
        let key = read_string(&mut buf)?;
        let count = read_u16(&mut buf)?;
        let values = (0..count)
            .map(|_| read_string(&mut buf))
            .collect::<Result<Vec<_>, _>>()?;
        options.insert(key, values);
    }
    Ok(options)
}

/// Parses the code and message of an `ERROR` response.
pub fn decode_error(mut buf: &[u8]) -> Result<(i32, String), FrameError> {
    ensure(buf, 4)?;
    let code = buf.get_i32();
    let message = read_string(&mut buf)?;
    Ok((code, message))
}

fn ensure(buf: &[u8], needed: usize) -> Result<(), FrameError> {
    if buf.remaining() < needed {
        return Err(FrameError::Truncated {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

fn read_u16(buf: &mut &[u8]) -> Result<u16, FrameError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

fn read_string(buf: &mut &[u8]) -> Result<String, FrameError> {
    let len = read_u16(buf)? as usize;
    ensure(buf, len)?;
    let value = std::str::from_utf8(&buf[..len])
        .map_err(|_| FrameError::InvalidUtf8)?
        .to_string();
    buf.advance(len);
    Ok(value)
}

fn is_valid_host(host: &str) -> bool {
    let unbracketed = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    unbracketed.parse::<IpAddr>().is_ok()
        || (!host.is_empty()
            && host
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.'))
}

/// Declares the database ready once an `OPTIONS` round trip succeeds.
#[derive(Debug, Clone, Default)]
pub struct CqlOptionsProbe {
    config: CqlProbeConfig,
}

impl CqlOptionsProbe {
    pub fn new(config: CqlProbeConfig) -> Self {
        Self { config }
    }

    async fn exchange(&self, address: &str) -> Result<FrameHeaderAndBody, BootstrapError> {
        let connect_error = |reason: String| BootstrapError::Connect {
            address: address.to_string(),
            reason,
        };

        let mut stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| connect_error(format!("no connection within {:?}", self.config.connect_timeout)))?
            .map_err(|e| connect_error(e.to_string()))?;

        let round_trip = async {
            stream.write_all(&encode_options(0)).await?;
            let mut header = [0u8; HEADER_LEN];
            stream.read_exact(&mut header).await?;
            Ok::<_, std::io::Error>(header)
        };
        let header = tokio::time::timeout(self.config.response_timeout, round_trip)
            .await
            .map_err(|_| connect_error(format!("no response within {:?}", self.config.response_timeout)))?
            .map_err(|e| connect_error(e.to_string()))?;

        let header = decode_header(&header).map_err(|e| BootstrapError::Protocol {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

        let mut body = vec![0u8; header.length as usize];
        tokio::time::timeout(self.config.response_timeout, stream.read_exact(&mut body))
            .await
            .map_err(|_| connect_error("response body did not arrive".to_string()))?
            .map_err(|e| connect_error(e.to_string()))?;

        Ok(FrameHeaderAndBody { header, body })
    }
}

struct FrameHeaderAndBody {
    header: FrameHeader,
    body: Vec<u8>,
}

#[async_trait]
impl Bootstrapper for CqlOptionsProbe {
    type Connection = SupportedOptions;

    async fn connect(&self, target: &ServiceTarget) -> ProbeResult<SupportedOptions, BootstrapError> {
        if !is_valid_host(&target.host) {
            return ProbeResult::Fatal(BootstrapError::InvalidTarget(format!(
                "{}: unparseable host {:?}",
                target.service, target.host
            )));
        }
        let address = match target.host_port_address(self.config.port) {
            Ok(address) => address,
            Err(e) => return ProbeResult::Fatal(e),
        };

        let FrameHeaderAndBody { header, body } = match self.exchange(&address).await {
            Ok(frame) => frame,
            Err(e) => return ProbeResult::Retryable(e),
        };

        let protocol_error = |reason: String| BootstrapError::Protocol {
            address: address.clone(),
            reason,
        };
        match header.opcode {
            Opcode::Supported => match decode_supported(&body) {
                Ok(options) => {
                    tracing::debug!(service = %target.service, %address, ?options, "native protocol answered");
                    ProbeResult::Success(options)
                }
                Err(e) => ProbeResult::Retryable(protocol_error(e.to_string())),
            },
            Opcode::Error => {
                let reason = match decode_error(&body) {
                    Ok((code, message)) => format!("server error {code:#06x}: {message}"),
                    Err(e) => format!("undecodable error response: {e}"),
                };
                ProbeResult::Retryable(protocol_error(reason))
            }
            other => ProbeResult::Retryable(protocol_error(format!("unexpected opcode {other:?}"))),
        }
    }
}

//! CQL native protocol (v2) frame and message encoding and decoding.
//!
//! Reference: https://github.com/apache/cassandra/blob/cassandra-2.0/doc/native_protocol_v2.spec

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;

use super::codec::{self, Cursor};
use super::error::{CqlError, CqlResult};
use super::result::ResultSet;

// ============================================================================
// Protocol Constants
// ============================================================================

/// Native protocol version spoken by this driver.
pub const PROTOCOL_VERSION: u8 = 0x02;

/// Direction bit set on every response frame.
pub const RESPONSE_FLAG: u8 = 0x80;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 8;

/// Largest frame body accepted from a server (256 MB, the protocol limit).
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// CQL language version announced in STARTUP.
pub const DEFAULT_CQL_VERSION: &str = "3.0.0";

/// Frame type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Error = 0x00,
    Startup = 0x01,
    Ready = 0x02,
    Authenticate = 0x03,
    Options = 0x05,
    Supported = 0x06,
    Query = 0x07,
    Result = 0x08,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    Event = 0x0C,
    Batch = 0x0D,
    AuthChallenge = 0x0E,
    AuthResponse = 0x0F,
    AuthSuccess = 0x10,
}

impl TryFrom<u8> for Opcode {
    type Error = CqlError;

    fn try_from(b: u8) -> CqlResult<Self> {
        let opcode = match b {
            0x00 => Opcode::Error,
            0x01 => Opcode::Startup,
            0x02 => Opcode::Ready,
            0x03 => Opcode::Authenticate,
            0x05 => Opcode::Options,
            0x06 => Opcode::Supported,
            0x07 => Opcode::Query,
            0x08 => Opcode::Result,
            0x09 => Opcode::Prepare,
            0x0A => Opcode::Execute,
            0x0B => Opcode::Register,
            0x0C => Opcode::Event,
            0x0D => Opcode::Batch,
            0x0E => Opcode::AuthChallenge,
            0x0F => Opcode::AuthResponse,
            0x10 => Opcode::AuthSuccess,
            _ => return Err(CqlError::protocol(format!("Unknown opcode: {:#04x}", b))),
        };
        Ok(opcode)
    }
}

/// Consistency levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u16)]
pub enum Consistency {
    Any = 0x0000,
    #[default]
    One = 0x0001,
    Two = 0x0002,
    Three = 0x0003,
    Quorum = 0x0004,
    All = 0x0005,
    LocalQuorum = 0x0006,
    EachQuorum = 0x0007,
    Serial = 0x0008,
    LocalSerial = 0x0009,
    LocalOne = 0x000A,
}

impl Consistency {
    pub fn from_u16(value: u16) -> Option<Self> {
        let cl = match value {
            0x0000 => Consistency::Any,
            0x0001 => Consistency::One,
            0x0002 => Consistency::Two,
            0x0003 => Consistency::Three,
            0x0004 => Consistency::Quorum,
            0x0005 => Consistency::All,
            0x0006 => Consistency::LocalQuorum,
            0x0007 => Consistency::EachQuorum,
            0x0008 => Consistency::Serial,
            0x0009 => Consistency::LocalSerial,
            0x000A => Consistency::LocalOne,
            _ => return None,
        };
        Some(cl)
    }
}

/// Batch types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum BatchType {
    #[default]
    Logged = 0,
    Unlogged = 1,
    Counter = 2,
}

/// QUERY/EXECUTE flag bits (v2).
mod query_flags {
    pub const VALUES: u8 = 0x01;
    pub const SKIP_METADATA: u8 = 0x02;
    pub const PAGE_SIZE: u8 = 0x04;
    pub const PAGING_STATE: u8 = 0x08;
    pub const SERIAL_CONSISTENCY: u8 = 0x10;
}

// ============================================================================
// Frame Header
// ============================================================================

/// The fixed 8-byte header preceding every frame body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub flags: u8,
    pub stream: i8,
    pub opcode: Opcode,
    pub length: u32,
}

impl FrameHeader {
    pub fn request(stream: i8, opcode: Opcode, length: usize) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags: 0,
            stream,
            opcode,
            length: length as u32,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.flags);
        buf.put_i8(self.stream);
        buf.put_u8(self.opcode as u8);
        buf.put_u32(self.length);
    }

    /// Decode a header from the first `HEADER_LEN` bytes of `buf`.
    pub fn decode(buf: &[u8]) -> CqlResult<Self> {
        let mut cur = Cursor::new(buf);
        let version = cur.read_byte()?;
        let flags = cur.read_byte()?;
        let stream = cur.read_byte()? as i8;
        let opcode = Opcode::try_from(cur.read_byte()?)?;
        let length = cur.read_int()? as u32;

        if version & !RESPONSE_FLAG != PROTOCOL_VERSION {
            return Err(CqlError::protocol(format!(
                "Unsupported protocol version: {:#04x}",
                version
            )));
        }
        if length as usize > MAX_FRAME_LEN {
            return Err(CqlError::protocol(format!(
                "Frame body of {} bytes exceeds the frame limit",
                length
            )));
        }

        Ok(Self {
            version,
            flags,
            stream,
            opcode,
            length,
        })
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        self.version & RESPONSE_FLAG != 0
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// A request body ready to be framed and written.
#[derive(Debug, Clone)]
pub struct EncodedRequest {
    pub opcode: Opcode,
    pub body: Bytes,
}

impl EncodedRequest {
    /// Frame the body with the given stream id.
    pub fn to_frame(&self, stream: i8) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.body.len());
        FrameHeader::request(stream, self.opcode, self.body.len()).encode(&mut buf);
        buf.put_slice(&self.body);
        buf
    }
}

/// Trait for encoding frontend messages
pub trait FrontendMessage {
    fn opcode(&self) -> Opcode;

    fn encode_body(&self, buf: &mut BytesMut) -> CqlResult<()>;

    fn encode(&self) -> CqlResult<EncodedRequest> {
        let mut body = BytesMut::new();
        self.encode_body(&mut body)?;
        Ok(EncodedRequest {
            opcode: self.opcode(),
            body: body.freeze(),
        })
    }
}

/// STARTUP: options map, must contain CQL_VERSION.
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub options: BTreeMap<String, String>,
}

impl StartupMessage {
    pub fn new(cql_version: &str) -> Self {
        let mut options = BTreeMap::new();
        options.insert("CQL_VERSION".to_string(), cql_version.to_string());
        Self { options }
    }
}

impl FrontendMessage for StartupMessage {
    fn opcode(&self) -> Opcode {
        Opcode::Startup
    }

    fn encode_body(&self, buf: &mut BytesMut) -> CqlResult<()> {
        codec::encode_string_map(buf, &self.options)
    }
}

/// OPTIONS: asks the server for its SUPPORTED options.
#[derive(Debug, Clone, Copy)]
pub struct OptionsMessage;

impl FrontendMessage for OptionsMessage {
    fn opcode(&self) -> Opcode {
        Opcode::Options
    }

    fn encode_body(&self, _buf: &mut BytesMut) -> CqlResult<()> {
        Ok(())
    }
}

/// AUTH_RESPONSE: one SASL token.
#[derive(Debug, Clone)]
pub struct AuthResponseMessage {
    pub token: Option<Bytes>,
}

impl FrontendMessage for AuthResponseMessage {
    fn opcode(&self) -> Opcode {
        Opcode::AuthResponse
    }

    fn encode_body(&self, buf: &mut BytesMut) -> CqlResult<()> {
        codec::encode_bytes(buf, self.token.as_deref());
        Ok(())
    }
}

/// Parameters shared by QUERY and EXECUTE.
#[derive(Debug, Clone, Default)]
pub struct QueryParameters {
    pub consistency: Consistency,
    /// Positional values, `None` for null.
    pub values: Vec<Option<Bytes>>,
    pub skip_metadata: bool,
    pub page_size: Option<i32>,
    pub paging_state: Option<Bytes>,
    pub serial_consistency: Option<Consistency>,
}

impl QueryParameters {
    fn flags(&self) -> u8 {
        let mut flags = 0;
        if !self.values.is_empty() {
            flags |= query_flags::VALUES;
        }
        if self.skip_metadata {
            flags |= query_flags::SKIP_METADATA;
        }
        if self.page_size.is_some() {
            flags |= query_flags::PAGE_SIZE;
        }
        if self.paging_state.is_some() {
            flags |= query_flags::PAGING_STATE;
        }
        if self.serial_consistency.is_some() {
            flags |= query_flags::SERIAL_CONSISTENCY;
        }
        flags
    }

    pub fn encode(&self, buf: &mut BytesMut) -> CqlResult<()> {
        codec::encode_short(buf, self.consistency as u16);
        codec::encode_byte(buf, self.flags());

        if !self.values.is_empty() {
            encode_values(buf, &self.values)?;
        }
        if let Some(page_size) = self.page_size {
            codec::encode_int(buf, page_size);
        }
        if let Some(ref state) = self.paging_state {
            codec::encode_bytes(buf, Some(state));
        }
        if let Some(serial) = self.serial_consistency {
            codec::encode_short(buf, serial as u16);
        }
        Ok(())
    }
}

fn encode_values(buf: &mut BytesMut, values: &[Option<Bytes>]) -> CqlResult<()> {
    codec::encode_count(buf, values.len(), "Bound value list")?;
    for value in values {
        codec::encode_bytes(buf, value.as_deref());
    }
    Ok(())
}

/// QUERY: an ad-hoc CQL string with its parameters.
#[derive(Debug, Clone)]
pub struct QueryMessage {
    pub query: String,
    pub params: QueryParameters,
}

impl FrontendMessage for QueryMessage {
    fn opcode(&self) -> Opcode {
        Opcode::Query
    }

    fn encode_body(&self, buf: &mut BytesMut) -> CqlResult<()> {
        codec::encode_long_string(buf, &self.query);
        self.params.encode(buf)
    }
}

/// PREPARE: a CQL string to be parsed by the server.
#[derive(Debug, Clone)]
pub struct PrepareMessage {
    pub query: String,
}

impl FrontendMessage for PrepareMessage {
    fn opcode(&self) -> Opcode {
        Opcode::Prepare
    }

    fn encode_body(&self, buf: &mut BytesMut) -> CqlResult<()> {
        codec::encode_long_string(buf, &self.query);
        Ok(())
    }
}

/// EXECUTE: a prepared id with its parameters.
#[derive(Debug, Clone)]
pub struct ExecuteMessage {
    pub id: Bytes,
    pub params: QueryParameters,
}

impl FrontendMessage for ExecuteMessage {
    fn opcode(&self) -> Opcode {
        Opcode::Execute
    }

    fn encode_body(&self, buf: &mut BytesMut) -> CqlResult<()> {
        codec::encode_short_bytes(buf, &self.id)?;
        self.params.encode(buf)
    }
}

/// One statement inside a BATCH.
#[derive(Debug, Clone)]
pub enum BatchQuery {
    Query(String),
    Prepared(Bytes),
}

#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub query: BatchQuery,
    pub values: Vec<Option<Bytes>>,
}

/// BATCH: several statements in one frame sharing one consistency.
#[derive(Debug, Clone)]
pub struct BatchMessage {
    pub batch_type: BatchType,
    pub entries: Vec<BatchEntry>,
    pub consistency: Consistency,
}

impl FrontendMessage for BatchMessage {
    fn opcode(&self) -> Opcode {
        Opcode::Batch
    }

    fn encode_body(&self, buf: &mut BytesMut) -> CqlResult<()> {
        codec::encode_byte(buf, self.batch_type as u8);
        codec::encode_count(buf, self.entries.len(), "Batch")?;

        for entry in &self.entries {
            match &entry.query {
                BatchQuery::Query(query) => {
                    codec::encode_byte(buf, 0);
                    codec::encode_long_string(buf, query);
                }
                BatchQuery::Prepared(id) => {
                    codec::encode_byte(buf, 1);
                    codec::encode_short_bytes(buf, id)?;
                }
            }
            encode_values(buf, &entry.values)?;
        }

        codec::encode_short(buf, self.consistency as u16);
        Ok(())
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Backend message types
#[derive(Debug)]
pub enum Response {
    Error { code: i32, message: String },
    Ready,
    Authenticate { class_name: String },
    Supported { options: BTreeMap<String, Vec<String>> },
    Result(ResultSet),
    Event,
    AuthChallenge { token: Option<Bytes> },
    AuthSuccess { token: Option<Bytes> },
}

impl Response {
    /// Decode a response body for the given header.
    pub fn decode(header: &FrameHeader, body: Bytes) -> CqlResult<Self> {
        if !header.is_response() {
            return Err(CqlError::protocol("Expected a response frame"));
        }

        match header.opcode {
            Opcode::Error => {
                let mut cur = Cursor::new(&body);
                let code = cur.read_int()?;
                let message = cur.read_string()?.to_owned();
                // Remaining bytes carry code-specific details
                Ok(Response::Error { code, message })
            }
            Opcode::Ready => Ok(Response::Ready),
            Opcode::Authenticate => {
                let class_name = Cursor::new(&body).read_string()?.to_owned();
                Ok(Response::Authenticate { class_name })
            }
            Opcode::Supported => {
                let options = Cursor::new(&body).read_string_multimap()?;
                Ok(Response::Supported { options })
            }
            Opcode::Result => Ok(Response::Result(ResultSet::decode(body)?)),
            Opcode::Event => Ok(Response::Event),
            Opcode::AuthChallenge => Ok(Response::AuthChallenge {
                token: read_token(&body)?,
            }),
            Opcode::AuthSuccess => Ok(Response::AuthSuccess {
                token: read_token(&body)?,
            }),
            other => Err(CqlError::protocol(format!(
                "Unexpected response opcode: {:?}",
                other
            ))),
        }
    }

    /// Convert an ERROR response into a `CqlError`, pass anything else through.
    pub fn into_result(self) -> CqlResult<Self> {
        match self {
            Response::Error { code, message } => Err(CqlError::Server { code, message }),
            other => Ok(other),
        }
    }
}

fn read_token(body: &Bytes) -> CqlResult<Option<Bytes>> {
    let token = Cursor::new(body).read_bytes()?;
    Ok(token.map(|t| body.slice_ref(t)))
}

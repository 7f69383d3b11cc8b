//! Wire format
//!
//! RFC 1350 packets plus the OACK of RFC 2347. Requests, options and error
//! messages are NUL-terminated strings; everything else is big-endian u16.

use crate::error::{Result, TftpError};
use bytes::{BufMut, Bytes, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
    /// RFC 2347
    Oack = 6,
}

impl TryFrom<u16> for Opcode {
    type Error = TftpError;

    fn try_from(value: u16) -> Result<Self> {
        const ALL: [Opcode; 6] = [
            Opcode::Rrq,
            Opcode::Wrq,
            Opcode::Data,
            Opcode::Ack,
            Opcode::Error,
            Opcode::Oack,
        ];
        ALL.into_iter()
            .find(|op| *op as u16 == value)
            .ok_or_else(|| TftpError::InvalidPacket(format!("unknown opcode: {}", value)))
    }
}

/// Error codes carried in ERROR packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
    /// RFC 2347
    OptionNegotiationFailed = 8,
}

impl ErrorCode {
    /// Codes outside the known range read as `NotDefined`
    pub fn from_u16(code: u16) -> Self {
        use ErrorCode::*;
        [
            NotDefined,
            FileNotFound,
            AccessViolation,
            DiskFull,
            IllegalOperation,
            UnknownTransferId,
            FileAlreadyExists,
            NoSuchUser,
            OptionNegotiationFailed,
        ]
        .get(usize::from(code))
        .copied()
        .unwrap_or(NotDefined)
    }
}

/// Transfer mode named in a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferMode {
    Octet,
    NetAscii,
    Mail,
    /// Kept verbatim so the session can refuse it
    Other(String),
}

impl TransferMode {
    /// Case-insensitive; never fails
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("octet") {
            TransferMode::Octet
        } else if s.eq_ignore_ascii_case("netascii") {
            TransferMode::NetAscii
        } else if s.eq_ignore_ascii_case("mail") {
            TransferMode::Mail
        } else {
            TransferMode::Other(s.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TransferMode::Octet => "octet",
            TransferMode::NetAscii => "netascii",
            TransferMode::Mail => "mail",
            TransferMode::Other(s) => s,
        }
    }
}

/// Request options (RFC 2347, 2348, 2349)
///
/// Only the options this server honours are kept as typed values; the
/// names of everything else are recorded in `ignored` for logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TftpOptions {
    /// RFC 2348
    pub blksize: Option<u16>,
    /// RFC 2349
    pub tsize: Option<u64>,
    /// Present but not understood, or not parseable
    pub ignored: Vec<String>,
}

impl TftpOptions {
    /// No honoured option is set
    pub fn is_empty(&self) -> bool {
        self.blksize.is_none() && self.tsize.is_none()
    }

    /// Read name/value pairs until the datagram runs out
    fn read_from(reader: &mut Reader<'_>) -> Self {
        let mut options = TftpOptions::default();
        while let (Some(name), Some(value)) = (reader.cstr(), reader.cstr()) {
            if name.is_empty() {
                break;
            }
            let name = name.to_ascii_lowercase();
            let value = value.parse::<u64>().ok();

            match (name.as_str(), value) {
                // Oversized requests are capped here and clamped by the session
                ("blksize", Some(size)) => options.blksize = Some(size.min(u64::from(u16::MAX)) as u16),
                ("tsize", Some(size)) => options.tsize = Some(size),
                _ => options.ignored.push(name),
            }
        }
        options
    }

    fn write_to(&self, buf: &mut BytesMut) {
        if let Some(blksize) = self.blksize {
            put_cstr(buf, "blksize");
            put_cstr(buf, &blksize.to_string());
        }
        if let Some(tsize) = self.tsize {
            put_cstr(buf, "tsize");
            put_cstr(buf, &tsize.to_string());
        }
    }
}

/// RRQ or WRQ body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub filename: String,
    pub mode: TransferMode,
    pub options: TftpOptions,
}

impl Request {
    fn read_from(reader: &mut Reader<'_>) -> Result<Self> {
        let filename = reader
            .cstr()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| TftpError::InvalidPacket("missing filename".to_string()))?;
        let mode = reader
            .cstr()
            .filter(|s| !s.is_empty())
            .map(|s| TransferMode::parse(&s))
            .ok_or_else(|| TftpError::InvalidPacket("missing mode".to_string()))?;

        Ok(Request {
            filename,
            mode,
            options: TftpOptions::read_from(reader),
        })
    }

    fn write_to(&self, buf: &mut BytesMut) {
        put_cstr(buf, &self.filename);
        put_cstr(buf, self.mode.as_str());
        self.options.write_to(buf);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TftpPacket {
    ReadRequest(Request),
    WriteRequest(Request),
    Data { block: u16, data: Bytes },
    Ack { block: u16 },
    Error { code: ErrorCode, message: String },
    Oack { options: TftpOptions },
}

/// Cursor over a received datagram
struct Reader<'a> {
    rest: &'a [u8],
}

impl<'a> Reader<'a> {
    fn u16(&mut self, what: &str) -> Result<u16> {
        let bytes: &'a [u8] = self.rest;
        match bytes {
            [hi, lo, rest @ ..] => {
                self.rest = rest;
                Ok(u16::from_be_bytes([*hi, *lo]))
            }
            _ => Err(TftpError::InvalidPacket(format!("{} too short", what))),
        }
    }

    /// Next NUL-terminated string; an unterminated tail still counts
    fn cstr(&mut self) -> Option<String> {
        if self.rest.is_empty() {
            return None;
        }
        let end = self.rest.iter().position(|&b| b == 0).unwrap_or(self.rest.len());
        let value = String::from_utf8_lossy(&self.rest[..end]).into_owned();
        self.rest = self.rest.get(end + 1..).unwrap_or_default();
        Some(value)
    }

    fn remaining(&self) -> &'a [u8] {
        self.rest
    }
}

fn put_cstr(buf: &mut BytesMut, value: &str) {
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

impl TftpPacket {
    pub fn parse(datagram: &[u8]) -> Result<Self> {
        let mut reader = Reader { rest: datagram };
        let opcode = Opcode::try_from(reader.u16("packet")?)?;

        Ok(match opcode {
            Opcode::Rrq => TftpPacket::ReadRequest(Request::read_from(&mut reader)?),
            Opcode::Wrq => TftpPacket::WriteRequest(Request::read_from(&mut reader)?),
            Opcode::Data => TftpPacket::Data {
                block: reader.u16("data packet")?,
                data: Bytes::copy_from_slice(reader.remaining()),
            },
            Opcode::Ack => TftpPacket::Ack {
                block: reader.u16("ack packet")?,
            },
            Opcode::Error => TftpPacket::Error {
                code: ErrorCode::from_u16(reader.u16("error packet")?),
                message: reader.cstr().unwrap_or_default(),
            },
            Opcode::Oack => TftpPacket::Oack {
                options: TftpOptions::read_from(&mut reader),
            },
        })
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            TftpPacket::ReadRequest(_) => Opcode::Rrq,
            TftpPacket::WriteRequest(_) => Opcode::Wrq,
            TftpPacket::Data { .. } => Opcode::Data,
            TftpPacket::Ack { .. } => Opcode::Ack,
            TftpPacket::Error { .. } => Opcode::Error,
            TftpPacket::Oack { .. } => Opcode::Oack,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.payload_len());
        buf.put_u16(self.opcode() as u16);

        match self {
            TftpPacket::ReadRequest(request) | TftpPacket::WriteRequest(request) => request.write_to(&mut buf),
            TftpPacket::Data { block, data } => {
                buf.put_u16(*block);
                buf.put_slice(data);
            }
            TftpPacket::Ack { block } => buf.put_u16(*block),
            TftpPacket::Error { code, message } => {
                buf.put_u16(*code as u16);
                put_cstr(&mut buf, message);
            }
            TftpPacket::Oack { options } => options.write_to(&mut buf),
        }

        buf.freeze()
    }

    fn payload_len(&self) -> usize {
        match self {
            TftpPacket::Data { data, .. } => data.len(),
            TftpPacket::Error { message, .. } => message.len() + 1,
            _ => 32,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        TftpPacket::Error {
            code,
            message: message.into(),
        }
    }

    pub fn data(block: u16, data: impl Into<Bytes>) -> Self {
        TftpPacket::Data {
            block,
            data: data.into(),
        }
    }

    pub fn ack(block: u16) -> Self {
        TftpPacket::Ack { block }
    }

    pub fn oack(options: TftpOptions) -> Self {
        TftpPacket::Oack { options }
    }
}

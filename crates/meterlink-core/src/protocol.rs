//! Request/reply vocabulary shared by clients and the engine.
//!
//! A request names a remote class, a method, and an argument list. A reply is
//! a result list whose first slot is conventionally an [`ErrorCode`].
//!
//! Stream transports carry each request and reply in a frame: a `u32`
//! little-endian body length followed by the body. Synchronous requests
//! carry an id that the matching [`Reply`] echoes, so replies may come back
//! in any order.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

use crate::value::{
    read_string, read_values, write_string, write_values, ValueError, WireValue,
};

/// Remote class that owns meter objects.
pub const METER_CLASS: &str = "Volmeter";

/// Method names understood by the meter class.
pub mod method {
    pub const CREATE: &str = "Create";
    pub const QUERY: &str = "Query";
    pub const GET_UPDATE_INTERVAL: &str = "GetUpdateInterval";
    pub const SET_UPDATE_INTERVAL: &str = "SetUpdateInterval";
    pub const ATTACH: &str = "Attach";
    pub const DETACH: &str = "Detach";
    pub const ADD_CALLBACK: &str = "AddCallback";
    pub const REMOVE_CALLBACK: &str = "RemoveCallback";
}

/// Largest frame body accepted from a stream.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Identifier of a meter object, assigned by the engine at creation.
///
/// Clients never synthesize one; they only copy what `Create` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MeterId(pub u64);

impl MeterId {
    /// Get the inner u64 value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<MeterId> for WireValue {
    fn from(id: MeterId) -> Self {
        WireValue::UInt64(id.0)
    }
}

impl std::fmt::Display for MeterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "meter#{}", self.0)
    }
}

/// Identifier of an audio source on the engine that a meter can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(pub u64);

impl SourceId {
    /// Get the inner u64 value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<SourceId> for WireValue {
    fn from(id: SourceId) -> Self {
        WireValue::UInt64(id.0)
    }
}

/// Status code carried in slot 0 of every synchronous reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Ok,
    Error,
    NotFound,
    /// The target id no longer resolves on the engine. Retry-safe.
    InvalidReference,
    OutOfBounds,
    Other(u64),
}

impl ErrorCode {
    pub fn as_u64(self) -> u64 {
        match self {
            Self::Ok => 0,
            Self::Error => 1,
            Self::NotFound => 2,
            Self::InvalidReference => 3,
            Self::OutOfBounds => 4,
            Self::Other(n) => n,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl From<u64> for ErrorCode {
    fn from(n: u64) -> Self {
        match n {
            0 => Self::Ok,
            1 => Self::Error,
            2 => Self::NotFound,
            3 => Self::InvalidReference,
            4 => Self::OutOfBounds,
            other => Self::Other(other),
        }
    }
}

impl From<ErrorCode> for WireValue {
    fn from(code: ErrorCode) -> Self {
        WireValue::UInt64(code.as_u64())
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "Ok"),
            Self::Error => write!(f, "Error"),
            Self::NotFound => write!(f, "NotFound"),
            Self::InvalidReference => write!(f, "InvalidReference"),
            Self::OutOfBounds => write!(f, "OutOfBounds"),
            Self::Other(n) => write!(f, "Unknown({})", n),
        }
    }
}

/// Whether the caller waits for a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Synchronous = 0,
    FireAndForget = 1,
}

/// One remote call as it travels over a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Correlates the reply. Zero for fire-and-forget calls.
    pub id: u64,
    pub kind: CallKind,
    pub class: String,
    pub method: String,
    pub args: Vec<WireValue>,
}

impl Request {
    pub fn new(id: u64, kind: CallKind, class: &str, method: &str, args: &[WireValue]) -> Self {
        Self {
            id,
            kind,
            class: class.to_string(),
            method: method.to_string(),
            args: args.to_vec(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ValueError> {
        let mut buf = Vec::new();
        buf.write_u8(self.kind as u8)?;
        buf.write_u64::<LittleEndian>(self.id)?;
        write_string(&mut buf, &self.class)?;
        write_string(&mut buf, &self.method)?;
        write_values(&mut buf, &self.args)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ValueError> {
        let mut cursor = Cursor::new(bytes);
        let kind = match cursor.read_u8()? {
            0 => CallKind::Synchronous,
            1 => CallKind::FireAndForget,
            other => {
                return Err(ValueError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown call kind {}", other),
                )))
            }
        };
        let id = cursor.read_u64::<LittleEndian>()?;
        let class = read_string(&mut cursor)?;
        let method = read_string(&mut cursor)?;
        let args = read_values(&mut cursor)?;
        let rest = bytes.len() - cursor.position() as usize;
        if rest != 0 {
            return Err(ValueError::TrailingBytes(rest));
        }
        Ok(Self {
            id,
            kind,
            class,
            method,
            args,
        })
    }
}

/// Result list of one synchronous request.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Id of the request being answered.
    pub id: u64,
    pub values: Vec<WireValue>,
}

impl Reply {
    pub fn encode(&self) -> Result<Vec<u8>, ValueError> {
        let mut buf = Vec::new();
        buf.write_u64::<LittleEndian>(self.id)?;
        write_values(&mut buf, &self.values)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ValueError> {
        let mut cursor = Cursor::new(bytes);
        let id = cursor.read_u64::<LittleEndian>()?;
        let values = read_values(&mut cursor)?;
        let rest = bytes.len() - cursor.position() as usize;
        if rest != 0 {
            return Err(ValueError::TrailingBytes(rest));
        }
        Ok(Self { id, values })
    }
}

/// Write one frame (length prefix + body).
pub fn write_frame<W: Write>(w: &mut W, body: &[u8]) -> io::Result<()> {
    if body.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds limit", body.len()),
        ));
    }
    w.write_u32::<LittleEndian>(body.len() as u32)?;
    w.write_all(body)?;
    w.flush()
}

/// Read one frame body.
///
/// Returns `Ok(None)` on a clean end of stream before the length prefix.
pub fn read_frame<R: Read>(r: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    match r.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;
    Ok(Some(body))
}

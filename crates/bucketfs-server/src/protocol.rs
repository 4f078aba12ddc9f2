//! Request framing for the front-end socket.
//!
//! A request is a one-byte op code, a NUL-terminated UTF-8 path and an
//! op-specific payload. A response is an `i8` status (0 or a negated
//! errno) followed, on success, by an op-specific payload. Integers are
//! `u64` in native byte order: both ends always run on the same host.
//!
//! | op        | code | request payload          | response payload                      |
//! |-----------|------|--------------------------|---------------------------------------|
//! | read      | `R`  | size, offset             | length, bytes                         |
//! | write     | `W`  | size, offset, bytes      |                                       |
//! | create    | `C`  |                          |                                       |
//! | flush     | `F`  |                          |                                       |
//! | truncate  | `T`  | length                   |                                       |
//! | release   | `X`  |                          |                                       |
//! | unlink    | `U`  |                          |                                       |
//! | access    | `G`  |                          | kind (u8), size                       |
//! | list_dir  | `D`  |                          | count, then kind, size, name NUL each |
//! | mkdir     | `M`  |                          |                                       |
//! | rmdir     | `K`  |                          |                                       |

use std::io;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use bucketfs_kernel::{ObjectAttr, ObjectKind, Op, Outcome, RemoteEntry};

use crate::constants::{MAX_PATH_LEN, MAX_PAYLOAD_LEN};

/// Framing failure. Fatal to the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection closed mid-message")]
    Truncated,

    #[error("unknown op code {0:#04x}")]
    UnknownOp(u8),

    #[error("path longer than {MAX_PATH_LEN} bytes")]
    PathTooLong,

    #[error("path is not valid UTF-8")]
    PathNotUtf8,

    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD_LEN} byte limit")]
    PayloadTooLarge(u64),

    #[error("unknown entry kind {0}")]
    UnknownKind(u8),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Status sent before closing a connection that broke framing.
    pub fn status(&self) -> i8 {
        -(libc::EPROTO as i8)
    }
}

fn eof_as_truncated(e: io::Error) -> ProtocolError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        ProtocolError::Truncated
    } else {
        ProtocolError::Io(e)
    }
}

// ============================================================================
// Op codes
// ============================================================================

/// Wire op code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum OpCode {
    Read,
    Write,
    Create,
    Flush,
    Truncate,
    Release,
    Unlink,
    Access,
    ListDir,
    Mkdir,
    Rmdir,
}

impl OpCode {
    pub fn as_byte(self) -> u8 {
        match self {
            OpCode::Read => b'R',
            OpCode::Write => b'W',
            OpCode::Create => b'C',
            OpCode::Flush => b'F',
            OpCode::Truncate => b'T',
            OpCode::Release => b'X',
            OpCode::Unlink => b'U',
            OpCode::Access => b'G',
            OpCode::ListDir => b'D',
            OpCode::Mkdir => b'M',
            OpCode::Rmdir => b'K',
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            b'R' => OpCode::Read,
            b'W' => OpCode::Write,
            b'C' => OpCode::Create,
            b'F' => OpCode::Flush,
            b'T' => OpCode::Truncate,
            b'X' => OpCode::Release,
            b'U' => OpCode::Unlink,
            b'G' => OpCode::Access,
            b'D' => OpCode::ListDir,
            b'M' => OpCode::Mkdir,
            b'K' => OpCode::Rmdir,
            _ => return None,
        })
    }

    /// Op code that carries `op` on the wire.
    pub fn of(op: &Op) -> Self {
        match op {
            Op::Read { .. } => OpCode::Read,
            Op::Write { .. } => OpCode::Write,
            Op::Create => OpCode::Create,
            Op::Flush => OpCode::Flush,
            Op::Truncate { .. } => OpCode::Truncate,
            Op::Release => OpCode::Release,
            Op::Unlink => OpCode::Unlink,
            Op::Stat => OpCode::Access,
            Op::ListDir => OpCode::ListDir,
            Op::Mkdir => OpCode::Mkdir,
            Op::Rmdir => OpCode::Rmdir,
        }
    }
}

// ============================================================================
// Requests
// ============================================================================

/// A decoded request. The path is raw; normalization happens later so a
/// bad path gets a status reply instead of killing the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub path: String,
    pub op: Op,
}

impl Request {
    pub fn new(path: impl Into<String>, op: Op) -> Self {
        Self {
            path: path.into(),
            op,
        }
    }

    pub fn code(&self) -> OpCode {
        OpCode::of(&self.op)
    }

    /// Encode for the wire (used by clients and tests).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.path.len() + 18);
        buf.push(self.code().as_byte());
        buf.extend_from_slice(self.path.as_bytes());
        buf.push(0);
        match &self.op {
            Op::Read { size, offset } => {
                buf.extend_from_slice(&size.to_ne_bytes());
                buf.extend_from_slice(&offset.to_ne_bytes());
            }
            Op::Write { data, offset } => {
                buf.extend_from_slice(&(data.len() as u64).to_ne_bytes());
                buf.extend_from_slice(&offset.to_ne_bytes());
                buf.extend_from_slice(data);
            }
            Op::Truncate { length } => buf.extend_from_slice(&length.to_ne_bytes()),
            _ => {}
        }
        buf
    }
}

async fn read_u64<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<u64, ProtocolError> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes).await.map_err(eof_as_truncated)?;
    Ok(u64::from_ne_bytes(bytes))
}

async fn read_cstr<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String, ProtocolError> {
    let mut buf = Vec::new();
    (&mut *reader)
        .take(MAX_PATH_LEN as u64 + 1)
        .read_until(0, &mut buf)
        .await?;
    if buf.last() != Some(&0) {
        return Err(if buf.len() > MAX_PATH_LEN {
            ProtocolError::PathTooLong
        } else {
            ProtocolError::Truncated
        });
    }
    buf.pop();
    String::from_utf8(buf).map_err(|_| ProtocolError::PathNotUtf8)
}

fn check_payload(size: u64) -> Result<u64, ProtocolError> {
    if size > MAX_PAYLOAD_LEN {
        Err(ProtocolError::PayloadTooLarge(size))
    } else {
        Ok(size)
    }
}

/// Read the next request.
///
/// Returns `None` when the peer closed the connection between requests.
pub async fn read_request<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Request>, ProtocolError> {
    let byte = match reader.read_u8().await {
        Ok(byte) => byte,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let code = OpCode::from_byte(byte).ok_or(ProtocolError::UnknownOp(byte))?;
    let path = read_cstr(reader).await?;

    let op = match code {
        OpCode::Read => {
            let size = check_payload(read_u64(reader).await?)?;
            let offset = read_u64(reader).await?;
            Op::Read { size, offset }
        }
        OpCode::Write => {
            let size = check_payload(read_u64(reader).await?)?;
            let offset = read_u64(reader).await?;
            let mut data = vec![0u8; size as usize];
            reader.read_exact(&mut data).await.map_err(eof_as_truncated)?;
            Op::Write { data, offset }
        }
        OpCode::Truncate => Op::Truncate {
            length: read_u64(reader).await?,
        },
        OpCode::Create => Op::Create,
        OpCode::Flush => Op::Flush,
        OpCode::Release => Op::Release,
        OpCode::Unlink => Op::Unlink,
        OpCode::Access => Op::Stat,
        OpCode::ListDir => Op::ListDir,
        OpCode::Mkdir => Op::Mkdir,
        OpCode::Rmdir => Op::Rmdir,
    };

    Ok(Some(Request { path, op }))
}

// ============================================================================
// Responses
// ============================================================================

/// A response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Bare status: success without payload, or any failure.
    Status(i8),
    Data(Vec<u8>),
    Attr(ObjectAttr),
    Listing(Vec<RemoteEntry>),
}

fn kind_byte(kind: ObjectKind) -> u8 {
    match kind {
        ObjectKind::File => 1,
        ObjectKind::Directory => 2,
    }
}

fn kind_from_byte(byte: u8) -> Result<ObjectKind, ProtocolError> {
    match byte {
        1 => Ok(ObjectKind::File),
        2 => Ok(ObjectKind::Directory),
        other => Err(ProtocolError::UnknownKind(other)),
    }
}

impl Response {
    pub fn ok() -> Self {
        Response::Status(0)
    }

    pub fn from_outcome(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Data(data) => Response::Data(data),
            Outcome::Attr(attr) => Response::Attr(attr),
            Outcome::Listing(entries) => Response::Listing(entries),
            Outcome::Done | Outcome::Written(_) | Outcome::Flushed(_) => Response::ok(),
        }
    }

    pub fn status(&self) -> i8 {
        match self {
            Response::Status(status) => *status,
            _ => 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![self.status() as u8];
        match self {
            Response::Status(_) => {}
            Response::Data(data) => {
                buf.extend_from_slice(&(data.len() as u64).to_ne_bytes());
                buf.extend_from_slice(data);
            }
            Response::Attr(attr) => {
                buf.push(kind_byte(attr.kind));
                buf.extend_from_slice(&attr.size.to_ne_bytes());
            }
            Response::Listing(entries) => {
                buf.extend_from_slice(&(entries.len() as u64).to_ne_bytes());
                for entry in entries {
                    buf.push(kind_byte(entry.kind));
                    buf.extend_from_slice(&entry.size.to_ne_bytes());
                    buf.extend_from_slice(entry.name.as_bytes());
                    buf.push(0);
                }
            }
        }
        buf
    }
}

/// Write one response and flush it.
pub async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &Response) -> io::Result<()> {
    writer.write_all(&response.encode()).await?;
    writer.flush().await
}

/// Read the response to a request with op code `code` (client side).
pub async fn read_response<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    code: OpCode,
) -> Result<Response, ProtocolError> {
    let status = reader.read_i8().await.map_err(eof_as_truncated)?;
    if status != 0 {
        return Ok(Response::Status(status));
    }

    match code {
        OpCode::Read => {
            let len = check_payload(read_u64(reader).await?)?;
            let mut data = vec![0u8; len as usize];
            reader.read_exact(&mut data).await.map_err(eof_as_truncated)?;
            Ok(Response::Data(data))
        }
        OpCode::Access => {
            let kind = kind_from_byte(reader.read_u8().await.map_err(eof_as_truncated)?)?;
            let size = read_u64(reader).await?;
            Ok(Response::Attr(match kind {
                ObjectKind::File => ObjectAttr::file(size),
                ObjectKind::Directory => ObjectAttr::directory(),
            }))
        }
        OpCode::ListDir => {
            let count = read_u64(reader).await?;
            let mut entries = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                let kind = kind_from_byte(reader.read_u8().await.map_err(eof_as_truncated)?)?;
                let size = read_u64(reader).await?;
                let name = read_cstr(reader).await?;
                entries.push(RemoteEntry { name, kind, size });
            }
            Ok(Response::Listing(entries))
        }
        _ => Ok(Response::ok()),
    }
}

//! Venti `venti-02` wire protocol
//!
//! After a one-line version exchange every message is framed as
//! `size[2] type[1] tag[1] body`, where `size` is big-endian and counts the
//! bytes after itself. Strings (`[s]`) carry a 2-byte length, byte arrays
//! (`[n]`) a 1-byte count.

#![allow(clippy::cast_possible_truncation)]

use bytes::{BufMut, Bytes, BytesMut};
use s3venti_common::{SCORE_SIZE, Score};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// ── Message types ─────────────────────────────────────────────────────────────

const RERROR: u8 = 1;
const TPING: u8 = 2;
const RPING: u8 = 3;
const THELLO: u8 = 4;
const RHELLO: u8 = 5;
const TGOODBYE: u8 = 6;
const TREAD: u8 = 12;
const RREAD: u8 = 13;
const TWRITE: u8 = 14;
const RWRITE: u8 = 15;
const TSYNC: u8 = 16;
const RSYNC: u8 = 17;

/// Version line the server announces
pub const VERSION_LINE: &str = "venti-02-s3venti\n";

/// Longest client version line accepted
const MAX_VERSION_LINE: usize = 512;

/// Largest frame after the size prefix
pub const MAX_FRAME: usize = u16::MAX as usize;

/// Largest payload an Rread can carry (frame minus type and tag)
pub const MAX_DATA: usize = MAX_FRAME - 2;

/// Longest Rerror text (payload minus its string length prefix)
pub const MAX_ERROR: usize = MAX_DATA - 2;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("truncated {0} message")]
    Truncated(&'static str),
    #[error("message of {0} bytes exceeds frame limit")]
    TooLarge(usize),
    #[error("unsupported version line {0:?}")]
    Version(String),
    #[error("string field is not valid UTF-8")]
    Utf8,
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// One protocol message, without its tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Rerror {
        error: String,
    },
    Tping,
    Rping,
    Thello {
        version: String,
        uid: String,
        strength: u8,
        crypto: Vec<u8>,
        codec: Vec<u8>,
    },
    Rhello {
        sid: String,
        rcrypto: u8,
        rcodec: u8,
    },
    Tgoodbye,
    Tread {
        score: Score,
        block_type: u8,
        count: u16,
    },
    Rread {
        data: Bytes,
    },
    Twrite {
        block_type: u8,
        data: Bytes,
    },
    Rwrite {
        score: Score,
    },
    Tsync,
    Rsync,
}

impl Message {
    /// Build an Rerror, cutting the text to what fits in one frame
    pub fn rerror(text: impl Into<String>) -> Self {
        let mut error = text.into();
        if error.len() > MAX_ERROR {
            let mut end = MAX_ERROR;
            while !error.is_char_boundary(end) {
                end -= 1;
            }
            error.truncate(end);
        }
        Self::Rerror { error }
    }

    fn type_code(&self) -> u8 {
        match self {
            Self::Rerror { .. } => RERROR,
            Self::Tping => TPING,
            Self::Rping => RPING,
            Self::Thello { .. } => THELLO,
            Self::Rhello { .. } => RHELLO,
            Self::Tgoodbye => TGOODBYE,
            Self::Tread { .. } => TREAD,
            Self::Rread { .. } => RREAD,
            Self::Twrite { .. } => TWRITE,
            Self::Rwrite { .. } => RWRITE,
            Self::Tsync => TSYNC,
            Self::Rsync => RSYNC,
        }
    }
}

/// A tagged message; replies carry the tag of their request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub message: Message,
}

impl Frame {
    pub fn new(tag: u8, message: Message) -> Self {
        Self { tag, message }
    }

    /// Serialize including the size prefix
    pub fn encode(&self) -> ProtocolResult<Bytes> {
        let mut body = BytesMut::with_capacity(64);
        body.put_u8(self.message.type_code());
        body.put_u8(self.tag);

        match &self.message {
            Message::Rerror { error } => put_string(&mut body, error)?,
            Message::Tping
            | Message::Rping
            | Message::Tgoodbye
            | Message::Tsync
            | Message::Rsync => {}
            Message::Thello {
                version,
                uid,
                strength,
                crypto,
                codec,
            } => {
                put_string(&mut body, version)?;
                put_string(&mut body, uid)?;
                body.put_u8(*strength);
                put_array(&mut body, crypto)?;
                put_array(&mut body, codec)?;
            }
            Message::Rhello {
                sid,
                rcrypto,
                rcodec,
            } => {
                put_string(&mut body, sid)?;
                body.put_u8(*rcrypto);
                body.put_u8(*rcodec);
            }
            Message::Tread {
                score,
                block_type,
                count,
            } => {
                body.put_slice(score.as_bytes());
                body.put_u8(*block_type);
                body.put_u8(0);
                body.put_u16(*count);
            }
            Message::Rread { data } => body.put_slice(data),
            Message::Twrite { block_type, data } => {
                body.put_u8(*block_type);
                body.put_slice(&[0; 3]);
                body.put_slice(data);
            }
            Message::Rwrite { score } => body.put_slice(score.as_bytes()),
        }

        if body.len() > MAX_FRAME {
            return Err(ProtocolError::TooLarge(body.len()));
        }
        let mut frame = BytesMut::with_capacity(body.len() + 2);
        frame.put_u16(body.len() as u16);
        frame.put_slice(&body);
        Ok(frame.freeze())
    }

    /// Parse a frame body (everything after the size prefix)
    pub fn decode(body: Bytes) -> ProtocolResult<Self> {
        let mut r = Reader::new(body, "frame");
        let type_code = r.u8()?;
        let tag = r.u8()?;

        let message = match type_code {
            RERROR => Message::Rerror {
                error: r.with("Rerror").string()?,
            },
            TPING => Message::Tping,
            RPING => Message::Rping,
            THELLO => {
                r.what = "Thello";
                Message::Thello {
                    version: r.string()?,
                    uid: r.string()?,
                    strength: r.u8()?,
                    crypto: r.array()?,
                    codec: r.array()?,
                }
            }
            RHELLO => {
                r.what = "Rhello";
                Message::Rhello {
                    sid: r.string()?,
                    rcrypto: r.u8()?,
                    rcodec: r.u8()?,
                }
            }
            TGOODBYE => Message::Tgoodbye,
            TREAD => {
                r.what = "Tread";
                let score = Score::from_slice(&r.take(SCORE_SIZE)?)
                    .map_err(|_| ProtocolError::Truncated("Tread"))?;
                let block_type = r.u8()?;
                r.take(1)?;
                Message::Tread {
                    score,
                    block_type,
                    count: r.u16()?,
                }
            }
            RREAD => Message::Rread { data: r.rest() },
            TWRITE => {
                r.what = "Twrite";
                let block_type = r.u8()?;
                r.take(3)?;
                Message::Twrite {
                    block_type,
                    data: r.rest(),
                }
            }
            RWRITE => {
                r.what = "Rwrite";
                let score = Score::from_slice(&r.take(SCORE_SIZE)?)
                    .map_err(|_| ProtocolError::Truncated("Rwrite"))?;
                Message::Rwrite { score }
            }
            TSYNC => Message::Tsync,
            RSYNC => Message::Rsync,
            other => return Err(ProtocolError::UnknownType(other)),
        };
        Ok(Self { tag, message })
    }
}

fn put_string(buf: &mut BytesMut, s: &str) -> ProtocolResult<()> {
    let len = u16::try_from(s.len()).map_err(|_| ProtocolError::TooLarge(s.len()))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_array(buf: &mut BytesMut, a: &[u8]) -> ProtocolResult<()> {
    let len = u8::try_from(a.len()).map_err(|_| ProtocolError::TooLarge(a.len()))?;
    buf.put_u8(len);
    buf.put_slice(a);
    Ok(())
}

/// Bounds-checked cursor over a frame body
struct Reader {
    buf: Bytes,
    what: &'static str,
}

impl Reader {
    fn new(buf: Bytes, what: &'static str) -> Self {
        Self { buf, what }
    }

    fn with(&mut self, what: &'static str) -> &mut Self {
        self.what = what;
        self
    }

    fn take(&mut self, n: usize) -> ProtocolResult<Bytes> {
        if self.buf.len() < n {
            return Err(ProtocolError::Truncated(self.what));
        }
        Ok(self.buf.split_to(n))
    }

    fn u8(&mut self) -> ProtocolResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> ProtocolResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn string(&mut self) -> ProtocolResult<String> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::Utf8)
    }

    fn array(&mut self) -> ProtocolResult<Vec<u8>> {
        let len = self.u8()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn rest(&mut self) -> Bytes {
        std::mem::take(&mut self.buf)
    }
}

/// Read one frame. `Ok(None)` on a clean end of stream between frames.
pub async fn read_frame<R>(reader: &mut R) -> ProtocolResult<Option<Frame>>
where
    R: AsyncBufRead + Unpin,
{
    let mut size = [0u8; 2];
    match reader.read_exact(&mut size).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u16::from_be_bytes(size) as usize;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Frame::decode(Bytes::from(body)).map(Some)
}

/// Write one frame and flush it
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode()?).await?;
    writer.flush().await?;
    Ok(())
}

/// Server side of the version exchange. Returns the client's version line.
pub async fn negotiate_version<R, W>(reader: &mut R, writer: &mut W) -> ProtocolResult<String>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_all(VERSION_LINE.as_bytes()).await?;
    writer.flush().await?;

    let mut line = Vec::new();
    let mut limited = (&mut *reader).take(MAX_VERSION_LINE as u64);
    limited.read_until(b'\n', &mut line).await?;
    if !line.ends_with(b"\n") {
        return Err(ProtocolError::Version(
            String::from_utf8_lossy(&line).into_owned(),
        ));
    }

    let line = String::from_utf8(line).map_err(|_| ProtocolError::Utf8)?;
    let line = line.trim_end().to_string();
    if !supports_v02(&line) {
        return Err(ProtocolError::Version(line));
    }
    Ok(line)
}

/// `venti-<v1>:<v2>...-<software>` must list `02`
fn supports_v02(line: &str) -> bool {
    let Some(rest) = line.strip_prefix("venti-") else {
        return false;
    };
    let versions = rest.split('-').next().unwrap_or_default();
    versions.split(':').any(|v| v == "02")
}

//! Socket transport to an external simulator process.
//!
//! Each bus channel is one TCP connection to the bridge. The endpoint opens
//! the connection, announces which channel it wants, and from then on the
//! stream carries nothing but word frames. This module owns only byte I/O;
//! segmentation lives in [`crate::stream`].
//!
//! # Wire format
//!
//! ```text
//!  hello (once, endpoint → bridge)
//!  ┌──────────┬──────────────────┬───────────┐
//!  │ name_len │ channel name     │ direction │
//!  │ u8       │ name_len bytes   │ u8        │
//!  └──────────┴──────────────────┴───────────┘
//!
//!  word (repeated)
//!  ┌───────┬──────────┬──────────────┐
//!  │ flags │ len      │ data         │
//!  │ u8    │ u16 (BE) │ len bytes    │
//!  └───────┴──────────┴──────────────┘
//!  flags bit 0 = last word of frame; other bits must be zero.
//! ```

use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::bus::{TransportError, WordSink, WordSource};
use crate::stream::TransferWord;

const FLAG_LAST: u8 = 0b0000_0001;

/// Which way words flow on a channel, seen from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    /// Endpoint writes, device reads.
    ToDevice = 0,
    /// Device writes, endpoint reads.
    FromDevice = 1,
}

impl TryFrom<u8> for Direction {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::ToDevice),
            1 => Ok(Self::FromDevice),
            other => Err(TransportError::Framing(format!(
                "unknown channel direction {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

fn eof_as_closed(e: std::io::Error) -> TransportError {
    if e.kind() == ErrorKind::UnexpectedEof {
        TransportError::Closed
    } else {
        TransportError::Io(e)
    }
}

/// EOF once a header byte has been read cuts a transfer in half.
fn eof_as_truncated(what: &'static str) -> impl Fn(std::io::Error) -> TransportError {
    move |e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            TransportError::Framing(format!("stream ended inside {what}"))
        } else {
            TransportError::Io(e)
        }
    }
}

/// Send the channel announcement.
pub async fn write_hello<W>(
    writer: &mut W,
    channel: &str,
    direction: Direction,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let name = channel.as_bytes();
    let len = u8::try_from(name.len()).map_err(|_| {
        TransportError::Framing(format!("channel name `{channel}` longer than 255 bytes"))
    })?;
    let mut buf = Vec::with_capacity(2 + name.len());
    buf.push(len);
    buf.extend_from_slice(name);
    buf.push(direction as u8);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Receive a channel announcement (bridge side).
pub async fn read_hello<R>(reader: &mut R) -> Result<(String, Direction), TransportError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u8().await.map_err(eof_as_closed)?;
    let mut name = vec![0u8; usize::from(len)];
    reader
        .read_exact(&mut name)
        .await
        .map_err(eof_as_truncated("hello"))?;
    let name = String::from_utf8(name)
        .map_err(|e| TransportError::Framing(format!("channel name is not UTF-8: {e}")))?;
    let direction = reader
        .read_u8()
        .await
        .map_err(eof_as_truncated("hello"))?;
    let direction = Direction::try_from(direction)?;
    Ok((name, direction))
}

/// Encode one word onto `writer`.
pub async fn write_word<W>(writer: &mut W, word: &TransferWord) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let len = u16::try_from(word.data.len()).map_err(|_| {
        TransportError::Framing(format!("{} byte word exceeds u16 length", word.data.len()))
    })?;
    let mut buf = Vec::with_capacity(3 + word.data.len());
    buf.push(if word.last { FLAG_LAST } else { 0 });
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&word.data);
    writer.write_all(&buf).await?;
    Ok(())
}

/// Decode one word from `reader`. End of stream before a word starts is
/// [`TransportError::Closed`]; end of stream inside a word is
/// [`TransportError::Framing`].
pub async fn read_word<R>(reader: &mut R) -> Result<TransferWord, TransportError>
where
    R: AsyncRead + Unpin,
{
    let flags = reader.read_u8().await.map_err(eof_as_closed)?;
    if flags & !FLAG_LAST != 0 {
        return Err(TransportError::Framing(format!(
            "unknown word flags {flags:#04x}"
        )));
    }
    let len = reader.read_u16().await.map_err(eof_as_truncated("word header"))?;
    if len == 0 {
        return Err(TransportError::Framing("zero-length word".into()));
    }
    let mut data = vec![0u8; usize::from(len)];
    reader
        .read_exact(&mut data)
        .await
        .map_err(eof_as_truncated("word data"))?;
    Ok(TransferWord::new(data, flags & FLAG_LAST != 0))
}

// ---------------------------------------------------------------------------
// Socket halves
// ---------------------------------------------------------------------------

async fn open<A: ToSocketAddrs>(
    addr: A,
    channel: &str,
    direction: Direction,
) -> Result<TcpStream, TransportError> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    write_hello(&mut stream, channel, direction).await?;
    log::debug!("[bridge] opened {channel} ({direction:?})");
    Ok(stream)
}

/// Endpoint → device channel over a bridge connection.
#[derive(Debug)]
pub struct SocketSink {
    channel: String,
    stream: Option<TcpStream>,
}

impl SocketSink {
    /// Connect to the bridge at `addr` and claim `channel` for writing.
    pub async fn connect<A: ToSocketAddrs>(addr: A, channel: &str) -> Result<Self, TransportError> {
        let stream = open(addr, channel, Direction::ToDevice).await?;
        Ok(Self {
            channel: channel.to_owned(),
            stream: Some(stream),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl WordSink for SocketSink {
    async fn write(&mut self, word: TransferWord) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        write_word(stream, &word).await
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                log::debug!("[bridge] shutdown of {} failed: {e}", self.channel);
            }
            log::debug!("[bridge] closed {}", self.channel);
        }
    }
}

/// Device → endpoint channel over a bridge connection.
#[derive(Debug)]
pub struct SocketSource {
    channel: String,
    stream: Option<TcpStream>,
}

impl SocketSource {
    /// Connect to the bridge at `addr` and claim `channel` for reading.
    pub async fn connect<A: ToSocketAddrs>(addr: A, channel: &str) -> Result<Self, TransportError> {
        let stream = open(addr, channel, Direction::FromDevice).await?;
        Ok(Self {
            channel: channel.to_owned(),
            stream: Some(stream),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl WordSource for SocketSource {
    async fn read(&mut self) -> Result<TransferWord, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        read_word(stream).await
    }

    async fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            log::debug!("[bridge] closed {}", self.channel);
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

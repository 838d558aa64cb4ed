//! Bus transport abstraction.
//!
//! An endpoint talks to the simulated device through two unidirectional word
//! channels: a [`WordSink`] it writes to and a [`WordSource`] it reads from.
//! Both calls suspend until the transport has completed the transfer; there is
//! no timeout and no cancellation.
//!
//! Two transports exist:
//! - [`channel`] — an in-process bus on top of `tokio::sync::mpsc`, used for
//!   loopback wiring and tests.
//! - [`crate::bridge`] — a TCP bridge to an external simulator process.

use std::future::Future;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::stream::TransferWord;

/// Errors reported by a transport. The core never interprets them beyond
/// recognising [`TransportError::Closed`] at a frame boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer side of the channel is gone, or `disconnect` was called.
    #[error("bus channel closed")]
    Closed,
    /// Underlying I/O error from the OS.
    #[error("bus I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A transfer could not be encoded or decoded on the wire.
    #[error("bus framing error: {0}")]
    Framing(String),
}

/// Write half of a bus channel.
pub trait WordSink: Send + 'static {
    /// Transfer one word, suspending until the transport accepts it.
    fn write(
        &mut self,
        word: TransferWord,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Release the channel. Calling it more than once is a no-op.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;
}

/// Read half of a bus channel.
pub trait WordSource: Send + 'static {
    /// Wait for the next word.
    fn read(&mut self) -> impl Future<Output = Result<TransferWord, TransportError>> + Send;

    /// Release the channel. Calling it more than once is a no-op.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;
}

// ---------------------------------------------------------------------------
// In-process channel bus
// ---------------------------------------------------------------------------

/// Create a connected sink/source pair holding at most `capacity` words in
/// flight. Writes suspend while the channel is full.
pub fn channel(capacity: usize) -> (ChannelSink, ChannelSource) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ChannelSink { tx: Some(tx) }, ChannelSource { rx, closed: false })
}

/// Write half of an in-process bus.
#[derive(Debug)]
pub struct ChannelSink {
    tx: Option<mpsc::Sender<TransferWord>>,
}

/// Read half of an in-process bus.
#[derive(Debug)]
pub struct ChannelSource {
    rx: mpsc::Receiver<TransferWord>,
    closed: bool,
}

impl ChannelSource {
    /// Take a word if one is already queued, without waiting.
    pub fn try_read(&mut self) -> Option<TransferWord> {
        self.rx.try_recv().ok()
    }
}

impl WordSink for ChannelSink {
    async fn write(&mut self, word: TransferWord) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(word).await.map_err(|_| TransportError::Closed)
    }

    async fn disconnect(&mut self) {
        self.tx = None;
    }
}

impl WordSource for ChannelSource {
    async fn read(&mut self) -> Result<TransferWord, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.rx.recv().await.ok_or(TransportError::Closed)
    }

    async fn disconnect(&mut self) {
        self.rx.close();
        self.closed = true;
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

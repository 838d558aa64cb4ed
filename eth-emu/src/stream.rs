//! Frame ⇄ bus-word segmentation.
//!
//! The bus carries at most `bus_width` bytes per transfer. A frame of any
//! length is cut into consecutive [`TransferWord`]s; the final word carries
//! the `last` marker so the receiving side knows where the frame ends.
//!
//! ```text
//!  frame (19 bytes), bus width 8
//!  ┌────────┬────────┬───┐
//!  │ 8 B    │ 8 B    │3 B│
//!  └────────┴────────┴───┘
//!   last=0   last=0   last=1
//! ```
//!
//! [`segment`] and [`reassemble`] are the pure halves; [`transmit_frame`] and
//! [`receive_frame`] drive them against a [`WordSink`] / [`WordSource`].

use std::num::NonZeroUsize;
use std::slice::Chunks;

use thiserror::Error;

use crate::bus::{TransportError, WordSink, WordSource};
use crate::error::EndpointError;

/// Bus width used when none is configured.
pub const DEFAULT_BUS_WIDTH: NonZeroUsize = match NonZeroUsize::new(8) {
    Some(width) => width,
    None => panic!("default bus width must be non-zero"),
};

// ---------------------------------------------------------------------------
// TransferWord
// ---------------------------------------------------------------------------

/// One bus transfer: a slice of a frame plus the end-of-frame marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferWord {
    /// Valid bytes carried by this transfer.
    pub data: Vec<u8>,
    /// Set on the final word of a frame.
    pub last: bool,
}

impl TransferWord {
    pub fn new(data: Vec<u8>, last: bool) -> Self {
        Self { data, last }
    }

    /// Number of valid bytes in this word.
    pub fn valid_byte_count(&self) -> usize {
        self.data.len()
    }
}

/// Errors raised while splitting or rebuilding a frame.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    /// A zero-length frame cannot be put on the bus.
    #[error("cannot segment an empty payload")]
    EmptyPayload,
    /// The word stream ended before a `last` word was seen.
    #[error("word stream ended before the last word of the frame")]
    TruncatedStream,
    /// A received word carried no bytes.
    #[error("received an empty bus word")]
    EmptyWord,
    /// A received word carried more bytes than the bus is wide.
    #[error("received a {len} byte word on a {bus_width} byte bus")]
    OversizedWord { len: usize, bus_width: usize },
}

// ---------------------------------------------------------------------------
// Segmentation
// ---------------------------------------------------------------------------

/// Iterator over the words of one frame, produced by [`segment`].
#[derive(Debug, Clone)]
pub struct Segments<'a> {
    chunks: Chunks<'a, u8>,
}

impl Iterator for Segments<'_> {
    type Item = TransferWord;

    fn next(&mut self) -> Option<TransferWord> {
        let chunk = self.chunks.next()?;
        Some(TransferWord {
            data: chunk.to_vec(),
            last: self.chunks.len() == 0,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

impl ExactSizeIterator for Segments<'_> {}

/// Split `buffer` into words of at most `bus_width` bytes.
///
/// The returned iterator yields `ceil(len / bus_width)` words; only the last
/// one has `last` set.
pub fn segment(buffer: &[u8], bus_width: NonZeroUsize) -> Result<Segments<'_>, StreamError> {
    if buffer.is_empty() {
        return Err(StreamError::EmptyPayload);
    }
    Ok(Segments {
        chunks: buffer.chunks(bus_width.get()),
    })
}

// ---------------------------------------------------------------------------
// Reassembly
// ---------------------------------------------------------------------------

/// Incremental frame builder fed one word at a time.
///
/// Every word must carry at least one byte, and no more than the bus width
/// when one is set.
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: Vec<u8>,
    words: usize,
    bus_width: Option<NonZeroUsize>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reassembler that also rejects words wider than `bus_width`.
    pub fn with_bus_width(bus_width: NonZeroUsize) -> Self {
        Self {
            bus_width: Some(bus_width),
            ..Self::default()
        }
    }

    /// Append `word`; returns the completed frame when `word.last` is set.
    pub fn push(&mut self, word: TransferWord) -> Result<Option<Vec<u8>>, StreamError> {
        let len = word.valid_byte_count();
        if len == 0 {
            return Err(StreamError::EmptyWord);
        }
        if let Some(width) = self.bus_width.filter(|w| len > w.get()) {
            return Err(StreamError::OversizedWord {
                len,
                bus_width: width.get(),
            });
        }
        self.buffer.extend_from_slice(&word.data);
        self.words += 1;
        if word.last {
            self.words = 0;
            Ok(Some(std::mem::take(&mut self.buffer)))
        } else {
            Ok(None)
        }
    }

    /// `true` when no partial frame is buffered.
    pub fn is_idle(&self) -> bool {
        self.words == 0
    }

    /// Number of words buffered for the frame in progress.
    pub fn pending_words(&self) -> usize {
        self.words
    }

    /// Declare the input finished. Fails if a frame was left half-built.
    pub fn finish(self) -> Result<(), StreamError> {
        if self.is_idle() {
            Ok(())
        } else {
            Err(StreamError::TruncatedStream)
        }
    }
}

/// Rebuild one frame from `words`.
///
/// Consumes words up to and including the first `last` word; anything after
/// it is left in the iterator.
pub fn reassemble<I>(words: I) -> Result<Vec<u8>, StreamError>
where
    I: IntoIterator<Item = TransferWord>,
{
    let mut reassembler = Reassembler::new();
    for word in words {
        if let Some(frame) = reassembler.push(word)? {
            return Ok(frame);
        }
    }
    Err(StreamError::TruncatedStream)
}

// ---------------------------------------------------------------------------
// Bus drivers
// ---------------------------------------------------------------------------

/// Segment `frame` and write every word to `sink`, in order.
///
/// Returns the number of words written.
pub async fn transmit_frame<S>(
    sink: &mut S,
    frame: &[u8],
    bus_width: NonZeroUsize,
) -> Result<usize, EndpointError>
where
    S: WordSink,
{
    let words = segment(frame, bus_width)?;
    let count = words.len();
    for word in words {
        sink.write(word).await?;
    }
    log::trace!("wrote {} byte frame as {} word(s)", frame.len(), count);
    Ok(count)
}

/// Read words from `source` until a complete frame has arrived.
///
/// Returns `Ok(None)` if the source closes between frames and
/// [`StreamError::TruncatedStream`] if it closes in the middle of one.
/// Words outside `1..=bus_width` bytes are rejected.
pub async fn receive_frame<R>(
    source: &mut R,
    bus_width: NonZeroUsize,
) -> Result<Option<Vec<u8>>, EndpointError>
where
    R: WordSource,
{
    let mut reassembler = Reassembler::with_bus_width(bus_width);
    loop {
        match source.read().await {
            Ok(word) => {
                if let Some(frame) = reassembler.push(word)? {
                    return Ok(Some(frame));
                }
            }
            Err(TransportError::Closed) => {
                reassembler.finish()?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn width(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn exact_multiple_of_width() {
        let words: Vec<_> = segment(&[7u8; 16], width(8)).unwrap().collect();
        assert_eq!(words.len(), 2);
        assert!(words.iter().all(|w| w.valid_byte_count() == 8));
        assert!(!words[0].last);
        assert!(words[1].last);
    }

    #[test]
    fn short_tail_word() {
        let data: Vec<u8> = (0..19).collect();
        let words: Vec<_> = segment(&data, width(8)).unwrap().collect();
        let sizes: Vec<_> = words.iter().map(TransferWord::valid_byte_count).collect();
        assert_eq!(sizes, vec![8, 8, 3]);
        assert_eq!(words[2].data, vec![16, 17, 18]);
    }

    #[test]
    fn frame_smaller_than_bus_is_one_last_word() {
        let words: Vec<_> = segment(b"abc", width(64)).unwrap().collect();
        assert_eq!(words, vec![TransferWord::new(b"abc".to_vec(), true)]);
    }

    #[test]
    fn width_one_gives_one_word_per_byte() {
        let segments = segment(b"hello", width(1)).unwrap();
        assert_eq!(segments.len(), 5);
    }

    #[test]
    fn empty_payload_rejected_for_any_width() {
        for w in [1, 8, 64, 4096] {
            assert_eq!(segment(b"", width(w)).unwrap_err(), StreamError::EmptyPayload);
        }
    }

    #[test]
    fn reassemble_without_last_is_truncated() {
        let words = vec![
            TransferWord::new(b"abcd".to_vec(), false),
            TransferWord::new(b"efgh".to_vec(), false),
        ];
        assert_eq!(reassemble(words), Err(StreamError::TruncatedStream));
    }

    #[test]
    fn reassemble_empty_input_is_truncated() {
        assert_eq!(
            reassemble(Vec::<TransferWord>::new()),
            Err(StreamError::TruncatedStream)
        );
    }

    #[test]
    fn reassemble_stops_at_first_last_word() {
        let mut words = vec![
            TransferWord::new(b"ab".to_vec(), false),
            TransferWord::new(b"cd".to_vec(), true),
            TransferWord::new(b"next".to_vec(), true),
        ]
        .into_iter();
        assert_eq!(reassemble(&mut words).unwrap(), b"abcd");
        // The following frame is left untouched.
        assert_eq!(words.next().unwrap().data, b"next");
    }

    #[test]
    fn reassembler_tracks_partial_frames() {
        let mut r = Reassembler::new();
        assert!(r.is_idle());
        assert_eq!(r.push(TransferWord::new(vec![1, 2], false)), Ok(None));
        assert_eq!(r.pending_words(), 1);
        assert_eq!(
            r.push(TransferWord::new(vec![3], true)),
            Ok(Some(vec![1, 2, 3]))
        );
        assert!(r.is_idle());
        // A second frame starts from a clean buffer.
        assert_eq!(r.push(TransferWord::new(vec![9], true)), Ok(Some(vec![9])));
        assert!(r.finish().is_ok());
    }

    #[test]
    fn reassembler_finish_with_partial_frame_fails() {
        let mut r = Reassembler::new();
        r.push(TransferWord::new(vec![1], false)).unwrap();
        assert_eq!(r.finish(), Err(StreamError::TruncatedStream));
    }

    #[test]
    fn reassembler_rejects_empty_and_oversized_words() {
        let mut r = Reassembler::with_bus_width(width(4));
        assert_eq!(
            r.push(TransferWord::new(vec![], true)),
            Err(StreamError::EmptyWord)
        );
        assert_eq!(
            r.push(TransferWord::new(vec![0; 5], true)),
            Err(StreamError::OversizedWord {
                len: 5,
                bus_width: 4
            })
        );
        assert_eq!(r.push(TransferWord::new(vec![0; 4], true)), Ok(Some(vec![0; 4])));

        // Without a width only empty words are refused.
        assert_eq!(
            reassemble(vec![TransferWord::new(vec![], true)]),
            Err(StreamError::EmptyWord)
        );
        assert_eq!(
            reassemble(vec![TransferWord::new(vec![0; 64], true)]).unwrap().len(),
            64
        );
    }

    #[tokio::test]
    async fn receive_frame_rejects_word_wider_than_bus() {
        let (mut sink, mut source) = crate::bus::channel(4);
        sink.write(TransferWord::new(vec![0; 9], true)).await.unwrap();
        assert!(matches!(
            receive_frame(&mut source, width(8)).await,
            Err(EndpointError::Stream(StreamError::OversizedWord {
                len: 9,
                bus_width: 8
            }))
        ));
    }

    proptest! {
        #[test]
        fn segment_then_reassemble_is_identity(
            data in proptest::collection::vec(any::<u8>(), 1..2048),
            w in 1usize..96,
        ) {
            let words: Vec<_> = segment(&data, width(w)).unwrap().collect();
            prop_assert_eq!(reassemble(words).unwrap(), data);
        }

        #[test]
        fn words_are_sized_and_terminated(
            data in proptest::collection::vec(any::<u8>(), 1..2048),
            w in 1usize..96,
        ) {
            let words: Vec<_> = segment(&data, width(w)).unwrap().collect();
            prop_assert_eq!(words.len(), data.len().div_ceil(w));
            prop_assert!(words.iter().all(|x| (1..=w).contains(&x.valid_byte_count())));
            prop_assert_eq!(words.iter().filter(|x| x.last).count(), 1);
            prop_assert!(words.last().unwrap().last);
            let total: usize = words.iter().map(TransferWord::valid_byte_count).sum();
            prop_assert_eq!(total, data.len());
        }
    }
}

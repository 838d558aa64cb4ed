//! Classic pcap capture files.
//!
//! Stimulus frames are read from a capture once, at startup; received frames
//! are appended to an output capture one record at a time.
//!
//! # File layout
//!
//! ```text
//!  global header (24 bytes)
//!  ┌───────┬─────────┬─────────┬──────────┬─────────┬─────────┬──────────┐
//!  │ magic │ v.major │ v.minor │ thiszone │ sigfigs │ snaplen │ linktype │
//!  │ 4     │ 2       │ 2       │ 4        │ 4       │ 4       │ 4        │
//!  └───────┴─────────┴─────────┴──────────┴─────────┴─────────┴──────────┘
//!  record header (16 bytes), then incl_len bytes of frame
//!  ┌─────────┬──────────┬──────────┬──────────┐
//!  │ ts_sec  │ ts_frac  │ incl_len │ orig_len │
//!  └─────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! The magic number fixes the byte order and whether `ts_frac` counts
//! microseconds or nanoseconds. Only link type 1 (Ethernet) is accepted.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;

const MAGIC_MICROS: u32 = 0xa1b2_c3d4;
const MAGIC_NANOS: u32 = 0xa1b2_3c4d;
const VERSION_MAJOR: u16 = 2;
const VERSION_MINOR: u16 = 4;
const SNAPLEN: u32 = 65_535;
const LINKTYPE_ETHERNET: u32 = 1;

/// Byte length of the file header.
pub const GLOBAL_HEADER_LEN: usize = 24;
/// Byte length of each record header.
pub const RECORD_HEADER_LEN: usize = 16;

// Byte offsets within the global header.
const OFF_MAGIC: usize = 0;
const OFF_LINKTYPE: usize = 20;

// Byte offsets within a record header.
const OFF_TS_SEC: usize = 0;
const OFF_TS_FRAC: usize = 4;
const OFF_INCL_LEN: usize = 8;
const OFF_ORIG_LEN: usize = 12;

/// Errors that can arise reading or writing a capture.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The file does not start with a pcap magic number.
    #[error("not a pcap capture (magic {0:#010x})")]
    BadMagic(u32),
    /// Frames are not Ethernet.
    #[error("unsupported capture link type {0}")]
    UnsupportedLinkType(u32),
    /// Fewer than 24 bytes in the file.
    #[error("capture header truncated")]
    TruncatedHeader,
    /// A record header or its data runs past the end of the file.
    #[error("capture record {index} truncated")]
    TruncatedRecord { index: usize },
}

// ---------------------------------------------------------------------------
// Format detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Format {
    big_endian: bool,
    nanos: bool,
}

impl Format {
    const NATIVE: Self = Self {
        big_endian: false,
        nanos: false,
    };

    fn detect(header: &[u8]) -> Result<Self, CaptureError> {
        if header.len() < GLOBAL_HEADER_LEN {
            return Err(CaptureError::TruncatedHeader);
        }
        let raw: [u8; 4] = [header[0], header[1], header[2], header[3]];
        let format = match (u32::from_le_bytes(raw), u32::from_be_bytes(raw)) {
            (MAGIC_MICROS, _) => Self { big_endian: false, nanos: false },
            (MAGIC_NANOS, _) => Self { big_endian: false, nanos: true },
            (_, MAGIC_MICROS) => Self { big_endian: true, nanos: false },
            (_, MAGIC_NANOS) => Self { big_endian: true, nanos: true },
            (le, _) => return Err(CaptureError::BadMagic(le)),
        };
        let link = format.u32_at(header, OFF_LINKTYPE);
        if link != LINKTYPE_ETHERNET {
            return Err(CaptureError::UnsupportedLinkType(link));
        }
        Ok(format)
    }

    fn u32_at(self, buf: &[u8], off: usize) -> u32 {
        let raw = [buf[off], buf[off + 1], buf[off + 2], buf[off + 3]];
        if self.big_endian {
            u32::from_be_bytes(raw)
        } else {
            u32::from_le_bytes(raw)
        }
    }

    fn put_u32(self, buf: &mut [u8], off: usize, value: u32) {
        let bytes = if self.big_endian {
            value.to_be_bytes()
        } else {
            value.to_le_bytes()
        };
        buf[off..off + 4].copy_from_slice(&bytes);
    }

    fn put_u16(self, buf: &mut [u8], off: usize, value: u16) {
        let bytes = if self.big_endian {
            value.to_be_bytes()
        } else {
            value.to_le_bytes()
        };
        buf[off..off + 2].copy_from_slice(&bytes);
    }

    fn global_header(self) -> [u8; GLOBAL_HEADER_LEN] {
        let mut buf = [0u8; GLOBAL_HEADER_LEN];
        let magic = if self.nanos { MAGIC_NANOS } else { MAGIC_MICROS };
        self.put_u32(&mut buf, OFF_MAGIC, magic);
        self.put_u16(&mut buf, 4, VERSION_MAJOR);
        self.put_u16(&mut buf, 6, VERSION_MINOR);
        // thiszone and sigfigs stay zero.
        self.put_u32(&mut buf, 16, SNAPLEN);
        self.put_u32(&mut buf, OFF_LINKTYPE, LINKTYPE_ETHERNET);
        buf
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Decode every frame in an in-memory capture, in file order.
pub fn parse_capture(bytes: &[u8]) -> Result<Vec<Vec<u8>>, CaptureError> {
    let format = Format::detect(bytes)?;
    let mut frames = Vec::new();
    let mut rest = &bytes[GLOBAL_HEADER_LEN..];

    while !rest.is_empty() {
        let index = frames.len();
        if rest.len() < RECORD_HEADER_LEN {
            return Err(CaptureError::TruncatedRecord { index });
        }
        let incl_len = format.u32_at(rest, OFF_INCL_LEN) as usize;
        let end = RECORD_HEADER_LEN + incl_len;
        if rest.len() < end {
            return Err(CaptureError::TruncatedRecord { index });
        }
        frames.push(rest[RECORD_HEADER_LEN..end].to_vec());
        rest = &rest[end..];
    }

    Ok(frames)
}

/// Read every frame of the capture at `path`.
pub fn read_frames(path: impl AsRef<Path>) -> Result<Vec<Vec<u8>>, CaptureError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    let frames = parse_capture(&bytes)?;
    log::debug!("read {} frame(s) from {}", frames.len(), path.display());
    Ok(frames)
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// Appends records to a capture file.
///
/// A new or empty file gets a little-endian microsecond header. An existing
/// capture keeps its own byte order and timestamp resolution.
#[derive(Debug)]
pub struct CaptureWriter {
    path: PathBuf,
    file: File,
    format: Format,
    written: usize,
}

impl CaptureWriter {
    /// Open `path` for appending, creating it if needed.
    pub fn append(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let format = if file.metadata()?.len() == 0 {
            let format = Format::NATIVE;
            file.write_all(&format.global_header())?;
            format
        } else {
            let mut header = [0u8; GLOBAL_HEADER_LEN];
            file.read_exact(&mut header)
                .map_err(|_| CaptureError::TruncatedHeader)?;
            Format::detect(&header)?
        };

        Ok(Self {
            path,
            file,
            format,
            written: 0,
        })
    }

    /// Append `frame` stamped with the current time.
    pub fn write_frame(&mut self, frame: &[u8]) -> Result<(), CaptureError> {
        self.write_frame_at(frame, Utc::now())
    }

    /// Append `frame` stamped with `timestamp`.
    pub fn write_frame_at(
        &mut self,
        frame: &[u8],
        timestamp: DateTime<Utc>,
    ) -> Result<(), CaptureError> {
        let len = u32::try_from(frame.len()).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} byte frame does not fit a capture record", frame.len()),
            )
        })?;
        let frac = if self.format.nanos {
            timestamp.timestamp_subsec_nanos()
        } else {
            timestamp.timestamp_subsec_micros()
        };

        let mut record = Vec::with_capacity(RECORD_HEADER_LEN + frame.len());
        record.resize(RECORD_HEADER_LEN, 0);
        // pcap seconds are 32-bit; wraps in 2106.
        self.format
            .put_u32(&mut record, OFF_TS_SEC, timestamp.timestamp() as u32);
        self.format.put_u32(&mut record, OFF_TS_FRAC, frac);
        self.format.put_u32(&mut record, OFF_INCL_LEN, len);
        self.format.put_u32(&mut record, OFF_ORIG_LEN, len);
        record.extend_from_slice(frame);

        self.file.write_all(&record)?;
        self.file.flush()?;
        self.written += 1;
        log::trace!("appended record {} to {}", self.written, self.path.display());
        Ok(())
    }

    /// Records appended through this writer.
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn big_endian_nanos_capture(frames: &[&[u8]]) -> Vec<u8> {
        let format = Format {
            big_endian: true,
            nanos: true,
        };
        let mut bytes = format.global_header().to_vec();
        for frame in frames {
            let mut header = [0u8; RECORD_HEADER_LEN];
            format.put_u32(&mut header, OFF_TS_SEC, 1);
            format.put_u32(&mut header, OFF_TS_FRAC, 999_999_999);
            format.put_u32(&mut header, OFF_INCL_LEN, frame.len() as u32);
            format.put_u32(&mut header, OFF_ORIG_LEN, frame.len() as u32);
            bytes.extend_from_slice(&header);
            bytes.extend_from_slice(frame);
        }
        bytes
    }

    #[test]
    fn written_frames_read_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.pcap");

        let mut writer = CaptureWriter::append(&path).unwrap();
        writer.write_frame(b"first frame").unwrap();
        writer.write_frame(&[0xaa; 60]).unwrap();
        assert_eq!(writer.written(), 2);
        drop(writer);

        let frames = read_frames(&path).unwrap();
        assert_eq!(frames, vec![b"first frame".to_vec(), vec![0xaa; 60]]);
    }

    #[test]
    fn reopening_appends_without_second_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.pcap");

        CaptureWriter::append(&path).unwrap().write_frame(b"a").unwrap();
        CaptureWriter::append(&path).unwrap().write_frame(b"b").unwrap();

        let frames = read_frames(&path).unwrap();
        assert_eq!(frames, vec![b"a".to_vec(), b"b".to_vec()]);
        let len = std::fs::metadata(&path).unwrap().len() as usize;
        assert_eq!(len, GLOBAL_HEADER_LEN + 2 * (RECORD_HEADER_LEN + 1));
    }

    #[test]
    fn empty_existing_file_gets_header() {
        let file = tempfile::NamedTempFile::new().unwrap();
        CaptureWriter::append(file.path()).unwrap();
        assert!(read_frames(file.path()).unwrap().is_empty());
    }

    #[test]
    fn header_is_little_endian_micros_ethernet() {
        let header = Format::NATIVE.global_header();
        assert_eq!(&header[0..4], &[0xd4, 0xc3, 0xb2, 0xa1]);
        assert_eq!(&header[20..24], &[1, 0, 0, 0]);
    }

    #[test]
    fn record_timestamp_encoding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ts.pcap");
        let at = Utc.timestamp_opt(1_700_000_000, 123_456_000).unwrap();

        let mut writer = CaptureWriter::append(&path).unwrap();
        writer.write_frame_at(b"xyz", at).unwrap();
        drop(writer);

        let bytes = std::fs::read(&path).unwrap();
        let record = &bytes[GLOBAL_HEADER_LEN..];
        assert_eq!(Format::NATIVE.u32_at(record, OFF_TS_SEC), 1_700_000_000);
        assert_eq!(Format::NATIVE.u32_at(record, OFF_TS_FRAC), 123_456);
        assert_eq!(Format::NATIVE.u32_at(record, OFF_INCL_LEN), 3);
    }

    #[test]
    fn big_endian_nanosecond_capture_is_read() {
        let bytes = big_endian_nanos_capture(&[b"one", b"three"]);
        let frames = parse_capture(&bytes).unwrap();
        assert_eq!(frames, vec![b"one".to_vec(), b"three".to_vec()]);
    }

    #[test]
    fn append_keeps_existing_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("be.pcap");
        std::fs::write(&path, big_endian_nanos_capture(&[b"old"])).unwrap();

        CaptureWriter::append(&path).unwrap().write_frame(b"new").unwrap();
        let frames = read_frames(&path).unwrap();
        assert_eq!(frames, vec![b"old".to_vec(), b"new".to_vec()]);
    }

    #[test]
    fn bad_magic_rejected() {
        let bytes = [0u8; GLOBAL_HEADER_LEN];
        assert!(matches!(
            parse_capture(&bytes),
            Err(CaptureError::BadMagic(0))
        ));
    }

    #[test]
    fn non_ethernet_link_rejected() {
        let mut bytes = Format::NATIVE.global_header();
        Format::NATIVE.put_u32(&mut bytes, OFF_LINKTYPE, 101);
        assert!(matches!(
            parse_capture(&bytes),
            Err(CaptureError::UnsupportedLinkType(101))
        ));
    }

    #[test]
    fn short_header_rejected() {
        assert!(matches!(
            parse_capture(&[0xd4, 0xc3, 0xb2, 0xa1]),
            Err(CaptureError::TruncatedHeader)
        ));
    }

    #[test]
    fn truncated_record_reports_index() {
        let mut bytes = big_endian_nanos_capture(&[b"complete", b"cut short"]);
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            parse_capture(&bytes),
            Err(CaptureError::TruncatedRecord { index: 1 })
        ));
    }
}

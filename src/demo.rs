//! Source engine demo (`.dem`) message stream walker.
//!
//! A demo starts with the `HL2DEMO\0` signature followed by a fixed-size
//! header region that we never interpret. After it comes a stream of
//! messages: a 1-byte signed type tag, a 4-byte little-endian tick and, for
//! data-bearing types, a fixed prefix plus a `u32` length-prefixed payload.
//! The `Stop` message ends the stream and carries no tick.
//!
//! There is no resync marker in the format: a single wrong prefix length
//! desynchronises every following message. The per-type layout therefore
//! lives in one table ([`MESSAGE_TABLE`]) instead of being spread across
//! branches.
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use thiserror::Error;
use tracing::{trace, warn};

/// Signature every demo must start with.
pub const DEMO_MAGIC: [u8; 8] = *b"HL2DEMO\0";
/// Absolute offset of the first message (magic + opaque header region).
pub const DEMO_HEADER_SIZE: u64 = 0x430;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(i8)]
pub enum MessageType {
    Nop = 0,
    Signon = 1,
    Packet = 2,
    SyncTick = 3,
    ConsoleCmd = 4,
    UserCmd = 5,
    DataTables = 6,
    Stop = 7,
    StringTables = 8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MessageCategory {
    /// Nothing follows the tick.
    ContentFree,
    /// Fixed prefix, then a `u32` payload length, then the payload.
    DataBearing,
    /// Ends the stream; no tick field.
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageLayout {
    pub category: MessageCategory,
    /// Bytes between the tick and the payload length field.
    pub prefix_len: u32,
}

const fn content_free() -> MessageLayout {
    MessageLayout { category: MessageCategory::ContentFree, prefix_len: 0 }
}

const fn data(prefix_len: u32) -> MessageLayout {
    MessageLayout { category: MessageCategory::DataBearing, prefix_len }
}

const fn terminal() -> MessageLayout {
    MessageLayout { category: MessageCategory::Terminal, prefix_len: 0 }
}

/// Wire layout per message type, indexed by tag value.
pub const MESSAGE_TABLE: [(MessageType, MessageLayout); 9] = [
    (MessageType::Nop, content_free()),
    (MessageType::Signon, data(0x54)),
    (MessageType::Packet, data(0x54)),
    (MessageType::SyncTick, content_free()),
    (MessageType::ConsoleCmd, data(0)),
    (MessageType::UserCmd, data(0x4)),
    (MessageType::DataTables, data(0)),
    (MessageType::Stop, terminal()),
    (MessageType::StringTables, data(0)),
];

impl MessageType {
    /// Map a raw tag to a known type; `None` for anything outside the table.
    pub fn from_tag(tag: i8) -> Option<Self> {
        usize::try_from(tag).ok().and_then(|idx| MESSAGE_TABLE.get(idx)).map(|(kind, _)| *kind)
    }

    pub fn tag(self) -> i8 {
        self as i8
    }

    pub fn layout(self) -> MessageLayout {
        MESSAGE_TABLE[self as usize].1
    }
}

/// What to do when the stream ends on a message boundary without a `Stop`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EofPolicy {
    /// Missing `Stop` is a truncation error.
    #[default]
    Strict,
    /// Missing `Stop` ends the stream; the last tick seen so far is kept.
    SoftEnd,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanOptions {
    pub eof_policy: EofPolicy,
}

impl ScanOptions {
    pub fn soft_end() -> Self {
        Self { eof_policy: EofPolicy::SoftEnd }
    }
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("invalid demo signature {found:02x?} (expected \"HL2DEMO\\0\")")]
    InvalidMagic { found: [u8; 8] },

    #[error("demo truncated at offset {offset:#x}")]
    UnexpectedEof { offset: u64 },

    #[error("unknown message type {tag} at offset {offset:#x}")]
    UnknownMessageType { tag: i8, offset: u64 },

    #[error("I/O error reading demo: {0}")]
    Io(#[from] io::Error),
}

/// One message as seen on the wire. The payload itself is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MessageHeader {
    /// Offset of the type tag.
    pub offset: u64,
    pub kind: MessageType,
    pub tick: i32,
    /// Declared payload length for data-bearing messages.
    pub payload_len: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Tick of the last message whose tick was non-negative.
    pub last_tick: Option<i32>,
    /// Messages read, not counting `Stop`.
    pub messages: u64,
    /// Stream offset where scanning ended (just past `Stop` on a complete demo).
    pub end_offset: u64,
}

/// Walks the message stream of a demo.
///
/// Generic over `R: Read + Seek` so tests can use `Cursor<Vec<u8>>` and
/// production code can use `BufReader<File>`. Payloads are skipped with
/// seeks against the known stream length, so a truncated payload surfaces
/// as [`ScanError::UnexpectedEof`] at the offset where it should begin.
pub struct DemoReader<R> {
    reader: R,
    offset: u64,
    len: u64,
    eof_policy: EofPolicy,
    finished: bool,
}

impl<R: Read + Seek> DemoReader<R> {
    pub fn open(reader: R) -> Result<Self, ScanError> {
        Self::with_options(reader, &ScanOptions::default())
    }

    /// Validate the signature and position the reader on the first message.
    pub fn with_options(mut reader: R, options: &ScanOptions) -> Result<Self, ScanError> {
        let len = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;
        let mut demo = Self { reader, offset: 0, len, eof_policy: options.eof_policy, finished: false };
        let found: [u8; 8] = demo.read_array()?;
        if found != DEMO_MAGIC {
            return Err(ScanError::InvalidMagic { found });
        }
        demo.skip(DEMO_HEADER_SIZE - DEMO_MAGIC.len() as u64)?;
        Ok(demo)
    }

    /// Current stream offset.
    pub fn position(&self) -> u64 {
        self.offset
    }

    /// Read the next message header, or `None` once `Stop` has been read.
    pub fn next_message(&mut self) -> Result<Option<MessageHeader>, ScanError> {
        if self.finished {
            return Ok(None);
        }
        let offset = self.offset;
        if offset >= self.len {
            return match self.eof_policy {
                EofPolicy::Strict => Err(ScanError::UnexpectedEof { offset }),
                EofPolicy::SoftEnd => {
                    warn!(offset, "demo ended without a Stop message");
                    self.finished = true;
                    Ok(None)
                }
            };
        }

        let [raw] = self.read_array::<1>()?;
        let tag = raw as i8;
        let known = MessageType::from_tag(tag).map(|kind| (kind, kind.layout()));
        if let Some((_, MessageLayout { category: MessageCategory::Terminal, .. })) = known {
            trace!(offset, "stop");
            self.finished = true;
            return Ok(None);
        }

        let tick = i32::from_le_bytes(self.read_array()?);
        let (kind, layout) = known.ok_or(ScanError::UnknownMessageType { tag, offset })?;
        let payload_len = match layout.category {
            MessageCategory::DataBearing => {
                self.skip(u64::from(layout.prefix_len))?;
                let len = u32::from_le_bytes(self.read_array()?);
                self.skip(u64::from(len))?;
                Some(len)
            }
            MessageCategory::ContentFree | MessageCategory::Terminal => None,
        };
        trace!(offset, ?kind, tick, ?payload_len, "message");
        Ok(Some(MessageHeader { offset, kind, tick, payload_len }))
    }

    /// Convert into a message iterator.
    pub fn messages(self) -> Messages<R> {
        Messages { demo: self, done: false }
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], ScanError> {
        let mut buf = [0u8; N];
        match self.reader.read_exact(&mut buf) {
            Ok(()) => {
                self.offset += N as u64;
                Ok(buf)
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(ScanError::UnexpectedEof { offset: self.offset })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn skip(&mut self, n: u64) -> Result<(), ScanError> {
        let target = self.offset + n;
        if target > self.len {
            return Err(ScanError::UnexpectedEof { offset: self.offset });
        }
        self.reader.seek(SeekFrom::Start(target))?;
        self.offset = target;
        Ok(())
    }
}

/// Iterator adapter over demo messages. Stops after the first error.
pub struct Messages<R> {
    demo: DemoReader<R>,
    done: bool,
}

impl<R> Messages<R> {
    pub fn position(&self) -> u64 {
        self.demo.offset
    }
}

impl<R: Read + Seek> Iterator for Messages<R> {
    type Item = Result<MessageHeader, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.demo.next_message() {
            Ok(Some(msg)) => Some(Ok(msg)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Last non-negative tick of the demo at `path`, with the strict EOF policy.
pub fn scan(path: impl AsRef<Path>) -> Result<Option<i32>, ScanError> {
    scan_with(path, &ScanOptions::default())
}

pub fn scan_with(path: impl AsRef<Path>, options: &ScanOptions) -> Result<Option<i32>, ScanError> {
    Ok(scan_report(path, options)?.last_tick)
}

pub fn scan_report(path: impl AsRef<Path>, options: &ScanOptions) -> Result<ScanReport, ScanError> {
    let file = File::open(path.as_ref())?;
    scan_report_reader(BufReader::new(file), options)
}

pub fn scan_reader<R: Read + Seek>(reader: R, options: &ScanOptions) -> Result<Option<i32>, ScanError> {
    Ok(scan_report_reader(reader, options)?.last_tick)
}

pub fn scan_report_reader<R: Read + Seek>(reader: R, options: &ScanOptions) -> Result<ScanReport, ScanError> {
    let mut demo = DemoReader::with_options(reader, options)?;
    let mut last_tick = None;
    let mut messages = 0u64;
    while let Some(msg) = demo.next_message()? {
        messages += 1;
        if msg.tick >= 0 {
            last_tick = Some(msg.tick);
        }
    }
    Ok(ScanReport { last_tick, messages, end_offset: demo.position() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn header() -> Vec<u8> {
        let mut bytes = DEMO_MAGIC.to_vec();
        bytes.resize(DEMO_HEADER_SIZE as usize, 0);
        bytes
    }

    fn push_msg(bytes: &mut Vec<u8>, tag: i8, tick: i32, prefix: usize, payload: Option<&[u8]>) {
        bytes.push(tag as u8);
        bytes.extend_from_slice(&tick.to_le_bytes());
        if let Some(p) = payload {
            bytes.extend(std::iter::repeat_n(0xAAu8, prefix));
            bytes.extend_from_slice(&(p.len() as u32).to_le_bytes());
            bytes.extend_from_slice(p);
        }
    }

    #[test]
    fn layout_table_matches_wire_format() {
        use MessageCategory::*;
        let expected = [
            (0, ContentFree, 0),
            (1, DataBearing, 0x54),
            (2, DataBearing, 0x54),
            (3, ContentFree, 0),
            (4, DataBearing, 0),
            (5, DataBearing, 0x4),
            (6, DataBearing, 0),
            (7, Terminal, 0),
            (8, DataBearing, 0),
        ];
        for (tag, category, prefix_len) in expected {
            let kind = MessageType::from_tag(tag).unwrap();
            assert_eq!(kind.tag(), tag);
            assert_eq!(kind.layout(), MessageLayout { category, prefix_len }, "{kind:?}");
        }
        assert_eq!(MessageType::from_tag(9), None);
        assert_eq!(MessageType::from_tag(-1), None);
        assert_eq!(MessageType::from_tag(i8::MAX), None);
    }

    #[test]
    fn stop_right_after_header_has_no_tick() {
        let mut bytes = header();
        bytes.push(7);
        let report = scan_report_reader(Cursor::new(bytes), &ScanOptions::default()).unwrap();
        assert_eq!(report.last_tick, None);
        assert_eq!(report.messages, 0);
        assert_eq!(report.end_offset, DEMO_HEADER_SIZE + 1);
    }

    #[test]
    fn negative_ticks_never_replace_last_tick() {
        let mut bytes = header();
        push_msg(&mut bytes, 0, -1, 0, None);
        push_msg(&mut bytes, 3, 10, 0, None);
        push_msg(&mut bytes, 4, -5, 0, Some(b"echo hi\0"));
        push_msg(&mut bytes, 3, 0, 0, None);
        push_msg(&mut bytes, 0, -100, 0, None);
        bytes.push(7);
        let tick = scan_reader(Cursor::new(bytes), &ScanOptions::default()).unwrap();
        assert_eq!(tick, Some(0));
    }

    #[test]
    fn each_data_type_lands_on_next_tag() {
        for (tag, prefix) in [(1i8, 0x54usize), (2, 0x54), (4, 0), (5, 4), (6, 0), (8, 0)] {
            let mut bytes = header();
            push_msg(&mut bytes, tag, 42, prefix, Some(&[7u8; 13]));
            let next = bytes.len() as u64;
            push_msg(&mut bytes, 3, 43, 0, None);
            bytes.push(7);

            let mut demo = DemoReader::open(Cursor::new(bytes)).unwrap();
            let first = demo.next_message().unwrap().unwrap();
            assert_eq!(first.offset, DEMO_HEADER_SIZE);
            assert_eq!(first.tick, 42);
            assert_eq!(first.payload_len, Some(13));
            assert_eq!(demo.position(), next, "tag {tag}");
            let second = demo.next_message().unwrap().unwrap();
            assert_eq!((second.kind, second.tick), (MessageType::SyncTick, 43));
            assert!(demo.next_message().unwrap().is_none());
        }
    }

    #[test]
    fn flipped_magic_reads_only_the_signature() {
        let mut bytes = header();
        bytes[3] ^= 0xFF;
        bytes.push(7);
        let mut cursor = Cursor::new(bytes);
        let err = DemoReader::open(&mut cursor).err().unwrap();
        assert!(matches!(err, ScanError::InvalidMagic { found } if found[3] == b'D' ^ 0xFF));
        assert_eq!(cursor.position(), 8);
    }

    #[test]
    fn unknown_tag_reports_value_and_offset() {
        let mut bytes = header();
        push_msg(&mut bytes, 3, 1, 0, None);
        let bad_at = bytes.len() as u64;
        push_msg(&mut bytes, -3, 2, 0, None);
        bytes.push(7);
        match scan_reader(Cursor::new(bytes), &ScanOptions::default()) {
            Err(ScanError::UnknownMessageType { tag, offset }) => {
                assert_eq!(tag, -3);
                assert_eq!(offset, bad_at);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn truncated_payload_is_unexpected_eof() {
        let mut bytes = header();
        push_msg(&mut bytes, 2, 5, 0x54, Some(&[1u8; 32]));
        bytes.truncate(bytes.len() - 8);
        let payload_at = DEMO_HEADER_SIZE + 1 + 4 + 0x54 + 4;
        match scan_reader(Cursor::new(bytes), &ScanOptions::soft_end()) {
            Err(ScanError::UnexpectedEof { offset }) => assert_eq!(offset, payload_at),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn truncated_header_and_short_file() {
        let short = b"HL2D".to_vec();
        assert!(matches!(
            scan_reader(Cursor::new(short), &ScanOptions::default()),
            Err(ScanError::UnexpectedEof { offset: 0 })
        ));
        let magic_only = DEMO_MAGIC.to_vec();
        assert!(matches!(
            scan_reader(Cursor::new(magic_only), &ScanOptions::soft_end()),
            Err(ScanError::UnexpectedEof { offset: 8 })
        ));
    }

    #[test]
    fn missing_stop_follows_eof_policy() {
        let mut bytes = header();
        push_msg(&mut bytes, 3, 77, 0, None);
        let end = bytes.len() as u64;

        match scan_reader(Cursor::new(bytes.clone()), &ScanOptions::default()) {
            Err(ScanError::UnexpectedEof { offset }) => assert_eq!(offset, end),
            other => panic!("unexpected result: {other:?}"),
        }
        let tick = scan_reader(Cursor::new(bytes), &ScanOptions::soft_end()).unwrap();
        assert_eq!(tick, Some(77));
    }

    #[test]
    fn truncated_tick_is_eof_even_when_soft() {
        let mut bytes = header();
        bytes.extend_from_slice(&[3, 1, 0]);
        assert!(matches!(
            scan_reader(Cursor::new(bytes), &ScanOptions::soft_end()),
            Err(ScanError::UnexpectedEof { offset }) if offset == DEMO_HEADER_SIZE + 1
        ));
    }

    #[test]
    fn iterator_stops_after_error() {
        let mut bytes = header();
        push_msg(&mut bytes, 0, 1, 0, None);
        push_msg(&mut bytes, 42, 2, 0, None);
        let demo = DemoReader::open(Cursor::new(bytes)).unwrap();
        let results: Vec<_> = demo.messages().collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(ScanError::UnknownMessageType { tag: 42, .. })));
    }
}

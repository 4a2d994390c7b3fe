//! Reassembly of the raw TCP byte stream into complete XML documents.
//!
//! OCP has no length-prefix framing: message boundaries are implicit in the
//! XML structure itself, so a document is complete exactly when the element
//! opened at the top level is closed again. The reassembler accumulates
//! arbitrarily chunked reads in a single `BytesMut` and runs an incremental
//! tag scanner over the unexamined tail, tracking open element names on a
//! stack. Nested elements that reuse the root's local name therefore cannot
//! cause premature closure.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Default safety ceiling for a single buffered document.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Reassembly buffer exceeded the safety ceiling without yielding a complete
/// document. Terminal for the stream: a misbehaving peer must not grow the
/// buffer without bound.
#[derive(Debug, Error)]
#[error("buffered {buffered} bytes without a complete document (limit {limit})")]
pub struct FrameTooLarge {
    /// Bytes currently buffered.
    pub buffered: usize,
    /// Configured ceiling.
    pub limit: usize,
}

/// One complete, balanced top-level XML document extracted from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    bytes: Bytes,
}

impl RawFrame {
    pub(crate) fn new(bytes: Bytes) -> Self {
        Self { bytes }
    }

    /// Returns the document bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns the document length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` if the frame holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Consumes the frame, returning the underlying bytes.
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

impl AsRef<[u8]> for RawFrame {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

/// Outcome of classifying the construct starting at a `<` byte.
enum Construct {
    /// The construct is not fully buffered yet.
    NeedMore,
    /// Non-element construct (comment, CDATA, PI, declaration) of the given
    /// total length. Does not affect element depth.
    Skip(usize),
    /// A complete element tag of the given total length.
    Tag {
        len: usize,
        name_end: usize,
        is_end: bool,
        is_self_closing: bool,
    },
}

/// Buffer for accumulating incoming bytes and extracting complete documents.
///
/// `scan_pos` marks the first unexamined byte so previously scanned content
/// is never re-walked; the open-element stack carries scanner state across
/// `feed` calls, which makes frame extraction invariant under how the byte
/// stream is chunked.
pub struct FrameReassembler {
    buffer: BytesMut,
    scan_pos: usize,
    open: Vec<Vec<u8>>,
    poisoned: bool,
    max_frame_size: usize,
}

impl FrameReassembler {
    /// Creates a reassembler with the default safety ceiling.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Creates a reassembler with an explicit safety ceiling in bytes.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4 * 1024),
            scan_pos: 0,
            open: Vec::new(),
            poisoned: false,
            max_frame_size,
        }
    }

    /// Appends a chunk and extracts every document completed by it.
    ///
    /// All complete documents present in the buffer are returned in order;
    /// the device may coalesce several pushes into one TCP segment. A
    /// partial trailing document stays buffered until more bytes arrive. An
    /// empty chunk produces no frames and no error.
    ///
    /// Fails with [`FrameTooLarge`] once the buffered prefix exceeds the
    /// ceiling without completing a document.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<RawFrame>, FrameTooLarge> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one() {
            frames.push(frame);
        }

        if frames.is_empty() && self.buffer.len() > self.max_frame_size {
            return Err(FrameTooLarge {
                buffered: self.buffer.len(),
                limit: self.max_frame_size,
            });
        }

        Ok(frames)
    }

    /// Number of bytes buffered but not yet part of a complete document.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Returns `true` if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Scans forward from `scan_pos` and splits off one document if the
    /// top-level element closes. Returns `None` when more bytes are needed
    /// or the stream is poisoned by a structural mismatch.
    fn try_extract_one(&mut self) -> Option<RawFrame> {
        if self.poisoned {
            return None;
        }

        while self.scan_pos < self.buffer.len() {
            let Some(rel) = find_byte(&self.buffer[self.scan_pos..], b'<') else {
                // Text only; nothing to do until the next tag shows up.
                self.scan_pos = self.buffer.len();
                return None;
            };
            let lt = self.scan_pos + rel;

            match classify(&self.buffer[lt..]) {
                Construct::NeedMore => {
                    self.scan_pos = lt;
                    return None;
                }
                Construct::Skip(len) => {
                    self.scan_pos = lt + len;
                }
                Construct::Tag {
                    len,
                    name_end,
                    is_end,
                    is_self_closing,
                } => {
                    let name_start = lt + 1 + usize::from(is_end);
                    let name = &self.buffer[name_start..lt + name_end];
                    if name.is_empty() {
                        self.poisoned = true;
                        return None;
                    }

                    let tag_end = lt + len;
                    if is_end {
                        let matches_top = self
                            .open
                            .last()
                            .is_some_and(|top| top.as_slice() == name);
                        if !matches_top {
                            // A close tag that does not match the innermost
                            // open element can never balance.
                            self.poisoned = true;
                            return None;
                        }
                        self.open.pop();
                        if self.open.is_empty() {
                            return Some(self.split_frame(tag_end));
                        }
                    } else if is_self_closing {
                        if self.open.is_empty() {
                            return Some(self.split_frame(tag_end));
                        }
                    } else {
                        self.open.push(name.to_vec());
                    }

                    self.scan_pos = tag_end;
                }
            }
        }

        None
    }

    fn split_frame(&mut self, end: usize) -> RawFrame {
        let bytes = self.buffer.split_to(end).freeze();
        self.scan_pos = 0;
        RawFrame::new(bytes)
    }
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Classifies the construct starting at `rest[0] == b'<'`.
fn classify(rest: &[u8]) -> Construct {
    debug_assert_eq!(rest.first(), Some(&b'<'));
    if rest.len() < 2 {
        return Construct::NeedMore;
    }

    match rest[1] {
        b'!' => classify_markup(rest),
        b'?' => match find_subslice(&rest[2..], b"?>") {
            Some(idx) => Construct::Skip(2 + idx + 2),
            None => Construct::NeedMore,
        },
        _ => classify_tag(rest),
    }
}

/// Handles `<!-- -->`, `<![CDATA[ ]]>`, and `<!...>` declarations.
fn classify_markup(rest: &[u8]) -> Construct {
    const COMMENT_OPEN: &[u8] = b"<!--";
    const CDATA_OPEN: &[u8] = b"<![CDATA[";

    if rest.starts_with(COMMENT_OPEN) {
        return match find_subslice(&rest[COMMENT_OPEN.len()..], b"-->") {
            Some(idx) => Construct::Skip(COMMENT_OPEN.len() + idx + 3),
            None => Construct::NeedMore,
        };
    }
    if rest.starts_with(CDATA_OPEN) {
        return match find_subslice(&rest[CDATA_OPEN.len()..], b"]]>") {
            Some(idx) => Construct::Skip(CDATA_OPEN.len() + idx + 3),
            None => Construct::NeedMore,
        };
    }
    // Short prefix could still become a comment or CDATA opener.
    if COMMENT_OPEN.starts_with(rest) || CDATA_OPEN.starts_with(rest) {
        return Construct::NeedMore;
    }

    match find_byte(rest, b'>') {
        Some(idx) => Construct::Skip(idx + 1),
        None => Construct::NeedMore,
    }
}

/// Scans an element tag, honoring quoted attribute values so a `>` inside a
/// quote does not end the tag.
fn classify_tag(rest: &[u8]) -> Construct {
    let is_end = rest[1] == b'/';

    let mut gt = None;
    let mut quote: Option<u8> = None;
    for (i, &b) in rest.iter().enumerate().skip(1) {
        match quote {
            Some(q) => {
                if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'>' => {
                    gt = Some(i);
                    break;
                }
                _ => {}
            },
        }
    }
    let Some(gt) = gt else {
        return Construct::NeedMore;
    };

    let is_self_closing = !is_end && rest[gt - 1] == b'/';

    let name_start = 1 + usize::from(is_end);
    let name_end = rest[name_start..=gt]
        .iter()
        .position(|&b| b.is_ascii_whitespace() || b == b'/' || b == b'>')
        .map(|idx| name_start + idx)
        .unwrap_or(gt);

    Construct::Tag {
        len: gt + 1,
        name_end,
        is_end,
        is_self_closing,
    }
}

fn find_byte(haystack: &[u8], needle: u8) -> Option<usize> {
    haystack.iter().position(|&b| b == needle)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

// src/io/framer.rs
//
// Incremental CBOR frame decoder.
//
// Each message on the wire is one self-describing CBOR data item with no length
// prefix. Bytes are accumulated across chunks and every complete item is yielded in
// arrival order; a partial item stays buffered until the rest arrives.

use ciborium::Value;
use futures::stream::{self, Stream};
use std::collections::VecDeque;

use super::error::LinkError;
use super::pump::ChunkSource;

/// Largest partial item kept in the buffer before decoding gives up
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

// ============================================================================
// Item Boundary Scanner
// ============================================================================

/// Open container on the scanner stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Open {
    /// Definite-length array, map or tag: items still expected
    Items(u64),
    /// Indefinite-length container or string, closed by a break byte
    UntilBreak,
}

/// Walks CBOR headers to find where the current top-level item ends.
///
/// Position and open containers persist between calls, so every byte of a
/// partial item is examined once no matter how many chunks it arrives in.
#[derive(Debug, Default)]
struct ItemScanner {
    offset: usize,
    stack: Vec<Open>,
}

impl ItemScanner {
    fn reset(&mut self) {
        self.offset = 0;
        self.stack.clear();
    }

    /// Length of the first complete item in `buf`, or `None` if more bytes are
    /// needed. `buf` must start at the current item and only ever grow between calls.
    fn scan(&mut self, buf: &[u8], max_len: usize) -> Result<Option<usize>, String> {
        loop {
            let Some(&initial) = buf.get(self.offset) else {
                return Ok(None);
            };
            let major = initial >> 5;
            let info = initial & 0x1f;

            if initial == 0xff {
                match self.stack.pop() {
                    Some(Open::UntilBreak) => {
                        self.offset += 1;
                        if let Some(len) = self.close_item() {
                            return Ok(Some(len));
                        }
                        continue;
                    }
                    _ => return Err(format!("unexpected break at +{}", self.offset)),
                }
            }

            let extra = match info {
                0..=23 => 0,
                24 => 1,
                25 => 2,
                26 => 4,
                27 => 8,
                31 if matches!(major, 2..=5) => 0,
                _ => {
                    return Err(format!(
                        "reserved header 0x{:02x} at +{}",
                        initial, self.offset
                    ))
                }
            };
            let header_len = 1 + extra;
            if buf.len() < self.offset + header_len {
                return Ok(None);
            }
            let arg = match info {
                0..=23 => info as u64,
                _ => buf[self.offset + 1..self.offset + header_len]
                    .iter()
                    .fold(0u64, |acc, b| (acc << 8) | *b as u64),
            };
            let indefinite = info == 31;

            match major {
                // Integers, simple values and floats
                0 | 1 | 7 => {
                    self.offset += header_len;
                }
                // Byte and text strings
                2 | 3 if indefinite => {
                    self.offset += header_len;
                    self.stack.push(Open::UntilBreak);
                    continue;
                }
                2 | 3 => {
                    let end = usize::try_from(arg)
                        .ok()
                        .and_then(|n| n.checked_add(self.offset + header_len))
                        .filter(|end| *end <= max_len)
                        .ok_or_else(|| {
                            format!("string of {} bytes exceeds limit of {} bytes", arg, max_len)
                        })?;
                    if buf.len() < end {
                        return Ok(None);
                    }
                    self.offset = end;
                }
                // Arrays, maps and tags
                _ => {
                    self.offset += header_len;
                    let items = match major {
                        4 => arg,
                        5 => arg
                            .checked_mul(2)
                            .ok_or_else(|| format!("map of {} pairs is too large", arg))?,
                        _ => 1,
                    };
                    if indefinite {
                        self.stack.push(Open::UntilBreak);
                        continue;
                    }
                    if items > 0 {
                        self.stack.push(Open::Items(items));
                        continue;
                    }
                }
            }

            if let Some(len) = self.close_item() {
                return Ok(Some(len));
            }
        }
    }

    /// Account for one finished item. Returns the top-level length once it completes.
    fn close_item(&mut self) -> Option<usize> {
        loop {
            match self.stack.last_mut() {
                None => {
                    let len = self.offset;
                    self.reset();
                    return Some(len);
                }
                Some(Open::Items(remaining)) => {
                    *remaining -= 1;
                    if *remaining > 0 {
                        return None;
                    }
                    self.stack.pop();
                }
                Some(Open::UntilBreak) => return None,
            }
        }
    }
}

// ============================================================================
// Framer
// ============================================================================

/// Accumulates raw bytes and splits them into CBOR values.
#[derive(Debug)]
pub struct CborFramer {
    buffer: Vec<u8>,
    ready: VecDeque<Value>,
    max_frame_len: usize,
    scanner: ItemScanner,
}

impl Default for CborFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl CborFramer {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        CborFramer {
            buffer: Vec::new(),
            ready: VecDeque::new(),
            max_frame_len,
            scanner: ItemScanner::default(),
        }
    }

    /// Bytes of a partial item waiting for more input
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Take the oldest decoded value.
    pub fn pop(&mut self) -> Option<Value> {
        self.ready.pop_front()
    }

    /// Append a chunk and decode every complete item it finishes.
    ///
    /// Values decoded before a malformed item stay available through [`pop`](Self::pop);
    /// the buffer is discarded on error since the stream cannot resynchronize.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        self.buffer.extend_from_slice(bytes);

        let mut consumed = 0;
        let result = loop {
            let len = match self.scanner.scan(&self.buffer[consumed..], self.max_frame_len) {
                Ok(Some(len)) => len,
                Ok(None) => break Ok(()),
                Err(e) => {
                    break Err(LinkError::decode(format!(
                        "malformed CBOR at stream offset +{}: {}",
                        consumed, e
                    )))
                }
            };
            match ciborium::de::from_reader::<Value, _>(&self.buffer[consumed..consumed + len]) {
                Ok(value) => {
                    consumed += len;
                    self.ready.push_back(value);
                }
                Err(e) => {
                    break Err(LinkError::decode(format!(
                        "malformed CBOR at stream offset +{}: {:?}",
                        consumed, e
                    )))
                }
            }
        };
        if let Err(e) = result {
            self.discard();
            return Err(e);
        }
        self.buffer.drain(..consumed);

        if self.buffer.len() > self.max_frame_len {
            let len = self.buffer.len();
            self.discard();
            return Err(LinkError::decode(format!(
                "partial frame of {} bytes exceeds limit of {} bytes",
                len, self.max_frame_len
            )));
        }
        Ok(())
    }

    fn discard(&mut self) {
        self.buffer.clear();
        self.scanner.reset();
    }

    /// Signal end of input. Fails if a partial item is still buffered.
    pub fn finish(&mut self) -> Result<(), LinkError> {
        if self.buffer.is_empty() {
            Ok(())
        } else {
            let pending = self.buffer.len();
            self.discard();
            Err(LinkError::TruncatedFrame { pending })
        }
    }
}

struct DecodeState {
    source: ChunkSource,
    framer: CborFramer,
    failure: Option<LinkError>,
    done: bool,
}

/// Lazily decode the chunk channel into values.
///
/// The stream ends when the source closes with no partial item buffered. A
/// truncated item, malformed bytes or a read error from the pump become the final
/// `Err` item.
pub fn decode(
    source: ChunkSource,
    max_frame_len: usize,
) -> impl Stream<Item = Result<Value, LinkError>> + Send {
    let state = DecodeState {
        source,
        framer: CborFramer::with_max_frame_len(max_frame_len),
        failure: None,
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(value) = state.framer.pop() {
                return Some((Ok(value), state));
            }
            if let Some(e) = state.failure.take() {
                state.done = true;
                return Some((Err(e), state));
            }
            if state.done {
                return None;
            }

            match state.source.next().await {
                Some(Ok(chunk)) => {
                    if let Err(e) = state.framer.feed(&chunk.bytes) {
                        state.failure = Some(e);
                    }
                }
                Some(Err(e)) => state.failure = Some(e),
                None => {
                    state.done = true;
                    if let Err(e) = state.framer.finish() {
                        state.failure = Some(e);
                    }
                }
            }
        }
    })
}

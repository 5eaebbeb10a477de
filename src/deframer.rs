/*! Streaming frame extraction.

The inbound byte stream is unsynchronised and may contain noise, partial
frames, and NUL bytes from line glitches. A small state machine walks the
stream byte by byte, re-synchronising on every start marker, and validates
completed frames (length, markers, both checkbytes, argument grammar)
before handing them up. Everything that goes wrong is counted.
*/
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{log, warn};

use crate::message::{
    self, FRAME_END, FRAME_START, MIN_FRAME_LEN, Message, hard_frame_limit, length_checkbyte,
};
use crate::value::ParseMode;

/// Receive-side counters for one link.
///
/// Bumped only by the reader; read from anywhere. Slightly stale reads are
/// fine, hence relaxed ordering throughout.
#[derive(Debug, Default)]
pub struct LinkStats {
    too_short: AtomicU64,
    too_long: AtomicU64,
    missing_start: AtomicU64,
    missing_end: AtomicU64,
    invalid_bytes: AtomicU64,
    bad_checkbytes: AtomicU64,
    bad_frames: AtomicU64,
    good_frames: AtomicU64,
}

impl LinkStats {
    /// Frames shorter than the minimum.
    pub fn too_short(&self) -> u64 {
        self.too_short.load(Ordering::Relaxed)
    }
    /// Frames (or pending buffers) longer than the configured limit.
    pub fn too_long(&self) -> u64 {
        self.too_long.load(Ordering::Relaxed)
    }
    /// End markers seen while waiting for a start marker.
    pub fn missing_start(&self) -> u64 {
        self.missing_start.load(Ordering::Relaxed)
    }
    /// Start markers seen while already inside a frame.
    pub fn missing_end(&self) -> u64 {
        self.missing_end.load(Ordering::Relaxed)
    }
    /// NUL bytes, which are illegal anywhere on the wire.
    pub fn invalid_bytes(&self) -> u64 {
        self.invalid_bytes.load(Ordering::Relaxed)
    }
    /// Frames whose length or content checkbyte did not match.
    pub fn bad_checkbytes(&self) -> u64 {
        self.bad_checkbytes.load(Ordering::Relaxed)
    }
    /// Frames that passed the checkbytes but failed value parsing.
    pub fn bad_frames(&self) -> u64 {
        self.bad_frames.load(Ordering::Relaxed)
    }
    /// Frames delivered.
    pub fn good_frames(&self) -> u64 {
        self.good_frames.load(Ordering::Relaxed)
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Dump all counters to the log at `level`.
    pub fn log(&self, level: log::Level) {
        log!(level, "Approximate receive stats...");
        log!(level, "  frames too short: {}", self.too_short());
        log!(level, "  frames too long: {}", self.too_long());
        log!(level, "  missing start byte: {}", self.missing_start());
        log!(level, "  missing end byte: {}", self.missing_end());
        log!(level, "  invalid bytes: {}", self.invalid_bytes());
        log!(level, "  bad checkbytes: {}", self.bad_checkbytes());
        log!(level, "  misc bad frames: {}", self.bad_frames());
        log!(level, "  good frames: {}", self.good_frames());
    }
}

enum State {
    /// Discarding noise until a start marker.
    WaitStart,
    /// Inside a frame, accumulating until the end marker.
    WaitEnd,
    /// End marker seen; next byte is the length checkbyte.
    WaitLen,
    /// Length checkbyte seen; next byte completes the frame.
    WaitChk,
}

/// Byte-driven frame extractor.
pub struct Deframer {
    state: State,
    buf: Vec<u8>,
    max_frame_len: usize,
    mode: ParseMode,
    stats: Arc<LinkStats>,
}

impl Deframer {
    /// New deframer with the given soft frame-length limit.
    pub fn new(max_frame_len: usize, mode: ParseMode) -> Self {
        Self {
            state: State::WaitStart,
            buf: Vec::with_capacity(max_frame_len),
            max_frame_len,
            mode,
            stats: Arc::new(LinkStats::default()),
        }
    }

    /// Shared handle to the counters.
    pub fn stats(&self) -> Arc<LinkStats> {
        Arc::clone(&self.stats)
    }

    /// Feed one byte. Returns a message when this byte completed a valid
    /// frame.
    ///
    /// NUL and a stray start marker only have special meaning while
    /// hunting for or filling a frame body; the two checkbyte positions
    /// take any byte and leave rejection to frame validation.
    pub fn push(&mut self, b: u8) -> Option<Message> {
        match self.state {
            State::WaitStart => {
                if b == 0 {
                    LinkStats::bump(&self.stats.invalid_bytes);
                } else if b == FRAME_START {
                    self.buf.clear();
                    self.buf.push(b);
                    self.state = State::WaitEnd;
                } else if b == FRAME_END {
                    LinkStats::bump(&self.stats.missing_start);
                }
                None
            }
            State::WaitEnd => {
                if b == 0 {
                    // NUL never appears in a frame; drop anything pending.
                    self.buf.clear();
                    LinkStats::bump(&self.stats.invalid_bytes);
                    self.state = State::WaitStart;
                } else if b == FRAME_START {
                    LinkStats::bump(&self.stats.missing_end);
                    self.buf.clear();
                    self.buf.push(b);
                } else {
                    self.buf.push(b);
                    if b == FRAME_END {
                        self.state = State::WaitLen;
                    } else if self.buf.len() > hard_frame_limit(self.max_frame_len) {
                        warn!(
                            "clearing input buffer (overflow): {} > {}",
                            self.buf.len(),
                            hard_frame_limit(self.max_frame_len)
                        );
                        self.buf.clear();
                        LinkStats::bump(&self.stats.too_long);
                        self.state = State::WaitStart;
                    }
                }
                None
            }
            State::WaitLen => {
                self.buf.push(b);
                self.state = State::WaitChk;
                None
            }
            State::WaitChk => {
                self.buf.push(b);
                let msg = self.convert();
                self.buf.clear();
                self.state = State::WaitStart;
                msg
            }
        }
    }

    /// Feed a chunk of bytes, collecting completed messages in arrival
    /// order.
    pub fn extend(&mut self, bytes: &[u8]) -> Vec<Message> {
        bytes.iter().filter_map(|&b| self.push(b)).collect()
    }

    /// Validate the buffered frame and decode it.
    fn convert(&self) -> Option<Message> {
        let frame = &self.buf;
        let stats = &self.stats;
        if frame.len() < MIN_FRAME_LEN {
            warn!("frame too short ({} bytes): {frame:?}", frame.len());
            LinkStats::bump(&stats.too_short);
            return None;
        }
        if frame.len() > self.max_frame_len {
            LinkStats::bump(&stats.too_long);
            warn!(
                "frame too long ({} > {}): {:?}",
                frame.len(),
                self.max_frame_len,
                String::from_utf8_lossy(frame)
            );
            if frame.len() > hard_frame_limit(self.max_frame_len) {
                warn!("discarding frame");
                return None;
            }
        }
        if frame[0] != FRAME_START {
            warn!("bad start byte: {frame:?}");
            LinkStats::bump(&stats.missing_start);
            return None;
        }
        if frame[frame.len() - 3] != FRAME_END {
            warn!("bad end byte: {frame:?}");
            LinkStats::bump(&stats.missing_end);
            return None;
        }
        if frame[frame.len() - 2] != length_checkbyte(frame.len()) {
            warn!("bad length checkbyte: {:?}", String::from_utf8_lossy(frame));
            LinkStats::bump(&stats.bad_checkbytes);
            return None;
        }
        if frame[frame.len() - 1] != message::content_checkbyte(&frame[..frame.len() - 1]) {
            warn!("bad content checkbyte: {:?}", String::from_utf8_lossy(frame));
            LinkStats::bump(&stats.bad_checkbytes);
            return None;
        }
        match Message::decode(frame, self.mode) {
            Ok(msg) => {
                LinkStats::bump(&stats.good_frames);
                Some(msg)
            }
            Err(e) => {
                warn!("cannot parse frame {:?}: {e}", String::from_utf8_lossy(frame));
                LinkStats::bump(&stats.bad_frames);
                None
            }
        }
    }
}

/*! Messages and the frame codec.

A frame is `< opcode(4) token(2) args > L C` where `L` is a length checkbyte
and `C` a content checkbyte, both reduced into printable ASCII that can never
collide with the frame markers. Encoding is deterministic, so the checkbytes
are too.
*/
use std::fmt;

use log::warn;

use crate::value::{self, Dict, ParseMode, Value};
use crate::{Error, Result};

/// Frame start marker.
pub const FRAME_START: u8 = b'<';
/// Frame end marker (followed by the two checkbytes).
pub const FRAME_END: u8 = b'>';
/// Shortest legal frame: empty args.
pub const MIN_FRAME_LEN: usize = 10;
/// Default soft limit on frame length. Frames up to twice this are still
/// parsed, with a warning; see [`crate::deframer`].
pub const DEFAULT_MAX_FRAME_LEN: usize = 512;
/// Flag byte marking unsolicited device-initiated messages.
pub const BACKGROUND_FLAG: char = 'B';

/// Hard limit corresponding to a configured soft limit.
///
/// The parser must bound what it buffers so noise after a start byte cannot
/// grow memory forever, but a board occasionally sending an oversized frame
/// should not have its messages vanish. Frames between the soft and hard
/// limits are warned about and kept; beyond the hard limit they are dropped.
pub fn hard_frame_limit(max_frame_len: usize) -> usize {
    max_frame_len * 2
}

/// True if `opcode` is exactly four printable ASCII characters, none of
/// them `<`, `>` or space.
pub fn is_valid_opcode(opcode: &str) -> bool {
    opcode.len() == 4 && opcode.bytes().all(is_frame_safe_byte)
}

/// True if `token` is exactly two printable ASCII characters, none of them
/// `<`, `>` or space.
pub fn is_valid_token(token: &str) -> bool {
    token.len() == 2 && token.bytes().all(is_frame_safe_byte)
}

fn is_frame_safe_byte(b: u8) -> bool {
    (33..=126).contains(&b) && b != FRAME_START && b != FRAME_END
}

/// Reduce an integer into a printable ASCII byte that is neither a frame
/// marker nor whitespace. Used for both checkbytes.
pub fn checkbyte(n: u32) -> u8 {
    let mut v = ((n & 0xffff) % 92) + 33;
    if v >= u32::from(FRAME_START) {
        v += 1;
    }
    if v >= u32::from(FRAME_END) {
        v += 1;
    }
    v as u8
}

/// Checkbyte over the total frame length.
pub fn length_checkbyte(frame_len: usize) -> u8 {
    checkbyte(frame_len as u32 * 7)
}

/// Checkbyte over frame content: a rolling byte hash of everything up to,
/// but not including, the content checkbyte itself.
pub fn content_checkbyte(bytes: &[u8]) -> u8 {
    let h = bytes
        .iter()
        .fold(0u32, |h, &b| ((h + u32::from(b)) * 31) & 0xff);
    checkbyte(h)
}

/// One protocol message: a four-character opcode, a two-character token
/// correlating requests with replies, and a sequence of typed arguments.
///
/// The token may be left unassigned; the port stamps one before sending.
/// Accessors split the opcode into `command` (first three characters) and
/// `flag` (last character: `R`equest, `A`ck, `D`one, or `B`ackground).
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    opcode: String,
    token: Option<String>,
    args: Vec<Value>,
}

impl Message {
    /// New message with an unassigned token.
    pub fn new(opcode: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            opcode: opcode.into(),
            token: None,
            args,
        }
    }

    /// New message with a token already assigned.
    pub fn with_token(opcode: impl Into<String>, token: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            opcode: opcode.into(),
            token: Some(token.into()),
            args,
        }
    }

    /// The full four-character opcode.
    pub fn opcode(&self) -> &str {
        &self.opcode
    }

    /// The opcode without its flag character.
    pub fn command(&self) -> &str {
        let end = self.opcode.len().saturating_sub(1);
        self.opcode.get(..end).unwrap_or(&self.opcode)
    }

    /// The flag character (last opcode character).
    pub fn flag(&self) -> char {
        self.opcode.chars().next_back().unwrap_or('\0')
    }

    /// The token, if assigned.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Assign or replace the token.
    pub fn set_token(&mut self, token: impl Into<String>) {
        self.token = Some(token.into());
    }

    /// The arguments.
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// True for unsolicited device-initiated messages (`flag == 'B'`).
    pub fn is_background(&self) -> bool {
        self.flag() == BACKGROUND_FLAG
    }

    /// The heartbeat payload, iff this is a well-formed `HRTB` message
    /// (single dictionary argument). A malformed heartbeat is still a
    /// valid message; this just returns `None` after logging.
    pub fn heartbeat(&self) -> Option<&Dict> {
        if self.opcode != "HRTB" {
            return None;
        }
        match self.args.as_slice() {
            [Value::Dict(d)] => Some(d),
            _ => {
                warn!("invalid heartbeat message: {self}");
                None
            }
        }
    }

    /// Check that this message is encodable: opcode and token valid, every
    /// argument (recursively) well-formed.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_opcode(&self.opcode) {
            return Err(Error::Config(format!("bad opcode: {:?}", self.opcode)));
        }
        match &self.token {
            None => return Err(Error::Config(format!("no token assigned: {self}"))),
            Some(t) if !is_valid_token(t) => {
                return Err(Error::Config(format!("bad token: {t:?}")));
            }
            Some(_) => {}
        }
        self.args.iter().try_for_each(Value::check)
    }

    /// Encode into a complete frame, checkbytes included.
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.validate()?;
        let token = self.token.as_ref().expect("validate checked the token");
        let mut frame = Vec::with_capacity(MIN_FRAME_LEN + 16 * self.args.len());
        frame.push(FRAME_START);
        frame.extend_from_slice(self.opcode.as_bytes());
        frame.extend_from_slice(token.as_bytes());
        for (n, arg) in self.args.iter().enumerate() {
            if n > 0 {
                frame.push(b',');
            }
            arg.encode_into(&mut frame);
        }
        let total = frame.len() + 3;
        frame.push(FRAME_END);
        frame.push(length_checkbyte(total));
        let c = content_checkbyte(&frame);
        frame.push(c);
        Ok(frame)
    }

    /// The two trailing checkbytes this message encodes to.
    pub fn checksums(&self) -> Result<[u8; 2]> {
        let frame = self.encode()?;
        Ok([frame[frame.len() - 2], frame[frame.len() - 1]])
    }

    /// Decode a frame into a message.
    ///
    /// The frame must include the markers and both checkbytes; the
    /// checkbytes themselves are verified by the deframer, not here.
    pub fn decode(frame: &[u8], mode: ParseMode) -> Result<Message> {
        if frame.len() < MIN_FRAME_LEN {
            return Err(Error::Parse(format!(
                "frame too short to decode: {} < {MIN_FRAME_LEN}",
                frame.len()
            )));
        }
        let opcode = std::str::from_utf8(&frame[1..5])
            .map_err(|_| Error::Parse("opcode was not ASCII".into()))?;
        if !is_valid_opcode(opcode) {
            return Err(Error::Parse(format!("bad opcode: {opcode:?}")));
        }
        let token = std::str::from_utf8(&frame[5..7])
            .map_err(|_| Error::Parse("token was not ASCII".into()))?;
        if !is_valid_token(token) {
            return Err(Error::Parse(format!("bad token: {token:?}")));
        }
        let args = value::parse_args(&frame[7..frame.len() - 3], mode)?;
        Ok(Message::with_token(opcode, token, args))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.opcode, self.token.as_deref().unwrap_or("??"))?;
        for (n, arg) in self.args.iter().enumerate() {
            f.write_str(if n == 0 { " " } else { "," })?;
            write!(f, "{arg}")?;
        }
        Ok(())
    }
}

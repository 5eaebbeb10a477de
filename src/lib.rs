#![warn(missing_docs)]
/*! This crate talks to microcontroller boards over a serial byte stream,
using an ASCII-framed, checksummed request/response protocol.

A board self-identifies with a *role* string, emits unsolicited background
messages (heartbeats, log lines), and answers host commands with an
acknowledgement and, for long operations, a later completion message.

# Architecture overview

The crate is layered, leaves first:

```text
  [ Value codec ]      value.rs    typed scalars, lists, dicts <-> bytes
  [ Frame codec ]      message.rs  opcode+token+args <-> framed bytes
  [ Deframer ]         deframer.rs byte-driven state machine over noise
  [ Port ]             port.rs     worker threads, token-matched ACK/DONE
  [ Background ]       background.rs  heartbeats, device log lines
  [ Discovery ]        discovery.rs   probe endpoints, bind devices by role
  [ Device ]           device.rs      role-typed handles on top of a port
```

Outbound data flows caller → device → port → frame codec → serial bytes;
inbound bytes run through the deframer and are routed to either the
foreground (replies) or background (heartbeats/logs) channel by flag.

# Example

Encoding and decoding is deterministic and byte-exact:

```
use boardlink::{Message, ParseMode, Value};

let mut msg = Message::new(
    "RUNR",
    vec![
        Value::from(1.23),
        Value::from(true),
        Value::from("Hi!"),
        Value::List(vec![Value::from(1), Value::from(2)]),
    ],
);
msg.set_token("aa");
let frame = msg.encode()?;
assert_eq!(frame, b"<RUNRaa1.23,T,\"Hi!\",[1,2]>-b");
assert_eq!(Message::decode(&frame, ParseMode::Strict)?, msg);
# Ok::<(), boardlink::Error>(())
```

Talking to hardware goes through [`port::Port`] directly, or through
[`discovery::detect_all`] which probes every serial endpoint on the system
and hands back role-typed device handles.
*/

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub mod background;
pub mod deframer;
pub mod device;
pub mod discovery;
pub mod message;
pub mod mirror;
pub mod port;
pub mod serial;
pub mod value;

pub use deframer::{Deframer, LinkStats};
pub use device::{Device, DeviceDetails, DeviceFactory};
pub use message::Message;
pub use port::Port;
pub use value::{ParseMode, Value};

/// Baud rate used by default on the serial link.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Boardlink error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A frame or value failed structural, checkbyte, or grammar validation.
    #[error("parse error: {0}")]
    Parse(String),

    /// A blocking read exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A well-formed message arrived with an unexpected opcode or token.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The serial endpoint failed, or the port has stopped.
    #[error("link error: {0}")]
    Link(String),

    /// Bad construction-time input: duplicate registration, invalid opcode,
    /// role mismatch.
    #[error("config error: {0}")]
    Config(String),

    /// External cancellation.
    #[error("interrupted")]
    Interrupted,
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Link(e.to_string())
    }
}

impl From<serialport::Error> for Error {
    fn from(e: serialport::Error) -> Self {
        Error::Link(e.to_string())
    }
}

/// The crate's result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Shareable cancellation flag.
///
/// Clones observe the same flag. Long-running device operations poll it via
/// [`CancelToken::check`], and a Ctrl-C handler (or any other thread) flips
/// it with [`CancelToken::cancel`].
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a new, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }
    /// Flag the token. All clones see it.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    /// True once any clone has been cancelled.
    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
    /// [`Error::Interrupted`] once cancelled, for use with `?` in polling
    /// loops.
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_is_shared() {
        let t = CancelToken::new();
        let t2 = t.clone();
        assert!(t.check().is_ok());
        t2.cancel();
        assert!(t.is_canceled());
        assert!(matches!(t.check(), Err(Error::Interrupted)));
    }
}

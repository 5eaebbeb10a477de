/*! Byte-level traffic mirroring, for debugging.

A mirror observes every raw byte the port reads or writes. The UDP
implementation forwards traffic to localhost sockets, so a second terminal
can watch a conversation live:

```text
socat -u udp4-recv:5551 -   # incoming bytes
socat -u udp4-recv:5552 -   # outgoing bytes
```

Mirrors run on the port's worker thread and must not share state with the
caller. Delivery is best-effort.
*/
use std::net::{SocketAddr, UdpSocket};

use crate::Result;

/// Observer for raw link traffic.
pub trait DataMirror: Send {
    /// Bytes read from the device.
    fn on_incoming(&mut self, data: &[u8]);
    /// Bytes written to the device.
    fn on_outgoing(&mut self, data: &[u8]);
    /// Release resources; called when the port stops.
    fn close(&mut self) {}
}

/// Default localhost target for incoming bytes.
pub const DEFAULT_MIRROR_IN: &str = "127.0.0.1:5551";
/// Default localhost target for outgoing bytes.
pub const DEFAULT_MIRROR_OUT: &str = "127.0.0.1:5552";

/// Mirror that forwards traffic over UDP datagrams.
pub struct UdpMirror {
    sock: UdpSocket,
    incoming: Option<SocketAddr>,
    outgoing: Option<SocketAddr>,
}

impl UdpMirror {
    /// Mirror to the given targets; `None` disables that direction.
    pub fn new(incoming: Option<SocketAddr>, outgoing: Option<SocketAddr>) -> Result<Self> {
        Ok(Self {
            sock: UdpSocket::bind("0.0.0.0:0")?,
            incoming,
            outgoing,
        })
    }

    /// Mirror both directions to the default localhost ports.
    pub fn localhost() -> Result<Self> {
        Self::new(
            Some(DEFAULT_MIRROR_IN.parse().expect("literal addr")),
            Some(DEFAULT_MIRROR_OUT.parse().expect("literal addr")),
        )
    }
}

impl DataMirror for UdpMirror {
    fn on_incoming(&mut self, data: &[u8]) {
        if let Some(addr) = self.incoming {
            let _ = self.sock.send_to(data, addr);
        }
    }

    fn on_outgoing(&mut self, data: &[u8]) {
        if let Some(addr) = self.outgoing {
            let _ = self.sock.send_to(data, addr);
        }
    }
}

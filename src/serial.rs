/*! Serial endpoint access.

The rest of the crate only sees [`SerialLink`]: non-blocking reads, whole
writes, and a queue-depth query. The real implementation sits on the
`serialport` crate; [`LoopLink`] is an in-memory pair for tests and demos
that need a scripted peer instead of hardware.
*/
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::Result;

/// A bidirectional byte link, typically a UART.
///
/// The port's reader/writer worker owns its link exclusively; nothing else
/// touches the endpoint once a port is running.
pub trait SerialLink: Send {
    /// The endpoint path this link was opened on.
    fn path(&self) -> &str;
    /// Bytes available to read without blocking.
    fn bytes_waiting(&mut self) -> Result<usize>;
    /// Non-blocking read; returns 0 when nothing is pending.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    /// Write the whole buffer.
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;
}

/// Open a serial endpoint at `baud`, 8-N-1, no flow control, non-blocking.
pub fn open_serial(path: &str, baud: u32) -> Result<Box<dyn SerialLink>> {
    let inner = serialport::new(path, baud)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(Duration::from_millis(1))
        .open()?;
    Ok(Box::new(SerialPortLink {
        path: path.to_string(),
        inner,
    }))
}

/// Candidate endpoint paths reported by the OS.
pub fn list_endpoints() -> Result<Vec<String>> {
    Ok(serialport::available_ports()?
        .into_iter()
        .map(|p| p.port_name)
        .collect())
}

struct SerialPortLink {
    path: String,
    inner: Box<dyn serialport::SerialPort>,
}

impl SerialLink for SerialPortLink {
    fn path(&self) -> &str {
        &self.path
    }

    fn bytes_waiting(&mut self) -> Result<usize> {
        Ok(self.inner.bytes_to_read()? as usize)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.inner.read(buf) {
            Ok(n) => Ok(n),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                ) =>
            {
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.inner.write_all(buf)?;
        Ok(())
    }
}

type ByteQueue = Arc<Mutex<VecDeque<u8>>>;

fn locked(q: &ByteQueue) -> std::sync::MutexGuard<'_, VecDeque<u8>> {
    q.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One end of an in-memory link pair.
///
/// Writes on one end become reads on the other. Useful for exercising a
/// [`crate::port::Port`] against a scripted peer without hardware.
pub struct LoopLink {
    path: String,
    rx: ByteQueue,
    tx: ByteQueue,
}

/// Create a connected pair of in-memory links.
pub fn loop_pair() -> (LoopLink, LoopLink) {
    let ab = ByteQueue::default();
    let ba = ByteQueue::default();
    (
        LoopLink {
            path: "loop0".into(),
            rx: Arc::clone(&ba),
            tx: Arc::clone(&ab),
        },
        LoopLink {
            path: "loop1".into(),
            rx: ab,
            tx: ba,
        },
    )
}

impl SerialLink for LoopLink {
    fn path(&self) -> &str {
        &self.path
    }

    fn bytes_waiting(&mut self) -> Result<usize> {
        Ok(locked(&self.rx).len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut q = locked(&self.rx);
        let mut n = 0;
        while n < buf.len() {
            match q.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        locked(&self.tx).extend(buf);
        Ok(())
    }
}

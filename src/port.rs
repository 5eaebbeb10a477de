/*! The port: a request/response engine on top of one serial link.

A port owns its link through a reader/writer worker thread: inbound bytes
run through the deframer and completed messages are routed, by flag, to the
foreground channel (command replies) or the background channel (heartbeats,
device logs). Outbound frames are written in submission order. A second,
optional worker consumes the background channel through a
[`BackgroundHandler`].

The calling side is synchronous: `send_and_ack` and `send_and_done` block
with explicit timeouts, retry with fresh tokens, and fail loudly on
mismatched replies. One owner thread drives a given port; exchanges are not
reentrant.
*/
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TryRecvError, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, warn};
use rand::Rng;

use crate::background::{self, BackgroundHandler};
use crate::deframer::{Deframer, LinkStats};
use crate::device::DeviceDetails;
use crate::message::{DEFAULT_MAX_FRAME_LEN, Message};
use crate::mirror::DataMirror;
use crate::serial::{self, SerialLink};
use crate::value::ParseMode;
use crate::{Error, Result};

/// Default deadline for an acknowledgement.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(500);
/// Default deadline for a completion message.
pub const DEFAULT_DONE_TIMEOUT: Duration = Duration::from_secs(1);
/// Default number of resends after a missed acknowledgement.
pub const DEFAULT_RETRIES: u32 = 3;

/// Tokens are two letters; the allocator walks this alphabet as a
/// two-digit base-52 counter.
const TOKEN_ALPHABET: &[u8; 52] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const TOKEN_SPACE: u16 = 52 * 52;

/// Depth of the outbound frame queue.
const OUT_DEPTH: usize = 64;
/// Depth of the foreground and background message queues.
const MSG_DEPTH: usize = 256;

fn token_at(index: u16) -> String {
    let i = usize::from(index % TOKEN_SPACE);
    let mut s = String::with_capacity(2);
    s.push(TOKEN_ALPHABET[i / 52] as char);
    s.push(TOKEN_ALPHABET[i % 52] as char);
    s
}

/// What to do with unsolicited (`flag == 'B'`) messages. Chosen at
/// construction; not runtime state.
pub enum Backgrounds {
    /// Deliver them on the foreground channel with everything else.
    Keep,
    /// Drop them silently.
    Discard,
    /// Queue them separately; the caller drains with
    /// [`Port::read_background`].
    Queue,
    /// Queue them separately and run a worker thread that feeds them to
    /// the handler.
    Handle(Box<dyn BackgroundHandler>),
}

/// Construction-time port settings.
pub struct PortConfig {
    /// Soft limit on frame length; twice this is the hard limit.
    pub max_frame_len: usize,
    /// Strict or permissive argument parsing.
    pub parse_mode: ParseMode,
    /// Background message routing.
    pub backgrounds: Backgrounds,
    /// Optional byte-level traffic observer.
    pub mirror: Option<Box<dyn DataMirror>>,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            parse_mode: ParseMode::Strict,
            backgrounds: Backgrounds::Discard,
            mirror: None,
        }
    }
}

/// A running connection to one board.
///
/// Constructed around an opened [`SerialLink`]; stopped exactly once by its
/// owner (or on drop). All blocking operations take explicit timeouts.
pub struct Port {
    path: String,
    out_tx: Option<SyncSender<Vec<u8>>>,
    fg_rx: Receiver<Message>,
    bg_rx: Option<Receiver<Message>>,
    stop_flag: Arc<AtomicBool>,
    io_worker: Option<JoinHandle<()>>,
    bg_worker: Option<JoinHandle<()>>,
    token_counter: Mutex<u16>,
    missed_acks: AtomicU64,
    stats: Arc<LinkStats>,
    expect_heartbeats: Arc<AtomicBool>,
}

enum BgRoute {
    Keep,
    Discard,
    Separate(SyncSender<Message>),
}

impl Port {
    /// Open `path` at `baud` and start the workers.
    pub fn open(path: &str, baud: u32, config: PortConfig) -> Result<Port> {
        Port::spawn(serial::open_serial(path, baud)?, config)
    }

    /// Start the workers around an already-open link.
    pub fn spawn(link: Box<dyn SerialLink>, config: PortConfig) -> Result<Port> {
        let path = link.path().to_string();
        let deframer = Deframer::new(config.max_frame_len, config.parse_mode);
        let stats = deframer.stats();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let expect_heartbeats = Arc::new(AtomicBool::new(true));
        let (out_tx, out_rx) = std::sync::mpsc::sync_channel(OUT_DEPTH);
        let (fg_tx, fg_rx) = std::sync::mpsc::sync_channel(MSG_DEPTH);

        let mut bg_rx = None;
        let mut bg_worker = None;
        let route = match config.backgrounds {
            Backgrounds::Keep => BgRoute::Keep,
            Backgrounds::Discard => BgRoute::Discard,
            Backgrounds::Queue => {
                let (tx, rx) = std::sync::mpsc::sync_channel(MSG_DEPTH);
                bg_rx = Some(rx);
                BgRoute::Separate(tx)
            }
            Backgrounds::Handle(handler) => {
                let (tx, rx) = std::sync::mpsc::sync_channel(MSG_DEPTH);
                let stop = Arc::clone(&stop_flag);
                let expect = Arc::clone(&expect_heartbeats);
                bg_worker = Some(
                    std::thread::Builder::new()
                        .name("boardlink-bg".to_string())
                        .spawn(move || background::run(&stop, &rx, &expect, handler))?,
                );
                BgRoute::Separate(tx)
            }
        };

        let io_worker = {
            let stop = Arc::clone(&stop_flag);
            let mirror = config.mirror;
            std::thread::Builder::new()
                .name("boardlink-io".to_string())
                .spawn(move || io_loop(link, deframer, &stop, &fg_tx, &route, &out_rx, mirror))?
        };

        Ok(Port {
            path,
            out_tx: Some(out_tx),
            fg_rx,
            bg_rx,
            stop_flag,
            io_worker: Some(io_worker),
            bg_worker,
            token_counter: Mutex::new(rand::rng().random_range(0..TOKEN_SPACE)),
            missed_acks: AtomicU64::new(0),
            stats,
            expect_heartbeats,
        })
    }

    /// The endpoint path this port runs on.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Shared handle to the receive counters.
    pub fn stats(&self) -> Arc<LinkStats> {
        Arc::clone(&self.stats)
    }

    /// Acknowledgements that timed out and triggered a resend.
    pub fn missed_acks(&self) -> u64 {
        self.missed_acks.load(Ordering::Relaxed)
    }

    /// Whether the missing-heartbeat watchdog should currently fire.
    /// Toggled together with the device's heartbeat emission.
    pub fn set_expect_heartbeats(&self, expect: bool) {
        self.expect_heartbeats.store(expect, Ordering::Relaxed);
    }

    /// Next token from the sequential allocator.
    fn next_token(&self) -> String {
        let mut counter = self
            .token_counter
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let t = *counter;
        *counter = (t + 1) % TOKEN_SPACE;
        token_at(t)
    }

    /// Queue a message for transmission, stamping a token if it has none.
    pub fn send(&mut self, msg: &mut Message) -> Result<()> {
        if msg.token().is_none() {
            msg.set_token(self.next_token());
        }
        let frame = msg.encode()?;
        let tx = self
            .out_tx
            .as_ref()
            .ok_or_else(|| Error::Link("port is stopped".into()))?;
        tx.send(frame)
            .map_err(|_| Error::Link("port is stopped".into()))
    }

    /// Send and block until the acknowledgement arrives.
    ///
    /// The expected ACK opcode defaults to the message's command plus `A`.
    /// A timeout triggers a resend with a *fresh* token, so a late reply to
    /// an earlier attempt can never match; a reply with the wrong opcode or
    /// token fails immediately as a protocol violation.
    pub fn send_and_ack(
        &mut self,
        msg: &mut Message,
        ack_opcode: Option<&str>,
        timeout: Duration,
        retries: u32,
    ) -> Result<Message> {
        let ack = match ack_opcode {
            Some(op) => op.to_string(),
            None => {
                debug_assert_ne!(msg.flag(), 'A', "cannot infer an ACK opcode for an ACK");
                format!("{}A", msg.command())
            }
        };
        for attempt in 0..=retries {
            if attempt > 0 {
                msg.set_token(self.next_token());
            }
            self.send(msg)?;
            match self.read(timeout) {
                Ok(reply) => {
                    if reply.opcode() == ack && reply.token() == msg.token() {
                        return Ok(reply);
                    }
                    return Err(Error::Protocol(format!(
                        "expected ACK {ack} with token {}, got {reply}",
                        msg.token().unwrap_or("??"),
                    )));
                }
                Err(Error::Timeout(_)) => {
                    debug!("missed ack: {msg}");
                    self.missed_acks.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => return Err(e),
            }
        }
        warn!("no ACK for {msg} ({retries} retries, {timeout:?} timeout)");
        Err(Error::Timeout(timeout))
    }

    /// Send and block until both the acknowledgement and the completion
    /// message arrive.
    ///
    /// The DONE opcode defaults to the command plus `D`; its token must
    /// match the acknowledged token. There are no retries at the DONE
    /// phase.
    #[allow(clippy::too_many_arguments)]
    pub fn send_and_done(
        &mut self,
        msg: &mut Message,
        ack_opcode: Option<&str>,
        done_opcode: Option<&str>,
        ack_timeout: Duration,
        done_timeout: Duration,
        ack_retries: u32,
    ) -> Result<(Message, Message)> {
        let ack = self.send_and_ack(msg, ack_opcode, ack_timeout, ack_retries)?;
        let done_opcode = match done_opcode {
            Some(op) => op.to_string(),
            None => format!("{}D", msg.command()),
        };
        match self.read(done_timeout) {
            Ok(done) => {
                if done.opcode() == done_opcode && done.token() == ack.token() {
                    Ok((ack, done))
                } else {
                    Err(Error::Protocol(format!(
                        "expected DONE {done_opcode} with token {}, got {done}",
                        ack.token().unwrap_or("??"),
                    )))
                }
            }
            Err(Error::Timeout(d)) => {
                error!("timeout waiting for DONE of {msg} (acked as {ack})");
                Err(Error::Timeout(d))
            }
            Err(e) => Err(e),
        }
    }

    /// Next foreground message, or [`Error::Timeout`].
    pub fn read(&mut self, timeout: Duration) -> Result<Message> {
        self.fg_rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => Error::Timeout(timeout),
            RecvTimeoutError::Disconnected => Error::Link("port is stopped".into()),
        })
    }

    /// Next foreground message, or `None` on timeout.
    pub fn try_read(&mut self, timeout: Duration) -> Option<Message> {
        self.fg_rx.recv_timeout(timeout).ok()
    }

    /// Next background message, or `None` on timeout.
    ///
    /// Only meaningful with [`Backgrounds::Queue`]; otherwise always
    /// `None`.
    pub fn read_background(&mut self, timeout: Duration) -> Option<Message> {
        self.bg_rx.as_ref()?.recv_timeout(timeout).ok()
    }

    /// Read one message and require its opcode, failing with a protocol
    /// violation on anything else.
    pub fn expect(&mut self, opcode: &str, timeout: Duration) -> Result<Message> {
        let msg = self.read(timeout)?;
        if msg.opcode() == opcode {
            Ok(msg)
        } else {
            Err(Error::Protocol(format!("unexpected message: {msg}")))
        }
    }

    /// Drain the foreground channel without blocking.
    pub fn flush(&mut self) {
        while self.fg_rx.try_recv().is_ok() {}
    }

    /// Query who is on the other end with a discovery exchange.
    pub fn ask_who(&mut self, timeout: Duration, retries: u32) -> Result<DeviceDetails> {
        let mut msg = Message::new("DISR", vec![]);
        let ack = self.send_and_ack(&mut msg, None, timeout, retries)?;
        DeviceDetails::from_args(ack.args())
    }

    /// Stop both workers and close the link. Idempotent.
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        // Dropping the sender wakes the worker's outbound drain.
        self.out_tx = None;
        if let Some(h) = self.bg_worker.take() {
            let _ = h.join();
        }
        if let Some(h) = self.io_worker.take() {
            let _ = h.join();
        }
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Reader/writer loop. Owns the link; nothing else touches it.
fn io_loop(
    mut link: Box<dyn SerialLink>,
    mut deframer: Deframer,
    stop: &AtomicBool,
    fg_tx: &SyncSender<Message>,
    route: &BgRoute,
    out_rx: &Receiver<Vec<u8>>,
    mut mirror: Option<Box<dyn DataMirror>>,
) {
    let idle = Duration::from_millis(1);
    let mut buf = [0u8; 4096];
    'io: while !stop.load(Ordering::Relaxed) {
        let mut busy = false;

        let waiting = match link.bytes_waiting() {
            Ok(n) => n,
            Err(e) => {
                error!("serial link failed on {}: {e}", link.path());
                break;
            }
        };
        if waiting > 0 {
            let n = match link.read(&mut buf) {
                Ok(n) => n,
                Err(e) => {
                    error!("serial read failed on {}: {e}", link.path());
                    break;
                }
            };
            if n > 0 {
                busy = true;
                if let Some(m) = mirror.as_mut() {
                    m.on_incoming(&buf[..n]);
                }
                for &b in &buf[..n] {
                    if let Some(msg) = deframer.push(b) {
                        route_msg(msg, fg_tx, route, stop);
                    }
                }
            }
        }

        loop {
            match out_rx.try_recv() {
                Ok(mut frame) => {
                    busy = true;
                    // Trailing newline for human observers; the peer's
                    // parser ignores it.
                    frame.push(b'\n');
                    if let Some(m) = mirror.as_mut() {
                        m.on_outgoing(&frame);
                    }
                    if let Err(e) = link.write_all(&frame) {
                        error!("serial write failed on {}: {e}", link.path());
                        break 'io;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break 'io,
            }
        }

        if !busy {
            std::thread::sleep(idle);
        }
    }
    // A dead worker means a stopped port, whatever the reason.
    stop.store(true, Ordering::SeqCst);
    debug!("stopped reading/writing {}", link.path());
    deframer.stats().log(log::Level::Debug);
    if let Some(m) = mirror.as_mut() {
        m.close();
    }
}

/// Deliver one decoded message. Foreground traffic blocks politely (while
/// watching the stop flag) because replies must not be lost; background
/// traffic is best-effort and dropped if its queue is full.
fn route_msg(msg: Message, fg_tx: &SyncSender<Message>, route: &BgRoute, stop: &AtomicBool) {
    if msg.is_background() {
        match route {
            BgRoute::Discard => return,
            BgRoute::Separate(tx) => {
                if let Err(TrySendError::Full(m)) = tx.try_send(msg) {
                    debug!("background queue full, dropping {m}");
                }
                return;
            }
            BgRoute::Keep => {}
        }
    }
    let mut msg = msg;
    while !stop.load(Ordering::Relaxed) {
        match fg_tx.try_send(msg) {
            Ok(()) => return,
            Err(TrySendError::Full(m)) => {
                msg = m;
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(TrySendError::Disconnected(_)) => return,
        }
    }
}

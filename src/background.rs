/*! Unsolicited device traffic: heartbeats, log lines, misc updates.

Boards emit `flag == 'B'` messages without being asked: `HRTB` heartbeats
carrying a status dictionary, `LOGB` log lines, and anything else a board
cares to announce. Delivery is best-effort and unacknowledged. A port in
[`crate::port::Backgrounds::Handle`] mode runs one worker thread that feeds
these to a [`BackgroundHandler`] and synthesises a missing-heartbeat event
when a board goes quiet.
*/
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, error, log, warn};

use crate::message::Message;
use crate::value::Value;

/// Heartbeat gap after which a board is considered quiet, unless
/// overridden.
pub const DEFAULT_HEARTBEAT_GAP: Duration = Duration::from_secs(5);

/// Longest the worker sleeps between watchdog checks.
const POLL: Duration = Duration::from_millis(100);

/// Receives background messages on the port's worker thread.
pub trait BackgroundHandler: Send {
    /// Maximum time without a heartbeat before
    /// [`BackgroundHandler::missing_heartbeat`] fires. `None` disables the
    /// watchdog.
    fn max_heartbeat_gap(&self) -> Option<Duration> {
        None
    }

    /// Called for every `HRTB` message.
    fn handle_heartbeat(&mut self, msg: &Message);

    /// Called for every `LOGB` message.
    fn handle_log(&mut self, msg: &Message);

    /// Called for every other background message.
    fn handle_misc(&mut self, msg: &Message);

    /// Called once when no heartbeat has arrived for
    /// [`BackgroundHandler::max_heartbeat_gap`]; not called again until a
    /// heartbeat shows up.
    fn missing_heartbeat(&mut self, since: Duration);
}

/// Worker loop: dispatch background messages and drive the heartbeat
/// watchdog. `expect_heartbeats` gates the watchdog so that a board which
/// was *told* to be quiet is not reported as lost.
pub(crate) fn run(
    stop: &AtomicBool,
    rx: &Receiver<Message>,
    expect_heartbeats: &AtomicBool,
    mut handler: Box<dyn BackgroundHandler>,
) {
    let mut last_heartbeat = Instant::now();
    let mut reported = false;
    while !stop.load(Ordering::Relaxed) {
        let gap = handler.max_heartbeat_gap();
        // Never sleep past the watchdog deadline, nor past a stop check.
        let wait = gap.map_or(POLL, |g| g.min(POLL));
        match rx.recv_timeout(wait) {
            Ok(msg) => match msg.opcode() {
                "HRTB" => {
                    handler.handle_heartbeat(&msg);
                    last_heartbeat = Instant::now();
                    reported = false;
                }
                "LOGB" => handler.handle_log(&msg),
                _ => handler.handle_misc(&msg),
            },
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if let Some(gap) = gap {
            let since = last_heartbeat.elapsed();
            if since > gap && !reported && expect_heartbeats.load(Ordering::Relaxed) {
                handler.missing_heartbeat(since);
                reported = true;
            }
        }
    }
    debug!("stopped handling background messages");
}

/// Map a device-reported severity name onto a [`log::Level`].
pub fn level_from_name(name: &str) -> Option<log::Level> {
    match name.to_ascii_uppercase().as_str() {
        "TRACE" => Some(log::Level::Trace),
        "DEBUG" => Some(log::Level::Debug),
        "INFO" => Some(log::Level::Info),
        "WARN" | "WARNING" => Some(log::Level::Warn),
        "ERROR" | "CRITICAL" | "FATAL" => Some(log::Level::Error),
        _ => None,
    }
}

/// Default handler: remembers the latest heartbeat, forwards board log
/// lines to the [`log`] facade, and warns when heartbeats go missing.
pub struct BoardMonitor {
    name: String,
    max_gap: Option<Duration>,
    last: Arc<Mutex<Option<Message>>>,
}

impl BoardMonitor {
    /// New monitor tagged with a board name for log lines.
    pub fn new(name: impl Into<String>, max_gap: Option<Duration>) -> Self {
        Self {
            name: name.into(),
            max_gap,
            last: Arc::default(),
        }
    }

    /// Handle for observing heartbeats after the monitor has moved into
    /// the worker thread.
    pub fn watch(&self) -> HeartbeatWatch {
        HeartbeatWatch(Arc::clone(&self.last))
    }
}

/// Shared view of the most recent heartbeat.
#[derive(Clone)]
pub struct HeartbeatWatch(Arc<Mutex<Option<Message>>>);

impl HeartbeatWatch {
    /// The most recently received heartbeat message, if any.
    pub fn latest(&self) -> Option<Message> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl BackgroundHandler for BoardMonitor {
    fn max_heartbeat_gap(&self) -> Option<Duration> {
        self.max_gap
    }

    fn handle_heartbeat(&mut self, msg: &Message) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(msg.clone());
    }

    fn handle_log(&mut self, msg: &Message) {
        match msg.args() {
            [Value::Str(level), Value::Str(text)] => match level_from_name(level) {
                Some(level) => log!(level, "[{}] {text}", self.name),
                None => error!("[{}] unknown log level {level:?}: {text}", self.name),
            },
            _ => error!("[{}] unexpected LOGB args: {msg}", self.name),
        }
    }

    fn handle_misc(&mut self, msg: &Message) {
        debug!("[{}] misc update: {msg}", self.name);
    }

    fn missing_heartbeat(&mut self, since: Duration) {
        warn!(
            "[{}] heartbeat lost from device after {:.1} seconds",
            self.name,
            since.as_secs_f64()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Dict;

    #[derive(Clone, Debug, PartialEq)]
    enum Event {
        Heartbeat(String),
        Log,
        Misc(String),
        Missing,
    }

    struct Recorder {
        events: Arc<Mutex<Vec<Event>>>,
        gap: Option<Duration>,
    }

    impl BackgroundHandler for Recorder {
        fn max_heartbeat_gap(&self) -> Option<Duration> {
            self.gap
        }
        fn handle_heartbeat(&mut self, msg: &Message) {
            self.events
                .lock()
                .unwrap()
                .push(Event::Heartbeat(msg.token().unwrap_or("").into()));
        }
        fn handle_log(&mut self, _msg: &Message) {
            self.events.lock().unwrap().push(Event::Log);
        }
        fn handle_misc(&mut self, msg: &Message) {
            self.events
                .lock()
                .unwrap()
                .push(Event::Misc(msg.opcode().into()));
        }
        fn missing_heartbeat(&mut self, _since: Duration) {
            self.events.lock().unwrap().push(Event::Missing);
        }
    }

    fn run_worker(
        gap: Option<Duration>,
        expect: bool,
        feed: Vec<Message>,
        run_for: Duration,
    ) -> Vec<Event> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let handler = Box::new(Recorder {
            events: Arc::clone(&events),
            gap,
        });
        let stop = Arc::new(AtomicBool::new(false));
        let expect_flag = Arc::new(AtomicBool::new(expect));
        let (tx, rx) = std::sync::mpsc::sync_channel(16);
        let worker = {
            let stop = Arc::clone(&stop);
            let expect_flag = Arc::clone(&expect_flag);
            std::thread::spawn(move || run(&stop, &rx, &expect_flag, handler))
        };
        for msg in feed {
            tx.send(msg).unwrap();
        }
        std::thread::sleep(run_for);
        stop.store(true, Ordering::SeqCst);
        worker.join().unwrap();
        let out = events.lock().unwrap().clone();
        out
    }

    fn heartbeat(token: &str) -> Message {
        Message::with_token("HRTB", token, vec![Value::Dict(Dict::new())])
    }

    #[test]
    fn dispatches_by_opcode() {
        let events = run_worker(
            None,
            true,
            vec![
                heartbeat("h1"),
                Message::with_token(
                    "LOGB",
                    "l1",
                    vec![Value::from("INFO"), Value::from("booted")],
                ),
                Message::with_token("POSB", "m1", vec![]),
            ],
            Duration::from_millis(50),
        );
        assert_eq!(
            events,
            vec![
                Event::Heartbeat("h1".into()),
                Event::Log,
                Event::Misc("POSB".into()),
            ]
        );
    }

    #[test]
    fn missing_heartbeat_fires_once() {
        let events = run_worker(
            Some(Duration::from_millis(20)),
            true,
            vec![],
            Duration::from_millis(200),
        );
        assert_eq!(events, vec![Event::Missing]);
    }

    #[test]
    fn missing_heartbeat_gated_by_expectation() {
        let events = run_worker(
            Some(Duration::from_millis(20)),
            false,
            vec![],
            Duration::from_millis(150),
        );
        assert!(events.is_empty());
    }

    #[test]
    fn heartbeat_rearms_the_watchdog() {
        let events = run_worker(
            Some(Duration::from_millis(40)),
            true,
            vec![heartbeat("h1")],
            Duration::from_millis(200),
        );
        assert_eq!(
            events,
            vec![Event::Heartbeat("h1".into()), Event::Missing]
        );
    }

    #[test]
    fn level_names_map() {
        assert_eq!(level_from_name("DEBUG"), Some(log::Level::Debug));
        assert_eq!(level_from_name("info"), Some(log::Level::Info));
        assert_eq!(level_from_name("WARNING"), Some(log::Level::Warn));
        assert_eq!(level_from_name("CRITICAL"), Some(log::Level::Error));
        assert_eq!(level_from_name("LOUD"), None);
    }

    #[test]
    fn monitor_tracks_latest_heartbeat() {
        let mut monitor = BoardMonitor::new("TestBoard", None);
        let watch = monitor.watch();
        assert!(watch.latest().is_none());
        let hb = heartbeat("ab");
        monitor.handle_heartbeat(&hb);
        assert_eq!(watch.latest(), Some(hb));
        // Malformed LOGB messages are absorbed, not fatal.
        monitor.handle_log(&Message::with_token("LOGB", "xx", vec![Value::from(3)]));
    }
}

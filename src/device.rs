/*! Role-typed device handles.

A device is a thin wrapper over a [`Port`] plus the identity the board
reported during discovery. Concrete device types implement [`Device`] and
build their domain operations out of `send_and_ack`/`send_and_done`
exchanges; the reserved exchanges (halt, heartbeat toggling) come as
provided methods. [`DeviceFactory`] is what discovery uses to turn a
responding endpoint into a handle for its role.
*/
use std::time::Duration;

use log::{error, info, warn};
use sha1::{Digest, Sha1};

use crate::background::{BoardMonitor, DEFAULT_HEARTBEAT_GAP, HeartbeatWatch};
use crate::message::Message;
use crate::port::{
    Backgrounds, DEFAULT_ACK_TIMEOUT, DEFAULT_DONE_TIMEOUT, DEFAULT_RETRIES, Port, PortConfig,
};
use crate::value::Value;
use crate::{DEFAULT_BAUD, Error, Result};

/// What a board reports in response to a discovery request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceDetails {
    /// The device type, e.g. `"MotorBoard"`.
    pub role: String,
    /// Distinguishes multiple boards of the same role.
    pub instance_index: i64,
    /// Unique hardware identifier, typically a silicon serial number.
    pub hardware_id: String,
    /// Firmware version string.
    pub version: String,
}

impl DeviceDetails {
    /// Parse the argument list of a discovery acknowledgement.
    pub fn from_args(args: &[Value]) -> Result<Self> {
        match args {
            [Value::Str(role), Value::Int(idx), Value::Str(hw), Value::Str(version)] => {
                Ok(Self {
                    role: role.clone(),
                    instance_index: *idx,
                    hardware_id: hw.clone(),
                    version: version.clone(),
                })
            }
            _ => Err(Error::Protocol(format!(
                "bad discovery reply args: {args:?}"
            ))),
        }
    }

    /// Shortened [`DeviceDetails::hardware_id`], for human-readable names.
    pub fn short_hardware_id(&self) -> String {
        shorten_id(&self.hardware_id)
    }

    /// A name identifying this particular board. Human-readable only,
    /// never on the wire.
    pub fn name(&self) -> String {
        format!("{}_{}_{}", self.role, self.instance_index, self.hardware_id)
    }
}

impl std::fmt::Display for DeviceDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}({}, {}, {})",
            self.role, self.instance_index, self.hardware_id, self.version
        )
    }
}

/// The low 6 hex digits of SHA-1 over a long identifier.
pub fn shorten_id(s: &str) -> String {
    let digest = hex::encode(Sha1::digest(s.as_bytes()));
    digest[digest.len() - 6..].to_string()
}

/// A connected board of a known role.
///
/// Implementations own their port and are stopped exactly once. The
/// provided methods cover the reserved protocol exchanges; domain-specific
/// operations belong on the concrete type.
pub trait Device: Send {
    /// The underlying port.
    fn port(&mut self) -> &mut Port;

    /// The identity reported at discovery time.
    fn details(&self) -> &DeviceDetails;

    /// Human-readable board name.
    fn name(&self) -> String {
        self.details().name()
    }

    /// Send a message, stamping a token if needed.
    fn send(&mut self, msg: &mut Message) -> Result<()> {
        self.port().send(msg)
    }

    /// Read the next reply. See [`Port::read`].
    fn read(&mut self, timeout: Duration) -> Result<Message> {
        self.port().read(timeout)
    }

    /// Read the next reply, `None` on timeout. See [`Port::try_read`].
    fn try_read(&mut self, timeout: Duration) -> Option<Message> {
        self.port().try_read(timeout)
    }

    /// Drop any queued replies.
    fn flush(&mut self) {
        self.port().flush()
    }

    /// Re-query the board's identity.
    fn ask_who(&mut self, timeout: Duration, retries: u32) -> Result<DeviceDetails> {
        self.port().ask_who(timeout, retries)
    }

    /// Tell the board to abandon whatever it is doing (`HALR`, acked and
    /// completed).
    fn halt(&mut self) -> Result<()> {
        let mut msg = Message::new("HALR", vec![]);
        self.port().send_and_done(
            &mut msg,
            Some("HALA"),
            Some("HALD"),
            DEFAULT_ACK_TIMEOUT,
            DEFAULT_DONE_TIMEOUT,
            DEFAULT_RETRIES,
        )?;
        Ok(())
    }

    /// Tell the board to start or stop emitting heartbeats, and gate the
    /// missing-heartbeat watchdog to match.
    fn set_heartbeats(&mut self, enabled: bool) -> Result<()> {
        let mut msg = Message::new("HRTR", vec![Value::Bool(enabled)]);
        self.port()
            .send_and_ack(&mut msg, Some("HRTA"), DEFAULT_ACK_TIMEOUT, DEFAULT_RETRIES)?;
        self.port().set_expect_heartbeats(enabled);
        Ok(())
    }

    /// Stop the port workers. Idempotent.
    fn stop(&mut self) {
        let name = self.name();
        let path = self.port().path().to_string();
        self.port().stop();
        info!("stopped {name} on {path}");
    }
}

/// Run an operation that may be cancelled from outside (Ctrl-C, another
/// thread). If it fails with [`Error::Interrupted`], the board is halted
/// best-effort, stale replies are flushed, and the interruption is
/// re-raised.
pub fn run_haltable<T>(
    dev: &mut dyn Device,
    f: impl FnOnce(&mut dyn Device) -> Result<T>,
) -> Result<T> {
    match f(dev) {
        Err(Error::Interrupted) => {
            warn!("halting {}...", dev.name());
            if let Err(e) = dev.halt() {
                error!("halt of {} failed: {e}", dev.name());
            }
            std::thread::sleep(Duration::from_secs(1));
            dev.flush();
            Err(Error::Interrupted)
        }
        other => other,
    }
}

/// Builds a device handle for one role during discovery.
pub trait DeviceFactory {
    /// The role string boards of this kind report.
    fn role(&self) -> &str;

    /// Baud rate for this kind of board.
    fn baud(&self) -> u32 {
        DEFAULT_BAUD
    }

    /// Open a permanent port on `path` and wrap it. `details` is what the
    /// board just reported to the discovery probe.
    fn connect(&self, path: &str, details: DeviceDetails) -> Result<Box<dyn Device>>;
}

/// A device with no domain-specific operations, with heartbeats and board
/// logs handled by a [`BoardMonitor`]. Good enough for scripting and for
/// roles that only need the reserved exchanges.
pub struct GenericDevice {
    port: Port,
    details: DeviceDetails,
    heartbeats: Option<HeartbeatWatch>,
}

impl GenericDevice {
    /// Wrap an already-running port.
    pub fn new(port: Port, details: DeviceDetails) -> Self {
        Self {
            port,
            details,
            heartbeats: None,
        }
    }

    /// The most recent heartbeat, when constructed through
    /// [`GenericFactory`].
    pub fn last_heartbeat(&self) -> Option<Message> {
        self.heartbeats.as_ref().and_then(HeartbeatWatch::latest)
    }
}

impl Device for GenericDevice {
    fn port(&mut self) -> &mut Port {
        &mut self.port
    }
    fn details(&self) -> &DeviceDetails {
        &self.details
    }
}

/// Factory producing [`GenericDevice`] handles for a role.
pub struct GenericFactory {
    role: String,
    baud: u32,
    max_gap: Option<Duration>,
}

impl GenericFactory {
    /// Factory for `role` with the default baud rate and heartbeat gap.
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            baud: DEFAULT_BAUD,
            max_gap: Some(DEFAULT_HEARTBEAT_GAP),
        }
    }

    /// Use a different baud rate.
    pub fn with_baud(mut self, baud: u32) -> Self {
        self.baud = baud;
        self
    }

    /// Change (or with `None`, disable) the missing-heartbeat watchdog.
    pub fn with_heartbeat_gap(mut self, gap: Option<Duration>) -> Self {
        self.max_gap = gap;
        self
    }
}

impl DeviceFactory for GenericFactory {
    fn role(&self) -> &str {
        &self.role
    }

    fn baud(&self) -> u32 {
        self.baud
    }

    fn connect(&self, path: &str, details: DeviceDetails) -> Result<Box<dyn Device>> {
        if details.role != self.role {
            return Err(Error::Config(format!(
                "role mismatch on {path}: expected {:?}, board says {:?}",
                self.role, details.role
            )));
        }
        let monitor = BoardMonitor::new(details.name(), self.max_gap);
        let watch = monitor.watch();
        let port = Port::open(
            path,
            self.baud,
            PortConfig {
                backgrounds: Backgrounds::Handle(Box::new(monitor)),
                ..PortConfig::default()
            },
        )?;
        Ok(Box::new(GenericDevice {
            port,
            details,
            heartbeats: Some(watch),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details() -> DeviceDetails {
        DeviceDetails {
            role: "ValveCluster".into(),
            instance_index: 0,
            hardware_id: "0031FFFFFFFFFFFF4E45356740010017".into(),
            version: "1.2.0".into(),
        }
    }

    #[test]
    fn short_ids() {
        assert_eq!(shorten_id("hello"), "a9434d");
        assert_eq!(shorten_id("BOARD-1234"), "880402");
        assert_eq!(details().short_hardware_id(), "36624f");
    }

    #[test]
    fn names() {
        let d = details();
        assert_eq!(d.name(), "ValveCluster_0_0031FFFFFFFFFFFF4E45356740010017");
        assert_eq!(
            d.to_string(),
            "ValveCluster(0, 0031FFFFFFFFFFFF4E45356740010017, 1.2.0)"
        );
    }

    #[test]
    fn discovery_reply_parsing() {
        let ok = DeviceDetails::from_args(&[
            Value::from("ValveCluster"),
            Value::from(0),
            Value::from("0031FFFFFFFFFFFF4E45356740010017"),
            Value::from("1.2.0"),
        ])
        .unwrap();
        assert_eq!(ok.role, "ValveCluster");
        assert_eq!(ok.instance_index, 0);

        for bad in [
            vec![],
            vec![Value::from("OnlyRole")],
            vec![
                Value::from("Role"),
                Value::from("not-an-int"),
                Value::from("hw"),
                Value::from("v"),
            ],
        ] {
            assert!(matches!(
                DeviceDetails::from_args(&bad),
                Err(Error::Protocol(_))
            ));
        }
    }

    #[test]
    fn factory_rejects_role_mismatch() {
        let factory = GenericFactory::new("MotorBoard");
        match factory.connect("/nonexistent", details()) {
            Err(err) => assert!(matches!(err, Error::Config(_)), "got {err:?}"),
            Ok(_) => panic!("expected connect to fail"),
        }
    }
}

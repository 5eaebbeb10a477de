/*! Finding boards on the system's serial endpoints.

Discovery enumerates candidate endpoints, probes each with a `DISR`
exchange over a short-lived port, and hands responding endpoints to the
[`DeviceFactory`] registered for the reported role. Endpoints that fail to
open, stay silent, or answer nonsense are skipped quietly; discovery is a
sweep over ports that mostly aren't ours.
*/
use std::collections::HashMap;
use std::time::Duration;

use log::debug;

use crate::device::{Device, DeviceFactory};
use crate::port::{Backgrounds, Port, PortConfig};
use crate::serial;
use crate::{DEFAULT_BAUD, Error, Result};

/// How long a probed endpoint gets to acknowledge a discovery request.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(100);
/// Resends during a probe.
const PROBE_RETRIES: u32 = 1;

/// Knobs for a discovery sweep.
#[derive(Clone, Copy, Debug, Default)]
pub struct DetectOptions {
    /// Probe likely endpoints first and stop as soon as every registered
    /// role has at least one device.
    pub fast: bool,
    /// Baud rate used when probing; `None` for the default.
    pub baud: Option<u32>,
    /// Fail the sweep if a board reports a role nobody registered,
    /// instead of skipping it.
    pub raise_on_unknown_role: bool,
}

/// Maps role strings to the factories that connect them.
#[derive(Default)]
pub struct DeviceRegistry {
    by_role: HashMap<String, Box<dyn DeviceFactory>>,
}

impl DeviceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a factory. Registering the same role twice is an error.
    pub fn register(&mut self, factory: Box<dyn DeviceFactory>) -> Result<()> {
        let role = factory.role().to_string();
        if self.by_role.contains_key(&role) {
            return Err(Error::Config(format!("role registered twice: {role:?}")));
        }
        self.by_role.insert(role, factory);
        Ok(())
    }

    /// Number of registered roles.
    pub fn len(&self) -> usize {
        self.by_role.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.by_role.is_empty()
    }

    /// The registered role strings.
    pub fn roles(&self) -> impl Iterator<Item = &str> + '_ {
        self.by_role.keys().map(String::as_str)
    }

    fn get(&self, role: &str) -> Option<&dyn DeviceFactory> {
        self.by_role.get(role).map(Box::as_ref)
    }
}

/// Endpoints that look like USB serial adapters are far more likely to be
/// boards than onboard UARTs or modems, so a fast sweep tries them first.
fn path_priority(path: &str) -> u8 {
    let basename = path
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(path)
        .to_ascii_lowercase();
    if basename.contains("usb") {
        0
    } else if basename.starts_with("tty") {
        1
    } else {
        2
    }
}

/// Probe a single endpoint and connect it through the registry.
///
/// Returns `Ok(None)` if the endpoint could not be opened, did not answer
/// the discovery probe, or reported an unregistered role (unless
/// [`DetectOptions::raise_on_unknown_role`] is set). The probe runs over a
/// transient port that discards background traffic; the factory then
/// reopens the endpoint permanently at its own baud rate.
pub fn open_device(
    path: &str,
    registry: &DeviceRegistry,
    opts: &DetectOptions,
) -> Result<Option<Box<dyn Device>>> {
    let baud = opts.baud.unwrap_or(DEFAULT_BAUD);
    let link = match serial::open_serial(path, baud) {
        Ok(link) => link,
        Err(e) => {
            debug!("failed to open {path}: {e}");
            return Ok(None);
        }
    };
    let mut port = Port::spawn(link, PortConfig {
        backgrounds: Backgrounds::Discard,
        ..PortConfig::default()
    })?;
    debug!("querying {path}...");
    let details = port.ask_who(PROBE_TIMEOUT, PROBE_RETRIES);
    port.stop();
    let details = match details {
        Ok(d) => d,
        Err(e) => {
            debug!("no discovery reply from {path}: {e}");
            return Ok(None);
        }
    };

    let Some(factory) = registry.get(&details.role) else {
        if opts.raise_on_unknown_role {
            return Err(Error::Config(format!(
                "unknown device role {:?} on {path}",
                details.role
            )));
        }
        debug!("skipping {path}: no factory for role {:?}", details.role);
        return Ok(None);
    };
    factory.connect(path, details).map(Some)
}

/// Probe every candidate endpoint and connect everything that responds
/// with a registered role, grouped by role.
pub fn detect_all(
    registry: &DeviceRegistry,
    opts: &DetectOptions,
) -> Result<HashMap<String, Vec<Box<dyn Device>>>> {
    let mut paths = serial::list_endpoints()?;
    if opts.fast {
        // Stable sort keeps OS enumeration order within each class.
        paths.sort_by_key(|p| path_priority(p));
    }
    let mut found: HashMap<String, Vec<Box<dyn Device>>> = HashMap::new();
    for path in &paths {
        debug!("trying to connect to {path}...");
        if let Some(dev) = open_device(path, registry, opts)? {
            let role = dev.details().role.clone();
            found.entry(role).or_default().push(dev);
            if opts.fast && found.len() == registry.len() {
                break;
            }
        }
    }
    Ok(found)
}

/// Alias for [`detect_all`].
pub fn find_all(
    registry: &DeviceRegistry,
    opts: &DetectOptions,
) -> Result<HashMap<String, Vec<Box<dyn Device>>>> {
    detect_all(registry, opts)
}

/// Like [`detect_all`], but requires at most one device per role and
/// unwraps the grouping. Duplicate boards for a role are an error.
pub fn find_single_of_each(
    registry: &DeviceRegistry,
    opts: &DetectOptions,
) -> Result<HashMap<String, Box<dyn Device>>> {
    single_of_each(detect_all(registry, opts)?)
}

fn single_of_each(
    all: HashMap<String, Vec<Box<dyn Device>>>,
) -> Result<HashMap<String, Box<dyn Device>>> {
    let mut out = HashMap::new();
    for (role, mut devices) in all {
        if devices.len() > 1 {
            return Err(Error::Config(format!(
                "too many boards with role {role:?} ({})",
                devices.len()
            )));
        }
        if let Some(dev) = devices.pop() {
            out.insert(role, dev);
        }
    }
    Ok(out)
}

/// Stop a collection of devices.
pub fn close_devices(devices: impl IntoIterator<Item = Box<dyn Device>>) {
    for mut dev in devices {
        dev.stop();
    }
}

/*! Probe every serial endpoint and report the boards that answer.

```no_run
$ cargo run --example detect -- MotorBoard SensorBoard --fast
MotorBoard: MotorBoard_0_0031FFFF4E45 v1.4.2 (hw 36624f)
```
*/
use anyhow::Result;
use clap::Parser;

use boardlink::device::{Device, GenericFactory};
use boardlink::discovery::{self, DetectOptions, DeviceRegistry};

#[derive(clap::Parser, Debug)]
#[command(version, about)]
struct Opt {
    /// Roles to look for.
    #[arg(required = true)]
    roles: Vec<String>,

    /// Verbosity of debug messages.
    #[arg(short, default_value = "0")]
    verbose: usize,

    /// Probe likely endpoints first, stop once every role has a board.
    #[arg(long)]
    fast: bool,

    /// Baud rate used for probing.
    #[arg(long)]
    baud: Option<u32>,
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    stderrlog::new()
        .module(module_path!())
        .module("boardlink")
        .verbosity(opt.verbose)
        .timestamp(stderrlog::Timestamp::Second)
        .init()?;

    let mut registry = DeviceRegistry::new();
    for role in &opt.roles {
        registry.register(Box::new(GenericFactory::new(role.as_str())))?;
    }
    let opts = DetectOptions {
        fast: opt.fast,
        baud: opt.baud,
        raise_on_unknown_role: false,
    };

    let found = discovery::detect_all(&registry, &opts)?;
    if found.is_empty() {
        println!("no boards found");
    }
    for (role, devices) in &found {
        for dev in devices {
            let d = dev.details();
            println!(
                "{role}: {} v{} (hw {})",
                d.name(),
                d.version,
                d.short_hardware_id()
            );
        }
    }
    discovery::close_devices(found.into_values().flatten());
    Ok(())
}

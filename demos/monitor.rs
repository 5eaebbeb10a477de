/*! Watch one board: enable its heartbeats and print them until Ctrl-C.

On interrupt the board is halted and heartbeats are turned back off, so it
comes back quiet.

```no_run
$ cargo run --example monitor -- /dev/ttyUSB0
```
*/
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::info;

use boardlink::device::{Device, GenericDevice, run_haltable};
use boardlink::port::{Backgrounds, Port, PortConfig};
use boardlink::{CancelToken, DEFAULT_BAUD, Error};

#[derive(clap::Parser, Debug)]
#[command(version, about)]
struct Opt {
    /// Serial endpoint the board is on.
    path: String,

    /// Verbosity of debug messages.
    #[arg(short, default_value = "1")]
    verbose: usize,

    /// Baud rate.
    #[arg(long, default_value_t = DEFAULT_BAUD)]
    baud: u32,
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    stderrlog::new()
        .module(module_path!())
        .module("boardlink")
        .verbosity(opt.verbose)
        .timestamp(stderrlog::Timestamp::Second)
        .init()?;

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel())?;
    }

    let mut port = Port::open(
        &opt.path,
        opt.baud,
        PortConfig {
            backgrounds: Backgrounds::Queue,
            ..PortConfig::default()
        },
    )?;
    let details = port.ask_who(Duration::from_millis(500), 3)?;
    println!("connected: {details}");
    let mut dev = GenericDevice::new(port, details);

    dev.set_heartbeats(true)?;
    let res: boardlink::Result<()> = run_haltable(&mut dev, |dev| loop {
        cancel.check()?;
        let Some(msg) = dev.port().read_background(Duration::from_millis(200)) else {
            continue;
        };
        match msg.heartbeat() {
            Some(hb) => {
                let fields: Vec<String> = hb.iter().map(|(k, v)| format!("{k}={v}")).collect();
                println!("heartbeat: {}", fields.join(" "));
            }
            None => println!("{msg}"),
        }
    });
    match res {
        Err(Error::Interrupted) => info!("interrupted, shutting down"),
        Err(e) => return Err(e.into()),
        Ok(()) => {}
    }

    let _ = dev.set_heartbeats(false);
    dev.stop();
    Ok(())
}

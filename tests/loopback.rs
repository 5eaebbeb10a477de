//! Port-level exchanges against a scripted peer over an in-memory link.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;

use boardlink::device::{self, Device, DeviceDetails, GenericDevice};
use boardlink::port::{Backgrounds, Port, PortConfig};
use boardlink::serial::{LoopLink, SerialLink, loop_pair};
use boardlink::{Deframer, Error, Message, ParseMode, Value};

const ACK_TIMEOUT: Duration = Duration::from_millis(200);
const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// A fake board: deframes whatever the port sends and answers through a
/// script. Requests are recorded for later assertions.
struct Peer {
    stop: Arc<AtomicBool>,
    seen: Arc<Mutex<Vec<Message>>>,
    worker: Option<JoinHandle<()>>,
}

impl Peer {
    fn spawn<F>(mut link: LoopLink, mut script: F) -> Peer
    where
        F: FnMut(&Message, usize) -> Vec<Message> + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let worker = {
            let stop = Arc::clone(&stop);
            let seen = Arc::clone(&seen);
            std::thread::spawn(move || {
                let mut deframer = Deframer::new(512, ParseMode::Strict);
                let mut buf = [0u8; 256];
                let mut count = 0;
                while !stop.load(Ordering::Relaxed) {
                    let n = link.read(&mut buf).expect("loop link read");
                    if n == 0 {
                        std::thread::sleep(Duration::from_millis(1));
                        continue;
                    }
                    for &b in &buf[..n] {
                        if let Some(msg) = deframer.push(b) {
                            seen.lock().unwrap().push(msg.clone());
                            for reply in script(&msg, count) {
                                link.write_all(&reply.encode().expect("peer encode"))
                                    .expect("loop link write");
                            }
                            count += 1;
                        }
                    }
                }
            })
        };
        Peer {
            stop,
            seen,
            worker: Some(worker),
        }
    }

    fn seen(&self) -> Vec<Message> {
        self.seen.lock().unwrap().clone()
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(w) = self.worker.take() {
            let _ = w.join();
        }
    }
}

fn ack_for(msg: &Message, args: Vec<Value>) -> Message {
    Message::with_token(
        format!("{}A", msg.command()),
        msg.token().expect("request has a token"),
        args,
    )
}

fn done_for(msg: &Message) -> Message {
    Message::with_token(
        format!("{}D", msg.command()),
        msg.token().expect("request has a token"),
        vec![],
    )
}

#[test]
fn ack_exchange() -> Result<()> {
    let (host, board) = loop_pair();
    let _peer = Peer::spawn(board, |msg, _| vec![ack_for(msg, vec![Value::from("ok")])]);
    let mut port = Port::spawn(Box::new(host), PortConfig::default())?;

    let mut msg = Message::new("RUNR", vec![Value::from(3)]);
    let ack = port.send_and_ack(&mut msg, None, ACK_TIMEOUT, 3)?;
    assert_eq!(ack.opcode(), "RUNA");
    assert_eq!(ack.token(), msg.token());
    assert_eq!(ack.args(), [Value::from("ok")]);
    assert_eq!(port.missed_acks(), 0);
    port.stop();
    Ok(())
}

#[test]
fn retry_uses_a_fresh_token() -> Result<()> {
    let (host, board) = loop_pair();
    // Drop the first attempt on the floor, ack the second.
    let peer = Peer::spawn(board, |msg, n| {
        if n == 0 {
            vec![]
        } else {
            vec![ack_for(msg, vec![])]
        }
    });
    let mut port = Port::spawn(Box::new(host), PortConfig::default())?;

    let mut msg = Message::new("RUNR", vec![]);
    let ack = port.send_and_ack(&mut msg, None, ACK_TIMEOUT, 3)?;
    assert_eq!(port.missed_acks(), 1);

    let seen = peer.seen();
    assert_eq!(seen.len(), 2);
    assert_ne!(
        seen[0].token(),
        seen[1].token(),
        "retry must re-stamp the token"
    );
    assert_eq!(ack.token(), seen[1].token());
    port.stop();
    Ok(())
}

#[test]
fn ack_timeout_after_all_retries() -> Result<()> {
    let (host, board) = loop_pair();
    let peer = Peer::spawn(board, |_, _| vec![]);
    let mut port = Port::spawn(Box::new(host), PortConfig::default())?;

    let mut msg = Message::new("RUNR", vec![]);
    let err = port
        .send_and_ack(&mut msg, None, Duration::from_millis(50), 2)
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "got {err:?}");
    assert_eq!(port.missed_acks(), 3);
    assert_eq!(peer.seen().len(), 3);
    port.stop();
    Ok(())
}

#[test]
fn wrong_token_is_a_protocol_violation() -> Result<()> {
    let (host, board) = loop_pair();
    let _peer = Peer::spawn(board, |msg, _| {
        vec![Message::with_token(
            format!("{}A", msg.command()),
            "!!",
            vec![],
        )]
    });
    let mut port = Port::spawn(Box::new(host), PortConfig::default())?;

    let mut msg = Message::new("RUNR", vec![]);
    let err = port.send_and_ack(&mut msg, None, ACK_TIMEOUT, 3).unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "got {err:?}");
    port.stop();
    Ok(())
}

#[test]
fn wrong_opcode_is_a_protocol_violation() -> Result<()> {
    let (host, board) = loop_pair();
    let _peer = Peer::spawn(board, |msg, _| {
        vec![Message::with_token(
            "NOPA",
            msg.token().unwrap(),
            vec![],
        )]
    });
    let mut port = Port::spawn(Box::new(host), PortConfig::default())?;

    let mut msg = Message::new("RUNR", vec![]);
    let err = port.send_and_ack(&mut msg, None, ACK_TIMEOUT, 3).unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "got {err:?}");
    port.stop();
    Ok(())
}

#[test]
fn done_exchange() -> Result<()> {
    let (host, board) = loop_pair();
    let _peer = Peer::spawn(board, |msg, _| {
        vec![ack_for(msg, vec![]), done_for(msg)]
    });
    let mut port = Port::spawn(Box::new(host), PortConfig::default())?;

    let mut msg = Message::new("MOVR", vec![Value::from(90)]);
    let (ack, done) = port.send_and_done(
        &mut msg,
        None,
        None,
        ACK_TIMEOUT,
        READ_TIMEOUT,
        3,
    )?;
    assert_eq!(ack.opcode(), "MOVA");
    assert_eq!(done.opcode(), "MOVD");
    assert_eq!(done.token(), ack.token());
    port.stop();
    Ok(())
}

#[test]
fn done_with_wrong_token_fails() -> Result<()> {
    let (host, board) = loop_pair();
    let _peer = Peer::spawn(board, |msg, _| {
        vec![
            ack_for(msg, vec![]),
            Message::with_token("MOVD", "!!", vec![]),
        ]
    });
    let mut port = Port::spawn(Box::new(host), PortConfig::default())?;

    let mut msg = Message::new("MOVR", vec![]);
    let err = port
        .send_and_done(&mut msg, None, None, ACK_TIMEOUT, READ_TIMEOUT, 3)
        .unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "got {err:?}");
    port.stop();
    Ok(())
}

#[test]
fn background_messages_queue_separately() -> Result<()> {
    let (host, board) = loop_pair();
    let _peer = Peer::spawn(board, |msg, _| {
        vec![
            Message::with_token("HRTB", "hb", vec![Value::Dict(Default::default())]),
            ack_for(msg, vec![]),
        ]
    });
    let mut port = Port::spawn(Box::new(host), PortConfig {
        backgrounds: Backgrounds::Queue,
        ..PortConfig::default()
    })?;

    // The heartbeat arrives before the ACK but must not disturb it.
    let mut msg = Message::new("PNGR", vec![]);
    let ack = port.send_and_ack(&mut msg, None, ACK_TIMEOUT, 3)?;
    assert_eq!(ack.opcode(), "PNGA");

    let hb = port
        .read_background(READ_TIMEOUT)
        .expect("queued heartbeat");
    assert_eq!(hb.opcode(), "HRTB");
    assert!(hb.heartbeat().is_some());
    port.stop();
    Ok(())
}

#[test]
fn background_messages_kept_inline() -> Result<()> {
    let (host, board) = loop_pair();
    let _peer = Peer::spawn(board, |msg, _| {
        vec![
            Message::with_token("HRTB", "hb", vec![Value::Dict(Default::default())]),
            ack_for(msg, vec![]),
        ]
    });
    let mut port = Port::spawn(Box::new(host), PortConfig {
        backgrounds: Backgrounds::Keep,
        ..PortConfig::default()
    })?;

    let mut msg = Message::new("PNGR", vec![]);
    port.send(&mut msg)?;
    let first = port.read(READ_TIMEOUT)?;
    assert_eq!(first.opcode(), "HRTB");
    let second = port.read(READ_TIMEOUT)?;
    assert_eq!(second.opcode(), "PNGA");
    port.stop();
    Ok(())
}

#[test]
fn background_messages_discarded_by_default() -> Result<()> {
    let (host, board) = loop_pair();
    let _peer = Peer::spawn(board, |msg, _| {
        vec![
            Message::with_token("HRTB", "hb", vec![Value::Dict(Default::default())]),
            ack_for(msg, vec![]),
        ]
    });
    let mut port = Port::spawn(Box::new(host), PortConfig::default())?;

    let mut msg = Message::new("PNGR", vec![]);
    let ack = port.send_and_ack(&mut msg, None, ACK_TIMEOUT, 3)?;
    assert_eq!(ack.opcode(), "PNGA");
    assert!(port.read_background(Duration::from_millis(20)).is_none());
    assert!(port.try_read(Duration::from_millis(20)).is_none());
    port.stop();
    Ok(())
}

#[test]
fn replies_arrive_in_wire_order() -> Result<()> {
    let (host, board) = loop_pair();
    let _peer = Peer::spawn(board, |msg, _| {
        vec![ack_for(msg, vec![msg.args()[0].clone()])]
    });
    let mut port = Port::spawn(Box::new(host), PortConfig::default())?;

    let mut sent_tokens = Vec::new();
    for n in 0..5 {
        let mut msg = Message::new("PNGR", vec![Value::from(n)]);
        port.send(&mut msg)?;
        sent_tokens.push(msg.token().unwrap().to_string());
    }
    for (n, want) in sent_tokens.iter().enumerate() {
        let reply = port.read(READ_TIMEOUT)?;
        assert_eq!(reply.token(), Some(want.as_str()));
        assert_eq!(reply.args(), [Value::from(n as i64)]);
    }
    port.stop();
    Ok(())
}

#[test]
fn flush_drains_pending_replies() -> Result<()> {
    let (host, board) = loop_pair();
    let _peer = Peer::spawn(board, |msg, _| {
        vec![
            ack_for(msg, vec![]),
            Message::with_token("XTRA", "t1", vec![]),
            Message::with_token("XTRA", "t2", vec![]),
        ]
    });
    let mut port = Port::spawn(Box::new(host), PortConfig::default())?;

    let mut msg = Message::new("PNGR", vec![]);
    port.send(&mut msg)?;
    // Wait for the burst to land, then flush everything.
    let _ = port.read(READ_TIMEOUT)?;
    std::thread::sleep(Duration::from_millis(50));
    port.flush();
    assert!(port.try_read(Duration::from_millis(20)).is_none());
    port.stop();
    Ok(())
}

#[test]
fn ask_who_parses_details() -> Result<()> {
    let (host, board) = loop_pair();
    let _peer = Peer::spawn(board, |msg, _| {
        vec![ack_for(
            msg,
            vec![
                Value::from("ValveCluster"),
                Value::from(2),
                Value::from("0031FFFFFFFFFFFF4E45356740010017"),
                Value::from("1.4.2"),
            ],
        )]
    });
    let mut port = Port::spawn(Box::new(host), PortConfig::default())?;

    let details = port.ask_who(ACK_TIMEOUT, 2)?;
    assert_eq!(details.role, "ValveCluster");
    assert_eq!(details.instance_index, 2);
    assert_eq!(details.version, "1.4.2");
    assert_eq!(details.short_hardware_id().len(), 6);
    port.stop();
    Ok(())
}

#[test]
fn ask_who_rejects_malformed_reply() -> Result<()> {
    let (host, board) = loop_pair();
    let _peer = Peer::spawn(board, |msg, _| {
        vec![ack_for(msg, vec![Value::from("RoleOnly")])]
    });
    let mut port = Port::spawn(Box::new(host), PortConfig::default())?;

    let err = port.ask_who(ACK_TIMEOUT, 1).unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "got {err:?}");
    port.stop();
    Ok(())
}

#[test]
fn expect_enforces_opcode() -> Result<()> {
    let (host, board) = loop_pair();
    let _peer = Peer::spawn(board, |msg, _| vec![ack_for(msg, vec![])]);
    let mut port = Port::spawn(Box::new(host), PortConfig::default())?;

    let mut msg = Message::new("PNGR", vec![]);
    port.send(&mut msg)?;
    port.expect("PNGA", READ_TIMEOUT)?;

    let mut msg = Message::new("PNGR", vec![]);
    port.send(&mut msg)?;
    let err = port.expect("MOVA", READ_TIMEOUT).unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "got {err:?}");
    port.stop();
    Ok(())
}

#[test]
fn noisy_link_still_delivers() -> Result<()> {
    let (host, mut board) = loop_pair();
    // Raw noise followed by a handwritten frame, no peer thread needed.
    board.write_all(b"garbage\0>>")?;
    board.write_all(&Message::with_token("EVTA", "zz", vec![Value::from(7)]).encode()?)?;
    let mut port = Port::spawn(Box::new(host), PortConfig::default())?;

    let msg = port.read(READ_TIMEOUT)?;
    assert_eq!(msg.opcode(), "EVTA");
    assert_eq!(msg.args(), [Value::from(7)]);
    let stats = port.stats();
    assert_eq!(stats.good_frames(), 1);
    assert_eq!(stats.invalid_bytes(), 1);
    port.stop();
    Ok(())
}

#[test]
fn device_halt_and_heartbeat_toggle() -> Result<()> {
    let (host, board) = loop_pair();
    let peer = Peer::spawn(board, |msg, _| match msg.opcode() {
        "HALR" => vec![ack_for(msg, vec![]), done_for(msg)],
        _ => vec![ack_for(msg, vec![])],
    });
    let port = Port::spawn(Box::new(host), PortConfig::default())?;
    let details = DeviceDetails {
        role: "MotorBoard".into(),
        instance_index: 0,
        hardware_id: "hw-1".into(),
        version: "1.0".into(),
    };
    let mut dev = GenericDevice::new(port, details);

    dev.set_heartbeats(true)?;
    dev.halt()?;
    let opcodes: Vec<String> = peer
        .seen()
        .iter()
        .map(|m| m.opcode().to_string())
        .collect();
    assert_eq!(opcodes, ["HRTR", "HALR"]);
    // The heartbeat request carried the flag.
    assert_eq!(peer.seen()[0].args(), [Value::from(true)]);
    dev.stop();
    Ok(())
}

#[test]
fn interrupted_operation_halts_the_board() -> Result<()> {
    let (host, board) = loop_pair();
    let peer = Peer::spawn(board, |msg, _| match msg.opcode() {
        "HALR" => vec![ack_for(msg, vec![]), done_for(msg)],
        _ => vec![],
    });
    let port = Port::spawn(Box::new(host), PortConfig::default())?;
    let details = DeviceDetails {
        role: "MotorBoard".into(),
        instance_index: 0,
        hardware_id: "hw-1".into(),
        version: "1.0".into(),
    };
    let mut dev = GenericDevice::new(port, details);

    let res: boardlink::Result<()> =
        device::run_haltable(&mut dev, |_| Err(Error::Interrupted));
    assert!(matches!(res, Err(Error::Interrupted)));
    let opcodes: Vec<String> = peer
        .seen()
        .iter()
        .map(|m| m.opcode().to_string())
        .collect();
    assert_eq!(opcodes, ["HALR"]);
    dev.stop();
    Ok(())
}

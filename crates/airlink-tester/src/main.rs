//! Two link nodes on a simulated medium, driven from the command line.
//! Useful for watching the protocol work: delivery reports, retries
//! under injected ack loss, beacon clock pull.

use std::thread;
use std::time::{Duration, Instant};

use airlink_common::__log::LevelFilter;
use airlink_common::{dev_info, dev_warn};
use airlink_mac::{
    BROADCAST_ADDR, LinkLayer, LinkTimings, STATUS_TX_DELIVERED, STATUS_TX_FAILED, Transmission,
};
use airlink_sim::{SimMedium, SimRadio};
use clap::Parser;

/// Timings scaled down from the stock virtual radio so a demo run
/// finishes in seconds.
struct DemoTimings;

impl LinkTimings for DemoTimings {
    const SIFS_TIME_MS: i64 = 10;
    const SLOT_TIME_MS: i64 = 20;
    const RETRY_LIMIT: u32 = 3;
    const ACK_TX_TIME_MS: i64 = 200;
}

type DemoLink = LinkLayer<SimRadio, DemoTimings>;

#[derive(Parser, Debug)]
struct Args {
    /// How many payloads the sender pushes across.
    #[clap(long, default_value_t = 5)]
    count: u32,

    /// Send everything to the broadcast address instead of unicast.
    #[clap(long)]
    broadcast: bool,

    /// Beacon interval in seconds for the sending node.
    #[clap(long)]
    beacon_interval: Option<i32>,

    /// Pin slot draws to the full contention window on both nodes.
    #[clap(long)]
    max_slot: bool,

    /// Enable per-frame debug chatter on both nodes.
    #[clap(long)]
    debug: bool,

    /// Swallow this many acks headed back to the sender, forcing
    /// retransmissions.
    #[clap(long, default_value_t = 0)]
    drop_acks: u32,
}

const SENDER_MAC: i16 = 17;
const RECEIVER_MAC: i16 = 23;

/// Upper bound on one frame's fate: every permitted retry at the widest
/// contention window, with margin.
const DELIVERY_WAIT: Duration = Duration::from_secs(5);

fn main() {
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();

    let medium = SimMedium::new();
    let sender: DemoLink = LinkLayer::new(medium.attach(), SENDER_MAC);
    let receiver: DemoLink = LinkLayer::new(medium.attach(), RECEIVER_MAC);

    if args.max_slot {
        sender.command(2, 1);
        receiver.command(2, 1);
    }
    if args.debug {
        sender.command(1, -1);
        receiver.command(1, -1);
    }
    if let Some(interval) = args.beacon_interval {
        sender.command(3, interval);
    }
    if args.drop_acks > 0 {
        let drop_acks = args.drop_acks;
        medium.drop_matching(drop_acks, |frame| {
            airlink_mac::Frame::decode(frame)
                .map(|f| f.kind() == Some(airlink_mac::FrameType::Ack) && f.dst == SENDER_MAC)
                .unwrap_or(false)
        });
        dev_info!("the medium will swallow the next {} acks", drop_acks);
    }

    let expected = args.count;
    let sink = thread::spawn(move || {
        let mut t = Transmission::default();
        for _ in 0..expected {
            let len = receiver.recv(&mut t);
            if len < 0 {
                dev_warn!("receive side torn down early");
                break;
            }
            dev_info!(
                "[{}] <- {:?} from {} ({} bytes)",
                RECEIVER_MAC,
                String::from_utf8_lossy(&t.buf),
                t.source_addr,
                len
            );
        }
    });

    let dst = if args.broadcast { BROADCAST_ADDR } else { RECEIVER_MAC };
    for i in 0..args.count {
        let payload = format!("ping {i}");
        let accepted = sender.send(dst, payload.as_bytes(), payload.len() as i32);
        if accepted == 0 {
            dev_warn!("[{}] send queue full, backing off", SENDER_MAC);
            thread::sleep(Duration::from_millis(500));
            continue;
        }
        if !args.broadcast {
            // The status word is never reset between sends, so a stale
            // terminal value from the previous frame still reads back.
            // Snapshot it and wait for a change; the word is
            // level-triggered, so an unchanged value once the worst-case
            // retry window has passed means this frame repeated the
            // previous outcome.
            let before = sender.status();
            let deadline = Instant::now() + DELIVERY_WAIT;
            let mut outcome = before;
            while outcome == before && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
                outcome = sender.status();
            }
            match outcome {
                STATUS_TX_DELIVERED => dev_info!("[{}] '{}' delivered", SENDER_MAC, payload),
                STATUS_TX_FAILED => {
                    dev_warn!("[{}] '{}' gave up after retries", SENDER_MAC, payload)
                }
                other => dev_warn!(
                    "[{}] '{}' outcome unresolved (status {})",
                    SENDER_MAC,
                    payload,
                    other
                ),
            }
        }
    }

    // Give broadcasts a moment to land before tearing the medium down.
    thread::sleep(Duration::from_millis(500));
    sender.command(0, 0);
    medium.shut_down();
    let _ = sink.join();
}

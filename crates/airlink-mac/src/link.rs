//! The datagram surface of the link layer and the state shared between
//! its worker threads.
//!
//! Construction spawns the receiver and the transmitter and wires three
//! bounded queues between them and the caller: the send queue (caller to
//! transmitter), the receive queue (receiver to caller) and the ack queue
//! (receiver to transmitter). Every error the layer can produce surfaces
//! through the status word; the calls themselves stay datagram-shaped.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use airlink_common::radio::Radio;
use airlink_common::{dev_info, dev_warn};
use crossbeam_channel::{Receiver as ChannelReceiver, Sender, bounded};

use crate::frame::{Frame, FrameType, MAX_PAYLOAD_LEN, SEQ_MODULUS, timestamp_to_bytes};
use crate::rx::Receiver;
use crate::tx::Transmitter;
use crate::{BROADCAST_ADDR, DefaultLinkTimings, LinkTimings};

/// A frame made it to the receive queue.
pub const STATUS_RX_OK: i32 = 1;
/// The last unicast send was acknowledged by its destination.
pub const STATUS_TX_DELIVERED: i32 = 4;
/// The last send was dropped: queue backpressure or retries exhausted.
pub const STATUS_TX_FAILED: i32 = 5;

/// Capacity of the send, receive and ack queues.
pub(crate) const QUEUE_CAPACITY: usize = 10;
/// Admission gate: sends are refused once this many frames are queued.
pub(crate) const SEND_GATE: usize = 4;
/// Admission gate: unicast receptions are shed once this many frames
/// wait for the caller. Broadcasts bypass the gate.
pub(crate) const RECV_GATE: usize = 4;

/// Send-path latency compensation added to beacon timestamps, matching
/// the receive-side subtraction.
const SENDER_FUDGE_FACTOR_MS: i64 = 2100;

/// State shared by the caller-facing surface and both workers.
pub(crate) struct Shared<R: Radio> {
    pub(crate) radio: R,
    pub(crate) mac: i16,
    status: AtomicI32,
    /// Added to the radio clock to form this node's clock view. Only the
    /// receiver advances it, and only forward.
    clock_offset: AtomicI64,
    /// Last sequence number emitted per destination, beacons included
    /// (under the broadcast pseudo-destination).
    seqs: Mutex<HashMap<i16, u16>>,
    /// The transmitter owns the radio's write side, except for the
    /// receiver's inline acks. This lock covers both writers.
    radio_write_lock: Mutex<()>,
    shutdown: AtomicBool,
    debug: AtomicBool,
    max_slot: AtomicBool,
    /// Beacon interval in milliseconds; negative disables beaconing.
    beacon_interval_ms: AtomicI64,
    last_beacon_ms: AtomicI64,
}

impl<R: Radio> Shared<R> {
    fn new(radio: R, mac: i16) -> Shared<R> {
        Shared {
            radio,
            mac,
            status: AtomicI32::new(0),
            clock_offset: AtomicI64::new(0),
            seqs: Mutex::new(HashMap::new()),
            radio_write_lock: Mutex::new(()),
            shutdown: AtomicBool::new(false),
            debug: AtomicBool::new(false),
            max_slot: AtomicBool::new(false),
            beacon_interval_ms: AtomicI64::new(-1),
            last_beacon_ms: AtomicI64::new(0),
        }
    }

    /// This node's clock view: the radio clock plus the beacon-derived
    /// offset.
    pub(crate) fn local_clock(&self) -> i64 {
        self.radio.clock() + self.clock_offset.load(Ordering::SeqCst)
    }

    pub(crate) fn advance_clock_offset(&self, delta_ms: i64) {
        debug_assert!(delta_ms > 0);
        self.clock_offset.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// Put a frame on the air. Serializes the two writers (transmitter
    /// FSM and the receiver's inline acks) over the shared radio.
    pub(crate) fn transmit(&self, frame: &[u8]) {
        let _write = self.radio_write_lock.lock().unwrap();
        if self.debug_mode() {
            dev_info!("[{}] tx {} bytes on air", self.mac, frame.len());
        }
        self.radio.transmit(frame);
    }

    /// Advance and return the sequence number for a destination. A
    /// destination never seen before starts at zero.
    pub(crate) fn next_seq(&self, dst: i16) -> u16 {
        let mut seqs = self.seqs.lock().unwrap();
        let next = match seqs.get(&dst) {
            Some(prev) => (prev + 1) % SEQ_MODULUS,
            None => 0,
        };
        seqs.insert(dst, next);
        next
    }

    pub(crate) fn set_status(&self, status: i32) {
        self.status.store(status, Ordering::SeqCst);
    }

    pub(crate) fn status(&self) -> i32 {
        self.status.load(Ordering::SeqCst)
    }

    pub(crate) fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn debug_mode(&self) -> bool {
        self.debug.load(Ordering::SeqCst)
    }

    pub(crate) fn max_slot_mode(&self) -> bool {
        self.max_slot.load(Ordering::SeqCst)
    }

    pub(crate) fn beacon_interval_ms(&self) -> i64 {
        self.beacon_interval_ms.load(Ordering::SeqCst)
    }

    pub(crate) fn is_time_to_beacon(&self) -> bool {
        let interval = self.beacon_interval_ms();
        interval > 0
            && self.local_clock() - self.last_beacon_ms.load(Ordering::SeqCst) >= interval
    }

    pub(crate) fn note_beacon_sent(&self) {
        self.last_beacon_ms.store(self.local_clock(), Ordering::SeqCst);
    }

    /// Build a beacon carrying our clock view, compensated for the
    /// send-path latency.
    pub(crate) fn create_beacon(&self) -> Vec<u8> {
        let stamp = timestamp_to_bytes(self.local_clock() + SENDER_FUDGE_FACTOR_MS);
        let seq = self.next_seq(BROADCAST_ADDR);
        Frame::encode(
            FrameType::Beacon,
            false,
            self.mac,
            BROADCAST_ADDR,
            &stamp,
            stamp.len(),
            seq,
        )
    }
}

/// Out-parameter for [`LinkLayer::recv`].
#[derive(Debug, Default, Clone)]
pub struct Transmission {
    pub buf: Vec<u8>,
    pub source_addr: i16,
    pub dest_addr: i16,
}

/// One node's attachment to the medium: owns the worker threads and the
/// queues, exposes the datagram surface.
pub struct LinkLayer<R: Radio + 'static, T: LinkTimings = DefaultLinkTimings> {
    shared: Arc<Shared<R>>,
    send_tx: Option<Sender<Vec<u8>>>,
    recv_rx: ChannelReceiver<Vec<u8>>,
    workers: Vec<JoinHandle<()>>,
    _timings: PhantomData<T>,
}

impl<R: Radio + 'static, T: LinkTimings + 'static> LinkLayer<R, T> {
    /// Attach to a radio as `mac` and start the receive and transmit
    /// workers.
    pub fn new(radio: R, mac: i16) -> LinkLayer<R, T> {
        let shared = Arc::new(Shared::new(radio, mac));
        let (send_tx, send_rx) = bounded(QUEUE_CAPACITY);
        let (recv_tx, recv_rx) = bounded(QUEUE_CAPACITY);
        let (ack_tx, ack_rx) = bounded(QUEUE_CAPACITY);

        let receiver: Receiver<R, T> = Receiver::new(Arc::clone(&shared), recv_tx, ack_tx);
        let mut transmitter: Transmitter<R, T> =
            Transmitter::new(Arc::clone(&shared), send_rx, ack_rx);

        let workers = vec![
            thread::spawn(move || receiver.run()),
            thread::spawn(move || transmitter.run()),
        ];

        LinkLayer {
            shared,
            send_tx: Some(send_tx),
            recv_rx,
            workers,
            _timings: PhantomData,
        }
    }

    pub fn mac_addr(&self) -> i16 {
        self.shared.mac
    }

    /// This node's synchronized clock view in milliseconds.
    pub fn local_clock(&self) -> i64 {
        self.shared.local_clock()
    }

    /// Queue a data frame for `dst`. Returns the number of payload bytes
    /// accepted, or 0 (with status `TX_FAILED`) when the send queue is
    /// backlogged.
    pub fn send(&self, dst: i16, data: &[u8], len: i32) -> i32 {
        let Some(send_tx) = self.send_tx.as_ref() else {
            self.shared.set_status(STATUS_TX_FAILED);
            return 0;
        };
        if send_tx.len() >= SEND_GATE {
            dev_warn!("[{}] send queue backlogged, refusing frame to {}", self.shared.mac, dst);
            self.shared.set_status(STATUS_TX_FAILED);
            return 0;
        }

        let len = (len.max(0) as usize).min(data.len()).min(MAX_PAYLOAD_LEN);
        let seq = self.shared.next_seq(dst);
        let bytes = Frame::encode(FrameType::Data, false, self.shared.mac, dst, data, len, seq);
        match send_tx.try_send(bytes) {
            Ok(()) => len as i32,
            Err(_) => {
                self.shared.set_status(STATUS_TX_FAILED);
                0
            }
        }
    }

    /// Block until a data frame for this node arrives and copy it into
    /// `t`. Returns the payload length, or -1 once the link is torn
    /// down.
    pub fn recv(&self, t: &mut Transmission) -> i32 {
        let bytes = match self.recv_rx.recv() {
            Ok(bytes) => bytes,
            Err(_) => return -1,
        };
        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(_) => return -1,
        };
        t.buf.clear();
        t.buf.extend_from_slice(&frame.payload);
        t.source_addr = frame.src;
        t.dest_addr = frame.dst;
        self.shared.set_status(STATUS_RX_OK);
        frame.payload.len() as i32
    }

    /// Current status word: 0 initially, then [`STATUS_RX_OK`],
    /// [`STATUS_TX_DELIVERED`] or [`STATUS_TX_FAILED`].
    pub fn status(&self) -> i32 {
        self.shared.status()
    }

    /// Runtime knobs.
    ///
    /// * `0`: log a settings summary.
    /// * `1`: `-1` enables per-frame debug chatter, `0` disables it.
    /// * `2`: `0` selects random slot draws, anything else pins the draw
    ///   to the full contention window.
    /// * `3`: `-1` disables beacons; a positive value enables them with
    ///   that interval in seconds and arms an immediate beacon when the
    ///   channel is idle; `0` is ignored.
    pub fn command(&self, cmd: i32, val: i32) -> i32 {
        match cmd {
            0 => {
                dev_info!(
                    "[{}] settings: debug={} max_slot={} beacon_interval_ms={}",
                    self.shared.mac,
                    self.shared.debug_mode(),
                    self.shared.max_slot_mode(),
                    self.shared.beacon_interval_ms(),
                );
                0
            }
            1 => {
                self.shared.debug.store(val == -1, Ordering::SeqCst);
                0
            }
            2 => {
                self.shared.max_slot.store(val != 0, Ordering::SeqCst);
                0
            }
            3 => {
                match val {
                    -1 => self.shared.beacon_interval_ms.store(-1, Ordering::SeqCst),
                    0 => dev_warn!("[{}] beacon interval of zero ignored", self.shared.mac),
                    secs if secs > 0 => {
                        let interval_ms = secs as i64 * 1000;
                        self.shared
                            .beacon_interval_ms
                            .store(interval_ms, Ordering::SeqCst);
                        // Arm an immediate beacon. Queueing it also wakes a
                        // transmitter that was parked on the send queue from
                        // before beacons were enabled.
                        if !self.shared.radio.in_use() {
                            if let Some(send_tx) = self.send_tx.as_ref() {
                                let _ = send_tx.try_send(self.shared.create_beacon());
                            }
                        }
                    }
                    other => dev_warn!("[{}] beacon interval {} ignored", self.shared.mac, other),
                }
                0
            }
            other => {
                dev_warn!("[{}] unknown command {}", self.shared.mac, other);
                -1
            }
        }
    }

    /// Stop both workers. The transmitter wakes through the
    /// disconnected send queue; the receiver exits once the radio
    /// reports closure.
    pub fn close(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.send_tx = None;
        self.workers.clear();
    }
}

impl<R: Radio + 'static, T: LinkTimings> Drop for LinkLayer<R, T> {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.send_tx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullRadio;

    impl Radio for NullRadio {
        fn receive(&self) -> Option<Vec<u8>> {
            None
        }

        fn transmit(&self, _frame: &[u8]) {}

        fn in_use(&self) -> bool {
            false
        }

        fn clock(&self) -> i64 {
            0
        }
    }

    #[test]
    fn sequence_numbers_count_up_per_destination() {
        let shared = Shared::new(NullRadio, 7);
        for expected in 0u16..5 {
            assert_eq!(shared.next_seq(23), expected);
        }
        // An unrelated destination starts over.
        assert_eq!(shared.next_seq(42), 0);
        assert_eq!(shared.next_seq(23), 5);
        // Beacons count under the broadcast pseudo-destination.
        assert_eq!(shared.next_seq(BROADCAST_ADDR), 0);
    }

    #[test]
    fn sequence_numbers_wrap_at_the_modulus() {
        let shared = Shared::new(NullRadio, 7);
        for _ in 0..SEQ_MODULUS {
            shared.next_seq(23);
        }
        // 4096 sends used 0..=4095; the next one wraps.
        assert_eq!(shared.next_seq(23), 0);
    }

    #[test]
    fn beacon_frames_carry_the_compensated_clock() {
        let shared = Shared::new(NullRadio, 7);
        let frame = Frame::decode(&shared.create_beacon()).unwrap();
        assert_eq!(frame.kind(), Some(FrameType::Beacon));
        assert_eq!(frame.dst, BROADCAST_ADDR);
        assert_eq!(frame.src, 7);
        assert_eq!(frame.seq, 0);
        let stamp: &[u8; 8] = frame.payload.as_slice().try_into().unwrap();
        assert_eq!(crate::bytes_to_timestamp(stamp), SENDER_FUDGE_FACTOR_MS);
    }

    #[test]
    fn beacon_interval_is_stored_in_milliseconds() {
        let link: LinkLayer<NullRadio> = LinkLayer::new(NullRadio, 7);
        assert_eq!(link.shared.beacon_interval_ms(), -1);
        link.command(3, 2);
        assert_eq!(link.shared.beacon_interval_ms(), 2000);
        link.command(3, 0);
        assert_eq!(link.shared.beacon_interval_ms(), 2000);
        link.command(3, -1);
        assert_eq!(link.shared.beacon_interval_ms(), -1);
    }

    #[test]
    fn clock_offset_only_moves_forward() {
        let shared = Shared::new(NullRadio, 7);
        assert_eq!(shared.local_clock(), 0);
        shared.advance_clock_offset(250);
        shared.advance_clock_offset(10);
        assert_eq!(shared.local_clock(), 260);
    }

    #[test]
    fn unknown_commands_are_rejected() {
        let link: LinkLayer<NullRadio> = LinkLayer::new(NullRadio, 7);
        assert_eq!(link.command(9, 1), -1);
        assert_eq!(link.command(2, 1), 0);
    }
}

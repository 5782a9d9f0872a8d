//! Transmit path: the CSMA/CA state machine.
//!
//! One worker thread walks an explicit five-state machine. Each state
//! handler performs its sleeps and channel checks, then returns the next
//! state; the driving loop only dispatches and watches the shutdown
//! flag. Acks for our own receptions never pass through here (the
//! receiver answers those inline); everything else that reaches the air
//! does.

use std::marker::PhantomData;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use airlink_common::radio::Radio;
use airlink_common::{dev_debug, dev_trace, dev_warn};
use crossbeam_channel::{Receiver as ChannelReceiver, RecvTimeoutError};
use rand::Rng;

use crate::frame::Frame;
use crate::link::{STATUS_TX_DELIVERED, STATUS_TX_FAILED, Shared};
use crate::LinkTimings;

/// Transmissions align to this wall-clock grain: a DIFS wait always
/// stretches to the next boundary first.
const BOUNDARY_MS: i64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    /// Idle; polling the send queue or generating a beacon.
    AwaitPacket,
    /// Channel was idle at pickup; wait DIFS and go if it stays idle.
    IdleDifsWait,
    /// Channel busy; wait out the activity, then DIFS, then slots.
    BusyDifsWait,
    /// Counting down backoff slots, pausing on channel activity.
    SlotWait,
    /// Unicast on the air; waiting for its ack.
    AwaitAck,
}

struct PendingTx {
    bytes: Vec<u8>,
    frame: Frame,
    broadcast: bool,
}

pub(crate) struct Transmitter<R: Radio, T: LinkTimings> {
    shared: Arc<Shared<R>>,
    send_rx: ChannelReceiver<Vec<u8>>,
    ack_rx: ChannelReceiver<Frame>,
    pending: Option<PendingTx>,
    cw: u16,
    /// Remaining backoff slots. Survives channel-busy aborts and, like
    /// the contention window, is only redrawn when `needs_slot_draw` is
    /// set.
    slots: u16,
    needs_slot_draw: bool,
    retries: u32,
    _timings: PhantomData<fn() -> T>,
}

impl<R: Radio, T: LinkTimings> Transmitter<R, T> {
    pub(crate) fn new(
        shared: Arc<Shared<R>>,
        send_rx: ChannelReceiver<Vec<u8>>,
        ack_rx: ChannelReceiver<Frame>,
    ) -> Transmitter<R, T> {
        Transmitter {
            shared,
            send_rx,
            ack_rx,
            pending: None,
            cw: T::CW_MIN,
            slots: 0,
            needs_slot_draw: true,
            retries: 0,
            _timings: PhantomData,
        }
    }

    pub(crate) fn run(&mut self) {
        let mut state = TxState::AwaitPacket;
        while !self.shared.shutting_down() {
            state = match state {
                TxState::AwaitPacket => match self.await_packet() {
                    Some(next) => next,
                    None => break,
                },
                TxState::IdleDifsWait => self.idle_difs_wait(),
                TxState::BusyDifsWait => self.busy_difs_wait(),
                TxState::SlotWait => self.slot_wait(),
                TxState::AwaitAck => self.await_ack(),
            };
        }
        dev_debug!("[{}] transmitter exiting", self.shared.mac);
    }

    /// Pick up the next frame: from the send queue, or a beacon when the
    /// schedule says so. Returns `None` once the surface is gone.
    fn await_packet(&mut self) -> Option<TxState> {
        let bytes = loop {
            let interval = self.shared.beacon_interval_ms();
            if interval > 0 {
                if self.shared.is_time_to_beacon() {
                    break self.shared.create_beacon();
                }
                match self
                    .send_rx
                    .recv_timeout(Duration::from_millis(interval as u64))
                {
                    Ok(bytes) => break bytes,
                    Err(RecvTimeoutError::Timeout) => break self.shared.create_beacon(),
                    Err(RecvTimeoutError::Disconnected) => return None,
                }
            } else {
                match self.send_rx.recv() {
                    Ok(bytes) => break bytes,
                    Err(_) => return None,
                }
            }
        };

        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                dev_warn!("[{}] discarding unparseable queued frame: {:?}", self.shared.mac, e);
                return Some(TxState::AwaitPacket);
            }
        };

        self.retries = 0;
        self.cw = T::CW_MIN;
        self.needs_slot_draw = true;
        let broadcast = frame.is_broadcast();
        dev_trace!(
            "[{}] picked up frame seq {} for {} ({} bytes)",
            self.shared.mac,
            frame.seq,
            frame.dst,
            bytes.len()
        );
        self.pending = Some(PendingTx {
            bytes,
            frame,
            broadcast,
        });

        Some(if self.shared.radio.in_use() {
            TxState::BusyDifsWait
        } else {
            TxState::IdleDifsWait
        })
    }

    fn idle_difs_wait(&mut self) -> TxState {
        if self.shared.radio.in_use() {
            return TxState::BusyDifsWait;
        }
        sleep_ms(aligned_difs_delay::<T>(self.shared.local_clock()));
        if self.shared.radio.in_use() {
            return TxState::BusyDifsWait;
        }
        self.transmit_pending();
        // The beacon schedule restarts on anything leaving this state,
        // not only beacons.
        self.shared.note_beacon_sent();
        self.after_transmit()
    }

    fn busy_difs_wait(&mut self) -> TxState {
        while self.shared.radio.in_use() {
            if self.shared.shutting_down() {
                return TxState::BusyDifsWait;
            }
            sleep_ms(T::DIFS_MS);
        }
        if self.needs_slot_draw {
            self.slots = self.draw_slots();
            self.needs_slot_draw = false;
            dev_trace!(
                "[{}] drew {} backoff slots (cw {})",
                self.shared.mac,
                self.slots,
                self.cw
            );
        }
        sleep_ms(T::DIFS_MS);
        if self.shared.radio.in_use() {
            TxState::BusyDifsWait
        } else {
            TxState::SlotWait
        }
    }

    fn slot_wait(&mut self) -> TxState {
        while self.slots > 0 {
            if self.shared.shutting_down() {
                return TxState::SlotWait;
            }
            let (sleep, full_slot) = slot_step::<T>(self.shared.local_clock());
            sleep_ms(sleep);
            if self.shared.radio.in_use() {
                // Keep the remaining count for the next attempt.
                return TxState::BusyDifsWait;
            }
            if full_slot {
                self.slots -= 1;
            }
        }
        if self.shared.radio.in_use() {
            return TxState::BusyDifsWait;
        }
        self.transmit_pending();
        self.after_transmit()
    }

    fn await_ack(&mut self) -> TxState {
        let timeout =
            T::SIFS_TIME_MS + T::ACK_TX_TIME_MS + self.slots as i64 * T::SLOT_TIME_MS;
        let deadline = Instant::now() + Duration::from_millis(timeout.max(0) as u64);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.ack_rx.recv_timeout(remaining) {
                Ok(ack) if ack.dst == self.shared.mac => {
                    dev_debug!(
                        "[{}] delivery confirmed by {} (seq {})",
                        self.shared.mac,
                        ack.src,
                        ack.seq
                    );
                    self.shared.set_status(STATUS_TX_DELIVERED);
                    self.pending = None;
                    return TxState::AwaitPacket;
                }
                Ok(stray) => dev_trace!(
                    "[{}] ignoring stray ack (seq {}, dst {})",
                    self.shared.mac,
                    stray.seq,
                    stray.dst
                ),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.ack_timed_out()
    }

    fn ack_timed_out(&mut self) -> TxState {
        if self.retries >= T::RETRY_LIMIT {
            dev_warn!(
                "[{}] retry limit reached, dropping frame for {}",
                self.shared.mac,
                self.pending.as_ref().map(|p| p.frame.dst).unwrap_or(0)
            );
            self.shared.set_status(STATUS_TX_FAILED);
            self.pending = None;
            return TxState::AwaitPacket;
        }

        self.cw = backoff_window::<T>(self.cw, self.retries);
        self.retries += 1;
        self.needs_slot_draw = true;
        if let Some(pending) = self.pending.as_mut() {
            if let Some(kind) = pending.frame.kind() {
                pending.frame.retry = true;
                pending.bytes = Frame::encode(
                    kind,
                    true,
                    pending.frame.src,
                    pending.frame.dst,
                    &pending.frame.payload,
                    pending.frame.payload.len(),
                    pending.frame.seq,
                );
            }
        }
        dev_debug!(
            "[{}] no ack, retry {} of {} with cw {}",
            self.shared.mac,
            self.retries,
            T::RETRY_LIMIT,
            self.cw
        );
        TxState::BusyDifsWait
    }

    fn draw_slots(&self) -> u16 {
        if self.shared.max_slot_mode() {
            self.cw
        } else {
            rand::rng().random_range(0..=self.cw)
        }
    }

    fn transmit_pending(&self) {
        if let Some(pending) = self.pending.as_ref() {
            self.shared.transmit(&pending.bytes);
        }
    }

    fn after_transmit(&mut self) -> TxState {
        if self.pending.as_ref().is_some_and(|p| p.broadcast) {
            self.pending = None;
            TxState::AwaitPacket
        } else {
            TxState::AwaitAck
        }
    }
}

fn sleep_ms(ms: i64) {
    if ms > 0 {
        thread::sleep(Duration::from_millis(ms as u64));
    }
}

/// The idle-channel DIFS wait: stretch to the next wall-clock boundary,
/// then a full DIFS.
fn aligned_difs_delay<T: LinkTimings>(now: i64) -> i64 {
    (BOUNDARY_MS - now.rem_euclid(BOUNDARY_MS)) + T::DIFS_MS
}

/// One slot-countdown step: sleep a full slot, or less when the next
/// wall-clock boundary comes first. Only a full slot counts against the
/// remaining slots; the boundary-exact case deliberately does not.
fn slot_step<T: LinkTimings>(now: i64) -> (i64, bool) {
    let to_boundary = BOUNDARY_MS - now.rem_euclid(BOUNDARY_MS);
    if to_boundary > T::SLOT_TIME_MS {
        (T::SLOT_TIME_MS, true)
    } else {
        (to_boundary, false)
    }
}

/// Contention window after an ack timeout: the first retry starts over
/// at the minimum, every later one doubles up to the cap.
fn backoff_window<T: LinkTimings>(cw: u16, completed_retries: u32) -> u16 {
    if completed_retries == 0 {
        T::CW_MIN
    } else {
        (cw * 2).min(T::CW_MAX)
    }
}

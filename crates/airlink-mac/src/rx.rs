//! Receive path: one blocking poll loop that classifies every frame on
//! the medium and feeds the right queue.
//!
//! The loop must never block on anything but the radio itself, so both
//! queue hand-offs use `try_send` and shed on overflow.

use std::marker::PhantomData;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use airlink_common::radio::Radio;
use airlink_common::{dev_debug, dev_info, dev_trace, dev_warn};
use crossbeam_channel::Sender;

use crate::frame::{Frame, FrameType, bytes_to_timestamp};
use crate::link::{RECV_GATE, Shared};
use crate::{BROADCAST_ADDR, LinkTimings};

/// Receive-path latency compensation subtracted from every beacon
/// timestamp before it is compared against the local clock.
const RECV_FUDGE_FACTOR_MS: i64 = 2500;

pub(crate) struct Receiver<R: Radio, T: LinkTimings> {
    shared: Arc<Shared<R>>,
    recv_tx: Sender<Vec<u8>>,
    ack_tx: Sender<Frame>,
    _timings: PhantomData<fn() -> T>,
}

impl<R: Radio, T: LinkTimings> Receiver<R, T> {
    pub(crate) fn new(
        shared: Arc<Shared<R>>,
        recv_tx: Sender<Vec<u8>>,
        ack_tx: Sender<Frame>,
    ) -> Receiver<R, T> {
        Receiver {
            shared,
            recv_tx,
            ack_tx,
            _timings: PhantomData,
        }
    }

    pub(crate) fn run(&self) {
        while !self.shared.shutting_down() {
            let Some(bytes) = self.shared.radio.receive() else {
                break;
            };
            let frame = match Frame::decode(&bytes) {
                Ok(frame) => frame,
                Err(e) => {
                    dev_warn!("[{}] dropping undecodable frame: {:?}", self.shared.mac, e);
                    continue;
                }
            };
            if !frame.crc_ok {
                dev_warn!(
                    "[{}] dropping frame with CRC mismatch (seq {}, src {})",
                    self.shared.mac,
                    frame.seq,
                    frame.src
                );
                continue;
            }
            self.dispatch(frame, bytes);
        }
        dev_debug!("[{}] receiver exiting", self.shared.mac);
    }

    fn dispatch(&self, frame: Frame, raw: Vec<u8>) {
        if self.shared.debug_mode() {
            dev_info!(
                "[{}] rx type bits {} seq {} from {} to {}",
                self.shared.mac,
                frame.kind_bits(),
                frame.seq,
                frame.src,
                frame.dst
            );
        }
        match (frame.kind(), frame.dst) {
            (Some(FrameType::Data), dst) if dst == self.shared.mac => {
                if self.recv_tx.len() < RECV_GATE {
                    let _ = self.recv_tx.try_send(raw);
                } else {
                    dev_debug!(
                        "[{}] receive queue backlogged, shedding unicast from {}",
                        self.shared.mac,
                        frame.src
                    );
                }
                self.emit_ack(&frame);
            }
            (Some(FrameType::Data), BROADCAST_ADDR) => {
                let _ = self.recv_tx.try_send(raw);
            }
            (Some(FrameType::Ack), dst) if dst == self.shared.mac => {
                let _ = self.ack_tx.try_send(frame);
            }
            (Some(FrameType::Beacon), BROADCAST_ADDR) => self.absorb_beacon(&frame),
            _ => dev_trace!(
                "[{}] ignoring frame (type bits {}, dst {})",
                self.shared.mac,
                frame.kind_bits(),
                frame.dst
            ),
        }
    }

    /// Answer a unicast data frame: wait out SIFS, then put the ack on
    /// the air directly, bypassing the transmitter's contention logic.
    fn emit_ack(&self, data: &Frame) {
        thread::sleep(Duration::from_millis(T::SIFS_TIME_MS.max(0) as u64));
        let ack = Frame::encode(
            FrameType::Ack,
            false,
            self.shared.mac,
            data.src,
            &[],
            0,
            data.seq,
        );
        self.shared.transmit(&ack);
        dev_trace!("[{}] acked seq {} to {}", self.shared.mac, data.seq, data.src);
    }

    fn absorb_beacon(&self, beacon: &Frame) {
        let Ok(stamp) = <&[u8; 8]>::try_from(beacon.payload.as_slice()) else {
            dev_warn!(
                "[{}] beacon from {} with {}-byte payload, expected 8",
                self.shared.mac,
                beacon.src,
                beacon.payload.len()
            );
            return;
        };
        let remote = bytes_to_timestamp(stamp) - RECV_FUDGE_FACTOR_MS;
        let local = self.shared.local_clock();
        if remote > local {
            self.shared.advance_clock_offset(remote - local);
            dev_debug!(
                "[{}] beacon from {} advanced the clock by {} ms",
                self.shared.mac,
                beacon.src,
                remote - local
            );
        }
    }
}

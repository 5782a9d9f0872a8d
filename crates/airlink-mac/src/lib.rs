/*! This crate implements a simplified 802.11-style link layer on top of a
 shared virtual radio medium. It provides a datagram send/receive surface
 with CSMA/CA medium access: a transmitter that defers to a busy channel
 with DIFS waits and randomized slot backoff, per-frame acknowledgements
 with retransmission under a binary-exponential contention window, and
 broadcast beacons that keep the peers' clock views loosely synchronized.

 ## Frame format

Each frame has the following format:

```text
     16 bits       16 bits      16 bits
+-------------+-------------+-------------+
|   Control   | Destination |   Source    |
+-------------+-------------+-------------+
|          Payload (0-2038 bytes)         |
+-----------------------------------------+
|                CRC-32                   |
+-----------------------------------------+
```

Where:
  - `Control`: big-endian word holding, from the most significant bit
    down: 3 bits of frame type (`0` data, `1` ack, `2` beacon, `4` cts,
    `5` rts), 1 retry bit (set on every retransmission of a data frame),
    and a 12-bit sequence number that wraps at 4096 and counts
    independently per (source, destination) pair.

  - `Destination`/`Source`: 16-bit MAC addresses, big-endian. The value
    `0xFFFF` (`-1` as a signed address) is the broadcast address.

  - `Payload`: opaque bytes for data frames, empty for acks, and exactly
    eight big-endian bytes of millisecond timestamp for beacons.

  - `CRC-32`: the IEEE polynomial over everything before the trailer,
    stored big-endian.

The cts/rts types are reserved by the codec and never produced here.
*/

pub mod frame;
pub mod link;
mod rx;
mod tx;

pub use frame::{Frame, FrameDecodeError, FrameType, bytes_to_timestamp, timestamp_to_bytes};
pub use link::{LinkLayer, Transmission};
pub use link::{STATUS_RX_OK, STATUS_TX_DELIVERED, STATUS_TX_FAILED};

/// MAC address frames are sent to when they are meant for everyone.
/// Encoded on the wire as `0xFFFF`.
pub const BROADCAST_ADDR: i16 = -1;

/// Medium-access timing parameters, fixed per deployment. The radio
/// simulator these values are calibrated against is slow, so everything
/// is expressed in whole milliseconds.
pub trait LinkTimings {
    /// Short inter-frame space: the gap between receiving a data frame
    /// and answering it with an ack.
    const SIFS_TIME_MS: i64;

    /// Length of one contention backoff slot.
    const SLOT_TIME_MS: i64;

    /// Smallest contention window (inclusive upper bound of the first
    /// slot draw).
    const CW_MIN: u16 = 3;

    /// Largest contention window the retry doubling can reach.
    const CW_MAX: u16 = 31;

    /// How many retransmissions a data frame gets before it is dropped.
    const RETRY_LIMIT: u32;

    /// Time allowance for the peer's ack to make it back on the air,
    /// calibrated against the radio simulator.
    const ACK_TX_TIME_MS: i64 = 1113;

    /// Distributed inter-frame space: the idle gap required before a
    /// contention attempt.
    const DIFS_MS: i64 = Self::SIFS_TIME_MS + 2 * Self::SLOT_TIME_MS;
}

/// Production timings for the stock virtual radio.
pub struct DefaultLinkTimings;

impl LinkTimings for DefaultLinkTimings {
    const SIFS_TIME_MS: i64 = 100;
    const SLOT_TIME_MS: i64 = 200;
    const RETRY_LIMIT: u32 = 5;
}

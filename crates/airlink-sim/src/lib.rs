//! An in-process radio medium for tests and demos.
//!
//! Every transceiver attached to a [`SimMedium`] hears every
//! transmission of the others, carrier sense reflects simulated airtime,
//! and each node can carry its own clock skew. Frame loss is injected
//! with predicates so the retry machinery can be exercised
//! deterministically.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use airlink_common::dev_trace;
use airlink_common::radio::Radio;

type DropPredicate = Box<dyn Fn(&[u8]) -> bool + Send>;

struct DropRule {
    matches: DropPredicate,
    remaining: u32,
}

struct NodeState {
    queue: VecDeque<Vec<u8>>,
    skew_ms: i64,
}

struct MediumState {
    nodes: Vec<NodeState>,
    busy_until_ms: i64,
    drops: Vec<DropRule>,
    shutdown: bool,
}

struct MediumInner {
    state: Mutex<MediumState>,
    arrivals: Condvar,
    epoch: Instant,
}

impl MediumInner {
    fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }
}

/// A shared broadcast medium. Attach one [`SimRadio`] per node.
#[derive(Clone)]
pub struct SimMedium {
    inner: Arc<MediumInner>,
}

impl SimMedium {
    pub fn new() -> SimMedium {
        SimMedium {
            inner: Arc::new(MediumInner {
                state: Mutex::new(MediumState {
                    nodes: Vec::new(),
                    busy_until_ms: 0,
                    drops: Vec::new(),
                    shutdown: false,
                }),
                arrivals: Condvar::new(),
                epoch: Instant::now(),
            }),
        }
    }

    pub fn attach(&self) -> SimRadio {
        self.attach_skewed(0)
    }

    /// Attach a transceiver whose clock runs `skew_ms` ahead of (or,
    /// negative, behind) the medium's.
    pub fn attach_skewed(&self, skew_ms: i64) -> SimRadio {
        let mut state = self.inner.state.lock().unwrap();
        state.nodes.push(NodeState {
            queue: VecDeque::new(),
            skew_ms,
        });
        SimRadio {
            medium: Arc::clone(&self.inner),
            id: state.nodes.len() - 1,
        }
    }

    /// Swallow the next `count` transmissions matched by `predicate`.
    /// Dropped frames reach no node at all; the medium still goes busy
    /// for their airtime.
    pub fn drop_matching(
        &self,
        count: u32,
        predicate: impl Fn(&[u8]) -> bool + Send + 'static,
    ) {
        let mut state = self.inner.state.lock().unwrap();
        state.drops.push(DropRule {
            matches: Box::new(predicate),
            remaining: count,
        });
    }

    /// Wake every blocked receiver with end-of-radio.
    pub fn shut_down(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.shutdown = true;
        self.inner.arrivals.notify_all();
    }
}

impl Default for SimMedium {
    fn default() -> Self {
        SimMedium::new()
    }
}

/// One node's transceiver on a [`SimMedium`].
#[derive(Clone)]
pub struct SimRadio {
    medium: Arc<MediumInner>,
    id: usize,
}

/// Simulated airtime of a frame. Small, so tests stay fast; still
/// length-dependent, so carrier sense has something to see.
fn airtime_ms(frame_len: usize) -> i64 {
    1 + (frame_len as i64) / 256
}

impl Radio for SimRadio {
    fn receive(&self) -> Option<Vec<u8>> {
        let mut state = self.medium.state.lock().unwrap();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(frame) = state.nodes[self.id].queue.pop_front() {
                return Some(frame);
            }
            state = self.medium.arrivals.wait(state).unwrap();
        }
    }

    fn transmit(&self, frame: &[u8]) {
        let mut state = self.medium.state.lock().unwrap();
        let now = self.medium.now_ms();
        state.busy_until_ms = now.max(state.busy_until_ms) + airtime_ms(frame.len());

        for rule in state.drops.iter_mut() {
            if rule.remaining > 0 && (rule.matches)(frame) {
                rule.remaining -= 1;
                dev_trace!("medium swallowed a {}-byte frame from node {}", frame.len(), self.id);
                return;
            }
        }

        for (id, node) in state.nodes.iter_mut().enumerate() {
            if id != self.id {
                node.queue.push_back(frame.to_vec());
            }
        }
        self.medium.arrivals.notify_all();
    }

    fn in_use(&self) -> bool {
        let state = self.medium.state.lock().unwrap();
        self.medium.now_ms() < state.busy_until_ms
    }

    fn clock(&self) -> i64 {
        let state = self.medium.state.lock().unwrap();
        self.medium.now_ms() + state.nodes[self.id].skew_ms
    }
}

//! Request id generation.
//!
//! Ids follow a snowflake layout: 39 bits of milliseconds since the Unix
//! epoch, 8 bits of node id, 16 bits of per-millisecond sequence. Ids from
//! one generator are strictly increasing; when the sequence overflows the
//! generator spins until the next millisecond.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

const MILLIS_BITS: u32 = 39;
const NODE_BITS: u32 = 8;
const SEQUENCE_BITS: u32 = 16;

const MILLIS_MASK: u64 = (1 << MILLIS_BITS) - 1;
const NODE_MASK: u64 = (1 << NODE_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// A source of unique request ids.
#[derive(Debug)]
pub struct ReqIdGenerator {
    node_id: u64,
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    last_millis: u64,
    sequence: u64,
}

impl ReqIdGenerator {
    /// A generator stamped with the low 8 bits of `node_id`.
    #[must_use]
    pub fn new(node_id: u8) -> Self {
        Self {
            node_id: u64::from(node_id) & NODE_MASK,
            state: Mutex::new(State {
                last_millis: 0,
                sequence: 0,
            }),
        }
    }

    /// The next id.
    pub fn next(&self) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut now = current_millis();
        if now < state.last_millis {
            // Clock went backwards; keep issuing against the last seen tick.
            now = state.last_millis;
        }
        if now == state.last_millis {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                while now <= state.last_millis {
                    now = current_millis();
                }
            }
        } else {
            state.sequence = 0;
        }
        state.last_millis = now;

        ((now & MILLIS_MASK) << (NODE_BITS + SEQUENCE_BITS))
            | (self.node_id << SEQUENCE_BITS)
            | state.sequence
    }
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique_and_increasing() {
        let generator = ReqIdGenerator::new(3);
        let mut seen = HashSet::new();
        let mut last = 0;
        for _ in 0..10_000 {
            let id = generator.next();
            assert!(id > last);
            assert!(seen.insert(id));
            last = id;
        }
    }

    #[test]
    fn node_id_is_embedded() {
        let generator = ReqIdGenerator::new(0xA5);
        let id = generator.next();
        assert_eq!((id >> SEQUENCE_BITS) & NODE_MASK, 0xA5);
    }
}

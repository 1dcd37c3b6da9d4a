// # Shared Invalidation Bus
//
// A fixed-size ring of catalog-cache invalidation messages broadcast to
// every worker. Publishing inserts at `max_msg_num`; each reader drains
// forward from its own cursor. When the ring fills, every reader's
// cursor is reset and the reader must discard its caches wholesale —
// overflow trades precision for bounded memory, it never blocks the
// writer indefinitely.
//
// The bus mutex doubles as the registry-walk lock for snapshot
// acquisition, which is what makes snapshot xmax reads race-free
// against transaction starts.

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::debug;

use crate::common::ItemPointer;

/// Capacity of the message ring.
pub const MAX_MESSAGES: usize = 4096;

/// Cursor values are renormalized once `min_msg_num` passes this bound;
/// it must be a multiple of the ring size.
pub const MSG_WRAPAROUND: i64 = (MAX_MESSAGES as i64) * 1_000_000;

/// One catalog invalidation: which cache, which hash bucket, which row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SharedInvalidMessage {
    pub cache_id: i32,
    pub hash_index: u32,
    pub tid: ItemPointer,
}

/// What a reader got back from the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalRead {
    /// Nothing pending.
    None,
    /// One message extracted; more may follow.
    Message(SharedInvalidMessage),
    /// Ring overflowed: discard relation-cache state.
    ResetRelCache,
    /// Full system-catalog-cache reset requested.
    ResetAllCaches,
}

#[derive(Debug, Clone, Copy)]
struct ReaderState {
    /// Next message number to read; negative while unregistered.
    next_msg_num: i64,
    /// Pending reset level: 0 none, 1 relcache, 2 full catalog cache.
    reset_state: u8,
    active: bool,
}

struct BusState {
    min_msg_num: i64,
    max_msg_num: i64,
    buffer: Vec<SharedInvalidMessage>,
    readers: Vec<ReaderState>,
}

impl BusState {
    fn set_all_invalid(&mut self, level: u8) {
        self.min_msg_num = 0;
        self.max_msg_num = 0;
        for reader in self.readers.iter_mut().filter(|r| r.active) {
            // A stronger pending reset is never downgraded.
            if reader.reset_state < level {
                reader.reset_state = level;
            }
            reader.next_msg_num = 0;
        }
    }

    /// Advance `min_msg_num` to the slowest reader and renormalize the
    /// counters if they have grown large.
    fn expire(&mut self) {
        let mut min = self.max_msg_num;
        if min == self.min_msg_num {
            return;
        }
        for reader in self.readers.iter().filter(|r| r.active) {
            if reader.next_msg_num >= 0 && reader.next_msg_num < min {
                min = reader.next_msg_num;
            }
        }
        self.min_msg_num = min;

        if min >= MSG_WRAPAROUND {
            self.min_msg_num -= MSG_WRAPAROUND;
            self.max_msg_num -= MSG_WRAPAROUND;
            for reader in self.readers.iter_mut().filter(|r| r.active) {
                if reader.next_msg_num >= 0 {
                    reader.next_msg_num -= MSG_WRAPAROUND;
                }
            }
        }
    }
}

/// Reader registration handle; index into the reader table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderId(usize);

/// Opaque guard holding the bus lock (used by snapshot acquisition).
pub struct BusGuard<'a>(#[allow(dead_code)] MutexGuard<'a, BusState>);

/// The shared invalidation bus.
pub struct SInvalBus {
    state: Mutex<BusState>,
    /// Broadcast on publish so idle listeners drain promptly.
    listeners: Condvar,
}

impl SInvalBus {
    pub fn new(max_readers: usize) -> Self {
        Self {
            state: Mutex::new(BusState {
                min_msg_num: 0,
                max_msg_num: 0,
                buffer: vec![SharedInvalidMessage::default(); MAX_MESSAGES],
                readers: vec![
                    ReaderState {
                        next_msg_num: -1,
                        reset_state: 0,
                        active: false,
                    };
                    max_readers
                ],
            }),
            listeners: Condvar::new(),
        }
    }

    /// Hold the bus lock across a registry walk. See module docs.
    pub fn guard(&self) -> BusGuard<'_> {
        BusGuard(self.state.lock())
    }

    /// Register a reader; it starts with all extant messages considered
    /// already read.
    pub fn register_reader(&self) -> Option<ReaderId> {
        let mut state = self.state.lock();
        let max = state.max_msg_num;
        for (index, reader) in state.readers.iter_mut().enumerate() {
            if !reader.active {
                reader.active = true;
                reader.next_msg_num = max;
                reader.reset_state = 0;
                return Some(ReaderId(index));
            }
        }
        None
    }

    pub fn unregister_reader(&self, id: ReaderId) {
        let mut state = self.state.lock();
        let reader = &mut state.readers[id.0];
        reader.active = false;
        reader.next_msg_num = -1;
        reader.reset_state = 0;
    }

    /// Publish one invalidation. Returns false if the ring overflowed
    /// and every reader was reset instead.
    pub fn publish(&self, msg: SharedInvalidMessage) -> bool {
        let mut state = self.state.lock();

        let mut num_msgs = state.max_msg_num - state.min_msg_num;
        if num_msgs >= MAX_MESSAGES as i64 {
            // The slowest reader may just not have expired yet; retry
            // after advancing min_msg_num.
            state.expire();
            num_msgs = state.max_msg_num - state.min_msg_num;
            if num_msgs >= MAX_MESSAGES as i64 {
                debug!("invalidation ring full, forcing relcache reset");
                state.set_all_invalid(1);
                self.listeners.notify_all();
                return false;
            }
        }

        let slot = (state.max_msg_num as usize) % MAX_MESSAGES;
        state.buffer[slot] = msg;
        state.max_msg_num += 1;
        self.listeners.notify_all();
        true
    }

    /// Request a full system-catalog-cache reset on every reader.
    pub fn reset_all(&self) {
        let mut state = self.state.lock();
        state.set_all_invalid(2);
        self.listeners.notify_all();
    }

    /// Fetch the next message for `id`, if any.
    pub fn consume(&self, id: ReaderId) -> InvalRead {
        let mut state = self.state.lock();
        let reader = state.readers[id.0];
        debug_assert!(reader.active);

        if reader.reset_state == 1 {
            let max = state.max_msg_num;
            let r = &mut state.readers[id.0];
            r.reset_state = 0;
            // The reset covers everything added since, as well.
            r.next_msg_num = max;
            return InvalRead::ResetRelCache;
        }
        if reader.reset_state == 2 {
            let max = state.max_msg_num;
            let r = &mut state.readers[id.0];
            r.reset_state = 0;
            r.next_msg_num = max;
            return InvalRead::ResetAllCaches;
        }
        if reader.next_msg_num >= state.max_msg_num {
            return InvalRead::None;
        }

        let slot = (reader.next_msg_num as usize) % MAX_MESSAGES;
        let msg = state.buffer[slot];
        state.readers[id.0].next_msg_num += 1;
        InvalRead::Message(msg)
    }

    /// Drain everything pending for `id`, invoking `apply` per message.
    /// Returns the strongest reset seen, if any.
    pub fn consume_all(
        &self,
        id: ReaderId,
        mut apply: impl FnMut(SharedInvalidMessage),
    ) -> Option<InvalRead> {
        let mut strongest = None;
        loop {
            match self.consume(id) {
                InvalRead::None => return strongest,
                InvalRead::Message(msg) => apply(msg),
                reset @ InvalRead::ResetRelCache => {
                    if strongest.is_none() {
                        strongest = Some(reset);
                    }
                }
                reset @ InvalRead::ResetAllCaches => strongest = Some(reset),
            }
        }
    }

    /// Writer-side garbage collection: drop messages every active
    /// reader has consumed.
    pub fn expire_consumed(&self) {
        self.state.lock().expire();
    }

    /// Number of messages currently buffered.
    pub fn pending(&self) -> usize {
        let state = self.state.lock();
        (state.max_msg_num - state.min_msg_num) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(cache_id: i32) -> SharedInvalidMessage {
        SharedInvalidMessage {
            cache_id,
            hash_index: cache_id as u32,
            tid: ItemPointer::new(1, 1),
        }
    }

    #[test]
    fn test_publish_consume_in_order() {
        let bus = SInvalBus::new(2);
        let reader = bus.register_reader().unwrap();

        bus.publish(msg(1));
        bus.publish(msg(2));

        assert_eq!(bus.consume(reader), InvalRead::Message(msg(1)));
        assert_eq!(bus.consume(reader), InvalRead::Message(msg(2)));
        assert_eq!(bus.consume(reader), InvalRead::None);
    }

    #[test]
    fn test_late_reader_skips_history() {
        let bus = SInvalBus::new(2);
        bus.publish(msg(1));
        let reader = bus.register_reader().unwrap();
        assert_eq!(bus.consume(reader), InvalRead::None);
    }

    #[test]
    fn test_overflow_resets_readers() {
        let bus = SInvalBus::new(2);
        let reader = bus.register_reader().unwrap();

        for i in 0..MAX_MESSAGES {
            assert!(bus.publish(msg(i as i32)));
        }
        // Ring is full and the reader has consumed nothing.
        assert!(!bus.publish(msg(-1)));

        assert_eq!(bus.consume(reader), InvalRead::ResetRelCache);
        assert_eq!(bus.consume(reader), InvalRead::None);
    }

    #[test]
    fn test_expire_unblocks_writer() {
        let bus = SInvalBus::new(2);
        let reader = bus.register_reader().unwrap();

        for i in 0..MAX_MESSAGES {
            bus.publish(msg(i as i32));
        }
        // Reader consumes everything, then the writer-side GC frees the
        // ring: the next publish succeeds without a reset.
        while bus.consume(reader) != InvalRead::None {}
        bus.expire_consumed();
        assert!(bus.publish(msg(7)));
        assert_eq!(bus.consume(reader), InvalRead::Message(msg(7)));
    }

    #[test]
    fn test_full_catalog_reset_wins() {
        let bus = SInvalBus::new(2);
        let reader = bus.register_reader().unwrap();
        bus.publish(msg(1));
        bus.reset_all();
        assert_eq!(bus.consume(reader), InvalRead::ResetAllCaches);
        assert_eq!(bus.consume(reader), InvalRead::None);
    }

    #[test]
    fn test_consume_all_applies_in_order() {
        let bus = SInvalBus::new(2);
        let reader = bus.register_reader().unwrap();
        for i in 0..5 {
            bus.publish(msg(i));
        }
        let mut seen = Vec::new();
        let reset = bus.consume_all(reader, |m| seen.push(m.cache_id));
        assert!(reset.is_none());
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }
}

use std::sync::atomic::{AtomicU32, Ordering};

/// Hands out message ids for reliable sends. Ids start at a random value so that a restarted
///  engine is unlikely to reuse ids its peers still remember; 0 is reserved and skipped.
pub struct MessageIdAllocator {
    next: AtomicU32,
}

impl MessageIdAllocator {
    pub fn new() -> MessageIdAllocator {
        Self::starting_at(rand::random())
    }

    pub fn starting_at(first: u32) -> MessageIdAllocator {
        MessageIdAllocator {
            next: AtomicU32::new(first),
        }
    }

    pub fn next_id(&self) -> u32 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

impl Default for MessageIdAllocator {
    fn default() -> Self {
        MessageIdAllocator::new()
    }
}

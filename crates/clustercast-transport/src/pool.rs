//! Process-wide free list of reusable packet buffers.
//!
//! Allocation falls back to constructing a fresh packet when the pool is
//! empty; recycling pushes buffers back for reuse. The critical section is
//! a plain mutex held only for the push/pop.

use std::sync::Mutex;

use crate::packet::Packet;

/// Free list of [`Packet`] buffers shared by all pipes of one multiplexer.
pub(crate) struct PacketPool {
    free: Mutex<Vec<Packet>>,
}

impl PacketPool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Pops a recycled packet, or constructs a new one if the pool is empty.
    pub fn allocate(&self) -> Packet {
        let recycled = self.free.lock().unwrap().pop();
        recycled.unwrap_or_else(Packet::new)
    }

    /// Returns one packet to the free list.
    pub fn recycle(&self, mut packet: Packet) {
        packet.reset();
        self.free.lock().unwrap().push(packet);
    }

    /// Returns a batch of packets to the free list in one critical section.
    pub fn recycle_all<I: IntoIterator<Item = Packet>>(&self, packets: I) {
        let mut free = self.free.lock().unwrap();
        for mut packet in packets {
            packet.reset();
            free.push(packet);
        }
    }

    /// Number of packets currently available for reuse.
    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_from_empty_pool() {
        let pool = PacketPool::new();
        assert_eq!(pool.available(), 0);
        let packet = pool.allocate();
        assert_eq!(packet.payload_len(), 0);
    }

    #[test]
    fn recycle_and_reuse() {
        let pool = PacketPool::new();
        let mut packet = pool.allocate();
        packet.set_payload(&[1, 2, 3]).unwrap();
        pool.recycle(packet);
        assert_eq!(pool.available(), 1);

        // The recycled buffer comes back with its payload cleared.
        let packet = pool.allocate();
        assert_eq!(packet.payload_len(), 0);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn recycle_all_batches() {
        let pool = PacketPool::new();
        let packets: Vec<Packet> = (0..5).map(|_| pool.allocate()).collect();
        pool.recycle_all(packets);
        assert_eq!(pool.available(), 5);
    }
}

//! Per-pipe state machines and the pipe table.
//!
//! One [`PipeState`] tracks a single logical byte stream: on the master the
//! retransmission window and per-slave acknowledgment offsets, on a slave
//! the delivery queue and loss-report gate, and on both the barrier/gather
//! rendezvous counters. All transitions that have no socket side effect live
//! here as plain methods so they can be exercised without a cluster.
//!
//! Locking: the table mutex is held only across insert/lookup/remove; each
//! pipe carries its own mutex plus one condition variable for receive
//! progress and one for barrier progress. The table mutex is never acquired
//! while a pipe mutex is held.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use serde::Serialize;

use crate::packet::{Packet, PacketQueue};
use crate::protocol::GatherOp;

/// Relation of an incoming data packet to the slave's stream position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DataDisposition {
    /// The packet continues the stream exactly.
    InOrder,
    /// The packet starts past the stream position: at least one loss.
    Gap,
    /// The packet precedes the stream position: retransmission duplicate.
    Duplicate,
}

/// Observable counters of one pipe, for diagnostics and tests.
#[derive(Debug, Clone, Serialize)]
pub struct PipeStats {
    /// Packets currently queued (master: unacknowledged window; slave:
    /// delivered but not yet consumed).
    pub queued_packets: usize,
    /// Next stream byte offset to assign (master) or deliver (slave).
    pub stream_pos: u32,
    /// Stream position of the window head (master only; zero on slaves).
    pub head_stream_pos: u32,
    /// Id of the last locally completed barrier.
    pub barrier_id: u32,
}

/// Mutable state of one pipe. Guarded by the owning [`Pipe`]'s mutex.
pub(crate) struct PipeState {
    /// Next byte offset to assign (master) or deliver (slave).
    pub stream_pos: u32,
    /// Master: retransmission window. Slave: delivery queue.
    pub packet_list: PacketQueue,
    /// Slave: suppresses repeated loss reports until the gap closes.
    pub packet_loss_mode: bool,
    /// Master: stream position of the window head.
    pub head_stream_pos: u32,
    /// Master: each slave's last reported position minus the head; zero
    /// means "has not acknowledged past the head".
    pub slave_stream_pos_offsets: Vec<u32>,
    /// Master: number of slaves whose offset is zero.
    pub num_head_slaves: u32,
    /// Id of the last locally completed barrier (0 = pipe not yet created).
    pub barrier_id: u32,
    /// Master: latest barrier id seen from each slave.
    pub slave_barrier_ids: Vec<u32>,
    /// Master: minimum over `slave_barrier_ids`.
    pub min_slave_barrier_id: u32,
    /// Master: most recent gather contribution from each slave.
    pub slave_gather_values: Vec<u32>,
    /// The folded gather result (computed on the master, received on
    /// slaves).
    pub master_gather_value: u32,
    /// Slave: highest completion id announced by the master; the wake
    /// predicate for barrier/gather/creation waits.
    pub completion_id: u32,
}

impl PipeState {
    /// Creates pipe state; the per-slave vectors are sized only on the
    /// master, which is the sole consumer of acknowledgments.
    pub fn new(num_slaves: usize, is_master: bool) -> Self {
        let per_slave = if is_master { num_slaves } else { 0 };
        Self {
            stream_pos: 0,
            packet_list: PacketQueue::new(),
            packet_loss_mode: false,
            head_stream_pos: 0,
            slave_stream_pos_offsets: vec![0; per_slave],
            num_head_slaves: per_slave as u32,
            barrier_id: 0,
            slave_barrier_ids: vec![0; per_slave],
            min_slave_barrier_id: 0,
            slave_gather_values: vec![0; per_slave],
            master_gather_value: 0,
            completion_id: 0,
        }
    }

    /// Classifies an incoming data packet against the delivery position.
    pub fn classify_data(&self, packet_stream_pos: u32) -> DataDisposition {
        if packet_stream_pos == self.stream_pos {
            DataDisposition::InOrder
        } else if self.stream_pos < packet_stream_pos {
            DataDisposition::Gap
        } else {
            DataDisposition::Duplicate
        }
    }

    /// Folds an acknowledged stream position into the window bookkeeping.
    ///
    /// Returns `Some(released)` when the last pending head acknowledgment
    /// arrived and a window advance was computed; the released packets must
    /// be returned to the pool and any sender blocked on a full window must
    /// be woken. Returns `None` when the acknowledgment only updated one
    /// slave's offset.
    pub fn process_acknowledgment(
        &mut self,
        slave_index: usize,
        ack_stream_pos: u32,
    ) -> Option<Vec<Packet>> {
        let offset = ack_stream_pos.wrapping_sub(self.head_stream_pos);
        if offset == 0 {
            return None;
        }
        if self.slave_stream_pos_offsets[slave_index] != 0 {
            self.slave_stream_pos_offsets[slave_index] = offset;
            return None;
        }
        self.slave_stream_pos_offsets[slave_index] = offset;
        self.num_head_slaves -= 1;
        if self.num_head_slaves != 0 {
            return None;
        }

        // Every slave has moved past the head: detach the prefix that the
        // slowest slave has covered.
        let mut min_offset = *self
            .slave_stream_pos_offsets
            .iter()
            .min()
            .expect("master pipe has at least one slave");
        let mut released = Vec::new();
        let mut discarded: u32 = 0;
        while let Some(front) = self.packet_list.front() {
            let size = front.payload_len() as u32;
            if min_offset < size {
                break;
            }
            min_offset -= size;
            discarded = discarded.wrapping_add(size);
            released.push(
                self.packet_list
                    .pop_front()
                    .expect("front() just observed a packet"),
            );
        }

        self.head_stream_pos = self.head_stream_pos.wrapping_add(discarded);
        self.num_head_slaves = 0;
        for offset in &mut self.slave_stream_pos_offsets {
            *offset = offset.wrapping_sub(discarded);
            if *offset == 0 {
                self.num_head_slaves += 1;
            }
        }
        Some(released)
    }

    /// Records a barrier (or gather) rendezvous message from one slave and
    /// recomputes the minimum barrier id across the cluster.
    pub fn record_barrier(
        &mut self,
        slave_index: usize,
        barrier_id: u32,
        gather_value: Option<u32>,
    ) -> u32 {
        self.slave_barrier_ids[slave_index] = barrier_id;
        if let Some(value) = gather_value {
            self.slave_gather_values[slave_index] = value;
        }
        self.min_slave_barrier_id = *self
            .slave_barrier_ids
            .iter()
            .min()
            .expect("master pipe has at least one slave");
        self.min_slave_barrier_id
    }

    /// Folds the configured operator over the master's value and every
    /// slave contribution.
    pub fn fold_gather(&self, value: u32, op: GatherOp) -> u32 {
        self.slave_gather_values
            .iter()
            .fold(value, |acc, &v| op.fold(acc, v))
    }

    /// Empties the retransmission window and resets flow control, making
    /// the current stream position the new head. Performed under a
    /// completed barrier, after which pre-barrier data is never resent.
    pub fn flush_send_window(&mut self) -> Vec<Packet> {
        let released = self.packet_list.take_all();
        self.head_stream_pos = self.stream_pos;
        for offset in &mut self.slave_stream_pos_offsets {
            *offset = 0;
        }
        self.num_head_slaves = self.slave_stream_pos_offsets.len() as u32;
        released
    }

    pub fn stats(&self) -> PipeStats {
        PipeStats {
            queued_packets: self.packet_list.len(),
            stream_pos: self.stream_pos,
            head_stream_pos: self.head_stream_pos,
            barrier_id: self.barrier_id,
        }
    }
}

/// One pipe: state plus the two condition variables associated with its
/// mutex.
pub(crate) struct Pipe {
    pub state: Mutex<PipeState>,
    /// Signaled on delivery-queue progress (slave) and window advance
    /// (master).
    pub receive_cond: Condvar,
    /// Signaled on barrier/gather rendezvous progress.
    pub barrier_cond: Condvar,
}

impl Pipe {
    pub fn new(num_slaves: usize, is_master: bool) -> Self {
        Self {
            state: Mutex::new(PipeState::new(num_slaves, is_master)),
            receive_cond: Condvar::new(),
            barrier_cond: Condvar::new(),
        }
    }
}

/// Registry of open pipes, keyed by pipe id.
#[derive(Default)]
pub(crate) struct PipeTable {
    pipes: Mutex<HashMap<u32, Arc<Pipe>>>,
}

impl PipeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a pipe, cloning its handle out from under the table lock so
    /// the pipe mutex is only ever acquired after the table lock is gone.
    pub fn get(&self, pipe_id: u32) -> Option<Arc<Pipe>> {
        self.pipes.lock().unwrap().get(&pipe_id).cloned()
    }

    pub fn insert(&self, pipe_id: u32, pipe: Arc<Pipe>) {
        self.pipes.lock().unwrap().insert(pipe_id, pipe);
    }

    pub fn remove(&self, pipe_id: u32) -> Option<Arc<Pipe>> {
        self.pipes.lock().unwrap().remove(&pipe_id)
    }

    /// Snapshot of every open pipe, used for teardown and fatal wakeups.
    pub fn all(&self) -> Vec<Arc<Pipe>> {
        self.pipes.lock().unwrap().values().cloned().collect()
    }
}

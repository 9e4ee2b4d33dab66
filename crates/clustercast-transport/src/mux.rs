//! The multiplexer: an arbitrary number of reliable, ordered byte streams
//! ("pipes") shared over one unreliable datagram socket.
//!
//! One master node (index 0) and N slave nodes share the cluster socket.
//! The master sends data packets to the whole slave group; slaves answer
//! with unicast control messages. Reliability is negative-acknowledgment
//! driven: slaves detect gaps in the per-pipe stream position and request
//! retransmission from the master's send window, which doubles as the flow
//! control bound. Barriers and gathers are rendezvous operations
//! coordinated by the master's receiver thread on the same socket.
//!
//! Each node runs exactly one background receiver thread; any number of
//! caller threads may use the public API concurrently. Lock order is pipe
//! table, then pipe state, then packet pool.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use crate::config::{ClusterTopology, MuxConfig};
use crate::error::{Result, TransportError};
use crate::fault::{DropFn, FaultInjector};
use crate::metrics::{MetricsSnapshot, MuxMetrics};
use crate::packet::Packet;
use crate::pipe::{DataDisposition, Pipe, PipeStats, PipeTable};
use crate::pool::PacketPool;
use crate::protocol::{
    is_data_datagram, GatherOp, MasterMessage, MasterMessageId, SlaveMessage, SlaveMessageId,
    DATAGRAM_CAPACITY, SLAVE_MESSAGE_SIZE,
};
use crate::udp::Wire;

/// Poll slice used by the receiver loops where no protocol timeout applies.
const IDLE_RECV_SLICE: Duration = Duration::from_secs(1);

/// Reliable ordered multi-stream broadcast transport over one UDP socket.
///
/// Dropping the multiplexer stops and joins the receiver thread. Callers
/// should close their pipes first; collective operations still in flight
/// during drop are outside the contract.
pub struct Multiplexer {
    shared: Arc<Shared>,
    receiver: Option<JoinHandle<()>>,
}

struct Shared {
    topology: ClusterTopology,
    params: RwLock<MuxConfig>,
    wire: Wire,
    pipes: PipeTable,
    pool: PacketPool,
    next_pipe_id: AtomicU32,
    connected: Mutex<bool>,
    connected_cond: std::sync::Condvar,
    fatal: Mutex<Option<String>>,
    stop: AtomicBool,
    metrics: MuxMetrics,
    faults: FaultInjector,
}

impl Multiplexer {
    /// Creates the node's multiplexer: binds the cluster socket and starts
    /// the receiver thread, which immediately begins the connection
    /// handshake.
    pub fn new(topology: ClusterTopology, config: MuxConfig) -> Result<Self> {
        if topology.num_slaves == 0 {
            return Err(TransportError::InvalidTopology {
                reason: "cluster needs at least one slave".into(),
            });
        }
        if topology.node_index > topology.num_slaves {
            return Err(TransportError::InvalidTopology {
                reason: format!(
                    "node index {} outside 0..={}",
                    topology.node_index, topology.num_slaves
                ),
            });
        }

        let wire = Wire::open(&topology)?;
        let is_master = topology.is_master();
        let node = topology.node_index;
        let shared = Arc::new(Shared {
            topology,
            params: RwLock::new(config.clamped()),
            wire,
            pipes: PipeTable::new(),
            pool: PacketPool::new(),
            next_pipe_id: AtomicU32::new(1),
            connected: Mutex::new(false),
            connected_cond: std::sync::Condvar::new(),
            fatal: Mutex::new(None),
            stop: AtomicBool::new(false),
            metrics: MuxMetrics::new(),
            faults: FaultInjector::new(),
        });

        let worker = Arc::clone(&shared);
        let receiver = std::thread::Builder::new()
            .name(format!("clustercast-recv-{node}"))
            .spawn(move || {
                if is_master {
                    worker.master_loop();
                } else {
                    worker.slave_loop();
                }
            })?;

        Ok(Self {
            shared,
            receiver: Some(receiver),
        })
    }

    /// Blocks until the connection handshake has completed on this node.
    pub fn wait_for_connection(&self) -> Result<()> {
        let mut connected = self.shared.connected.lock().unwrap();
        while !*connected {
            self.shared.check_fatal()?;
            connected = self.shared.connected_cond.wait(connected).unwrap();
        }
        Ok(())
    }

    /// Opens a new pipe and synchronizes its creation across the cluster.
    ///
    /// Pipe ids are not negotiated on the wire: every node assigns its own
    /// next id, so all nodes must call `open_pipe` in the same order for
    /// the ids to agree. The call returns once every node has created the
    /// pipe.
    pub fn open_pipe(&self) -> Result<u32> {
        self.shared.check_fatal()?;
        let shared = &self.shared;
        let pipe_id = shared.next_pipe_id.fetch_add(1, Ordering::Relaxed);
        let pipe = Arc::new(Pipe::new(
            shared.topology.num_slaves as usize,
            shared.topology.is_master(),
        ));
        shared.pipes.insert(pipe_id, Arc::clone(&pipe));
        debug!(pipe_id, "opening pipe");

        let mut st = pipe.state.lock().unwrap();
        if shared.topology.is_master() {
            while st.min_slave_barrier_id == 0 {
                shared.check_fatal()?;
                st = pipe.barrier_cond.wait(st).unwrap();
            }
            let mut msg = MasterMessage::new(MasterMessageId::CreatePipe);
            msg.pipe_id = pipe_id;
            let burst = shared.params().master_message_burst_size;
            for _ in 0..burst {
                shared.send_datagram(&msg.encode());
            }
        } else {
            while st.completion_id < 1 {
                shared.check_fatal()?;
                let params = shared.params();
                let msg = SlaveMessage::new(
                    shared.topology.node_index,
                    SlaveMessageId::CreatePipe,
                    pipe_id,
                );
                for _ in 0..params.slave_message_burst_size {
                    shared.send_datagram(&msg.encode());
                }
                let (guard, _) = pipe
                    .barrier_cond
                    .wait_timeout(st, params.barrier_wait_timeout)
                    .unwrap();
                st = guard;
            }
        }
        st.barrier_id = 1;
        Ok(pipe_id)
    }

    /// Closes a pipe after a final barrier, guaranteeing no in-flight
    /// retransmissions outlive it. Queued packets return to the pool.
    pub fn close_pipe(&self, pipe_id: u32) -> Result<()> {
        self.barrier(pipe_id)?;

        let pipe = self
            .shared
            .pipes
            .remove(pipe_id)
            .ok_or(TransportError::UnknownPipe(pipe_id))?;
        let released = pipe.state.lock().unwrap().packet_list.take_all();
        self.shared.pool.recycle_all(released);

        let snapshot = self.shared.metrics.snapshot();
        debug!(
            pipe_id,
            resent_packets = snapshot.resent_packets,
            resent_bytes = snapshot.resent_bytes,
            "closed pipe"
        );
        Ok(())
    }

    /// Takes a packet buffer from the pool (or allocates a fresh one).
    pub fn allocate_packet(&self) -> Packet {
        self.shared.pool.allocate()
    }

    /// Appends the packet to the pipe's stream and transmits it to the
    /// slave group. Blocks while the send window is full.
    ///
    /// Only the master writes to pipes.
    pub fn send_packet(&self, pipe_id: u32, mut packet: Packet) -> Result<()> {
        if !self.shared.topology.is_master() {
            return Err(TransportError::WrongRole {
                node: self.shared.topology.node_index,
                operation: "send_packet",
            });
        }
        self.shared.check_fatal()?;
        let pipe = self.shared.pipe(pipe_id)?;

        let mut st = pipe.state.lock().unwrap();
        while st.packet_list.len() >= self.shared.params().send_buffer_size {
            self.shared.check_fatal()?;
            st = pipe.receive_cond.wait(st).unwrap();
        }

        packet.set_pipe_id(pipe_id);
        packet.set_stream_pos(st.stream_pos);
        st.stream_pos = st.stream_pos.wrapping_add(packet.payload_len() as u32);

        // Copy the wire bytes out before the window takes ownership: the
        // receiver thread may acknowledge and recycle the packet the moment
        // the lock is released.
        let mut wire_buf = [0u8; DATAGRAM_CAPACITY];
        let len = packet.datagram().len();
        wire_buf[..len].copy_from_slice(packet.datagram());
        st.packet_list.push_back(packet);
        drop(st);

        self.shared.send_datagram(&wire_buf[..len]);
        Ok(())
    }

    /// Removes and returns the next in-order packet of the pipe's stream.
    /// Blocks until one is available, prodding the master with a loss probe
    /// whenever a wait slice elapses without progress.
    ///
    /// Only slaves read from pipes.
    pub fn receive_packet(&self, pipe_id: u32) -> Result<Packet> {
        if self.shared.topology.is_master() {
            return Err(TransportError::WrongRole {
                node: self.shared.topology.node_index,
                operation: "receive_packet",
            });
        }
        self.shared.check_fatal()?;
        let pipe = self.shared.pipe(pipe_id)?;

        let mut st = pipe.state.lock().unwrap();
        while st.packet_list.is_empty() {
            self.shared.check_fatal()?;
            let params = self.shared.params();
            let (guard, wait) = pipe
                .receive_cond
                .wait_timeout(st, params.receive_wait_timeout)
                .unwrap();
            st = guard;
            if wait.timed_out() && st.packet_list.is_empty() {
                // The loss report for the missing data may itself have been
                // lost; prod the master with a probe that acknowledges the
                // current position.
                let mut msg = SlaveMessage::new(
                    self.shared.topology.node_index,
                    SlaveMessageId::PacketLoss,
                    pipe_id,
                );
                msg.stream_pos = st.stream_pos;
                msg.packet_pos = st.stream_pos;
                self.shared.metrics.inc_loss_reports();
                for _ in 0..params.slave_message_burst_size {
                    self.shared.send_datagram(&msg.encode());
                }
            }
        }
        Ok(st
            .packet_list
            .pop_front()
            .expect("loop exits only with a queued packet"))
    }

    /// Runs a collective barrier on the pipe. On return every node has
    /// entered the barrier; on the master the send window has been flushed,
    /// so pre-barrier data is never retransmitted again.
    pub fn barrier(&self, pipe_id: u32) -> Result<()> {
        self.collective(pipe_id, None).map(|_| ())
    }

    /// Runs a collective reduction: folds `op` over the master's value and
    /// every slave's contribution, returning the same result on all nodes.
    pub fn gather(&self, pipe_id: u32, value: u32, op: GatherOp) -> Result<u32> {
        self.collective(pipe_id, Some((value, op)))
    }

    /// Port the cluster socket is bound to.
    pub fn local_port(&self) -> Result<u16> {
        Ok(self.shared.wire.local_port()?)
    }

    /// Index of this node (0 = master).
    pub fn node_index(&self) -> u32 {
        self.shared.topology.node_index
    }

    /// Number of slave nodes in the cluster.
    pub fn num_slaves(&self) -> u32 {
        self.shared.topology.num_slaves
    }

    /// Current metrics counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Observable counters of one pipe.
    pub fn pipe_stats(&self, pipe_id: u32) -> Result<PipeStats> {
        let pipe = self.shared.pipe(pipe_id)?;
        let st = pipe.state.lock().unwrap();
        Ok(st.stats())
    }

    /// Adjusts how long a slave waits between handshake bursts.
    pub fn set_connection_wait_timeout(&self, timeout: Duration) {
        self.shared.params.write().unwrap().connection_wait_timeout = timeout;
    }

    /// Adjusts the silence period and the number of ping rounds before the
    /// connection is declared dead. At least two rounds are kept.
    pub fn set_ping_timeout(&self, timeout: Duration, max_requests: u32) {
        let mut params = self.shared.params.write().unwrap();
        params.ping_timeout = timeout;
        params.max_ping_requests = max_requests.max(2);
    }

    /// Adjusts the receive wait slice between loss probes.
    pub fn set_receive_wait_timeout(&self, timeout: Duration) {
        self.shared.params.write().unwrap().receive_wait_timeout = timeout;
    }

    /// Adjusts the wait slice between barrier rendezvous bursts.
    pub fn set_barrier_wait_timeout(&self, timeout: Duration) {
        self.shared.params.write().unwrap().barrier_wait_timeout = timeout;
    }

    /// Adjusts the master send window, in packets.
    pub fn set_send_buffer_size(&self, packets: usize) {
        self.shared.params.write().unwrap().send_buffer_size = packets;
    }

    /// Adjusts how many times control messages are repeated on the wire.
    pub fn set_message_burst_sizes(&self, master: u32, slave: u32) {
        let mut params = self.shared.params.write().unwrap();
        params.master_message_burst_size = master;
        params.slave_message_burst_size = slave;
    }

    /// Installs (or clears) a hook that drops incoming datagrams when it
    /// returns true. Test support for loss injection.
    pub fn inject_recv_fault(&self, hook: Option<DropFn>) {
        self.shared.faults.set_recv_drop(hook);
    }

    /// Installs (or clears) a hook that drops outgoing datagrams when it
    /// returns true. Test support for loss injection.
    pub fn inject_send_fault(&self, hook: Option<DropFn>) {
        self.shared.faults.set_send_drop(hook);
    }

    /// Barrier and gather share one rendezvous; gather additionally carries
    /// values and folds them on the master.
    fn collective(&self, pipe_id: u32, contribution: Option<(u32, GatherOp)>) -> Result<u32> {
        self.shared.check_fatal()?;
        let shared = &self.shared;
        let pipe = shared.pipe(pipe_id)?;
        let node = shared.topology.node_index;

        let mut st = pipe.state.lock().unwrap();
        let next = st.barrier_id + 1;

        if shared.topology.is_master() {
            while st.min_slave_barrier_id < next {
                shared.check_fatal()?;
                st = pipe.barrier_cond.wait(st).unwrap();
            }

            if let Some((value, op)) = contribution {
                st.master_gather_value = st.fold_gather(value, op);
            }

            // The barrier is a checkpoint: every slave has the stream up to
            // here, so the retransmission window can be dropped wholesale.
            let released = st.flush_send_window();
            shared.pool.recycle_all(released);
            pipe.receive_cond.notify_all();

            let mut msg = MasterMessage::new(if contribution.is_some() {
                MasterMessageId::Gather
            } else {
                MasterMessageId::Barrier
            });
            msg.pipe_id = pipe_id;
            msg.barrier_id = next;
            msg.master_value = st.master_gather_value;
            shared.send_datagram(&msg.encode());
        } else {
            while st.completion_id < next {
                shared.check_fatal()?;
                let params = shared.params();
                let mut msg = SlaveMessage::new(
                    node,
                    if contribution.is_some() {
                        SlaveMessageId::Gather
                    } else {
                        SlaveMessageId::Barrier
                    },
                    pipe_id,
                );
                msg.barrier_id = next;
                if let Some((value, _)) = contribution {
                    msg.slave_value = value;
                }
                for _ in 0..params.slave_message_burst_size {
                    shared.send_datagram(&msg.encode());
                }
                let (guard, _) = pipe
                    .barrier_cond
                    .wait_timeout(st, params.barrier_wait_timeout)
                    .unwrap();
                st = guard;
            }
        }

        st.barrier_id = next;
        Ok(st.master_gather_value)
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.receiver.take() {
            let _ = handle.join();
        }
        for pipe in self.shared.pipes.all() {
            let released = pipe.state.lock().unwrap().packet_list.take_all();
            self.shared.pool.recycle_all(released);
        }
    }
}

impl Shared {
    fn params(&self) -> MuxConfig {
        self.params.read().unwrap().clone()
    }

    fn pipe(&self, pipe_id: u32) -> Result<Arc<Pipe>> {
        self.pipes
            .get(pipe_id)
            .ok_or(TransportError::UnknownPipe(pipe_id))
    }

    fn check_fatal(&self) -> Result<()> {
        match self.fatal.lock().unwrap().as_ref() {
            Some(reason) => Err(TransportError::ReceiverTerminated {
                node: self.topology.node_index,
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Latches a fatal receiver condition and wakes every waiter so blocked
    /// public calls observe it.
    fn fail(&self, reason: String) {
        error!(node = self.topology.node_index, %reason, "receiver terminating");
        {
            let mut fatal = self.fatal.lock().unwrap();
            if fatal.is_none() {
                *fatal = Some(reason);
            }
        }
        self.connected_cond.notify_all();
        for pipe in self.pipes.all() {
            pipe.receive_cond.notify_all();
            pipe.barrier_cond.notify_all();
        }
    }

    fn send_datagram(&self, datagram: &[u8]) {
        if self.faults.drop_outgoing(datagram) {
            trace!(len = datagram.len(), "outgoing datagram dropped by fault hook");
            return;
        }
        if let Err(e) = self.wire.send(datagram) {
            // Transient transmit failures look like loss to the peers and
            // are repaired by the retransmission machinery.
            warn!(error = %e, len = datagram.len(), "datagram transmit failed");
        }
    }

    // ---- master side -------------------------------------------------

    fn master_loop(&self) {
        if !self.master_handshake() {
            return;
        }

        let mut buf = [0u8; SLAVE_MESSAGE_SIZE];
        while !self.stop.load(Ordering::Relaxed) {
            let Some(len) = self
                .wire
                .recv_deadline(&mut buf, IDLE_RECV_SLICE, &self.stop)
            else {
                continue;
            };
            if self.faults.drop_incoming(&buf[..len]) {
                continue;
            }
            if len != SLAVE_MESSAGE_SIZE {
                if len > 0 {
                    trace!(len, "ignoring malformed datagram on master socket");
                }
                continue;
            }
            let msg = match SlaveMessage::decode(&buf[..len]) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(error = %e, "undecodable slave message");
                    continue;
                }
            };
            if let Err(reason) = self.handle_slave_message(msg) {
                self.fail(reason);
                return;
            }
        }
    }

    /// Collects one CONNECTION from every slave, then announces completion.
    /// Returns false if shut down mid-handshake.
    fn master_handshake(&self) -> bool {
        let num_slaves = self.topology.num_slaves as usize;
        let mut seen = vec![false; num_slaves];
        let mut remaining = num_slaves;
        let mut buf = [0u8; SLAVE_MESSAGE_SIZE];

        while remaining > 0 {
            if self.stop.load(Ordering::Relaxed) {
                return false;
            }
            let Some(len) = self
                .wire
                .recv_deadline(&mut buf, IDLE_RECV_SLICE, &self.stop)
            else {
                continue;
            };
            if self.faults.drop_incoming(&buf[..len]) || len != SLAVE_MESSAGE_SIZE {
                continue;
            }
            let Ok(msg) = SlaveMessage::decode(&buf[..len]) else {
                continue;
            };
            if msg.id == SlaveMessageId::Connection {
                let index = msg.node_index as usize;
                if (1..=num_slaves).contains(&index) && !seen[index - 1] {
                    seen[index - 1] = true;
                    remaining -= 1;
                    debug!(slave = msg.node_index, remaining, "slave connected");
                }
            }
        }

        let burst = self.params().master_message_burst_size;
        let msg = MasterMessage::new(MasterMessageId::Connection);
        for _ in 0..burst {
            self.send_datagram(&msg.encode());
        }

        *self.connected.lock().unwrap() = true;
        self.connected_cond.notify_all();
        debug!("cluster connection established");
        true
    }

    /// Dispatches one slave control message. An error return is fatal and
    /// carries the reason.
    fn handle_slave_message(&self, msg: SlaveMessage) -> std::result::Result<(), String> {
        let num_slaves = self.topology.num_slaves as usize;
        let slave_index = match (msg.node_index as usize).checked_sub(1) {
            Some(index) if index < num_slaves => index,
            _ => {
                warn!(node_index = msg.node_index, "message from unknown slave index");
                return Ok(());
            }
        };

        match msg.id {
            SlaveMessageId::Connection => {
                // A slave missed the completion announcement; repeat it once.
                let reply = MasterMessage::new(MasterMessageId::Connection);
                self.send_datagram(&reply.encode());
            }

            SlaveMessageId::Ping => {
                self.metrics.inc_pings();
                let reply = MasterMessage::new(MasterMessageId::Ping);
                self.send_datagram(&reply.encode());
            }

            SlaveMessageId::CreatePipe => {
                if let Some(pipe) = self.pipes.get(msg.pipe_id) {
                    let mut st = pipe.state.lock().unwrap();
                    if st.barrier_id >= 1 {
                        // The slave missed the creation completion.
                        let mut reply = MasterMessage::new(MasterMessageId::CreatePipe);
                        reply.pipe_id = msg.pipe_id;
                        self.send_datagram(&reply.encode());
                    } else {
                        let min = st.record_barrier(slave_index, 1, None);
                        if min > 0 {
                            pipe.barrier_cond.notify_all();
                        }
                    }
                }
            }

            SlaveMessageId::Acknowledgment => {
                self.metrics.inc_acknowledgments();
                if let Some(pipe) = self.pipes.get(msg.pipe_id) {
                    let mut st = pipe.state.lock().unwrap();
                    if let Some(released) = st.process_acknowledgment(slave_index, msg.stream_pos)
                    {
                        self.pool.recycle_all(released);
                        pipe.receive_cond.notify_all();
                    }
                }
            }

            SlaveMessageId::PacketLoss => {
                self.metrics.inc_loss_reports();
                if let Some(pipe) = self.pipes.get(msg.pipe_id) {
                    let mut st = pipe.state.lock().unwrap();
                    // The reported position is also a positive
                    // acknowledgment of everything before it.
                    if let Some(released) = st.process_acknowledgment(slave_index, msg.stream_pos)
                    {
                        self.pool.recycle_all(released);
                        pipe.receive_cond.notify_all();
                    }

                    // Nothing to resend when the slave is merely waiting for
                    // data that was never sent.
                    if msg.stream_pos < st.stream_pos {
                        let Some(start) = st
                            .packet_list
                            .iter()
                            .position(|p| p.stream_pos() == msg.stream_pos)
                        else {
                            return Err(format!(
                                "fatal packet loss on pipe {}: stream position {} no longer in \
                                 the send window (head {})",
                                msg.pipe_id, msg.stream_pos, st.head_stream_pos
                            ));
                        };
                        let mut packets = 0u64;
                        let mut bytes = 0u64;
                        for packet in st.packet_list.iter().skip(start) {
                            self.send_datagram(packet.datagram());
                            packets += 1;
                            bytes += packet.payload_len() as u64;
                        }
                        self.metrics.add_resent(packets, bytes);
                        warn!(
                            pipe_id = msg.pipe_id,
                            slave = msg.node_index,
                            from = msg.stream_pos,
                            packets,
                            "retransmitted send window tail"
                        );
                    }
                }
            }

            SlaveMessageId::Barrier => {
                if let Some(pipe) = self.pipes.get(msg.pipe_id) {
                    let mut st = pipe.state.lock().unwrap();
                    if msg.barrier_id <= st.barrier_id {
                        // The slave missed this barrier's completion.
                        let mut reply = MasterMessage::new(MasterMessageId::Barrier);
                        reply.pipe_id = msg.pipe_id;
                        reply.barrier_id = msg.barrier_id;
                        self.send_datagram(&reply.encode());
                    } else {
                        let min = st.record_barrier(slave_index, msg.barrier_id, None);
                        if min > st.barrier_id {
                            pipe.barrier_cond.notify_all();
                        }
                    }
                }
            }

            SlaveMessageId::Gather => {
                if let Some(pipe) = self.pipes.get(msg.pipe_id) {
                    let mut st = pipe.state.lock().unwrap();
                    if msg.barrier_id <= st.barrier_id {
                        // The slave missed the completion; repeat it with
                        // the folded value.
                        let mut reply = MasterMessage::new(MasterMessageId::Gather);
                        reply.pipe_id = msg.pipe_id;
                        reply.barrier_id = msg.barrier_id;
                        reply.master_value = st.master_gather_value;
                        self.send_datagram(&reply.encode());
                    } else {
                        let min =
                            st.record_barrier(slave_index, msg.barrier_id, Some(msg.slave_value));
                        if min > st.barrier_id {
                            pipe.barrier_cond.notify_all();
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // ---- slave side --------------------------------------------------

    fn slave_loop(&self) {
        let node = self.topology.node_index;
        let mut scratch = self.pool.allocate();
        // Stagger acknowledgment emission across the cluster: each slave
        // acks every Nth in-order packet, starting at a different offset.
        let mut send_ack_in = node - 1;

        // Announce ourselves until the master (or anything) answers.
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return;
            }
            let params = self.params();
            let msg = SlaveMessage::new(node, SlaveMessageId::Connection, 0);
            for _ in 0..params.slave_message_burst_size {
                self.send_datagram(&msg.encode());
            }
            if let Some(len) = self.wire.recv_deadline(
                scratch.recv_buf(),
                params.connection_wait_timeout,
                &self.stop,
            ) {
                self.handle_master_datagram(&mut scratch, len, &mut send_ack_in);
                break;
            }
        }

        // Steady state: consume datagrams, pinging through silence.
        while !self.stop.load(Ordering::Relaxed) {
            let params = self.params();
            let mut received = None;
            for _ in 0..params.max_ping_requests {
                if let Some(len) =
                    self.wire
                        .recv_deadline(scratch.recv_buf(), params.ping_timeout, &self.stop)
                {
                    received = Some(len);
                    break;
                }
                if self.stop.load(Ordering::Relaxed) {
                    return;
                }
                let ping = SlaveMessage::new(node, SlaveMessageId::Ping, 0);
                self.metrics.inc_pings();
                for _ in 0..params.slave_message_burst_size {
                    self.send_datagram(&ping.encode());
                }
            }
            let Some(len) = received else {
                if self.stop.load(Ordering::Relaxed) {
                    return;
                }
                self.fail(format!(
                    "no datagram for {} ping rounds of {:?}",
                    params.max_ping_requests, params.ping_timeout
                ));
                return;
            };
            self.handle_master_datagram(&mut scratch, len, &mut send_ack_in);
        }
    }

    /// Classifies and dispatches one datagram received into the scratch
    /// packet.
    fn handle_master_datagram(&self, scratch: &mut Packet, len: usize, send_ack_in: &mut u32) {
        if len == 0 {
            return;
        }
        if self.faults.drop_incoming(scratch.raw(len)) {
            trace!(len, "incoming datagram dropped by fault hook");
            return;
        }
        if is_data_datagram(scratch.raw(len)) {
            scratch.set_datagram_len(len);
            self.handle_data_packet(scratch, send_ack_in);
        } else {
            match MasterMessage::decode(scratch.raw(len)) {
                Ok(msg) => self.handle_master_message(msg),
                Err(e) => warn!(error = %e, len, "undecodable master message"),
            }
        }
    }

    fn handle_data_packet(&self, scratch: &mut Packet, send_ack_in: &mut u32) {
        let node = self.topology.node_index;
        let pipe_id = scratch.pipe_id();
        let packet_pos = scratch.stream_pos();
        let Some(pipe) = self.pipes.get(pipe_id) else {
            trace!(pipe_id, "data packet for unknown pipe");
            return;
        };

        let mut st = pipe.state.lock().unwrap();
        match st.classify_data(packet_pos) {
            DataDisposition::Gap => {
                if !st.packet_loss_mode {
                    warn!(
                        pipe_id,
                        expected = st.stream_pos,
                        received = packet_pos,
                        "gap in pipe stream, requesting retransmission"
                    );
                    let mut msg = SlaveMessage::new(node, SlaveMessageId::PacketLoss, pipe_id);
                    msg.stream_pos = st.stream_pos;
                    msg.packet_pos = packet_pos;
                    self.metrics.inc_loss_reports();
                    let burst = self.params().slave_message_burst_size;
                    for _ in 0..burst {
                        self.send_datagram(&msg.encode());
                    }
                    // One report per gap; further out-of-order packets stay
                    // silent until the missing data arrives.
                    st.packet_loss_mode = true;
                }
            }

            DataDisposition::Duplicate => {
                trace!(pipe_id, stream_pos = packet_pos, "retransmission duplicate");
            }

            DataDisposition::InOrder => {
                st.packet_loss_mode = false;

                let was_empty = st.packet_list.is_empty();
                st.stream_pos = st.stream_pos.wrapping_add(scratch.payload_len() as u32);

                // Hand the filled packet to the delivery queue and continue
                // receiving into a fresh one.
                let delivered = std::mem::replace(scratch, self.pool.allocate());
                st.packet_list.push_back(delivered);
                if was_empty {
                    pipe.receive_cond.notify_one();
                }

                *send_ack_in += 1;
                if *send_ack_in >= self.topology.num_slaves {
                    let mut msg =
                        SlaveMessage::new(node, SlaveMessageId::Acknowledgment, pipe_id);
                    msg.stream_pos = st.stream_pos;
                    msg.packet_pos = packet_pos;
                    self.metrics.inc_acknowledgments();
                    self.send_datagram(&msg.encode());
                    *send_ack_in = 0;
                }
            }
        }
    }

    fn handle_master_message(&self, msg: MasterMessage) {
        match msg.id {
            MasterMessageId::Connection => {
                let mut connected = self.connected.lock().unwrap();
                if !*connected {
                    *connected = true;
                    self.connected_cond.notify_all();
                    debug!(node = self.topology.node_index, "connected to master");
                }
            }

            MasterMessageId::Ping => {
                // The reply's arrival already reset the silence clock.
            }

            MasterMessageId::CreatePipe => {
                if let Some(pipe) = self.pipes.get(msg.pipe_id) {
                    let mut st = pipe.state.lock().unwrap();
                    if st.barrier_id == 0 && st.completion_id < 1 {
                        st.completion_id = 1;
                        pipe.barrier_cond.notify_all();
                    }
                }
            }

            MasterMessageId::Barrier => {
                if let Some(pipe) = self.pipes.get(msg.pipe_id) {
                    let mut st = pipe.state.lock().unwrap();
                    if msg.barrier_id > st.barrier_id {
                        st.completion_id = msg.barrier_id;
                        pipe.barrier_cond.notify_all();
                    }
                }
            }

            MasterMessageId::Gather => {
                if let Some(pipe) = self.pipes.get(msg.pipe_id) {
                    let mut st = pipe.state.lock().unwrap();
                    if msg.barrier_id > st.barrier_id {
                        st.master_gather_value = msg.master_value;
                        st.completion_id = msg.barrier_id;
                        pipe.barrier_cond.notify_all();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair_topology(node_index: u32, master_port: u16, slave_port: u16) -> ClusterTopology {
        ClusterTopology {
            num_slaves: 1,
            node_index,
            master_host: "127.0.0.1".into(),
            master_port,
            slave_group: "127.0.0.1".into(),
            slave_port,
        }
    }

    #[test]
    fn rejects_invalid_topology() {
        let mut topology = pair_topology(0, 47201, 47202);
        topology.num_slaves = 0;
        assert!(matches!(
            Multiplexer::new(topology, MuxConfig::default()),
            Err(TransportError::InvalidTopology { .. })
        ));

        let mut topology = pair_topology(0, 47201, 47202);
        topology.node_index = 5;
        assert!(matches!(
            Multiplexer::new(topology, MuxConfig::default()),
            Err(TransportError::InvalidTopology { .. })
        ));
    }

    #[test]
    fn role_misuse_is_rejected() {
        let master = Multiplexer::new(pair_topology(0, 47203, 47204), MuxConfig::default()).unwrap();
        let slave = Multiplexer::new(pair_topology(1, 47203, 47204), MuxConfig::default()).unwrap();

        assert!(matches!(
            master.receive_packet(1),
            Err(TransportError::WrongRole { .. })
        ));
        let packet = slave.allocate_packet();
        assert!(matches!(
            slave.send_packet(1, packet),
            Err(TransportError::WrongRole { .. })
        ));
    }

    #[test]
    fn unknown_pipe_is_rejected() {
        let master = Multiplexer::new(pair_topology(0, 47205, 47206), MuxConfig::default()).unwrap();
        let slave = Multiplexer::new(pair_topology(1, 47205, 47206), MuxConfig::default()).unwrap();
        master.wait_for_connection().unwrap();
        slave.wait_for_connection().unwrap();

        assert!(matches!(
            master.pipe_stats(99),
            Err(TransportError::UnknownPipe(99))
        ));
        assert!(matches!(
            master.barrier(99),
            Err(TransportError::UnknownPipe(99))
        ));
        let packet = master.allocate_packet();
        assert!(matches!(
            master.send_packet(99, packet),
            Err(TransportError::UnknownPipe(99))
        ));
    }

    #[test]
    fn local_port_matches_role() {
        let master = Multiplexer::new(pair_topology(0, 47207, 47208), MuxConfig::default()).unwrap();
        assert_eq!(master.local_port().unwrap(), 47207);
        let slave = Multiplexer::new(pair_topology(1, 47207, 47208), MuxConfig::default()).unwrap();
        assert_eq!(slave.local_port().unwrap(), 47208);
    }

    #[test]
    fn handshake_completes_on_loopback_pair() {
        let slave = Multiplexer::new(pair_topology(1, 47209, 47210), MuxConfig::default()).unwrap();
        // Master brought up after the slave already started announcing.
        let master = Multiplexer::new(pair_topology(0, 47209, 47210), MuxConfig::default()).unwrap();

        master.wait_for_connection().unwrap();
        slave.wait_for_connection().unwrap();
    }
}

//! Loopback cluster harness: one master and N slaves in the same process.
//!
//! Every launched cluster gets its own port pair (and its own multicast
//! group when it has more than one slave) so tests can run concurrently
//! under `cargo test`. Clusters with a single slave use plain unicast to
//! 127.0.0.1, which keeps the smallest tests independent of loopback
//! multicast support.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use clustercast_transport::{ClusterTopology, GatherOp, Multiplexer, MuxConfig};

static INIT_TRACING: Once = Once::new();

/// Installs the env-filtered tracing subscriber once per test binary.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

static NEXT_PORT: AtomicU16 = AtomicU16::new(52000);
static NEXT_GROUP: AtomicU16 = AtomicU16::new(1);

fn alloc_ports() -> (u16, u16) {
    let base = NEXT_PORT.fetch_add(2, Ordering::Relaxed);
    (base, base + 1)
}

fn alloc_group() -> String {
    let n = NEXT_GROUP.fetch_add(1, Ordering::Relaxed);
    format!("239.255.81.{}", (n % 250) + 1)
}

/// Runs `f` on a fresh thread and fails the test if it does not finish
/// within `timeout`. Converts protocol hangs into diagnosable panics.
pub fn run_within<F>(label: &str, timeout: Duration, f: F)
where
    F: FnOnce() + Send + 'static,
{
    let (tx, rx) = std::sync::mpsc::channel();
    let label_owned = label.to_string();
    std::thread::Builder::new()
        .name(format!("scenario-{label_owned}"))
        .spawn(move || {
            f();
            let _ = tx.send(());
        })
        .expect("spawn scenario thread");
    if rx.recv_timeout(timeout).is_err() {
        panic!("scenario '{label}' did not complete within {timeout:?}");
    }
}

/// Sends one payload on the pipe from the master.
pub fn send_payload(master: &Multiplexer, pipe_id: u32, payload: &[u8]) {
    let mut packet = master.allocate_packet();
    packet.set_payload(payload).expect("payload fits");
    master.send_packet(pipe_id, packet).expect("send_packet");
}

/// Receives the next packet on the pipe from a slave, as owned bytes.
pub fn recv_payload(slave: &Multiplexer, pipe_id: u32) -> Vec<u8> {
    slave
        .receive_packet(pipe_id)
        .expect("receive_packet")
        .payload()
        .to_vec()
}

/// An in-process cluster: one master plus N slaves on loopback.
pub struct TestCluster {
    /// The coordinator node.
    pub master: Arc<Multiplexer>,
    /// The worker nodes, index 0 holding node index 1.
    pub slaves: Vec<Arc<Multiplexer>>,
}

impl TestCluster {
    /// Launches a cluster with default tunables.
    pub fn launch(num_slaves: u32) -> Self {
        Self::launch_with_config(num_slaves, MuxConfig::default())
    }

    /// Launches a cluster, bringing the slaves up first and the master
    /// last, which exercises the handshake's announce-and-retry path.
    pub fn launch_with_config(num_slaves: u32, config: MuxConfig) -> Self {
        init_tracing();
        let (master_port, slave_port) = alloc_ports();
        let group = if num_slaves == 1 {
            "127.0.0.1".to_string()
        } else {
            alloc_group()
        };

        let topology = |node_index: u32| ClusterTopology {
            num_slaves,
            node_index,
            master_host: "127.0.0.1".into(),
            master_port,
            slave_group: group.clone(),
            slave_port,
        };

        let slaves: Vec<Arc<Multiplexer>> = (1..=num_slaves)
            .map(|i| {
                Arc::new(Multiplexer::new(topology(i), config.clone()).expect("launch slave"))
            })
            .collect();
        let master =
            Arc::new(Multiplexer::new(topology(0), config.clone()).expect("launch master"));

        tracing::debug!(num_slaves, master_port, slave_port, %group, "test cluster launched");
        Self { master, slaves }
    }

    /// Every node in the cluster, master first.
    pub fn nodes(&self) -> Vec<Arc<Multiplexer>> {
        let mut nodes = vec![Arc::clone(&self.master)];
        nodes.extend(self.slaves.iter().cloned());
        nodes
    }

    /// Blocks until every node reports the handshake complete.
    pub fn wait_connected(&self) {
        for node in self.nodes() {
            node.wait_for_connection().expect("wait_for_connection");
        }
    }

    /// Opens the next pipe on every node concurrently and checks that all
    /// nodes assigned the same id.
    pub fn open_pipe(&self) -> u32 {
        let handles: Vec<_> = self
            .slaves
            .iter()
            .map(|slave| {
                let slave = Arc::clone(slave);
                std::thread::spawn(move || slave.open_pipe().expect("slave open_pipe"))
            })
            .collect();
        let pipe_id = self.master.open_pipe().expect("master open_pipe");
        for handle in handles {
            assert_eq!(handle.join().expect("join open_pipe"), pipe_id);
        }
        pipe_id
    }

    /// Runs a barrier on every node concurrently.
    pub fn barrier(&self, pipe_id: u32) {
        let handles: Vec<_> = self
            .slaves
            .iter()
            .map(|slave| {
                let slave = Arc::clone(slave);
                std::thread::spawn(move || slave.barrier(pipe_id).expect("slave barrier"))
            })
            .collect();
        self.master.barrier(pipe_id).expect("master barrier");
        for handle in handles {
            handle.join().expect("join barrier");
        }
    }

    /// Runs a gather on every node concurrently and returns each node's
    /// result, master first.
    pub fn gather(
        &self,
        pipe_id: u32,
        master_value: u32,
        slave_values: &[u32],
        op: GatherOp,
    ) -> Vec<u32> {
        assert_eq!(slave_values.len(), self.slaves.len());
        let handles: Vec<_> = self
            .slaves
            .iter()
            .zip(slave_values)
            .map(|(slave, &value)| {
                let slave = Arc::clone(slave);
                std::thread::spawn(move || slave.gather(pipe_id, value, op).expect("slave gather"))
            })
            .collect();
        let mut results = vec![self
            .master
            .gather(pipe_id, master_value, op)
            .expect("master gather")];
        for handle in handles {
            results.push(handle.join().expect("join gather"));
        }
        results
    }

    /// Closes the pipe on every node concurrently.
    pub fn close_pipe(&self, pipe_id: u32) {
        let handles: Vec<_> = self
            .slaves
            .iter()
            .map(|slave| {
                let slave = Arc::clone(slave);
                std::thread::spawn(move || slave.close_pipe(pipe_id).expect("slave close_pipe"))
            })
            .collect();
        self.master.close_pipe(pipe_id).expect("master close_pipe");
        for handle in handles {
            handle.join().expect("join close_pipe");
        }
    }
}

//! Property tests over live loopback clusters: ordered lossless delivery
//! for arbitrary payload sequences, and gather agreement for arbitrary
//! operand vectors under every operator.
//!
//! Each case launches a real cluster, so the case counts are kept small.

use std::sync::Arc;
use std::time::Duration;

use clustercast_transport::GatherOp;
use proptest::prelude::*;

use crate::harness::{run_within, TestCluster};

fn any_op() -> impl Strategy<Value = GatherOp> {
    prop_oneof![
        Just(GatherOp::And),
        Just(GatherOp::Or),
        Just(GatherOp::Min),
        Just(GatherOp::Max),
        Just(GatherOp::Sum),
        Just(GatherOp::Product),
    ]
}

fn gather_reference(op: GatherOp, master_value: u32, slave_values: &[u32]) -> u32 {
    slave_values
        .iter()
        .fold(master_value, |acc, &value| op.fold(acc, value))
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 6,
        .. ProptestConfig::default()
    })]

    /// Whatever sequence of payloads the master submits, every slave reads
    /// back exactly that sequence, in order, with packet boundaries
    /// preserved.
    #[test]
    fn stream_delivery_preserves_order_and_boundaries(
        payloads in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 1..256),
            1..25,
        ),
    ) {
        run_within("proptest stream", Duration::from_secs(60), move || {
            let cluster = TestCluster::launch(2);
            cluster.wait_connected();
            let pipe_id = cluster.open_pipe();

            let count = payloads.len();
            let receivers: Vec<_> = cluster
                .slaves
                .iter()
                .map(|slave| {
                    let slave = Arc::clone(slave);
                    std::thread::spawn(move || {
                        (0..count)
                            .map(|_| {
                                slave
                                    .receive_packet(pipe_id)
                                    .expect("receive")
                                    .payload()
                                    .to_vec()
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            for payload in &payloads {
                let mut packet = cluster.master.allocate_packet();
                packet.set_payload(payload).expect("payload fits");
                cluster.master.send_packet(pipe_id, packet).expect("send");
            }

            for receiver in receivers {
                assert_eq!(receiver.join().expect("join receiver"), payloads);
            }

            cluster.close_pipe(pipe_id);
        });
    }

    /// All nodes return the identical gather result, equal to folding the
    /// operator over the master's value and the slave contributions.
    #[test]
    fn gather_agreement(
        master_value in any::<u32>(),
        slave_values in proptest::collection::vec(any::<u32>(), 2),
        op in any_op(),
    ) {
        run_within("proptest gather", Duration::from_secs(60), move || {
            let cluster = TestCluster::launch(2);
            cluster.wait_connected();
            let pipe_id = cluster.open_pipe();

            let results = cluster.gather(pipe_id, master_value, &slave_values, op);
            let expected = gather_reference(op, master_value, &slave_values);
            assert_eq!(results, vec![expected; 3]);

            cluster.close_pipe(pipe_id);
        });
    }
}

//! Loss-injection scenarios: retransmission recovery, flow-control
//! blocking under suppressed acknowledgments, and probe-driven recovery
//! when the loss report itself goes missing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clustercast_transport::protocol::{is_data_datagram, SlaveMessage, SlaveMessageId};
use clustercast_transport::MuxConfig;
use rand::{Rng, SeedableRng};

use crate::harness::{run_within, send_payload, TestCluster};

#[test]
fn lost_data_packet_is_retransmitted() {
    run_within("loss recovery", Duration::from_secs(60), || {
        let cluster = TestCluster::launch(2);
        cluster.wait_connected();
        let pipe_id = cluster.open_pipe();

        // Drop the 5th data datagram on its way into slave 2 only.
        let mut data_seen = 0u32;
        cluster.slaves[1].inject_recv_fault(Some(Box::new(move |datagram| {
            if is_data_datagram(datagram) {
                data_seen += 1;
                data_seen == 5
            } else {
                false
            }
        })));

        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let payloads: Vec<Vec<u8>> = (0..100)
            .map(|_| (0..1000).map(|_| rng.gen()).collect())
            .collect();

        let receivers: Vec<_> = cluster
            .slaves
            .iter()
            .map(|slave| {
                let slave = Arc::clone(slave);
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| slave.receive_packet(pipe_id).expect("receive").payload().to_vec())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        for payload in &payloads {
            send_payload(&cluster.master, pipe_id, payload);
        }

        for receiver in receivers {
            let received = receiver.join().expect("join receiver");
            assert_eq!(received, payloads);
        }

        let metrics = cluster.master.metrics();
        assert!(metrics.loss_reports >= 1, "master saw no loss report");
        assert!(metrics.resent_packets >= 1, "master resent nothing");

        cluster.close_pipe(pipe_id);
    });
}

#[test]
fn full_window_blocks_sender_until_acknowledged() {
    run_within("flow control", Duration::from_secs(60), || {
        let config = MuxConfig {
            send_buffer_size: 4,
            ..Default::default()
        };
        let cluster = TestCluster::launch_with_config(1, config);
        cluster.wait_connected();
        let pipe_id = cluster.open_pipe();

        // The slave swallows every acknowledgment it would send, so the
        // master's window can only drain through the receive probe.
        cluster.slaves[0].inject_send_fault(Some(Box::new(|datagram| {
            SlaveMessage::decode(datagram)
                .map(|msg| msg.id == SlaveMessageId::Acknowledgment)
                .unwrap_or(false)
        })));

        let sent_all = Arc::new(AtomicBool::new(false));
        let sender = {
            let master = Arc::clone(&cluster.master);
            let sent_all = Arc::clone(&sent_all);
            std::thread::spawn(move || {
                for i in 0..5u8 {
                    send_payload(&master, pipe_id, &[i; 100]);
                }
                sent_all.store(true, Ordering::Relaxed);
            })
        };

        // With a window of 4 and no acknowledgments the 5th send must
        // still be blocked.
        std::thread::sleep(Duration::from_millis(600));
        assert!(!sent_all.load(Ordering::Relaxed), "5th send did not block");
        let stats = cluster.master.pipe_stats(pipe_id).expect("stats");
        assert_eq!(stats.queued_packets, 4);

        // Once the slave starts consuming, its receive probe acknowledges
        // the delivered data and unblocks the sender.
        for i in 0..5u8 {
            let packet = cluster.slaves[0].receive_packet(pipe_id).expect("receive");
            assert_eq!(packet.payload(), &[i; 100]);
        }
        sender.join().expect("join sender");
        assert!(sent_all.load(Ordering::Relaxed));

        cluster.close_pipe(pipe_id);
    });
}

#[test]
fn receive_probe_recovers_lost_loss_report() {
    run_within("probe recovery", Duration::from_secs(60), || {
        let cluster = TestCluster::launch(1);
        cluster.wait_connected();
        let pipe_id = cluster.open_pipe();

        let slave = &cluster.slaves[0];

        // Lose the 2nd data datagram, and additionally swallow the gap
        // report it triggers (a gap report carries the offending packet
        // position; the periodic probe repeats the stream position
        // instead). Recovery must come from the probe alone.
        let mut data_seen = 0u32;
        slave.inject_recv_fault(Some(Box::new(move |datagram| {
            if is_data_datagram(datagram) {
                data_seen += 1;
                data_seen == 2
            } else {
                false
            }
        })));
        slave.inject_send_fault(Some(Box::new(|datagram| {
            SlaveMessage::decode(datagram)
                .map(|msg| msg.id == SlaveMessageId::PacketLoss && msg.packet_pos != msg.stream_pos)
                .unwrap_or(false)
        })));

        for i in 0..3u8 {
            send_payload(&cluster.master, pipe_id, &[i; 32]);
        }
        for i in 0..3u8 {
            let packet = slave.receive_packet(pipe_id).expect("receive");
            assert_eq!(packet.payload(), &[i; 32]);
        }

        assert!(cluster.master.metrics().resent_packets >= 1);

        slave.inject_send_fault(None);
        cluster.close_pipe(pipe_id);
    });
}

use std::{
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

use flowkeeper::{
    cache::AccountedFlow,
    exporters::{ExportBatch, direct::DirectExporter},
    pipeline::Pipeline,
    runtime::{
        conf::{Conf, DeduperMode},
        task_manager::TaskManager,
    },
};
use flowkeeper_common::{Direction, EventFlags, FlowKey, InterfacePair, RawEvent, proto, tcp_flags};
use tokio::{sync::mpsc, time::Instant};

fn event(if_index: u32, if_name: &str, src_port: u16) -> RawEvent {
    RawEvent {
        key: FlowKey {
            src_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dst_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            src_port,
            dst_port: 443,
            protocol: proto::TCP,
            if_index,
            direction: Direction::Egress,
        },
        if_name: if_name.to_string(),
        timestamp_ns: 1_700_000_000_000_000_000,
        bytes: 100,
        packets: 2,
        flags: EventFlags {
            tcp_flags: tcp_flags::ACK,
            ..Default::default()
        },
    }
}

const AGENT: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 50));

fn start(conf: &Conf) -> (Pipeline, TaskManager, mpsc::Receiver<ExportBatch>) {
    let mut tasks = TaskManager::new();
    let (exporter, rx) = DirectExporter::channel(64);
    let pipeline = Pipeline::start(conf, Box::new(exporter), AGENT, &mut tasks)
        .expect("pipeline starts");
    (pipeline, tasks, rx)
}

async fn stop(tasks: TaskManager, mut rx: mpsc::Receiver<ExportBatch>) -> Vec<AccountedFlow> {
    let result = tasks.shutdown_with_timeout(Duration::from_secs(5)).await;
    assert!(result.is_graceful(), "shutdown was forced: {result:?}");

    let mut flows = Vec::new();
    while let Ok(batch) = rx.try_recv() {
        flows.extend(batch.records);
    }
    flows
}

#[tokio::test]
async fn merged_duplicates_land_in_one_flow() {
    let conf = Conf {
        deduper: DeduperMode::FirstCome,
        deduper_merge: true,
        ..Default::default()
    };
    let (pipeline, tasks, rx) = start(&conf);
    let ingest = pipeline.ingest();

    for _ in 0..3 {
        assert!(ingest.offer(event(2, "eth0", 5000)));
    }
    assert!(ingest.offer(event(3, "eth1", 5000)));

    let flows = stop(tasks, rx).await;
    assert_eq!(flows.len(), 1);

    let flow = &flows[0];
    assert_eq!(flow.key.if_index, 2);
    assert_eq!(flow.packets, 8);
    assert_eq!(flow.bytes, 400);
    assert!(!flow.duplicate);
    assert_eq!(flow.agent_ip, Some(AGENT));

    let pairs: Vec<InterfacePair> = flow.interfaces.iter().cloned().collect();
    assert_eq!(
        pairs,
        vec![
            InterfacePair {
                if_index: 2,
                if_name: "eth0".to_string(),
                direction: Direction::Egress,
            },
            InterfacePair {
                if_index: 3,
                if_name: "eth1".to_string(),
                direction: Direction::Egress,
            },
        ]
    );
}

#[tokio::test]
async fn default_dedup_drops_other_interfaces() {
    let conf = Conf {
        deduper: DeduperMode::FirstCome,
        deduper_merge: false,
        ..Default::default()
    };
    let (pipeline, tasks, rx) = start(&conf);
    let ingest = pipeline.ingest();

    ingest.offer(event(2, "eth0", 5001));
    ingest.offer(event(3, "eth1", 5001));
    ingest.offer(event(2, "eth0", 5001));

    let flows = stop(tasks, rx).await;
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].key.if_index, 2);
    assert_eq!(flows[0].packets, 4);
}

#[tokio::test]
async fn just_mark_keeps_duplicates_apart() {
    let conf = Conf {
        deduper: DeduperMode::FirstCome,
        deduper_just_mark: true,
        ..Default::default()
    };
    let (pipeline, tasks, rx) = start(&conf);
    let ingest = pipeline.ingest();

    ingest.offer(event(2, "eth0", 5002));
    ingest.offer(event(3, "eth1", 5002));

    let mut flows = stop(tasks, rx).await;
    flows.sort_by_key(|flow| flow.key.if_index);
    assert_eq!(flows.len(), 2);
    assert!(!flows[0].duplicate);
    assert!(flows[1].duplicate);
    assert_eq!(flows[1].key.if_index, 3);
}

#[tokio::test]
async fn just_mark_with_merge_folds_the_pair_into_the_owner() {
    let conf = Conf {
        deduper: DeduperMode::FirstCome,
        deduper_just_mark: true,
        deduper_merge: true,
        ..Default::default()
    };
    let (pipeline, tasks, rx) = start(&conf);
    let ingest = pipeline.ingest();

    ingest.offer(event(2, "eth0", 5003));
    ingest.offer(event(3, "eth1", 5003));

    let mut flows = stop(tasks, rx).await;
    flows.sort_by_key(|flow| flow.key.if_index);
    assert_eq!(flows.len(), 2);

    let owner = &flows[0];
    assert!(!owner.duplicate);
    assert_eq!(owner.key.if_index, 2);
    assert_eq!(owner.packets, 2);
    let names: Vec<&str> = owner.interfaces.iter().map(|p| p.if_name.as_str()).collect();
    assert_eq!(names, vec!["eth0", "eth1"]);

    let marked = &flows[1];
    assert!(marked.duplicate);
    assert_eq!(marked.key.if_index, 3);
    assert_eq!(marked.packets, 2);
}

#[tokio::test]
async fn full_ingest_queue_drops_without_waiting() {
    let conf = Conf {
        buffers_length: 2,
        ..Default::default()
    };
    let (pipeline, tasks, rx) = start(&conf);
    let ingest = pipeline.ingest();

    // the stages cannot run until this task yields
    let queued = (0..10)
        .filter(|port| ingest.offer(event(2, "eth0", 6000 + port)))
        .count();
    assert_eq!(queued, 2);
    assert_eq!(pipeline.drops().snapshot().ingest, 8);

    let flows = stop(tasks, rx).await;
    assert_eq!(flows.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn long_lived_flow_is_exported_within_timeout_plus_sweep() {
    let active_timeout = Duration::from_secs(10);
    let sweep = Duration::from_secs(2);
    let conf = Conf {
        cache_active_timeout: active_timeout,
        cache_sweep_interval: Some(sweep),
        ..Default::default()
    };
    let (pipeline, tasks, mut rx) = start(&conf);
    let ingest = pipeline.ingest();

    let started = Instant::now();
    ingest.offer(event(2, "eth0", 7000));

    let batch = rx.recv().await.expect("flow exported before shutdown");
    let waited = started.elapsed();
    assert_eq!(batch.records.len(), 1);
    assert!(waited >= active_timeout, "evicted early after {waited:?}");
    assert!(
        waited <= active_timeout + sweep,
        "evicted late after {waited:?}"
    );

    assert!(stop(tasks, rx).await.is_empty());
}

//! Stage wiring: ingest → dedup → cache → export.
//!
//! Every stage is one task that owns its state and reads one bounded queue.
//! Producers never wait: a full queue drops the item and counts it.
//!
//! Shutdown cascades down the chain. The dedup stage stops on the shutdown
//! broadcast, drains what is already queued and drops its sender; the cache
//! stage sees its queue end, flushes every live flow and drops the export
//! sender; the export fan-out sees its queue end and shuts the backend down.

use std::{
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use flowkeeper_common::{EventFlags, RawEvent};
use tokio::{
    sync::{broadcast, mpsc},
    time::{Instant, MissedTickBehavior, interval_at},
};
use tracing::{debug, info};

use crate::{
    cache::{AccountedFlow, AccountingCache},
    dedup::{DedupOptions, Deduplicator, FlowEvent, Outcome},
    exporters::{FlowExporter, run_fanout},
    filter::{EveryNth, FlowFilter, Verdict},
    metrics::registry::{DEDUP_EVENTS_TOTAL, FLOW_EVENTS_TOTAL, PROCESSING_LATENCY_SECONDS},
    runtime::{
        conf::{Conf, ConfigError, DeduperMode, DirectionMode},
        memory::ShrinkPolicy,
        task_manager::TaskManager,
    },
};

pub mod queue;

use queue::{DropSender, bounded};

const MIN_DEDUP_SWEEP: Duration = Duration::from_millis(100);

/// Entry point for raw events. Cheap to clone; every capture feed gets one.
#[derive(Clone, Debug)]
pub struct Ingest {
    direction: DirectionMode,
    rtt: bool,
    drops: bool,
    dns: bool,
    translation: bool,
    sampler: Arc<EveryNth>,
    filter: Option<Arc<FlowFilter>>,
    tx: DropSender<RawEvent>,
}

impl Ingest {
    pub(crate) fn new(conf: &Conf, tx: DropSender<RawEvent>) -> Result<Self, ConfigError> {
        let filter = if conf.enable_flow_filter {
            Some(Arc::new(conf.flow_filter()?))
        } else {
            None
        };

        Ok(Self {
            direction: conf.direction,
            rtt: conf.enable_rtt,
            drops: conf.enable_pkt_drops,
            dns: conf.enable_dns_tracking,
            translation: conf.enable_pkt_translation,
            sampler: Arc::new(EveryNth::new(conf.sampling)),
            filter,
            tx,
        })
    }

    /// Admits one event into the pipeline without waiting.
    ///
    /// Returns `false` when the event was not queued, whether it was filtered,
    /// sampled out, from a direction not captured, or dropped on a full queue.
    pub fn offer(&self, mut event: RawEvent) -> bool {
        count("received");

        if !self.direction.admits(event.key.direction) {
            count("direction_mismatch");
            return false;
        }

        self.clear_disabled(&mut event.flags);

        if !self.sampler.admit() {
            count("sampled_out");
            return false;
        }

        if let Some(filter) = &self.filter {
            match filter.evaluate(&event) {
                Verdict::Accept => {}
                Verdict::Reject => {
                    count("filtered");
                    return false;
                }
                Verdict::SampledOut => {
                    count("sampled_out");
                    return false;
                }
            }
        }

        count("accepted");
        self.tx.offer(event)
    }

    /// Events dropped because the ingest queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.tx.dropped()
    }

    fn clear_disabled(&self, flags: &mut EventFlags) {
        if !self.rtt {
            flags.rtt_ns = None;
        }
        if !self.drops {
            flags.drops = None;
        }
        if !self.dns {
            flags.dns = None;
        }
        if !self.translation {
            flags.translation = None;
        }
    }
}

fn count(status: &str) {
    FLOW_EVENTS_TOTAL.with_label_values(&[status]).inc();
}

/// Queue drop counts at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropSnapshot {
    pub ingest: u64,
    pub dedup: u64,
    pub export: u64,
}

impl DropSnapshot {
    pub fn total(&self) -> u64 {
        self.ingest + self.dedup + self.export
    }
}

#[derive(Debug, Clone)]
pub struct DropCounters {
    ingest: Arc<AtomicU64>,
    dedup: Arc<AtomicU64>,
    export: Arc<AtomicU64>,
}

impl DropCounters {
    pub fn snapshot(&self) -> DropSnapshot {
        DropSnapshot {
            ingest: self.ingest.load(Ordering::Relaxed),
            dedup: self.dedup.load(Ordering::Relaxed),
            export: self.export.load(Ordering::Relaxed),
        }
    }
}

/// A running pipeline. Dropping it does not stop the stages; shut the
/// [`TaskManager`] down for that.
#[derive(Debug)]
pub struct Pipeline {
    ingest: Ingest,
    drops: DropCounters,
}

impl Pipeline {
    /// Spawns the dedup, cache and export stages on `tasks`. Exported flows
    /// are stamped with `agent_ip`.
    pub fn start(
        conf: &Conf,
        exporter: Box<dyn FlowExporter>,
        agent_ip: IpAddr,
        tasks: &mut TaskManager,
    ) -> Result<Self, ConfigError> {
        let (ingest_tx, ingest_rx) = bounded::<RawEvent>("ingest", conf.buffers_length);
        let (dedup_tx, dedup_rx) = bounded::<FlowEvent>("dedup", conf.buffers_length);
        let (export_tx, export_rx) =
            bounded::<AccountedFlow>("export", conf.export_queue_capacity());

        let drops = DropCounters {
            ingest: ingest_tx.drop_counter(),
            dedup: dedup_tx.drop_counter(),
            export: export_tx.drop_counter(),
        };
        let ingest = Ingest::new(conf, ingest_tx)?;

        let deduplicator = match conf.deduper {
            DeduperMode::None => None,
            DeduperMode::FirstCome => Some(Deduplicator::new(DedupOptions {
                expiry: conf.dedup_expiry(),
                just_mark: conf.deduper_just_mark,
                merge: conf.deduper_merge,
            })),
        };
        let reclaim = conf.force_reclaim.then(ShrinkPolicy::flow_tables);
        tasks.spawn_with_shutdown("pipeline-dedup", |shutdown| {
            run_dedup_stage(deduplicator, ingest_rx, dedup_tx, reclaim, shutdown)
        });

        let cache = AccountingCache::new(conf.cache_max_flows, conf.cache_active_timeout);
        tasks.spawn(
            "pipeline-cache",
            run_cache_stage(cache, dedup_rx, export_tx, conf.sweep_interval(), reclaim),
        );

        tasks.spawn(
            "pipeline-export",
            run_fanout(exporter, export_rx, conf.max_batch_records, agent_ip),
        );

        info!(
            event.name = "pipeline.started",
            buffers_length = conf.buffers_length,
            export_queue_capacity = conf.export_queue_capacity(),
            cache_max_flows = conf.cache_max_flows,
            deduper = ?conf.deduper,
            exporter = %conf.export,
            "flow pipeline started"
        );

        Ok(Self { ingest, drops })
    }

    pub fn ingest(&self) -> Ingest {
        self.ingest.clone()
    }

    pub fn drops(&self) -> DropCounters {
        self.drops.clone()
    }
}

/// Classifies events and forwards survivors to the cache queue.
///
/// Without a deduplicator every event passes through unchanged.
pub async fn run_dedup_stage(
    mut dedup: Option<Deduplicator>,
    mut rx: mpsc::Receiver<RawEvent>,
    tx: DropSender<FlowEvent>,
    reclaim: Option<ShrinkPolicy>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let period = dedup
        .as_ref()
        .map_or(Duration::from_secs(3600), |d| {
            (d.options().expiry / 2).max(MIN_DEDUP_SWEEP)
        });
    let mut sweep = interval_at(Instant::now() + period, period);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let forward = |dedup: &mut Option<Deduplicator>, event: RawEvent| {
        let outcome = match dedup {
            Some(dedup) => dedup.process(event, Instant::now()),
            None => {
                DEDUP_EVENTS_TOTAL.with_label_values(&["passthrough"]).inc();
                Outcome::Forward(FlowEvent::new(event))
            }
        };
        for flow_event in outcome.into_events() {
            tx.offer(flow_event);
        }
    };

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            event = rx.recv() => match event {
                Some(event) => forward(&mut dedup, event),
                None => break,
            },
            _ = sweep.tick(), if dedup.is_some() => {
                if let Some(dedup) = dedup.as_mut() {
                    let started = std::time::Instant::now();
                    let expired = dedup.sweep(Instant::now());
                    if let Some(policy) = &reclaim {
                        dedup.reclaim(policy);
                    }
                    PROCESSING_LATENCY_SECONDS
                        .with_label_values(&["dedup_sweep"])
                        .observe(started.elapsed().as_secs_f64());
                    debug!(
                        event.name = "pipeline.dedup_swept",
                        expired,
                        tracked = dedup.len(),
                        "dedup sweep completed"
                    );
                }
            }
        }
    }

    rx.close();
    let mut drained = 0usize;
    while let Some(event) = rx.recv().await {
        forward(&mut dedup, event);
        drained += 1;
    }
    info!(
        event.name = "pipeline.dedup_stopped",
        drained,
        "dedup stage stopped"
    );
}

/// Accounts events and pushes evicted flows to the export queue.
///
/// Runs until the dedup stage goes away, then flushes every live flow.
pub async fn run_cache_stage(
    mut cache: AccountingCache,
    mut rx: mpsc::Receiver<FlowEvent>,
    export_tx: DropSender<AccountedFlow>,
    sweep_interval: Duration,
    reclaim: Option<ShrinkPolicy>,
) {
    let mut sweep = interval_at(Instant::now() + sweep_interval, sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => {
                    if let Some(evicted) = cache.admit(event, Instant::now()) {
                        export_tx.offer(evicted);
                    }
                }
                None => break,
            },
            _ = sweep.tick() => {
                let started = std::time::Instant::now();
                let expired = cache.sweep(Instant::now());
                let evicted = expired.len();
                for flow in expired {
                    export_tx.offer(flow);
                }
                if let Some(policy) = &reclaim {
                    cache.reclaim(policy);
                }
                PROCESSING_LATENCY_SECONDS
                    .with_label_values(&["cache_sweep"])
                    .observe(started.elapsed().as_secs_f64());
                if evicted > 0 {
                    debug!(
                        event.name = "pipeline.cache_swept",
                        evicted,
                        live = cache.len(),
                        "cache sweep completed"
                    );
                }
            }
        }
    }

    let flushed = cache.drain();
    let total = flushed.len();
    let queued = flushed
        .into_iter()
        .map(|flow| export_tx.offer(flow))
        .filter(|queued| *queued)
        .count();
    info!(
        event.name = "pipeline.cache_flushed",
        flushed = total,
        queued,
        "cache stage stopped"
    );
}

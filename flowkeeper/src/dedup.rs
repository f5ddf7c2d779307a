//! First-come deduplication of flows seen on several interfaces.
//!
//! The first interface/direction pair to report a 5-tuple becomes its owner.
//! Reports of the same 5-tuple from other pairs are duplicates until the owner
//! has been silent for longer than the expiry.

use std::{collections::BTreeMap, time::Duration};

use flowkeeper_common::{BaseKey, InterfacePair, RawEvent};
use fxhash::FxHashMap;
use tokio::time::Instant;

use crate::{
    metrics::registry::{DEDUP_ENTRIES, DEDUP_EVENTS_TOTAL, DEDUP_EXPIRED_TOTAL},
    runtime::memory::ShrinkPolicy,
};

/// A raw event on its way to the accounting cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowEvent {
    pub event: RawEvent,
    /// Where the event was actually captured. Differs from the key's interface
    /// when the event was merged into its owner.
    pub observed: InterfacePair,
    pub duplicate: bool,
    /// Carries no counters: only adds `observed` to an existing flow.
    pub pair_only: bool,
}

impl FlowEvent {
    pub fn new(event: RawEvent) -> Self {
        Self {
            observed: event.observed_pair(),
            event,
            duplicate: false,
            pair_only: false,
        }
    }
}

/// What the deduplicator made of one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Forward(FlowEvent),
    /// A duplicate forwarded under its own key, plus the pair to fold into
    /// the owner's flow when merging is on.
    Marked {
        duplicate: FlowEvent,
        fold: Option<FlowEvent>,
    },
    Dropped,
}

impl Outcome {
    /// Events to queue for the cache, in order.
    pub fn into_events(self) -> impl Iterator<Item = FlowEvent> {
        let (first, second) = match self {
            Outcome::Forward(event) => (Some(event), None),
            Outcome::Marked { duplicate, fold } => (Some(duplicate), fold),
            Outcome::Dropped => (None, None),
        };
        first.into_iter().chain(second)
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self, Outcome::Dropped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupOptions {
    pub expiry: Duration,
    /// Forward duplicates flagged instead of dropping them.
    pub just_mark: bool,
    /// Fold duplicates into the owner's flow. With `just_mark` only the
    /// observed pair is folded; the counters stay on the marked duplicate.
    pub merge: bool,
}

#[derive(Debug)]
struct Entry {
    owner: InterfacePair,
    last_seen: Instant,
    seq: u64,
}

pub struct Deduplicator {
    opts: DedupOptions,
    entries: FxHashMap<BaseKey, Entry>,
    by_last_seen: BTreeMap<(Instant, u64), BaseKey>,
    next_seq: u64,
}

impl Deduplicator {
    pub fn new(opts: DedupOptions) -> Self {
        Self {
            opts,
            entries: FxHashMap::default(),
            by_last_seen: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn options(&self) -> DedupOptions {
        self.opts
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Classifies one event.
    pub fn process(&mut self, mut event: RawEvent, now: Instant) -> Outcome {
        let base = event.key.base();
        let observed = event.observed_pair();
        let seq = self.next_seq;
        self.next_seq += 1;

        let expiry = self.opts.expiry;
        let live = self
            .entries
            .get(&base)
            .is_some_and(|entry| now.saturating_duration_since(entry.last_seen) <= expiry);

        if !live {
            if let Some(stale) = self.entries.remove(&base) {
                self.by_last_seen.remove(&(stale.last_seen, stale.seq));
            }
            self.by_last_seen.insert((now, seq), base);
            self.entries.insert(
                base,
                Entry {
                    owner: observed.clone(),
                    last_seen: now,
                    seq,
                },
            );
            DEDUP_ENTRIES.set(self.entries.len() as i64);
            DEDUP_EVENTS_TOTAL.with_label_values(&["new"]).inc();
            return Outcome::Forward(forwarded(event, observed, false));
        }

        let Some(entry) = self.entries.get_mut(&base) else {
            return Outcome::Dropped;
        };
        self.by_last_seen.remove(&(entry.last_seen, entry.seq));
        entry.last_seen = now;
        entry.seq = seq;
        self.by_last_seen.insert((now, seq), base);

        if entry.owner == observed {
            DEDUP_EVENTS_TOTAL.with_label_values(&["owner"]).inc();
            return Outcome::Forward(forwarded(event, observed, false));
        }

        if self.opts.just_mark {
            DEDUP_EVENTS_TOTAL.with_label_values(&["marked"]).inc();
            let fold = self.opts.merge.then(|| FlowEvent {
                event: RawEvent {
                    key: event
                        .key
                        .with_interface(entry.owner.if_index, entry.owner.direction),
                    if_name: entry.owner.if_name.clone(),
                    timestamp_ns: event.timestamp_ns,
                    bytes: 0,
                    packets: 0,
                    flags: Default::default(),
                },
                observed: observed.clone(),
                duplicate: false,
                pair_only: true,
            });
            return Outcome::Marked {
                duplicate: forwarded(event, observed, true),
                fold,
            };
        }

        if self.opts.merge {
            event.key = event
                .key
                .with_interface(entry.owner.if_index, entry.owner.direction);
            event.if_name = entry.owner.if_name.clone();
            DEDUP_EVENTS_TOTAL.with_label_values(&["merged"]).inc();
            return Outcome::Forward(forwarded(event, observed, false));
        }

        DEDUP_EVENTS_TOTAL.with_label_values(&["dropped"]).inc();
        Outcome::Dropped
    }

    /// Forgets owners silent for longer than the expiry. Returns how many.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        while let Some((&(last_seen, seq), _)) = self.by_last_seen.first_key_value() {
            if now.saturating_duration_since(last_seen) <= self.opts.expiry {
                break;
            }
            if let Some((_, base)) = self.by_last_seen.pop_first()
                && self.entries.get(&base).is_some_and(|e| e.seq == seq)
            {
                self.entries.remove(&base);
                expired += 1;
            }
        }

        if expired > 0 {
            DEDUP_EXPIRED_TOTAL.inc_by(expired as u64);
            DEDUP_ENTRIES.set(self.entries.len() as i64);
        }
        expired
    }

    pub fn reclaim(&mut self, policy: &ShrinkPolicy) -> bool {
        policy.reclaim(&mut self.entries)
    }

    /// The current owner of a 5-tuple, if tracked and not expired.
    pub fn owner(&self, base: &BaseKey, now: Instant) -> Option<&InterfacePair> {
        self.entries
            .get(base)
            .filter(|e| now.saturating_duration_since(e.last_seen) <= self.opts.expiry)
            .map(|e| &e.owner)
    }
}

fn forwarded(event: RawEvent, observed: InterfacePair, duplicate: bool) -> FlowEvent {
    FlowEvent {
        event,
        observed,
        duplicate,
        pair_only: false,
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use flowkeeper_common::{Direction, FlowKey, proto};

    use super::*;

    const EXPIRY: Duration = Duration::from_secs(10);

    fn opts(just_mark: bool, merge: bool) -> DedupOptions {
        DedupOptions {
            expiry: EXPIRY,
            just_mark,
            merge,
        }
    }

    fn single(outcome: Outcome) -> FlowEvent {
        let mut events: Vec<_> = outcome.into_events().collect();
        assert_eq!(events.len(), 1, "expected exactly one forwarded event");
        events.remove(0)
    }

    fn event(if_index: u32, if_name: &str, direction: Direction) -> RawEvent {
        RawEvent {
            key: FlowKey {
                src_addr: IpAddr::V4(Ipv4Addr::new(10, 1, 0, 1)),
                dst_addr: IpAddr::V4(Ipv4Addr::new(10, 1, 0, 2)),
                src_port: 51000,
                dst_port: 80,
                protocol: proto::TCP,
                if_index,
                direction,
            },
            if_name: if_name.to_string(),
            timestamp_ns: 0,
            bytes: 100,
            packets: 1,
            flags: Default::default(),
        }
    }

    #[test]
    fn first_reporter_owns_and_duplicates_are_dropped_by_default() {
        let mut dedup = Deduplicator::new(opts(false, false));
        let now = Instant::now();

        let first = single(dedup.process(event(2, "eth0", Direction::Egress), now));
        assert!(!first.duplicate);

        assert!(dedup.process(event(5, "veth5", Direction::Ingress), now).is_dropped());
        assert!(!dedup.process(event(2, "eth0", Direction::Egress), now).is_dropped());
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn same_interface_other_direction_is_a_duplicate() {
        let mut dedup = Deduplicator::new(opts(false, false));
        let now = Instant::now();
        dedup.process(event(2, "eth0", Direction::Egress), now);
        assert!(dedup.process(event(2, "eth0", Direction::Ingress), now).is_dropped());
    }

    #[test]
    fn just_mark_forwards_flagged_duplicates_unchanged() {
        let mut dedup = Deduplicator::new(opts(true, false));
        let now = Instant::now();
        dedup.process(event(2, "eth0", Direction::Egress), now);

        let dup = single(dedup.process(event(5, "veth5", Direction::Ingress), now));
        assert!(dup.duplicate);
        assert!(!dup.pair_only);
        assert_eq!(dup.event.key.if_index, 5);
        assert_eq!(dup.event.if_name, "veth5");
    }

    #[test]
    fn just_mark_with_merge_also_folds_the_pair_into_the_owner() {
        let mut dedup = Deduplicator::new(opts(true, true));
        let now = Instant::now();
        dedup.process(event(2, "eth0", Direction::Egress), now);

        let events: Vec<_> = dedup
            .process(event(5, "veth5", Direction::Ingress), now)
            .into_events()
            .collect();
        assert_eq!(events.len(), 2);

        let dup = &events[0];
        assert!(dup.duplicate);
        assert_eq!(dup.event.key.if_index, 5);
        assert_eq!(dup.event.bytes, 100);

        let fold = &events[1];
        assert!(fold.pair_only);
        assert!(!fold.duplicate);
        assert_eq!(fold.event.key.if_index, 2);
        assert_eq!(fold.event.key.direction, Direction::Egress);
        assert_eq!((fold.event.bytes, fold.event.packets), (0, 0));
        assert_eq!(fold.observed, dup.observed);
    }

    #[test]
    fn merge_rehomes_duplicates_on_the_owner() {
        let mut dedup = Deduplicator::new(opts(false, true));
        let now = Instant::now();
        dedup.process(event(2, "eth0", Direction::Egress), now);

        let merged = single(dedup.process(event(5, "veth5", Direction::Ingress), now));
        assert!(!merged.duplicate);
        assert_eq!(merged.event.key.if_index, 2);
        assert_eq!(merged.event.key.direction, Direction::Egress);
        assert_eq!(merged.event.if_name, "eth0");
        assert_eq!(
            merged.observed,
            InterfacePair {
                if_index: 5,
                if_name: "veth5".to_string(),
                direction: Direction::Ingress,
            }
        );
    }

    #[test]
    fn owner_changes_after_expiry_even_before_sweep() {
        let mut dedup = Deduplicator::new(opts(false, false));
        let start = Instant::now();
        dedup.process(event(2, "eth0", Direction::Egress), start);

        let later = start + EXPIRY + Duration::from_millis(1);
        let taken_over = single(dedup.process(event(5, "veth5", Direction::Ingress), later));
        assert!(!taken_over.duplicate);
        assert_eq!(
            dedup.owner(&taken_over.event.key.base(), later).map(|o| o.if_index),
            Some(5)
        );
        assert!(dedup.process(event(2, "eth0", Direction::Egress), later).is_dropped());
    }

    #[test]
    fn duplicates_keep_the_owner_alive() {
        let mut dedup = Deduplicator::new(opts(false, false));
        let start = Instant::now();
        dedup.process(event(2, "eth0", Direction::Egress), start);

        let mid = start + Duration::from_secs(8);
        dedup.process(event(5, "veth5", Direction::Ingress), mid);

        let later = start + Duration::from_secs(15);
        assert_eq!(dedup.sweep(later), 0);
        assert!(dedup.process(event(5, "veth5", Direction::Ingress), later).is_dropped());
    }

    #[test]
    fn sweep_removes_only_expired_entries_oldest_first() {
        let mut dedup = Deduplicator::new(opts(false, false));
        let start = Instant::now();

        let mut old = event(2, "eth0", Direction::Egress);
        old.key.src_port = 1;
        let mut fresh = event(2, "eth0", Direction::Egress);
        fresh.key.src_port = 2;

        dedup.process(old, start);
        dedup.process(fresh, start + Duration::from_secs(5));
        assert_eq!(dedup.len(), 2);

        // exactly at expiry: still live
        assert_eq!(dedup.sweep(start + EXPIRY), 0);
        assert_eq!(dedup.sweep(start + EXPIRY + Duration::from_secs(1)), 1);
        assert_eq!(dedup.len(), 1);
        assert_eq!(dedup.sweep(start + Duration::from_secs(60)), 1);
        assert!(dedup.is_empty());
    }
}

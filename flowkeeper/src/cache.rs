//! Bounded per-flow accumulators.
//!
//! Entries are indexed by [`FlowKey`] and, separately, by creation time so the
//! oldest entry can be found without scanning. Nothing here touches a channel;
//! the caller decides what to do with evicted flows.

use std::{collections::BTreeMap, collections::BTreeSet, net::IpAddr, time::Duration};

use flowkeeper_common::{DnsInfo, DropInfo, FlowKey, InterfacePair, Translation};
use fxhash::FxHashMap;
use serde::Serialize;
use tokio::time::Instant;

use crate::{
    dedup::FlowEvent,
    metrics::registry::{CACHE_EVICTIONS_TOTAL, CACHE_FLOWS, CACHE_SHRINKS_TOTAL},
    runtime::memory::ShrinkPolicy,
};

/// Accumulated drop counters. The cause and flags are from the latest event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DropTotals {
    pub packets: u64,
    pub bytes: u64,
    pub latest_cause: u32,
    pub latest_tcp_flags: u16,
}

impl DropTotals {
    fn add(&mut self, info: &DropInfo) {
        self.packets += u64::from(info.packets);
        self.bytes += info.bytes;
        self.latest_cause = info.cause;
        self.latest_tcp_flags = info.latest_tcp_flags;
    }
}

/// A flow record as it leaves the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountedFlow {
    pub key: FlowKey,
    pub if_name: String,
    pub bytes: u64,
    pub packets: u64,
    /// Earliest event timestamp, ns since the unix epoch.
    pub first_seen_ns: u64,
    /// Latest event timestamp, ns since the unix epoch.
    pub last_seen_ns: u64,
    /// Every interface/direction the flow was actually observed on.
    pub interfaces: BTreeSet<InterfacePair>,
    pub tcp_flags: u16,
    pub icmp_type: u8,
    pub icmp_code: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drops: Option<DropTotals>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtt_ns: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translation: Option<Translation>,
    pub duplicate: bool,
    /// Reporting agent, stamped by the export fan-out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_ip: Option<IpAddr>,
    #[serde(skip)]
    pub created_at: Instant,
}

impl AccountedFlow {
    pub fn new(event: FlowEvent, now: Instant) -> Self {
        let FlowEvent {
            event,
            observed,
            duplicate,
            ..
        } = event;

        let mut flow = Self {
            key: event.key,
            if_name: event.if_name,
            bytes: 0,
            packets: 0,
            first_seen_ns: event.timestamp_ns,
            last_seen_ns: event.timestamp_ns,
            interfaces: BTreeSet::new(),
            tcp_flags: 0,
            icmp_type: event.flags.icmp_type,
            icmp_code: event.flags.icmp_code,
            drops: None,
            rtt_ns: None,
            dns: None,
            translation: None,
            duplicate,
            agent_ip: None,
            created_at: now,
        };
        flow.interfaces.insert(observed);
        flow.accumulate_counters(
            event.bytes,
            event.packets,
            event.timestamp_ns,
            &event.flags,
        );
        flow
    }

    /// Folds another event for the same key into this record.
    pub fn absorb(&mut self, event: FlowEvent) {
        let FlowEvent {
            event,
            observed,
            duplicate,
            ..
        } = event;

        self.interfaces.insert(observed);
        self.duplicate &= duplicate;
        if event.flags.icmp_type != 0 || event.flags.icmp_code != 0 {
            self.icmp_type = event.flags.icmp_type;
            self.icmp_code = event.flags.icmp_code;
        }
        self.accumulate_counters(
            event.bytes,
            event.packets,
            event.timestamp_ns,
            &event.flags,
        );
    }

    fn accumulate_counters(
        &mut self,
        bytes: u64,
        packets: u64,
        timestamp_ns: u64,
        flags: &flowkeeper_common::EventFlags,
    ) {
        self.bytes = self.bytes.saturating_add(bytes);
        self.packets = self.packets.saturating_add(packets);
        self.first_seen_ns = self.first_seen_ns.min(timestamp_ns);
        self.last_seen_ns = self.last_seen_ns.max(timestamp_ns);
        self.tcp_flags |= flags.tcp_flags;

        if let Some(drops) = &flags.drops {
            self.drops.get_or_insert_with(DropTotals::default).add(drops);
        }
        if let Some(rtt) = flags.rtt_ns {
            self.rtt_ns = Some(self.rtt_ns.map_or(rtt, |current| current.max(rtt)));
        }
        if flags.dns.is_some() {
            self.dns = flags.dns;
        }
        if flags.translation.is_some() {
            self.translation = flags.translation;
        }
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }
}

/// Why a flow left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Capacity,
    Timeout,
    Shutdown,
}

impl EvictionReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            EvictionReason::Capacity => "capacity",
            EvictionReason::Timeout => "timeout",
            EvictionReason::Shutdown => "shutdown",
        }
    }
}

pub struct AccountingCache {
    max_flows: usize,
    active_timeout: Duration,
    entries: FxHashMap<FlowKey, (u64, AccountedFlow)>,
    by_creation: BTreeMap<(Instant, u64), FlowKey>,
    next_seq: u64,
}

impl AccountingCache {
    pub fn new(max_flows: usize, active_timeout: Duration) -> Self {
        Self {
            max_flows: max_flows.max(1),
            active_timeout,
            entries: FxHashMap::default(),
            by_creation: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &FlowKey) -> Option<&AccountedFlow> {
        self.entries.get(key).map(|(_, flow)| flow)
    }

    /// Accounts one event. Returns the flow evicted to make room, if any.
    ///
    /// A pair-only event never creates a flow: it is dropped when its owner
    /// is no longer cached.
    pub fn admit(&mut self, event: FlowEvent, now: Instant) -> Option<AccountedFlow> {
        let key = event.event.key;
        if let Some((_, flow)) = self.entries.get_mut(&key) {
            if event.pair_only {
                flow.interfaces.insert(event.observed);
            } else {
                flow.absorb(event);
            }
            return None;
        }
        if event.pair_only {
            return None;
        }

        let evicted = if self.entries.len() >= self.max_flows {
            self.evict_oldest()
        } else {
            None
        };
        if evicted.is_some() {
            CACHE_EVICTIONS_TOTAL
                .with_label_values(&[EvictionReason::Capacity.as_str()])
                .inc();
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_creation.insert((now, seq), key);
        self.entries
            .insert(key, (seq, AccountedFlow::new(event, now)));
        CACHE_FLOWS.set(self.entries.len() as i64);

        evicted
    }

    /// Removes every flow whose age reached the active timeout, oldest first.
    pub fn sweep(&mut self, now: Instant) -> Vec<AccountedFlow> {
        let mut expired = Vec::new();
        while let Some((&(created_at, _), _)) = self.by_creation.first_key_value() {
            if now.saturating_duration_since(created_at) < self.active_timeout {
                break;
            }
            if let Some(flow) = self.evict_oldest() {
                expired.push(flow);
            }
        }

        if !expired.is_empty() {
            CACHE_EVICTIONS_TOTAL
                .with_label_values(&[EvictionReason::Timeout.as_str()])
                .inc_by(expired.len() as u64);
            CACHE_FLOWS.set(self.entries.len() as i64);
        }
        expired
    }

    /// Empties the cache, oldest first.
    pub fn drain(&mut self) -> Vec<AccountedFlow> {
        let mut flows = Vec::with_capacity(self.entries.len());
        while let Some(flow) = self.evict_oldest() {
            flows.push(flow);
        }
        CACHE_EVICTIONS_TOTAL
            .with_label_values(&[EvictionReason::Shutdown.as_str()])
            .inc_by(flows.len() as u64);
        CACHE_FLOWS.set(0);
        flows
    }

    pub fn reclaim(&mut self, policy: &ShrinkPolicy) -> bool {
        let shrunk = policy.reclaim(&mut self.entries);
        if shrunk {
            CACHE_SHRINKS_TOTAL.inc();
        }
        shrunk
    }

    fn evict_oldest(&mut self) -> Option<AccountedFlow> {
        while let Some(((_, seq), key)) = self.by_creation.pop_first() {
            match self.entries.get(&key) {
                Some((entry_seq, _)) if *entry_seq == seq => {
                    return self.entries.remove(&key).map(|(_, flow)| flow);
                }
                _ => continue,
            }
        }
        None
    }
}

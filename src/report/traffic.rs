use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant, SystemTime};

use serde::Deserialize;

use crate::batch::Packet;

use super::{Report, ReportInfo, Snapshot, SnapshotRow};

/// Packet field a traffic report keys its rows by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficKey {
    Hostname,
    ServerName,
    ScriptName,
}

impl TrafficKey {
    fn extract<'a>(&self, packet: &'a Packet) -> &'a str {
        match self {
            TrafficKey::Hostname => &packet.hostname,
            TrafficKey::ServerName => &packet.server_name,
            TrafficKey::ScriptName => &packet.script_name,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Aggregate {
    req_count: u64,
    request_time_total: Duration,
    document_size_total: u64,
    memory_peak_max: u64,
}

#[derive(Debug, Default)]
struct TickBucket {
    by_key: HashMap<String, Aggregate>,
    packet_count: u64,
}

/// Windowed request-traffic report.
///
/// Aggregates packets per key over `time_window` split into `tick_count`
/// rotating buckets; every tick the oldest bucket falls out of the window.
pub struct TrafficReport {
    name: String,
    key: TrafficKey,
    info: ReportInfo,
    // front = oldest tick, back = current tick
    buckets: VecDeque<TickBucket>,
}

impl TrafficReport {
    pub fn new(name: String, key: TrafficKey, info: ReportInfo) -> Self {
        Self {
            name,
            key,
            info,
            buckets: VecDeque::with_capacity(info.tick_count as usize + 1),
        }
    }
}

impl Report for TrafficReport {
    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> ReportInfo {
        self.info
    }

    fn ticks_init(&mut self, _now: Instant) {
        self.buckets.clear();
        self.buckets.push_back(TickBucket::default());
    }

    fn tick_now(&mut self, _now: Instant) {
        self.buckets.push_back(TickBucket::default());
        while self.buckets.len() > self.info.tick_count as usize {
            self.buckets.pop_front();
        }
    }

    fn add_multi(&mut self, packets: &[Packet]) {
        if self.buckets.is_empty() {
            self.buckets.push_back(TickBucket::default());
        }
        let current = self.buckets.back_mut().expect("current tick bucket");

        for packet in packets {
            current.packet_count += 1;

            let agg = current
                .by_key
                .entry(self.key.extract(packet).to_string())
                .or_default();
            agg.req_count += 1;
            agg.request_time_total += packet.request_time;
            agg.document_size_total += packet.document_size;
            agg.memory_peak_max = agg.memory_peak_max.max(packet.memory_peak);
        }
    }

    fn get_snapshot(&self) -> Snapshot {
        let mut merged: HashMap<&str, Aggregate> = HashMap::new();
        let mut packet_count = 0u64;

        for bucket in &self.buckets {
            packet_count += bucket.packet_count;
            for (key, agg) in &bucket.by_key {
                let row = merged.entry(key.as_str()).or_default();
                row.req_count += agg.req_count;
                row.request_time_total += agg.request_time_total;
                row.document_size_total += agg.document_size_total;
                row.memory_peak_max = row.memory_peak_max.max(agg.memory_peak_max);
            }
        }

        let mut rows: Vec<SnapshotRow> = merged
            .into_iter()
            .map(|(key, agg)| SnapshotRow {
                key: key.to_string(),
                req_count: agg.req_count,
                request_time_total: agg.request_time_total,
                document_size_total: agg.document_size_total,
                memory_peak_max: agg.memory_peak_max,
            })
            .collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));

        Snapshot {
            report_name: self.name.clone(),
            taken_at: SystemTime::now(),
            info: self.info,
            packet_count,
            rows,
        }
    }
}

pub mod traffic;

use std::time::{Duration, Instant, SystemTime};

use crate::batch::Packet;

/// Static window parameters of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportInfo {
    /// Total aggregation window the report covers.
    pub time_window: Duration,
    /// Number of ticks the window is split into.
    pub tick_count: u32,
}

impl ReportInfo {
    /// Interval between ticks for this report.
    pub fn tick_interval(&self) -> Duration {
        self.time_window / self.tick_count
    }
}

/// Aggregation unit owning time-windowed state, updated per batch and per
/// tick.
///
/// All methods except construction run on the owning report host's worker;
/// no other code touches a live report.
pub trait Report: Send {
    /// Unique name this report is addressed by on the control plane.
    fn name(&self) -> &str;

    /// Window parameters; the host derives its tick interval from these.
    fn info(&self) -> ReportInfo;

    /// Seeds the tick base. Called once on the host worker before any other
    /// call.
    fn ticks_init(&mut self, now: Instant);

    /// Advances the window by one tick.
    fn tick_now(&mut self, now: Instant);

    /// Folds a batch worth of packets into the current tick.
    fn add_multi(&mut self, packets: &[Packet]);

    /// Immutable view of the current aggregated state.
    fn get_snapshot(&self) -> Snapshot;
}

/// One aggregated row of a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotRow {
    /// Value of the field the report is keyed by.
    pub key: String,
    /// Requests observed for this key inside the window.
    pub req_count: u64,
    /// Sum of request wall time for this key.
    pub request_time_total: Duration,
    /// Sum of response bytes for this key.
    pub document_size_total: u64,
    /// Largest memory peak observed for this key.
    pub memory_peak_max: u64,
}

/// Immutable view of a report's aggregated state at a point in time.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Name of the report this was taken from.
    pub report_name: String,
    /// Wall-clock capture time.
    pub taken_at: SystemTime,
    /// Window parameters of the source report.
    pub info: ReportInfo,
    /// Total packets currently inside the window.
    pub packet_count: u64,
    /// Aggregated rows, one per key.
    pub rows: Vec<SnapshotRow>,
}

impl Snapshot {
    /// Looks up a row by key.
    pub fn row(&self, key: &str) -> Option<&SnapshotRow> {
        self.rows.iter().find(|r| r.key == key)
    }
}

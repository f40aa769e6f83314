use std::sync::Arc;
use std::time::Duration;

/// One parsed request-telemetry record as produced by the upstream repacker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    /// Machine the request was served from.
    pub hostname: String,
    /// Virtual host / server name the request hit.
    pub server_name: String,
    /// Script or handler that serviced the request.
    pub script_name: String,
    /// Wall time spent servicing the request.
    pub request_time: Duration,
    /// Bytes of response body produced.
    pub document_size: u64,
    /// Peak memory used while servicing, in bytes.
    pub memory_peak: u64,
    /// Response status code.
    pub status: u16,
}

/// Immutable bundle of parsed packets.
///
/// Handed around as `Arc<PacketBatch>`: the coordinator clones the reference
/// once per report host during fan-out, and the bundle is freed when the last
/// holder drops it.
#[derive(Debug)]
pub struct PacketBatch {
    packets: Vec<Packet>,
}

impl PacketBatch {
    /// Wraps a set of parsed packets into a shared batch.
    pub fn new(packets: Vec<Packet>) -> Arc<Self> {
        Arc::new(Self { packets })
    }

    /// The packets carried by this batch.
    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    /// Number of packets in this batch.
    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }
}

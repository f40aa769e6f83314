use std::sync::Arc;

use crate::health::HealthMetrics;
use crate::ticker::Ticker;

/// Process-wide shared services: the clock and the stats surface.
///
/// Owned by the process entry point; the coordinator and report hosts borrow
/// it for their lifetimes.
pub struct Globals {
    ticker: Ticker,
    health: Arc<HealthMetrics>,
}

impl Globals {
    pub fn new(health: Arc<HealthMetrics>) -> Arc<Self> {
        Arc::new(Self {
            ticker: Ticker::new(),
            health,
        })
    }

    pub fn ticker(&self) -> &Ticker {
        &self.ticker
    }

    pub fn health(&self) -> &HealthMetrics {
        &self.health
    }
}

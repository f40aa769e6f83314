use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, Instrument};

use crate::batch::PacketBatch;
use crate::globals::Globals;
use crate::report::Report;
use crate::ticker::TickChannel;

use super::messages::{ReportFn, ReportHostRequest};

/// Configuration for one report host, derived by the coordinator.
pub(crate) struct ReportHostConf {
    /// Host identity, also the ticker subscription name. Must be unique
    /// among live hosts.
    pub name: String,
    /// Worker identity for tracing.
    pub thread_name: String,
    /// Plain report name, used as the label on the stats surface.
    pub report_name: String,
    /// Ingest queue capacity, in batches.
    pub packets_buffer_capacity: usize,
}

/// Thread-plus-mailbox wrapper that single-threads all access to one report.
///
/// The hosted report is touched only from the worker task; everything else
/// goes through the host's queues.
pub(crate) struct ReportHost {
    globals: Arc<Globals>,
    conf: ReportHostConf,

    packets_tx: mpsc::Sender<Arc<PacketBatch>>,
    packets_rx: Option<mpsc::Receiver<Arc<PacketBatch>>>,

    control_tx: mpsc::Sender<ReportHostRequest>,
    control_rx: Option<mpsc::Receiver<ReportHostRequest>>,

    shutdown_tx: mpsc::Sender<oneshot::Sender<()>>,
    shutdown_rx: Option<mpsc::Receiver<oneshot::Sender<()>>>,

    worker: Option<JoinHandle<()>>,
}

impl ReportHost {
    /// Binds the host's queues. Does not start the worker.
    pub fn new(globals: Arc<Globals>, conf: ReportHostConf) -> Self {
        let (packets_tx, packets_rx) = mpsc::channel(conf.packets_buffer_capacity.max(1));
        let (control_tx, control_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        Self {
            globals,
            conf,
            packets_tx,
            packets_rx: Some(packets_rx),
            control_tx,
            control_rx: Some(control_rx),
            shutdown_tx,
            shutdown_rx: Some(shutdown_rx),
            worker: None,
        }
    }

    /// Moves the report in, subscribes its tick channel, and spawns the
    /// worker. Fails if called twice.
    pub fn startup(&mut self, report: Box<dyn Report>) -> Result<()> {
        if self.worker.is_some() {
            bail!("report host {} is already started", self.conf.name);
        }

        let info = report.info();
        if info.tick_count == 0 {
            bail!("report {}: tick_count must be positive", report.name());
        }

        // The subscription name is the host name; it stays claimed until the
        // worker unsubscribes on exit, so a deleted report's name can be
        // reused by a later host.
        let tick_chan = self
            .globals
            .ticker()
            .subscribe(info.tick_interval(), &self.conf.name)
            .with_context(|| format!("subscribing tick channel for {}", self.conf.name))?;

        let packets_rx = self.packets_rx.take().expect("startup called more than once");
        let control_rx = self.control_rx.take().expect("startup called more than once");
        let shutdown_rx = self.shutdown_rx.take().expect("startup called more than once");

        let span = tracing::info_span!(
            "report_host",
            thread = %self.conf.thread_name,
            report = %self.conf.report_name,
        );

        self.worker = Some(tokio::spawn(
            run_worker(
                Arc::clone(&self.globals),
                self.conf.report_name.clone(),
                report,
                tick_chan,
                packets_rx,
                control_rx,
                shutdown_rx,
            )
            .instrument(span),
        ));

        Ok(())
    }

    /// Non-blocking, lossy enqueue of a batch onto the ingest queue.
    ///
    /// Called from the coordinator worker during fan-out; must never stall
    /// it. A full queue drops the batch and counts the drop.
    pub fn process_batch(&self, batch: Arc<PacketBatch>) {
        match self.packets_tx.try_send(batch) {
            Ok(()) => self.globals.health().batches_forwarded.inc(),
            Err(_) => {
                self.globals
                    .health()
                    .batches_dropped
                    .with_label_values(&[self.conf.report_name.as_str()])
                    .inc();
                trace!(report = %self.conf.report_name, "ingest queue full, dropping batch");
            }
        }
    }

    /// Runs `func` against the hosted report on the worker and waits for it
    /// to complete.
    pub async fn call_with_report(&self, func: ReportFn) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.control_tx
            .send(ReportHostRequest {
                func,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow!("report host {}: control channel closed", self.conf.name))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("report host {}: control reply dropped", self.conf.name))?;

        Ok(())
    }

    /// Asks the worker to stop, waits for the acknowledgement, and joins it.
    /// After return the host is drained.
    pub async fn shutdown(&mut self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();

        self.shutdown_tx
            .send(ack_tx)
            .await
            .map_err(|_| anyhow!("report host {}: shutdown channel closed", self.conf.name))?;

        ack_rx
            .await
            .map_err(|_| anyhow!("report host {}: shutdown ack dropped", self.conf.name))?;

        if let Some(worker) = self.worker.take() {
            worker
                .await
                .with_context(|| format!("joining report host {} worker", self.conf.name))?;
        }

        Ok(())
    }
}

/// Report host event loop.
///
/// Linearises everything that touches the report: ticks, batch ingest,
/// control closures, shutdown. Exits after the iteration that saw the
/// shutdown token, then releases the tick subscription.
async fn run_worker(
    globals: Arc<Globals>,
    report_name: String,
    mut report: Box<dyn Report>,
    mut tick_chan: TickChannel,
    mut packets_rx: mpsc::Receiver<Arc<PacketBatch>>,
    mut control_rx: mpsc::Receiver<ReportHostRequest>,
    mut shutdown_rx: mpsc::Receiver<oneshot::Sender<()>>,
) {
    report.ticks_init(Instant::now());

    let packets_metric = globals
        .health()
        .packets_received
        .with_label_values(&[report_name.as_str()]);
    let mut packets_received: u64 = 0;
    let mut shutdown = false;

    debug!("report host worker started");

    while !shutdown {
        tokio::select! {
            Some(now) = tick_chan.recv() => {
                // Drain the channel so a backlog collapses into one tick.
                let mut latest = now;
                while let Some(extra) = tick_chan.try_recv() {
                    latest = extra;
                }
                report.tick_now(latest);
            }

            Some(batch) = packets_rx.recv() => {
                let count = batch.packet_count();
                packets_received += count as u64;
                packets_metric.inc_by(count as f64);
                report.add_multi(batch.packets());
            }

            Some(request) = control_rx.recv() => {
                (request.func)(report.as_mut());
                let _ = request.reply.send(());
            }

            Some(ack) = shutdown_rx.recv() => {
                shutdown = true;
                let _ = ack.send(());
            }
        }
    }

    // Required so a later host may claim the same name.
    globals.ticker().unsubscribe(tick_chan);

    debug!(packets_received, "report host worker stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::batch::Packet;
    use crate::health::HealthMetrics;
    use crate::report::{ReportInfo, Snapshot};

    struct StubReport {
        name: String,
        packets_seen: Arc<AtomicU64>,
    }

    impl Report for StubReport {
        fn name(&self) -> &str {
            &self.name
        }

        fn info(&self) -> ReportInfo {
            ReportInfo {
                time_window: Duration::from_secs(60),
                tick_count: 60,
            }
        }

        fn ticks_init(&mut self, _now: Instant) {}

        fn tick_now(&mut self, _now: Instant) {}

        fn add_multi(&mut self, packets: &[Packet]) {
            self.packets_seen
                .fetch_add(packets.len() as u64, Ordering::SeqCst);
        }

        fn get_snapshot(&self) -> Snapshot {
            Snapshot {
                report_name: self.name.clone(),
                taken_at: std::time::SystemTime::now(),
                info: self.info(),
                packet_count: self.packets_seen.load(Ordering::SeqCst),
                rows: Vec::new(),
            }
        }
    }

    fn test_globals() -> Arc<Globals> {
        Globals::new(Arc::new(
            HealthMetrics::new(":0").expect("health metrics"),
        ))
    }

    fn host_conf(capacity: usize) -> ReportHostConf {
        ReportHostConf {
            name: "rh/0/stub".to_string(),
            thread_name: "rh/0".to_string(),
            report_name: "stub".to_string(),
            packets_buffer_capacity: capacity,
        }
    }

    fn stub_report(packets_seen: Arc<AtomicU64>) -> Box<dyn Report> {
        Box::new(StubReport {
            name: "stub".to_string(),
            packets_seen,
        })
    }

    fn batch_of(count: usize) -> Arc<PacketBatch> {
        PacketBatch::new(vec![Packet::default(); count])
    }

    #[tokio::test]
    async fn test_startup_twice_fails() {
        let globals = test_globals();
        let mut host = ReportHost::new(Arc::clone(&globals), host_conf(8));

        let seen = Arc::new(AtomicU64::new(0));
        host.startup(stub_report(Arc::clone(&seen))).expect("first startup");

        let err = host
            .startup(stub_report(seen))
            .expect_err("second startup must fail");
        assert!(err.to_string().contains("already started"));

        host.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn test_call_with_report_runs_exactly_once() {
        let globals = test_globals();
        let mut host = ReportHost::new(Arc::clone(&globals), host_conf(8));
        host.startup(stub_report(Arc::new(AtomicU64::new(0))))
            .expect("startup");

        let calls = Arc::new(AtomicU64::new(0));
        let calls_in_closure = Arc::clone(&calls);
        host.call_with_report(Box::new(move |report| {
            calls_in_closure.fetch_add(1, Ordering::SeqCst);
            assert_eq!(report.name(), "stub");
        }))
        .await
        .expect("call_with_report");

        assert_eq!(calls.load(Ordering::SeqCst), 1);

        host.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn test_process_batch_counts_drops_when_queue_full() {
        let globals = test_globals();
        // Host is never started, so nothing drains the queue.
        let host = ReportHost::new(Arc::clone(&globals), host_conf(2));

        host.process_batch(batch_of(1));
        host.process_batch(batch_of(1));
        host.process_batch(batch_of(1));

        let dropped = globals
            .health()
            .batches_dropped
            .with_label_values(&["stub"])
            .get();
        assert_eq!(dropped as u64, 1);
        assert_eq!(globals.health().batches_forwarded.get() as u64, 2);
    }

    #[tokio::test]
    async fn test_delivered_packets_are_accounted() {
        let globals = test_globals();
        let mut host = ReportHost::new(Arc::clone(&globals), host_conf(8));

        let seen = Arc::new(AtomicU64::new(0));
        host.startup(stub_report(Arc::clone(&seen))).expect("startup");

        host.process_batch(batch_of(3));
        host.process_batch(batch_of(2));

        // The worker serialises ingest; wait for it to drain the queue.
        for _ in 0..100 {
            if seen.load(Ordering::SeqCst) == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 5);

        host.shutdown().await.expect("shutdown");

        let received = globals
            .health()
            .packets_received
            .with_label_values(&["stub"])
            .get();
        assert_eq!(received as u64, 5);
    }
}

mod host;
pub mod messages;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use crate::batch::PacketBatch;
use crate::config::CoordinatorConfig;
use crate::globals::Globals;
use crate::report::Report;
use crate::ticker::TickChannel;

use self::host::{ReportHost, ReportHostConf};
use self::messages::{
    ControlEnvelope, ControlRequest, ControlResponse, CoordinatorFn,
};

/// Ticker subscription name of the coordinator's wake-up tick.
const WAKE_TICK_NAME: &str = "coordinator";

/// Repacker-side handle to the coordinator input queue.
#[derive(Clone)]
pub struct BatchSender {
    tx: mpsc::Sender<Arc<PacketBatch>>,
}

impl BatchSender {
    /// Non-blocking, lossy enqueue. Returns false when the queue is full or
    /// the coordinator has stopped.
    pub fn send(&self, batch: Arc<PacketBatch>) -> bool {
        self.tx.try_send(batch).is_ok()
    }
}

/// Fans inbound packet batches out to a dynamic set of report hosts and
/// services the synchronous control plane.
///
/// All report-host map mutation happens on the coordinator worker while it
/// dispatches control requests; callers only ever hold this handle.
pub struct Coordinator {
    globals: Arc<Globals>,
    conf: CoordinatorConfig,

    input_tx: mpsc::Sender<Arc<PacketBatch>>,
    input_rx: Option<mpsc::Receiver<Arc<PacketBatch>>>,

    control_tx: mpsc::Sender<ControlEnvelope>,
    control_rx: Option<mpsc::Receiver<ControlEnvelope>>,

    worker: Option<JoinHandle<()>>,
}

impl Coordinator {
    /// Binds the input and control queues. Does not start the worker.
    pub fn new(globals: Arc<Globals>, conf: CoordinatorConfig) -> Self {
        let (input_tx, input_rx) = mpsc::channel(conf.input_buffer_capacity.max(1));
        let (control_tx, control_rx) = mpsc::channel(16);

        Self {
            globals,
            conf,
            input_tx,
            input_rx: Some(input_rx),
            control_tx,
            control_rx: Some(control_rx),
            worker: None,
        }
    }

    /// Handle the repacker uses to push batches into the coordinator.
    pub fn batch_sender(&self) -> BatchSender {
        BatchSender {
            tx: self.input_tx.clone(),
        }
    }

    /// Spawns the worker. Returns immediately; fails if called twice.
    pub fn startup(&mut self) -> Result<()> {
        if self.worker.is_some() {
            bail!("coordinator is already started");
        }

        let tick_chan = self
            .globals
            .ticker()
            .subscribe(Duration::from_secs(1), WAKE_TICK_NAME)
            .context("subscribing coordinator wake tick")?;

        let input_rx = self.input_rx.take().expect("startup called more than once");
        let control_rx = self.control_rx.take().expect("startup called more than once");

        let core = CoordinatorCore {
            globals: Arc::clone(&self.globals),
            conf: self.conf.clone(),
            report_hosts: HashMap::new(),
            shutdown: false,
        };

        let span = tracing::info_span!("coordinator");
        self.worker = Some(tokio::spawn(
            run_worker(core, tick_chan, input_rx, control_rx).instrument(span),
        ));

        Ok(())
    }

    /// Generic synchronous control call, usable from any task.
    pub async fn request(&self, request: ControlRequest) -> Result<ControlResponse> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.control_tx
            .send(ControlEnvelope {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow!("coordinator control channel closed"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("coordinator dropped the control reply"))
    }

    /// Runs a closure on the coordinator worker.
    pub async fn call(&self, func: CoordinatorFn) -> Result<ControlResponse> {
        self.request(ControlRequest::Call(func)).await
    }

    /// Creates and starts a report host for `report`, keyed by its name.
    pub async fn add_report(&self, report: Box<dyn Report>) -> Result<ControlResponse> {
        self.request(ControlRequest::AddReport(report)).await
    }

    /// Shuts down and removes the named report.
    pub async fn delete_report(&self, name: &str) -> Result<ControlResponse> {
        self.request(ControlRequest::DeleteReport(name.to_string()))
            .await
    }

    /// Captures a snapshot from the named report.
    pub async fn get_report_snapshot(&self, name: &str) -> Result<ControlResponse> {
        self.request(ControlRequest::GetReportSnapshot(name.to_string()))
            .await
    }

    /// Shuts down every report host and the coordinator worker, joining it
    /// before returning.
    pub async fn shutdown(&mut self) -> Result<()> {
        let response = self.request(ControlRequest::Shutdown).await?;
        if !response.is_ok() {
            bail!("coordinator shutdown failed: {}", response.message());
        }

        if let Some(worker) = self.worker.take() {
            worker.await.context("joining coordinator worker")?;
        }

        Ok(())
    }
}

/// Worker-side coordinator state, exposed to `Call` closures.
pub struct CoordinatorCore {
    globals: Arc<Globals>,
    conf: CoordinatorConfig,
    // report_name -> report host; mutated only on the worker.
    report_hosts: HashMap<String, ReportHost>,
    shutdown: bool,
}

impl CoordinatorCore {
    /// Number of live report hosts.
    pub fn report_count(&self) -> usize {
        self.report_hosts.len()
    }

    /// Names of all live reports.
    pub fn report_names(&self) -> Vec<String> {
        self.report_hosts.keys().cloned().collect()
    }

    /// Whether a live report with this name exists.
    pub fn has_report(&self, name: &str) -> bool {
        self.report_hosts.contains_key(name)
    }

    /// Relays one batch to every live report host. Slow hosts drop.
    fn fan_out(&self, batch: Arc<PacketBatch>) {
        for report_host in self.report_hosts.values() {
            report_host.process_batch(Arc::clone(&batch));
        }
    }

    /// Services one control request and posts exactly one reply. Dispatch
    /// failures become generic error replies; the loop never dies on them.
    async fn handle_control(&mut self, envelope: ControlEnvelope) {
        let ControlEnvelope { request, reply } = envelope;
        let kind = request.kind();

        let response = match self.dispatch(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(request = kind, error = %e, "control request failed");
                ControlResponse::error(e.to_string())
            }
        };

        let outcome = if response.is_ok() { "ok" } else { "error" };
        self.globals
            .health()
            .control_requests
            .with_label_values(&[kind, outcome])
            .inc();

        if reply.send(response).is_err() {
            warn!(request = kind, "control caller went away before the reply");
        }
    }

    async fn dispatch(&mut self, request: ControlRequest) -> Result<ControlResponse> {
        match request {
            ControlRequest::Call(func) => {
                func(self);
                Ok(ControlResponse::ok())
            }

            ControlRequest::Shutdown => {
                for (name, report_host) in self.report_hosts.iter_mut() {
                    report_host
                        .shutdown()
                        .await
                        .with_context(|| format!("shutting down report host for {name}"))?;
                }
                self.report_hosts.clear();
                self.globals.health().reports_active.set(0.0);

                self.shutdown = true;
                Ok(ControlResponse::ok())
            }

            ControlRequest::AddReport(report) => {
                let report_name = report.name().to_string();
                if self.report_hosts.contains_key(&report_name) {
                    bail!("report already exists: {report_name}");
                }

                let thread_id = self.report_hosts.len();
                let conf = ReportHostConf {
                    name: format!("rh/{thread_id}/{report_name}"),
                    thread_name: format!("rh/{thread_id}"),
                    report_name: report_name.clone(),
                    packets_buffer_capacity: self.conf.report_packets_buffer_capacity,
                };

                let mut report_host = ReportHost::new(Arc::clone(&self.globals), conf);
                report_host
                    .startup(report)
                    .with_context(|| format!("starting report host for {report_name}"))?;

                self.report_hosts.insert(report_name.clone(), report_host);
                self.globals
                    .health()
                    .reports_active
                    .set(self.report_hosts.len() as f64);

                info!(report = %report_name, "report added");
                Ok(ControlResponse::ok())
            }

            ControlRequest::DeleteReport(name) => {
                let Some(report_host) = self.report_hosts.get_mut(&name) else {
                    return Ok(ControlResponse::error(format!("unknown report: {name}")));
                };

                // Waits for the host to completely shut itself down.
                report_host
                    .shutdown()
                    .await
                    .with_context(|| format!("shutting down report host for {name}"))?;

                let removed = self.report_hosts.remove(&name);
                debug_assert!(removed.is_some(), "host map entry vanished during delete");
                self.globals
                    .health()
                    .reports_active
                    .set(self.report_hosts.len() as f64);

                info!(report = %name, "report deleted");
                Ok(ControlResponse::ok())
            }

            ControlRequest::GetReportSnapshot(name) => {
                let Some(report_host) = self.report_hosts.get(&name) else {
                    return Ok(ControlResponse::error(format!("unknown report: {name}")));
                };

                let (snapshot_tx, snapshot_rx) = oneshot::channel();
                report_host
                    .call_with_report(Box::new(move |report| {
                        let _ = snapshot_tx.send(report.get_snapshot());
                    }))
                    .await?;

                let snapshot = snapshot_rx
                    .await
                    .context("snapshot closure dropped its result")?;

                Ok(ControlResponse::ReportSnapshot { snapshot })
            }
        }
    }
}

/// Coordinator event loop: wake tick, batch fan-out, control dispatch.
/// Only a `Shutdown` request ends it.
async fn run_worker(
    mut core: CoordinatorCore,
    mut tick_chan: TickChannel,
    mut input_rx: mpsc::Receiver<Arc<PacketBatch>>,
    mut control_rx: mpsc::Receiver<ControlEnvelope>,
) {
    debug!("coordinator worker started");

    while !core.shutdown {
        tokio::select! {
            Some(_) = tick_chan.recv() => {
                // Wake-up only; drain any backlog and move on.
                while tick_chan.try_recv().is_some() {}
            }

            Some(batch) = input_rx.recv() => {
                core.globals.health().batches_received.inc();
                core.fan_out(batch);
            }

            Some(envelope) = control_rx.recv() => {
                core.handle_control(envelope).await;
            }
        }
    }

    core.globals.ticker().unsubscribe(tick_chan);

    debug!("coordinator worker stopped");
}

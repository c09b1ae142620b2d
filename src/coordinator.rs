//! The master↔worker message bus.
//!
//! Workers connect to the master over localhost TCP; frames are
//! length-prefixed JSON. The master keeps all coordination state inside a
//! single event loop fed by per-connection reader tasks, so nothing here
//! needs finer-grained locking than the connection registry itself.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::{SinkExt as _, StreamExt as _};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::{Instant, sleep},
};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::{
    metrics::StatsRegistry,
    prelude::*,
    worker::{WorkerSnapshot, unix_now},
};

/// How many times a worker re-attempts a snapshot delivery.
const SEND_ATTEMPTS: usize = 3;
/// Backoff between delivery attempts.
const SEND_BACKOFF: Duration = Duration::from_millis(500);
/// Broadcasts sent before the master settles into polling.
const SHUTDOWN_BROADCASTS: usize = 3;
/// How long the master waits for stragglers at shutdown.
const SHUTDOWN_POLL_WINDOW: Duration = Duration::from_secs(15);
/// Interval between re-broadcasts while polling.
const SHUTDOWN_REBROADCAST_EVERY: Duration = Duration::from_secs(5);

/// Everything that crosses the master↔worker channel.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    /// Master → workers: produce and send a snapshot now.
    RequestMetrics,
    /// Master → workers: liveness probe.
    WorkerHeartbeat,
    /// Worker → master: a snapshot payload.
    WorkerCustomMetrics(WorkerSnapshot),
    /// Worker → master: acknowledgement paired with a snapshot delivery.
    WorkerMetricsSent {
        worker_id: String,
        pid: u32,
        timestamp: f64,
    },
    /// Worker → master: liveness answer.
    WorkerHeartbeatResponse {
        worker_id: String,
        pid: u32,
        timestamp: f64,
    },
}

fn encode(message: &BusMessage) -> Result<bytes::Bytes> {
    Ok(bytes::Bytes::from(serde_json::to_vec(message)?))
}

fn decode(frame: &[u8]) -> Result<BusMessage> {
    serde_json::from_slice(frame).context("undecodable bus frame")
}

/// What the master remembers about one worker.
#[derive(Clone, Debug, Default)]
pub struct WorkerInfo {
    pub pid: u32,
    pub last_heartbeat: f64,
    pub metrics_count: u64,
    pub last_snapshot: Option<WorkerSnapshot>,
}

/// Totals derived from the received snapshots.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AggregateTotals {
    pub request_count: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// The master's coordination state. Only the master's event loop touches
/// this.
#[derive(Debug, Default)]
pub struct MasterState {
    seen_request_ids: HashSet<String>,
    workers: HashMap<String, WorkerInfo>,
    /// Ordered, append-only log of accepted snapshots.
    snapshots: Vec<WorkerSnapshot>,
}

impl MasterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one inbound message into the state.
    pub fn handle(&mut self, message: BusMessage) {
        match message {
            BusMessage::WorkerCustomMetrics(snapshot) => {
                if !self.seen_request_ids.insert(snapshot.request_id.clone()) {
                    debug!(
                        worker_id = %snapshot.worker_id,
                        request_id = %snapshot.request_id,
                        "duplicate metrics delivery ignored"
                    );
                    return;
                }
                let info = self.workers.entry(snapshot.worker_id.clone()).or_default();
                info.pid = snapshot.pid;
                info.metrics_count += 1;
                info.last_snapshot = Some(snapshot.clone());
                self.snapshots.push(snapshot);
            }
            BusMessage::WorkerMetricsSent { worker_id, pid, .. } => {
                debug!(%worker_id, pid, "metrics delivery acknowledged");
            }
            BusMessage::WorkerHeartbeatResponse {
                worker_id,
                pid,
                timestamp,
            } => {
                let info = self.workers.entry(worker_id).or_default();
                info.pid = pid;
                info.last_heartbeat = timestamp;
            }
            BusMessage::RequestMetrics | BusMessage::WorkerHeartbeat => {
                debug!("master received a master-bound message; ignoring");
            }
        }
    }

    /// How many distinct workers have delivered at least one snapshot.
    pub fn reporting_workers(&self) -> usize {
        self.workers
            .values()
            .filter(|info| info.last_snapshot.is_some())
            .count()
    }

    pub fn worker_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Sum counters over snapshots, deduplicated by worker id. Later
    /// snapshots supersede earlier ones from the same worker because the
    /// counters are cumulative.
    pub fn aggregate(&self) -> AggregateTotals {
        let mut latest: HashMap<&str, &WorkerSnapshot> = HashMap::new();
        for snapshot in &self.snapshots {
            latest.insert(snapshot.worker_id.as_str(), snapshot);
        }
        let mut totals = AggregateTotals::default();
        for snapshot in latest.values() {
            totals.request_count += snapshot.request_count;
            totals.completion_tokens += snapshot.completion_tokens;
            totals.total_tokens += snapshot.total_tokens;
        }
        totals
    }

    /// Fold the endpoint distributions of each worker's latest snapshot
    /// into the master's own stats store. Quantiles come out of the merged
    /// samples there, never out of worker-computed numbers.
    pub fn merge_stats_into(&self, registry: &mut StatsRegistry) {
        let mut latest: HashMap<&str, &WorkerSnapshot> = HashMap::new();
        for snapshot in &self.snapshots {
            latest.insert(snapshot.worker_id.as_str(), snapshot);
        }
        for snapshot in latest.values() {
            registry.merge_wire(&snapshot.stats);
        }
    }
}

/// The master's side of the bus.
pub struct MasterBus {
    inbound_rx: mpsc::UnboundedReceiver<BusMessage>,
    connections: Arc<Mutex<Vec<mpsc::UnboundedSender<BusMessage>>>>,
    port: u16,
}

impl MasterBus {
    /// Bind the coordination channel and start accepting workers.
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .with_context(|| format!("failed to bind coordination port {port}"))?;
        let port = listener.local_addr()?.port();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let connections: Arc<Mutex<Vec<mpsc::UnboundedSender<BusMessage>>>> =
            Arc::new(Mutex::new(Vec::new()));

        let accept_connections = connections.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, peer)) = listener.accept().await else {
                    break;
                };
                debug!(%peer, "worker connected to coordination channel");
                let framed = Framed::new(socket, LengthDelimitedCodec::new());
                let (mut sink, mut stream) = framed.split();

                let (outbound_tx, mut outbound_rx) =
                    mpsc::unbounded_channel::<BusMessage>();
                accept_connections
                    .lock()
                    .expect("lock poisoned")
                    .push(outbound_tx);

                tokio::spawn(async move {
                    while let Some(message) = outbound_rx.recv().await {
                        let Ok(frame) = encode(&message) else { break };
                        if sink.send(frame).await.is_err() {
                            break;
                        }
                    }
                });

                let inbound_tx = inbound_tx.clone();
                tokio::spawn(async move {
                    while let Some(Ok(frame)) = stream.next().await {
                        match decode(&frame) {
                            Ok(message) => {
                                if inbound_tx.send(message).is_err() {
                                    break;
                                }
                            }
                            Err(err) => warn!("dropping bad bus frame: {err}"),
                        }
                    }
                });
            }
        });

        Ok(MasterBus {
            inbound_rx,
            connections,
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Send a message to every connected worker. Dead connections are
    /// pruned as a side effect.
    pub fn broadcast(&self, message: &BusMessage) {
        let mut connections = self.connections.lock().expect("lock poisoned");
        connections.retain(|tx| tx.send(message.clone()).is_ok());
    }

    /// Receive the next inbound message, if any arrives before `deadline`.
    pub async fn recv_until(&mut self, deadline: Instant) -> Option<BusMessage> {
        tokio::select! {
            message = self.inbound_rx.recv() => message,
            _ = tokio::time::sleep_until(deadline) => None,
        }
    }

    /// Drain every message currently queued into `state`.
    pub fn drain_into(&mut self, state: &mut MasterState) {
        while let Ok(message) = self.inbound_rx.try_recv() {
            state.handle(message);
        }
    }
}

/// Shutdown protocol: ask every worker for its final snapshot, tolerate a
/// permanent shortfall, and return once `worker_count` distinct workers
/// reported or the window elapsed.
pub async fn collect_final_metrics(
    bus: &mut MasterBus,
    state: &mut MasterState,
    worker_count: usize,
) {
    for _ in 0..SHUTDOWN_BROADCASTS {
        bus.broadcast(&BusMessage::RequestMetrics);
        sleep(Duration::from_secs(1)).await;
        bus.drain_into(state);
        if state.reporting_workers() >= worker_count {
            return;
        }
    }

    let poll_deadline = Instant::now() + SHUTDOWN_POLL_WINDOW;
    let mut next_rebroadcast = Instant::now() + SHUTDOWN_REBROADCAST_EVERY;
    while Instant::now() < poll_deadline {
        if state.reporting_workers() >= worker_count {
            return;
        }
        if Instant::now() >= next_rebroadcast {
            bus.broadcast(&BusMessage::RequestMetrics);
            next_rebroadcast = Instant::now() + SHUTDOWN_REBROADCAST_EVERY;
        }
        let step = poll_deadline.min(next_rebroadcast);
        if let Some(message) = bus.recv_until(step).await {
            state.handle(message);
        }
    }

    warn!(
        expected = worker_count,
        reporting = state.reporting_workers(),
        reported_ids = ?state.worker_ids(),
        "proceeding with a metrics shortfall at shutdown"
    );
}

/// The worker's side of the bus.
pub struct WorkerBus {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl WorkerBus {
    pub async fn connect(port: u16) -> Result<Self> {
        let socket = TcpStream::connect(("127.0.0.1", port))
            .await
            .with_context(|| format!("failed to reach master on port {port}"))?;
        Ok(WorkerBus {
            framed: Framed::new(socket, LengthDelimitedCodec::new()),
        })
    }

    /// Next master-originated message; `None` when the master went away.
    pub async fn next(&mut self) -> Option<BusMessage> {
        loop {
            match self.framed.next().await? {
                Ok(frame) => match decode(&frame) {
                    Ok(message) => return Some(message),
                    Err(err) => warn!("dropping bad bus frame: {err}"),
                },
                Err(err) => {
                    warn!("coordination channel error: {err}");
                    return None;
                }
            }
        }
    }

    pub async fn send(&mut self, message: &BusMessage) -> Result<()> {
        self.framed
            .send(encode(message)?)
            .await
            .context("failed to send bus message")
    }

    /// Deliver a snapshot, re-attempting with backoff, then acknowledge.
    pub async fn send_snapshot(&mut self, snapshot: WorkerSnapshot) -> Result<()> {
        let worker_id = snapshot.worker_id.clone();
        let pid = snapshot.pid;
        let message = BusMessage::WorkerCustomMetrics(snapshot);
        let mut last_err = None;
        for attempt in 1..=SEND_ATTEMPTS {
            match self.send(&message).await {
                Ok(()) => {
                    self.send(&BusMessage::WorkerMetricsSent {
                        worker_id: worker_id.clone(),
                        pid,
                        timestamp: unix_now(),
                    })
                    .await?;
                    return Ok(());
                }
                Err(err) => {
                    warn!(attempt, "snapshot delivery failed: {err}");
                    last_err = Some(err);
                    sleep(SEND_BACKOFF).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("snapshot delivery failed")))
    }

    pub async fn send_heartbeat(&mut self, worker_id: &str) -> Result<()> {
        self.send(&BusMessage::WorkerHeartbeatResponse {
            worker_id: worker_id.to_owned(),
            pid: std::process::id(),
            timestamp: unix_now(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use crate::metrics::WireStats;

    use super::*;

    fn snapshot(worker_id: &str, seq: u64, requests: u64) -> WorkerSnapshot {
        WorkerSnapshot {
            worker_id: worker_id.to_owned(),
            pid: 100,
            request_id: format!("{worker_id}_{seq}"),
            timestamp: seq as f64,
            request_count: requests,
            completion_tokens: requests * 10,
            total_tokens: requests * 12,
            stats: WireStats::new(),
        }
    }

    #[test]
    fn duplicate_request_ids_are_dropped() {
        let mut state = MasterState::new();
        let payload = snapshot("w1", 1, 500);
        state.handle(BusMessage::WorkerCustomMetrics(payload.clone()));
        state.handle(BusMessage::WorkerCustomMetrics(payload.clone()));
        state.handle(BusMessage::WorkerCustomMetrics(payload));
        assert_eq!(state.aggregate().request_count, 500);
        assert_eq!(state.reporting_workers(), 1);
    }

    #[test]
    fn aggregation_dedups_by_worker_id_not_pid() {
        let mut state = MasterState::new();
        // Two workers that happen to share a PID; distinct worker ids.
        let mut a = snapshot("100_1111", 1, 500);
        let mut b = snapshot("100_2222", 1, 501);
        a.pid = 100;
        b.pid = 100;
        state.handle(BusMessage::WorkerCustomMetrics(a));
        state.handle(BusMessage::WorkerCustomMetrics(b));
        assert_eq!(state.aggregate().request_count, 1001);
    }

    #[test]
    fn later_snapshot_supersedes_earlier_for_same_worker() {
        let mut state = MasterState::new();
        state.handle(BusMessage::WorkerCustomMetrics(snapshot("w1", 1, 100)));
        state.handle(BusMessage::WorkerCustomMetrics(snapshot("w1", 2, 250)));
        let totals = state.aggregate();
        assert_eq!(totals.request_count, 250);
        assert_eq!(totals.completion_tokens, 2500);
    }

    #[test]
    fn heartbeats_update_worker_registry() {
        let mut state = MasterState::new();
        state.handle(BusMessage::WorkerHeartbeatResponse {
            worker_id: "w1".to_owned(),
            pid: 7,
            timestamp: 1234.5,
        });
        assert_eq!(state.workers["w1"].last_heartbeat, 1234.5);
        assert_eq!(state.reporting_workers(), 0);
    }

    #[test]
    fn messages_round_trip_through_the_codec() {
        let original = BusMessage::WorkerCustomMetrics(snapshot("w9", 3, 42));
        let decoded = decode(&encode(&original).unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[tokio::test]
    async fn bus_delivers_requests_and_snapshots() {
        let mut master = MasterBus::bind(0).await.unwrap();
        let mut worker = WorkerBus::connect(master.port()).await.unwrap();

        // Give the accept loop a beat to register the connection.
        sleep(Duration::from_millis(50)).await;
        master.broadcast(&BusMessage::RequestMetrics);
        assert_eq!(worker.next().await, Some(BusMessage::RequestMetrics));

        worker.send_snapshot(snapshot("w1", 1, 77)).await.unwrap();

        let mut state = MasterState::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        while state.reporting_workers() < 1 {
            match master.recv_until(deadline).await {
                Some(message) => state.handle(message),
                None => break,
            }
        }
        assert_eq!(state.aggregate().request_count, 77);
    }
}

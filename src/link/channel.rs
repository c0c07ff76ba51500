use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep, timeout};

use crate::config::LinkConfig;
use crate::link::ack::{AckRecord, AckTracker, STATUS_SENT};
use crate::link::serial::SerialLink;
use crate::message::EmergencyMessage;

/// How long the worker waits on the queue before polling the inbound side.
const DEQUEUE_WAIT: Duration = Duration::from_secs(1);
/// Pause after a failed reconnect attempt.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
/// Entries older than this at the moment of a send error are dropped
/// instead of re-enqueued.
const RESEND_MAX_AGE: Duration = Duration::from_secs(60);
/// Bounded wait for the worker to exit on `stop` before it is aborted.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);
/// Cooperative pacing between worker passes.
const IDLE_PAUSE: Duration = Duration::from_millis(10);
/// Sent/dropped history ring size, oldest evicted first.
const HISTORY_CAP: usize = 50;

const DISPOSITION_SENT: &str = "sent";
const DISPOSITION_DROPPED: &str = "dropped";

struct QueueEntry {
    message: EmergencyMessage,
    enqueued_at: Instant,
}

/// One sent or dropped message, for the presentation layer.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub message: EmergencyMessage,
    pub timestamp: DateTime<Utc>,
    pub disposition: String,
}

/// Read-only snapshot of the channel, safe to take while the link is down.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub connected: bool,
    pub running: bool,
}

/// Reliable-as-possible message transport over a flaky serial-radio link.
///
/// Owns the bounded outbound queue and the single worker task that drains
/// it, reconnecting with backoff whenever the device disappears. Inbound
/// `ack_status` frames are parsed off the same link and recorded in the
/// [`AckTracker`]. Every transport failure funnels into "mark disconnected";
/// the channel is designed to run indefinitely and self-heal.
pub struct TransportChannel {
    link: Arc<Mutex<Box<dyn SerialLink>>>,
    tx: mpsc::Sender<QueueEntry>,
    rx: Mutex<Option<mpsc::Receiver<QueueEntry>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    connected: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    acks: AckTracker,
    history: Arc<RwLock<VecDeque<HistoryEntry>>>,
}

impl TransportChannel {
    pub fn new(config: &LinkConfig, link: Box<dyn SerialLink>) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown, _) = watch::channel(false);

        Self {
            link: Arc::new(Mutex::new(link)),
            tx,
            rx: Mutex::new(Some(rx)),
            worker: Mutex::new(None),
            shutdown,
            connected: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            acks: AckTracker::new(),
            history: Arc::new(RwLock::new(VecDeque::new())),
        }
    }

    /// Open the serial device. Idempotent; failures are logged and returned,
    /// never panicked on.
    pub async fn connect(&self) -> Result<()> {
        let mut link = self.link.lock().await;
        if link.is_open() {
            debug!("radio link already connected");
            self.connected.store(true, Ordering::SeqCst);
            return Ok(());
        }

        match link.open() {
            Ok(()) => {
                self.connected.store(true, Ordering::SeqCst);
                info!("Radio link connected");
                Ok(())
            }
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                error!("Failed to connect radio link: {e:#}");
                Err(e)
            }
        }
    }

    /// Close the serial device if open. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let mut link = self.link.lock().await;
        if link.is_open() {
            link.close();
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Push a message onto the bounded outbound queue without blocking.
    ///
    /// A full queue is backpressure: the caller decides whether to drop or
    /// escalate, the channel just reports it.
    pub fn enqueue(&self, message: EmergencyMessage) -> Result<()> {
        let message_id = message.message_id;
        let entry = QueueEntry {
            message,
            enqueued_at: Instant::now(),
        };

        match self.tx.try_send(entry) {
            Ok(()) => {
                debug!("queued message {message_id}");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("outbound queue full, rejecting message {message_id}");
                Err(anyhow!("outbound queue full"))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(anyhow!("transport channel is shut down"))
            }
        }
    }

    /// Spawn the send/receive worker. Errors if it was already started.
    pub async fn start(&self) -> Result<()> {
        let rx = self
            .rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("transport worker already started"))?;

        self.shutdown.send_replace(false);
        self.running.store(true, Ordering::SeqCst);

        let worker = Worker {
            link: Arc::clone(&self.link),
            tx: self.tx.clone(),
            rx,
            shutdown: self.shutdown.subscribe(),
            connected: Arc::clone(&self.connected),
            acks: self.acks.clone(),
            history: Arc::clone(&self.history),
        };

        let running = Arc::clone(&self.running);
        let handle = tokio::spawn(async move {
            worker.run().await;
            running.store(false, Ordering::SeqCst);
        });
        *self.worker.lock().await = Some(handle);

        info!("Transport worker started");
        Ok(())
    }

    /// Signal the worker to exit, wait a bounded time for it, then close the
    /// device regardless. Entries still queued at this point are dropped;
    /// the worker logs how many.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);

        if let Some(mut handle) = self.worker.lock().await.take() {
            if timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
                warn!("transport worker did not exit within {STOP_TIMEOUT:?}, aborting");
                handle.abort();
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.disconnect().await;
        info!("Transport channel stopped");
    }

    /// Last-known delivery status for a message id, if any was recorded.
    pub async fn ack_status(&self, message_id: i64) -> Option<AckRecord> {
        self.acks.get(message_id).await
    }

    /// Handle to the tracker itself, for collaborators that poll it directly.
    pub fn tracker(&self) -> AckTracker {
        self.acks.clone()
    }

    pub fn status(&self) -> ChannelStatus {
        let capacity = self.tx.max_capacity();
        ChannelStatus {
            queue_depth: capacity - self.tx.capacity(),
            queue_capacity: capacity,
            connected: self.connected.load(Ordering::SeqCst),
            running: self.running.load(Ordering::SeqCst),
        }
    }

    /// The last 50 sent/dropped messages, newest last.
    pub async fn history(&self) -> Vec<HistoryEntry> {
        self.history.read().await.iter().cloned().collect()
    }
}

struct Worker {
    link: Arc<Mutex<Box<dyn SerialLink>>>,
    tx: mpsc::Sender<QueueEntry>,
    rx: mpsc::Receiver<QueueEntry>,
    shutdown: watch::Receiver<bool>,
    connected: Arc<AtomicBool>,
    acks: AckTracker,
    history: Arc<RwLock<VecDeque<HistoryEntry>>>,
}

impl Worker {
    async fn run(mut self) {
        info!("transport worker running");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match timeout(DEQUEUE_WAIT, self.rx.recv()).await {
                Ok(Some(entry)) => {
                    if !self.ensure_connected().await {
                        self.requeue(entry, "reconnect pending").await;
                        tokio::select! {
                            _ = sleep(RECONNECT_BACKOFF) => {}
                            _ = self.shutdown.changed() => {}
                        }
                        continue;
                    }
                    self.send_entry(entry).await;
                }
                Ok(None) => break,
                Err(_) => {} // queue empty this pass
            }

            self.poll_inbound().await;
            sleep(IDLE_PAUSE).await;
        }

        let mut undelivered = 0usize;
        while self.rx.try_recv().is_ok() {
            undelivered += 1;
        }
        if undelivered > 0 {
            warn!("transport worker exiting with {undelivered} undelivered messages");
        }
        info!("transport worker stopped");
    }

    async fn ensure_connected(&mut self) -> bool {
        if self.connected.load(Ordering::SeqCst) {
            return true;
        }

        let mut link = self.link.lock().await;
        match link.open() {
            Ok(()) => {
                self.connected.store(true, Ordering::SeqCst);
                info!("radio link reconnected");
                true
            }
            Err(e) => {
                warn!("radio link unavailable: {e:#}");
                false
            }
        }
    }

    async fn send_entry(&mut self, entry: QueueEntry) {
        let message_id = entry.message.message_id;
        let line = match entry.message.wire_line() {
            Ok(line) => line,
            Err(e) => {
                error!("failed to encode message {message_id}: {e:#}");
                return;
            }
        };

        let written = {
            let mut link = self.link.lock().await;
            link.write_line(&line)
        };

        match written {
            Ok(()) => {
                info!(
                    "sent message {message_id} (code {})",
                    entry.message.emergency_code
                );
                self.acks.upsert(message_id, STATUS_SENT, Value::Null).await;
                self.push_history(entry.message, DISPOSITION_SENT).await;
            }
            Err(e) => {
                warn!("write failed for message {message_id}: {e}");
                self.mark_disconnected().await;

                if entry.enqueued_at.elapsed() < RESEND_MAX_AGE {
                    self.requeue(entry, "write failure").await;
                } else {
                    warn!(
                        "dropping message {message_id} after {:?} in queue",
                        entry.enqueued_at.elapsed()
                    );
                    self.push_history(entry.message, DISPOSITION_DROPPED).await;
                }
            }
        }
    }

    /// Put an entry back at the tail of the queue. If producers refilled the
    /// queue in the meantime the entry is dropped, and the drop is recorded.
    async fn requeue(&mut self, entry: QueueEntry, why: &str) {
        let message_id = entry.message.message_id;
        match self.tx.try_send(entry) {
            Ok(()) => debug!("requeued message {message_id} after {why}"),
            Err(err) => {
                let entry = match err {
                    mpsc::error::TrySendError::Full(entry) => entry,
                    mpsc::error::TrySendError::Closed(entry) => entry,
                };
                warn!("queue unavailable while handling {why}; dropping message {message_id}");
                self.push_history(entry.message, DISPOSITION_DROPPED).await;
            }
        }
    }

    async fn poll_inbound(&mut self) {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }

        let polled = {
            let mut link = self.link.lock().await;
            link.poll_line()
        };

        match polled {
            Ok(Some(line)) => self.handle_frame(&line).await,
            Ok(None) => {}
            Err(e) => {
                warn!("read failed on radio link: {e}");
                self.mark_disconnected().await;
            }
        }
    }

    /// Best-effort protocol: only `ack_status` frames are meaningful, and
    /// nothing the peer emits may crash the bridge.
    async fn handle_frame(&mut self, line: &str) {
        debug!("inbound frame: {line}");

        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(_) => {
                debug!("discarding non-JSON inbound line");
                return;
            }
        };

        if value.get("type").and_then(Value::as_str) != Some("ack_status") {
            debug!("ignoring unrecognized inbound frame");
            return;
        }

        let Some(message_id) = value.get("messageId").and_then(Value::as_i64) else {
            warn!("ack_status frame missing messageId: {line}");
            return;
        };
        let Some(status) = value.get("status").and_then(Value::as_str) else {
            warn!("ack_status frame missing status: {line}");
            return;
        };

        info!("ack status for message {message_id}: {status}");
        self.acks.upsert(message_id, status, value.clone()).await;
    }

    async fn mark_disconnected(&mut self) {
        let mut link = self.link.lock().await;
        link.close();
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn push_history(&self, message: EmergencyMessage, disposition: &str) {
        let mut history = self.history.write().await;
        history.push_back(HistoryEntry {
            message,
            timestamp: Utc::now(),
            disposition: disposition.to_string(),
        });
        while history.len() > HISTORY_CAP {
            history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::link::ack::STATUS_DELIVERED;
    use crate::link::serial::mock::MockLink;
    use crate::message::{ConditionKind, EmergencyMessage};

    fn test_config(queue_capacity: usize) -> LinkConfig {
        LinkConfig {
            queue_capacity,
            ..LinkConfig::default()
        }
    }

    fn fire_message(id: i64) -> EmergencyMessage {
        EmergencyMessage::new("FIRE: 2 fire/smoke instances", ConditionKind::Fire, id)
    }

    /// Wait (in virtual time) until `predicate` holds, or fail the test.
    async fn wait_until(mut predicate: impl FnMut() -> bool) {
        for _ in 0..10_000 {
            if predicate() {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_queue_bound_enforced() {
        let channel = TransportChannel::new(&test_config(10), Box::new(MockLink::default()));

        for i in 0..10 {
            assert!(channel.enqueue(fire_message(i)).is_ok(), "enqueue {i}");
        }
        assert!(channel.enqueue(fire_message(10)).is_err());

        let status = channel.status();
        assert_eq!(status.queue_depth, 10);
        assert_eq!(status.queue_capacity, 10);
        assert!(!status.running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_draining_admits_more() {
        let link = MockLink::default();
        let state = link.state();
        let channel = TransportChannel::new(&test_config(1), Box::new(link));

        assert!(channel.enqueue(fire_message(1)).is_ok());
        assert!(channel.enqueue(fire_message(2)).is_err());

        channel.start().await.expect("start");
        wait_until(|| state.lock().unwrap().written.len() == 1).await;

        assert!(channel.enqueue(fire_message(3)).is_ok());
        channel.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_with_backoff_delivers_once() {
        let link = MockLink::default();
        let state = link.state();
        state.lock().unwrap().fail_opens = 3;
        let channel = TransportChannel::new(&test_config(10), Box::new(link));

        assert!(channel.enqueue(fire_message(1001)).is_ok());
        channel.start().await.expect("start");

        wait_until(|| state.lock().unwrap().written.len() == 1).await;

        // No duplicate send beyond the explicit retry path.
        sleep(Duration::from_secs(10)).await;
        assert_eq!(state.lock().unwrap().written.len(), 1);

        let record = channel.ack_status(1001).await.expect("sent record");
        assert_eq!(record.status, STATUS_SENT);
        assert!(channel.status().connected);

        channel.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_ack_upsert_and_garbage_tolerance() {
        let link = MockLink::default();
        let state = link.state();
        {
            let mut s = state.lock().unwrap();
            s.inbound.push_back("+++noise+++".to_string());
            s.inbound
                .push_back(r#"{"type":"ack_status","messageId":1001,"status":"sent"}"#.to_string());
            s.inbound.push_back(r#"{"type":"telemetry","rssi":-90}"#.to_string());
            s.inbound.push_back(
                r#"{"type":"ack_status","messageId":1001,"status":"delivered","rssi":-87}"#
                    .to_string(),
            );
        }
        let channel = TransportChannel::new(&test_config(10), Box::new(link));
        channel.connect().await.expect("connect");
        channel.start().await.expect("start");

        wait_until(|| state.lock().unwrap().inbound.is_empty()).await;
        let mut record = None;
        for _ in 0..10_000 {
            record = channel.ack_status(1001).await;
            if record.as_ref().is_some_and(|r| r.status == STATUS_DELIVERED) {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }

        let record = record.expect("ack record");
        assert_eq!(record.status, STATUS_DELIVERED);
        assert_eq!(record.details["rssi"], -87);

        channel.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_requeues_young_entry() {
        let link = MockLink::default();
        let state = link.state();
        state.lock().unwrap().fail_writes = 1;
        let channel = TransportChannel::new(&test_config(10), Box::new(link));

        assert!(channel.enqueue(fire_message(7)).is_ok());
        channel.start().await.expect("start");

        wait_until(|| state.lock().unwrap().written.len() == 1).await;

        let history = channel.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].disposition, "sent");

        channel.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_drops_aged_entry() {
        let link = MockLink::default();
        let state = link.state();
        state.lock().unwrap().fail_writes = 1;
        let channel = TransportChannel::new(&test_config(10), Box::new(link));

        assert!(channel.enqueue(fire_message(8)).is_ok());
        // Let the entry age past the retry-eligibility window before the
        // worker ever sees it.
        tokio::time::advance(Duration::from_secs(61)).await;

        channel.start().await.expect("start");
        let mut history = Vec::new();
        for _ in 0..10_000 {
            history = channel.history().await;
            if !history.is_empty() {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(history[0].disposition, "dropped");
        assert!(state.lock().unwrap().written.is_empty());

        channel.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_closes_device_and_reports_status() {
        let link = MockLink::default();
        let state = link.state();
        let channel = TransportChannel::new(&test_config(10), Box::new(link));

        channel.connect().await.expect("connect");
        channel.start().await.expect("start");
        wait_until(|| channel.status().running).await;

        channel.stop().await;

        let status = channel.status();
        assert!(!status.running);
        assert!(!status.connected);
        assert!(!state.lock().unwrap().open);

        // The queue is closed for good after shutdown.
        assert!(channel.enqueue(fire_message(9)).is_err());
    }

    #[tokio::test]
    async fn test_start_twice_is_an_error() {
        let channel = TransportChannel::new(&test_config(10), Box::new(MockLink::default()));
        channel.start().await.expect("first start");
        assert!(channel.start().await.is_err());
        channel.stop().await;
    }
}

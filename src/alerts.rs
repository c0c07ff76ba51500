use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::time::Instant;

use crate::config::AlertConfig;
use crate::detect::{Detector, Frame};
use crate::link::ack::STATUS_DELIVERED;
use crate::link::channel::TransportChannel;
use crate::message::{ConditionKind, EmergencyMessage, MessageIdGen};

/// What `on_detection` did with a reported condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// A new alert occurrence was queued under this message id.
    Sent(i64),
    /// An alert of the same kind is already outstanding; nothing was sent.
    Suppressed,
    /// A different kind holds the slot and this kind's cooldown has not
    /// elapsed since its last send.
    CooldownHeld,
    /// The transport rejected the message (queue full or shut down).
    QueueRejected,
}

/// What one `poll_retry` pass did with the outstanding alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The receiver confirmed delivery; the slot was cleared.
    Acknowledged,
    /// The alert was re-queued under a fresh message id.
    Resent(i64),
    /// The retry attempt could not be queued; it still consumed a retry slot.
    RetryDropped,
    /// Retries are exhausted; the slot was cleared.
    Failed,
}

#[derive(Debug, Clone)]
struct ActiveAlert {
    id: i64,
    kind: ConditionKind,
    details: String,
    sent_at: Instant,
    retry_count: u32,
    acknowledged: bool,
}

/// Read-only view of the outstanding alert, for presentation.
#[derive(Debug, Clone, Serialize)]
pub struct AlertSnapshot {
    pub id: i64,
    pub kind: &'static str,
    pub details: String,
    pub retry_count: u32,
    pub max_retries: u32,
    pub acknowledged: bool,
}

/// Turns raw per-frame detector reports into at most one outstanding
/// emergency message, governed by cooldown and retry rules.
///
/// One instance owns one active-alert slot. For a sustained condition the
/// manager emits at most `1 + max_retries` messages per occurrence, spaced
/// at least the retry interval apart, then gives up observably.
pub struct AlertManager {
    channel: Arc<TransportChannel>,
    config: AlertConfig,
    ids: MessageIdGen,
    active: Option<ActiveAlert>,
    last_sent: HashMap<ConditionKind, Instant>,
}

fn alert_text(kind: ConditionKind, details: &str) -> String {
    format!("{}: {}", kind.label().to_uppercase(), details)
}

impl AlertManager {
    pub fn new(channel: Arc<TransportChannel>, config: AlertConfig) -> Self {
        Self {
            channel,
            config,
            ids: MessageIdGen::new(),
            active: None,
            last_sent: HashMap::new(),
        }
    }

    /// Feed one positive detector report. Decides whether it becomes a new
    /// outgoing message, is suppressed as a duplicate, or is held by a
    /// cooldown.
    pub fn on_detection(&mut self, kind: ConditionKind, details: &str) -> Disposition {
        if let Some(active) = &self.active {
            if active.kind == kind {
                info!(
                    "suppressing duplicate {} alert (message {} outstanding)",
                    kind.label(),
                    active.id
                );
                return Disposition::Suppressed;
            }

            let held = self
                .last_sent
                .get(&kind)
                .is_some_and(|last| last.elapsed() <= self.config.cooldown());
            if held {
                debug!("{} alert held by cooldown", kind.label());
                return Disposition::CooldownHeld;
            }
        }

        self.dispatch(kind, details)
    }

    fn dispatch(&mut self, kind: ConditionKind, details: &str) -> Disposition {
        let id = self.ids.next_id();
        let message = EmergencyMessage::new(alert_text(kind, details), kind, id);

        match self.channel.enqueue(message) {
            Ok(()) => {
                info!("alert raised: {} message {id} ({details})", kind.label());
                let now = Instant::now();
                self.active = Some(ActiveAlert {
                    id,
                    kind,
                    details: details.to_string(),
                    sent_at: now,
                    retry_count: 0,
                    acknowledged: false,
                });
                self.last_sent.insert(kind, now);
                Disposition::Sent(id)
            }
            Err(e) => {
                warn!("could not queue {} alert: {e:#}", kind.label());
                Disposition::QueueRejected
            }
        }
    }

    /// Reconcile the outstanding alert with the acknowledgment tracker and
    /// the retry schedule. Call on a fixed cadence; a no-op when idle.
    pub async fn poll_retry(&mut self) -> Option<RetryOutcome> {
        let current_id = self.active.as_ref()?.id;

        if let Some(record) = self.channel.ack_status(current_id).await {
            if record.status == STATUS_DELIVERED {
                if let Some(active) = self.active.as_mut() {
                    active.acknowledged = true;
                    info!(
                        "{} alert acknowledged as delivered (message {current_id})",
                        active.kind.label()
                    );
                }
                self.active = None;
                return Some(RetryOutcome::Acknowledged);
            }
        }

        let retry_interval = self.config.retry_interval();
        let max_retries = self.config.max_retries;

        let active = self.active.as_mut()?;
        if active.sent_at.elapsed() <= retry_interval {
            return None;
        }

        if active.retry_count >= max_retries {
            warn!(
                "{} alert failed after {} retries (message {})",
                active.kind.label(),
                active.retry_count,
                active.id
            );
            self.active = None;
            return Some(RetryOutcome::Failed);
        }

        // A failed enqueue below still consumes this retry slot, and the
        // timer restarts either way; total attempts stay bounded no matter
        // what state the transport is in.
        active.retry_count += 1;
        active.sent_at = Instant::now();
        let attempt = active.retry_count;

        let new_id = self.ids.next_id();
        let message =
            EmergencyMessage::new(alert_text(active.kind, &active.details), active.kind, new_id);

        match self.channel.enqueue(message) {
            Ok(()) => {
                active.id = new_id;
                info!(
                    "resending {} alert as message {new_id} (attempt {attempt}/{max_retries})",
                    active.kind.label()
                );
                Some(RetryOutcome::Resent(new_id))
            }
            Err(e) => {
                warn!(
                    "retry {attempt}/{max_retries} for {} alert not queued: {e:#}",
                    active.kind.label()
                );
                Some(RetryOutcome::RetryDropped)
            }
        }
    }

    /// Run every detector once over a frame and feed positive reports into
    /// `on_detection`. Detector failures are logged and skipped; an external
    /// model crashing must not take the relay with it.
    pub fn scan(
        &mut self,
        frame: &Frame,
        detectors: &mut [Box<dyn Detector>],
    ) -> Vec<(ConditionKind, Disposition)> {
        let mut outcomes = Vec::new();
        for detector in detectors {
            let kind = detector.kind();
            match detector.detect(frame) {
                Ok(detection) if detection.present => {
                    let disposition = self.on_detection(kind, &detection.details);
                    outcomes.push((kind, disposition));
                }
                Ok(_) => {}
                Err(e) => warn!("{} detector failed on frame: {e:#}", kind.label()),
            }
        }
        outcomes
    }

    pub fn active_alert(&self) -> Option<AlertSnapshot> {
        self.active.as_ref().map(|active| AlertSnapshot {
            id: active.id,
            kind: active.kind.label(),
            details: active.details.clone(),
            retry_count: active.retry_count,
            max_retries: self.config.max_retries,
            acknowledged: active.acknowledged,
        })
    }
}

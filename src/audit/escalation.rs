// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Escalation
//!
//! Critical audit records are escalated to a notification channel. Escalation
//! is fire-and-forget: [`EscalationChannel::escalate`] cannot fail, and
//! delivery problems are logged where they happen.
//!
//! ```text
//! AuditTrail ── escalate() ──→ ChannelEscalation ══ mpsc ══→ EscalationDispatcher ──→ AlertSink
//!                                                             (tokio task)            (webhook)
//! ```
//!
//! ## Shutdown
//!
//! The dispatcher stops on a `tokio_util::sync::CancellationToken`, after
//! delivering whatever is already queued.

use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::Severity;
use crate::storage::AuditRecord;

/// Alert payload sent to operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityAlert {
    pub alert_id: String,
    /// Audit record that raised the alert.
    pub record_id: String,
    pub raised_at: DateTime<Utc>,
    pub action: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl SecurityAlert {
    pub fn from_record(record: &AuditRecord) -> Self {
        Self {
            alert_id: uuid::Uuid::new_v4().to_string(),
            record_id: record.record_id.clone(),
            raised_at: record.timestamp,
            action: record.action.clone(),
            severity: record.severity,
            actor: record.actor.clone(),
            origin: record.origin.clone(),
            resource: record.resource.clone(),
            error_code: record.error_code.clone(),
        }
    }
}

/// Where critical alerts go. Must never block or fail the caller.
pub trait EscalationChannel: Send + Sync {
    fn escalate(&self, alert: SecurityAlert);
}

/// Escalation that only writes the alert to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEscalation;

impl EscalationChannel for LogEscalation {
    fn escalate(&self, alert: SecurityAlert) {
        error!(
            alert_id = %alert.alert_id,
            record_id = %alert.record_id,
            action = %alert.action,
            actor = alert.actor.as_deref().unwrap_or("-"),
            origin = alert.origin.as_deref().unwrap_or("-"),
            "SECURITY ALERT"
        );
    }
}

/// Escalation that queues alerts for an [`EscalationDispatcher`].
#[derive(Debug, Clone)]
pub struct ChannelEscalation {
    tx: mpsc::UnboundedSender<SecurityAlert>,
}

impl ChannelEscalation {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SecurityAlert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EscalationChannel for ChannelEscalation {
    fn escalate(&self, alert: SecurityAlert) {
        if let Err(e) = self.tx.send(alert) {
            warn!(alert_id = %e.0.alert_id, "Escalation dispatcher is gone, alert dropped");
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EscalationError {
    #[error("alert delivery failed: {0}")]
    Delivery(String),

    #[error("alert endpoint rejected delivery with status {0}")]
    Rejected(u16),

    #[error("invalid alert endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Final destination of an alert (webhook, pager, ...).
pub trait AlertSink: Send + Sync {
    fn deliver(
        &self,
        alert: &SecurityAlert,
    ) -> impl Future<Output = Result<(), EscalationError>> + Send;
}

/// Background task delivering queued alerts to a sink.
pub struct EscalationDispatcher<S> {
    rx: mpsc::UnboundedReceiver<SecurityAlert>,
    sink: S,
}

impl<S: AlertSink> EscalationDispatcher<S> {
    pub fn new(rx: mpsc::UnboundedReceiver<SecurityAlert>, sink: S) -> Self {
        Self { rx, sink }
    }

    /// Run until the token is cancelled or every sender is dropped.
    ///
    /// Should be spawned as a background task:
    /// ```rust,ignore
    /// tokio::spawn(dispatcher.run(shutdown.clone()));
    /// ```
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Escalation dispatcher starting");

        loop {
            tokio::select! {
                next = self.rx.recv() => match next {
                    Some(alert) => self.dispatch(alert).await,
                    None => {
                        info!("Escalation channel closed, dispatcher stopping");
                        return;
                    }
                },
                _ = shutdown.cancelled() => {
                    while let Ok(alert) = self.rx.try_recv() {
                        self.dispatch(alert).await;
                    }
                    info!("Escalation dispatcher shutting down");
                    return;
                }
            }
        }
    }

    async fn dispatch(&self, alert: SecurityAlert) {
        match self.sink.deliver(&alert).await {
            Ok(()) => info!(alert_id = %alert.alert_id, action = %alert.action, "Alert delivered"),
            Err(e) => error!(
                alert_id = %alert.alert_id,
                action = %alert.action,
                error = %e,
                "Alert delivery failed"
            ),
        }
    }
}

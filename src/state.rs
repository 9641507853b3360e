// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Framework Wiring
//!
//! [`Framework`] builds every component from a [`FrameworkConfig`] and shares
//! them behind `Arc`s:
//!
//! ```text
//! MemoryStore ─┬─► RateLimiter ─► PermissionGate ─┐
//!              └─► SecureCache ──────────────────┤
//! RedbStore ─────────────────────────────────────┼─► OperationExecutor
//! JsonlAuditStore ─► AuditTrail ─────────────────┘
//! ```
//!
//! Background work (stale sweep, webhook delivery) starts only when
//! [`Framework::spawn_background`] is called from inside a tokio runtime:
//!
//! ```rust,ignore
//! let shutdown = CancellationToken::new();
//! let handles = framework.spawn_background(shutdown.clone());
//! // ...
//! shutdown.cancel();
//! ```

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audit::{
    AuditRecorder, AuditTrail, ChannelEscalation, EscalationChannel, EscalationDispatcher,
    EscalationError, LogEscalation, SecurityAlert, WebhookNotifier,
};
use crate::auth::{
    Authenticator, IdentityError, IdentityProvider, JwtIdentityProvider, PermissionGate,
    RateLimiter,
};
use crate::cache::{CacheSweeper, Cipher, CipherError, SecureCache};
use crate::clock::{Clock, SystemClock};
use crate::config::FrameworkConfig;
use crate::operation::{MetricsRecorder, OperationExecutor};
use crate::storage::{
    AuditStoreError, JsonlAuditStore, MemoryStore, RedbStore, StoragePaths, StoreError,
};

#[derive(Debug, thiserror::Error)]
pub enum FrameworkError {
    #[error("storage: {0}")]
    Storage(#[from] StoreError),

    #[error("audit store: {0}")]
    Audit(#[from] AuditStoreError),

    #[error("cache cipher: {0}")]
    Cipher(#[from] CipherError),

    #[error("identity provider: {0}")]
    Identity(#[from] IdentityError),

    #[error("escalation: {0}")]
    Escalation(#[from] EscalationError),
}

/// Fully wired framework.
pub struct Framework {
    pub clock: Arc<dyn Clock>,
    pub shared: Arc<MemoryStore>,
    pub store: Arc<RedbStore>,
    pub audit_store: Arc<JsonlAuditStore>,
    pub audit: Arc<dyn AuditRecorder>,
    pub limiter: Arc<RateLimiter>,
    pub cache: Arc<SecureCache>,
    pub metrics: Arc<MetricsRecorder>,
    pub executor: Arc<OperationExecutor>,
    /// Present when a JWT secret is configured.
    pub authenticator: Option<Arc<Authenticator>>,
    sweep_interval: std::time::Duration,
    pending_alerts: Option<(UnboundedReceiver<SecurityAlert>, WebhookNotifier)>,
}

impl std::fmt::Debug for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framework")
            .field("executor", &self.executor)
            .field("authenticator", &self.authenticator.is_some())
            .finish_non_exhaustive()
    }
}

impl Framework {
    pub fn build(config: &FrameworkConfig) -> Result<Self, FrameworkError> {
        Self::build_with_clock(config, Arc::new(SystemClock))
    }

    pub fn build_with_clock(
        config: &FrameworkConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, FrameworkError> {
        let paths = StoragePaths::new(&config.data_dir);

        let shared = Arc::new(MemoryStore::new(clock.clone(), config.shared_store_max_bytes));
        let store = Arc::new(RedbStore::open(&paths.database_file())?);
        let audit_store = Arc::new(JsonlAuditStore::open(paths)?);

        let mut pending_alerts = None;
        let escalation: Arc<dyn EscalationChannel> = match &config.webhook {
            Some(webhook) => {
                let notifier = WebhookNotifier::new(webhook.url.clone(), &webhook.secret)?;
                let (channel, rx) = ChannelEscalation::new();
                pending_alerts = Some((rx, notifier));
                Arc::new(channel)
            }
            None => Arc::new(LogEscalation),
        };
        let audit: Arc<dyn AuditRecorder> =
            Arc::new(AuditTrail::new(audit_store.clone(), escalation, clock.clone()));

        let limiter = Arc::new(RateLimiter::new(
            shared.clone(),
            clock.clone(),
            config.rate_limit,
        ));
        let cache = Arc::new(
            SecureCache::new(
                shared.clone(),
                Cipher::from_secret(&config.cache_secret)?,
                clock.clone(),
                config.cache,
            )
            .with_audit(audit.clone()),
        );
        let gate = Arc::new(PermissionGate::new(
            limiter.clone(),
            audit.clone(),
            clock.clone(),
        ));
        let metrics = Arc::new(MetricsRecorder::new());
        let executor = Arc::new(
            OperationExecutor::new(store.clone(), gate, audit.clone())
                .with_metrics(metrics.clone())
                .with_cache(cache.clone())
                .with_limiter(limiter.clone())
                .with_retry_policy(config.retry)
                .with_config(config.executor),
        );

        let authenticator = match &config.jwt {
            Some(jwt) => {
                let provider: Arc<dyn IdentityProvider> = Arc::new(JwtIdentityProvider::new(
                    &jwt.secret,
                    jwt.issuer.as_deref(),
                )?);
                Some(Arc::new(Authenticator::new(
                    provider,
                    limiter.clone(),
                    audit.clone(),
                )))
            }
            None => None,
        };

        info!(
            data_dir = %config.data_dir.display(),
            webhook = pending_alerts.is_some(),
            jwt = authenticator.is_some(),
            "Framework initialized"
        );

        Ok(Self {
            clock,
            shared,
            store,
            audit_store,
            audit,
            limiter,
            cache,
            metrics,
            executor,
            authenticator,
            sweep_interval: config.sweep_interval,
            pending_alerts,
        })
    }

    /// Start the cache sweeper and, when a webhook is configured, the
    /// escalation dispatcher. Calling it twice only starts the dispatcher once.
    pub fn spawn_background(&mut self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(2);

        let sweeper = CacheSweeper::new(self.cache.clone()).with_interval(self.sweep_interval);
        handles.push(tokio::spawn(sweeper.run(shutdown.clone())));

        match self.pending_alerts.take() {
            Some((rx, notifier)) => {
                let dispatcher = EscalationDispatcher::new(rx, notifier);
                handles.push(tokio::spawn(dispatcher.run(shutdown)));
            }
            None => warn!("No webhook configured; critical alerts are only logged"),
        }
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{
        OperationContext, PermissionSet, Principal, RequestMetadata, ResourceDescriptor, Role,
    };
    use crate::config::WebhookSettings;
    use crate::error::OperationError;
    use crate::operation::{CriticalOperation, OperationResult, OperationScope};
    use crate::storage::AuditOutcome;
    use std::time::Duration;

    struct Publish;

    impl CriticalOperation for Publish {
        type Output = String;

        fn operation_type(&self) -> &str {
            "content.publish"
        }

        fn required_permissions(&self) -> PermissionSet {
            ["content.publish"].into_iter().collect()
        }

        fn execute(
            &self,
            scope: &mut OperationScope<'_>,
        ) -> Result<OperationResult<String>, OperationError> {
            scope.put("published", "front-page", &"live")?;
            Ok(OperationResult::valid("live".to_string()))
        }
    }

    fn config(dir: &std::path::Path) -> FrameworkConfig {
        let mut config = FrameworkConfig::with_cache_secret(vec![5u8; 32]);
        config.data_dir = dir.to_path_buf();
        config
    }

    #[test]
    fn wires_a_working_executor() {
        let dir = tempfile::tempdir().unwrap();
        let framework = Framework::build(&config(dir.path())).unwrap();
        assert!(framework.authenticator.is_none());

        let now = framework.clock.now();
        let ctx = OperationContext::new(
            Principal::new("3", now + chrono::Duration::hours(1)),
            Role::Editor.default_permissions(),
            ResourceDescriptor::new("page", "front-page"),
            RequestMetadata::new("192.0.2.1", now),
        );
        let result = framework.executor.execute(&Publish, &ctx).unwrap();
        assert_eq!(result.value, "live");

        let today = now.format("%Y-%m-%d").to_string();
        let records = framework.audit_store.read_events(&today).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, AuditOutcome::Success);
        assert_eq!(
            framework.metrics.snapshot("content.publish").unwrap().successes,
            1
        );
    }

    #[test]
    fn weak_cache_secret_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.cache_secret = vec![1, 2, 3];
        assert!(matches!(
            Framework::build(&config),
            Err(FrameworkError::Cipher(CipherError::WeakSecret))
        ));
    }

    #[test]
    fn jwt_secret_enables_authenticator() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.jwt = Some(crate::config::JwtSettings {
            secret: b"jwt-secret-jwt-secret".to_vec(),
            issuer: None,
        });
        let framework = Framework::build(&config).unwrap();
        assert!(framework.authenticator.is_some());
    }

    #[tokio::test]
    async fn background_tasks_stop_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.webhook = Some(WebhookSettings {
            url: "http://127.0.0.1:9/alerts".parse().unwrap(),
            secret: b"hook".to_vec(),
        });
        let mut framework = Framework::build(&config).unwrap();

        let shutdown = CancellationToken::new();
        let handles = framework.spawn_background(shutdown.clone());
        assert_eq!(handles.len(), 2);
        // The dispatcher is handed out once.
        assert_eq!(framework.spawn_background(shutdown.clone()).len(), 1);

        shutdown.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}

//! Pipeline Coordinator
//!
//! Wires the durable log, the ingress subscriber and the snapshot uploader,
//! and owns their lifecycle.
//!
//! ## Startup
//!
//! The log is opened (and its torn tail recovered) before either worker
//! starts, so the first inbound message always has somewhere to go.
//!
//! ## Shutdown
//!
//! ```text
//! cancel ──► subscriber stops (in-flight append completes)
//!        ──► upload timer stops (no new cycles)
//!        ──► in-flight upload completes
//!        ──► log actor: final flush + fsync
//! ```

use crate::ingress::{
    validate_filter, Backoff, BackoffConfig, IngressSubscriber, SubscriberCounters,
    SubscriberStats, TopicFilterError, Transport,
};
use crate::io::{ProductionRng, Rng};
use crate::log::{spawn_log_actor, LogConfig, LogError, LogHandle, LogStats, LogStore};
use crate::store::ContentStore;
use crate::uploader::{SnapshotUploader, UploaderConfig, UploaderStats};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub topic_pattern: String,
    pub log: LogConfig,
    pub uploader: UploaderConfig,
    pub backoff: BackoffConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            topic_pattern: "sensores/#".to_string(),
            log: LogConfig::default(),
            uploader: UploaderConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl From<&crate::config::BridgeConfig> for PipelineConfig {
    fn from(config: &crate::config::BridgeConfig) -> Self {
        PipelineConfig {
            topic_pattern: config.topic_pattern.clone(),
            log: config.log_config(),
            uploader: config.uploader_config(),
            backoff: config.backoff,
        }
    }
}

/// Error type for pipeline startup
#[derive(Debug)]
pub enum PipelineError {
    InvalidTopic(TopicFilterError),
    /// The log could not be opened
    Log(LogError),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::InvalidTopic(e) => write!(f, "invalid topic pattern: {}", e),
            PipelineError::Log(e) => write!(f, "cannot open log: {}", e),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::InvalidTopic(e) => Some(e),
            PipelineError::Log(e) => Some(e),
        }
    }
}

impl From<LogError> for PipelineError {
    fn from(e: LogError) -> Self {
        PipelineError::Log(e)
    }
}

/// Final counters from every component
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub subscriber: SubscriberStats,
    pub uploader: UploaderStats,
    /// `None` if the log actor was already gone at shutdown
    pub log: Option<LogStats>,
}

/// A running pipeline
pub struct Pipeline {
    cancel: CancellationToken,
    log: LogHandle,
    log_task: JoinHandle<()>,
    uploader: SnapshotUploader,
    uploader_task: JoinHandle<()>,
    subscriber_task: JoinHandle<SubscriberStats>,
    subscriber_counters: Arc<SubscriberCounters>,
}

impl Pipeline {
    /// Open the log and start both workers. Must be called inside a tokio
    /// runtime.
    pub fn start<T, S>(
        config: PipelineConfig,
        transport: T,
        store: Arc<dyn ContentStore>,
        log_store: S,
    ) -> Result<Self, PipelineError>
    where
        T: Transport,
        S: LogStore,
    {
        Self::start_with_rng(config, transport, store, log_store, ProductionRng::new())
    }

    /// Like [`Pipeline::start`], with an explicit RNG for reconnect jitter
    pub fn start_with_rng<T, S, R>(
        config: PipelineConfig,
        transport: T,
        store: Arc<dyn ContentStore>,
        log_store: S,
        rng: R,
    ) -> Result<Self, PipelineError>
    where
        T: Transport,
        S: LogStore,
        R: Rng,
    {
        validate_filter(&config.topic_pattern).map_err(PipelineError::InvalidTopic)?;

        let (log, log_task) = spawn_log_actor(log_store, config.log.clone())?;
        let cancel = CancellationToken::new();

        let subscriber = IngressSubscriber::new(
            transport,
            log.clone(),
            config.topic_pattern.clone(),
            Backoff::new(config.backoff, rng),
        );
        let subscriber_counters = subscriber.counters();
        let subscriber_task = tokio::spawn(subscriber.run(cancel.child_token()));

        let uploader = SnapshotUploader::new(log.clone(), store, config.uploader.clone());
        let uploader_task = tokio::spawn(uploader.clone().run(cancel.child_token()));

        info!(
            topic = %config.topic_pattern,
            log = %config.log.path.display(),
            upload_interval_secs = config.uploader.interval.as_secs_f64(),
            "Pipeline started"
        );

        Ok(Pipeline {
            cancel,
            log,
            log_task,
            uploader,
            uploader_task,
            subscriber_task,
            subscriber_counters,
        })
    }

    pub fn log(&self) -> &LogHandle {
        &self.log
    }

    pub fn uploader(&self) -> &SnapshotUploader {
        &self.uploader
    }

    pub fn subscriber_stats(&self) -> SubscriberStats {
        self.subscriber_counters.snapshot()
    }

    /// Token that stops the pipeline's workers when cancelled.
    /// [`Pipeline::shutdown`] still has to be called to drain.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ordered drain. Returns once the log has been flushed and closed.
    pub async fn shutdown(self) -> PipelineStats {
        info!("Pipeline shutting down");
        self.cancel.cancel();

        let subscriber = match self.subscriber_task.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "Subscriber task ended abnormally");
                self.subscriber_counters.snapshot()
            }
        };

        if let Err(e) = self.uploader_task.await {
            error!(error = %e, "Upload timer task ended abnormally");
        }
        self.uploader.wait_idle().await;
        let uploader = self.uploader.stats();

        let log = self.log.stats().await.ok();
        self.log.shutdown().await;
        if let Err(e) = self.log_task.await {
            error!(error = %e, "Log actor ended abnormally");
        }

        info!(
            received = subscriber.received,
            appended = subscriber.appended,
            dropped = subscriber.dropped,
            uploads = uploader.succeeded,
            upload_failures = uploader.failed,
            last_cid = ?uploader.last_content_id.as_ref().map(|c| c.to_string()),
            "Pipeline stopped"
        );

        PipelineStats {
            subscriber,
            uploader,
            log,
        }
    }

    /// Run until `signal` resolves (or the token is cancelled elsewhere),
    /// then drain
    pub async fn run_until<F>(self, signal: F) -> PipelineStats
    where
        F: Future<Output = ()>,
    {
        let cancelled = self.cancel.clone();
        tokio::select! {
            _ = signal => info!("Termination signal received"),
            _ = cancelled.cancelled() => {}
        }
        self.shutdown().await
    }
}

//! Signal-driven log rotation

use crate::logger::{EventLogger, Sink};
use crate::types::LogFields;
use crate::{GatewayError, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One rotation request. Carries no payload; each one causes exactly one rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationRequest;

/// Cloneable trigger feeding the rotation queue
#[derive(Debug, Clone)]
pub struct RotationHandle {
    tx: mpsc::UnboundedSender<RotationRequest>,
}

impl RotationHandle {
    /// Queue a rotation. Returns `false` once the controller has stopped.
    pub fn request(&self) -> bool {
        self.tx.send(RotationRequest).is_ok()
    }
}

/// Receiving side of the rotation queue
#[derive(Debug)]
pub struct RotationRequests {
    rx: mpsc::UnboundedReceiver<RotationRequest>,
}

impl RotationRequests {
    /// Wait for the next request; `None` when every handle is gone
    pub async fn next(&mut self) -> Option<RotationRequest> {
        self.rx.recv().await
    }
}

/// Create a connected handle/queue pair
pub fn rotation_channel() -> (RotationHandle, RotationRequests) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RotationHandle { tx }, RotationRequests { rx })
}

/// Forward every SIGHUP delivered to the process into `handle` until
/// `shutdown` fires.
#[cfg(unix)]
pub fn forward_hangup(handle: RotationHandle, shutdown: CancellationToken) -> Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())
        .map_err(|e| GatewayError::Rotation(format!("Failed to install SIGHUP handler: {}", e)))?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() || !handle.request() {
                        break;
                    }
                    debug!("SIGHUP received, rotation requested");
                }
            }
        }
    }))
}

/// Log rotation manager.
///
/// Consumes [`RotationRequests`] on a dedicated task and rotates one sink per
/// request. Failures leave the sink on its previous file and are reported
/// through the event logger itself.
pub struct RotationController {
    sink: Arc<dyn Sink>,
    logger: Arc<EventLogger>,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl RotationController {
    /// Create a new controller for `sink`
    pub fn new(sink: Arc<dyn Sink>, logger: Arc<EventLogger>) -> Self {
        Self {
            sink,
            logger,
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Serve rotation requests until the queue closes or `shutdown` fires
    pub async fn start(self: Arc<Self>, mut requests: RotationRequests, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                request = requests.next() => {
                    match request {
                        Some(RotationRequest) => {
                            let _ = self.rotate_once().await;
                        }
                        None => break,
                    }
                }
            }
        }
    }

    /// Spawn [`RotationController::start`] on the runtime
    pub fn spawn(self: &Arc<Self>, requests: RotationRequests, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).start(requests, shutdown))
    }

    /// Rotate immediately, off the async workers
    pub async fn rotate_once(&self) -> Result<Option<PathBuf>> {
        let sink = Arc::clone(&self.sink);
        let result = tokio::task::spawn_blocking(move || sink.rotate())
            .await
            .unwrap_or_else(|e| Err(GatewayError::Rotation(format!("rotation task failed: {}", e))));

        match &result {
            Ok(archive) => {
                self.completed.fetch_add(1, Ordering::SeqCst);
                let mut fields = LogFields::new().with("sink", self.sink.name());
                if let Some(archive) = archive {
                    fields.push("archive", archive.display().to_string());
                }
                self.logger.info_with_fields("log file rotated", fields);
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                self.logger.error_with_fields(
                    "log rotation failed",
                    LogFields::new()
                        .with("sink", self.sink.name())
                        .with("error", e.to_string()),
                );
            }
        }
        result
    }

    /// Rotations completed successfully
    pub fn rotations(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Rotations that failed
    pub fn failures(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }
}

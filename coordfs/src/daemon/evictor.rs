use crate::vfs::state::{FsEvent, FsState};
use crate::vfs::tmp::TempStore;
use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Spawns the eviction loop: every `ttl` it deletes staged files older than
/// `ttl`. It stops when `cancel` fires or the file system leaves the
/// connected state; a failed sweep moves the file system to the error state.
pub fn spawn_evictor(
    temp: Arc<TempStore>,
    ttl: Duration,
    state: Arc<FsState>,
    events: broadcast::Sender<FsEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "temp evictor started on {} (ttl {}ms)",
            temp.root().display(),
            ttl.as_millis()
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(ttl) => {}
            }
            if !state.is_connected() {
                break;
            }
            match temp.sweep(ttl).await {
                Ok(0) => {}
                Ok(n) => debug!("evicted {n} expired temp files"),
                Err(e) => {
                    error!("temp evictor failed, stopping: {e}");
                    state.set_error(format!("temp evictor failed: {e}"));
                    let _ = events.send(FsEvent::EvictorFailed {
                        error: e.to_string(),
                    });
                    break;
                }
            }
        }
        info!("temp evictor stopped");
    })
}

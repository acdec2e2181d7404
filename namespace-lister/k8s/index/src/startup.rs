use crate::Store;
use namespace_lister_core::Synchronizer;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Starts the synchronizer once the index holds the initial state of every watch.
///
/// Until then no access index is published, so listings are not answered from a partial mirror.
pub async fn synchronize_when_ready(
    mut ready: watch::Receiver<bool>,
    sync: Synchronizer<Store>,
    shutdown: CancellationToken,
) {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => {
            debug!("Shut down before the index was ready");
            return;
        }
        indexed = is_indexed(&mut ready) => {
            if !indexed {
                return;
            }
        }
    }

    info!("Starting access cache synchronization");
    sync.start(shutdown);
}

/// Returns false if the index was dropped before becoming ready.
async fn is_indexed(ready: &mut watch::Receiver<bool>) -> bool {
    ready.wait_for(|ready| *ready).await.is_ok()
}

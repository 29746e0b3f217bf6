use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DealerResult;
use crate::platform::PlatformTask;

/// Resource-bookkeeping collaborator. Live wasm tasks are announced here so
/// they contribute to the same accounting as ordinary container tasks.
#[async_trait]
pub trait TaskMonitor: Send + Sync {
    async fn monitor(
        &self,
        task: Arc<dyn PlatformTask>,
        labels: HashMap<String, String>,
    ) -> DealerResult<()>;

    async fn stop(&self, id: &str) -> DealerResult<()>;
}

/// Monitor that discards every notification. Installed when the embedding
/// service has no metrics collector wired up.
pub struct NoopMonitor;

#[async_trait]
impl TaskMonitor for NoopMonitor {
    async fn monitor(
        &self,
        _task: Arc<dyn PlatformTask>,
        _labels: HashMap<String, String>,
    ) -> DealerResult<()> {
        Ok(())
    }

    async fn stop(&self, _id: &str) -> DealerResult<()> {
        Ok(())
    }
}

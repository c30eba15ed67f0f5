use std::time::Duration;

use async_trait::async_trait;
use courier_consumer::{DispatchError, Downstream, Job};
use log::{info, warn};
use serde::{Deserialize, Serialize};

/// Job body understood by the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: u64,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub fail: bool,
}

/// Runs each work item on its own task and reports how it went.
pub struct WorkItemHandler;

#[async_trait]
impl Downstream for WorkItemHandler {
    async fn dispatch(&self, job: Job) -> Result<(), DispatchError> {
        let item: WorkItem = serde_json::from_slice(job.body())
            .map_err(|err| DispatchError::MalformedPayload(err.to_string()))?;
        let Job {
            delivery,
            completion,
            acknowledger,
        } = job;

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(item.duration_ms)).await;
            if item.fail {
                warn!(
                    "Work item {} (delivery {}) failed",
                    item.id, delivery.delivery_tag
                );
                completion.fail();
                if let Some(acknowledger) = acknowledger {
                    acknowledger.nack();
                }
            } else {
                info!(
                    "Work item {} (delivery {}) finished",
                    item.id, delivery.delivery_tag
                );
                completion.succeed();
                if let Some(acknowledger) = acknowledger {
                    acknowledger.ack();
                }
            }
        });
        Ok(())
    }
}

use crate::consumer::{ConsumerContext, consume};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Supervises the reactive consumers as separate tasks so one consumer
/// crashing on a message never takes the others down. Shrinking publishes end
/// sentinels instead of killing tasks, so no in-flight message is dropped
/// mid-handling.
#[derive(Default)]
pub struct ConsumerPool {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ConsumerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn live(&self) -> usize {
        let mut handles = self.handles.lock().await;
        handles.retain(|handle| !handle.is_finished());
        handles.len()
    }

    /// Converge the number of live consumers to `target`. Returns the change
    /// applied (spawned positive, sentinels negative).
    pub async fn resize(&self, target: usize, ctx: &ConsumerContext) -> i64 {
        let live = self.live().await;
        let diff = target as i64 - live as i64;
        if diff > 0 {
            let mut handles = self.handles.lock().await;
            for _ in 0..diff {
                let ctx = ctx.clone();
                handles.push(tokio::spawn(async move {
                    if let Err(e) = consume(&ctx).await {
                        tracing::error!(error = %e, "consumer stopped with a queue error");
                    }
                }));
            }
            tracing::info!(spawned = diff, "spawned reactive consumers");
        } else if diff < 0 {
            for _ in 0..-diff {
                if let Err(e) = ctx.queue.publish_end_sentinel().await {
                    tracing::warn!(error = %e, "failed to publish end sentinel");
                }
            }
            tracing::info!(stopped = -diff, "asked surplus consumers to stop");
        }
        diff
    }
}

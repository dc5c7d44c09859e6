use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use thiserror::Error;

/// Control payload that stops a consumer. Sent by the pool when shrinking and
/// by tests; never produced by the job router.
pub const END_PROCESSING_PAYLOAD: &str = "__END__";

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct JobDetails {
    pub labels: HashSet<String>,
    pub url: String,
}

#[derive(Debug, Error)]
pub enum JobParseError {
    #[error("message is not valid job JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("job url is not a valid URL: {0}")]
    Url(String),

    #[error("job url has no path: {0}")]
    EmptyPath(String),
}

pub fn parse_job_details(payload: &[u8]) -> Result<JobDetails, JobParseError> {
    let details: JobDetails = serde_json::from_slice(payload)?;
    let url = reqwest::Url::parse(&details.url)
        .map_err(|err| JobParseError::Url(format!("{}: {err}", details.url)))?;
    if url.path().is_empty() || url.path() == "/" {
        return Err(JobParseError::EmptyPath(details.url.clone()));
    }
    Ok(details)
}

/// Case-folded subset check: every job label must be one this manager can
/// satisfy.
pub fn labels_supported(labels: &HashSet<String>, supported: &HashSet<String>) -> bool {
    let supported: HashSet<String> = supported.iter().map(|label| label.to_lowercase()).collect();
    labels
        .iter()
        .all(|label| supported.contains(&label.to_lowercase()))
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to connect to the queue: {0}")]
    Connect(String),

    #[error("failed to receive from the queue: {0}")]
    Receive(String),

    #[error("failed to settle a queue message: {0}")]
    Settle(String),

    #[error("failed to publish to the queue: {0}")]
    Publish(String),

    #[error("queue consumer closed")]
    Closed,
}

/// One in-flight message. Dropping a delivery without settling it leaves the
/// message unacknowledged, so the broker redelivers it.
#[async_trait]
pub trait Delivery: Send {
    fn payload(&self) -> &[u8];

    async fn ack(self: Box<Self>) -> Result<(), QueueError>;

    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), QueueError>;
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Blocking receive of the next message.
    async fn receive(&self) -> Result<Box<dyn Delivery>, QueueError>;

    async fn depth(&self) -> Result<u64, QueueError>;

    async fn publish_end_sentinel(&self) -> Result<(), QueueError>;
}

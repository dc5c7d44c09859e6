use crate::cloud::{
    CloudError, CloudProvider, CloudRunnerInstance, CloudStatus, SshError, SshOutput, SshSession,
};
use crate::metrics::{Event, EventKind, MetricError, MetricSink};
use crate::model::{InstanceId, PlatformKind, RunnerIdentity, RunnerMetadata};
use crate::platform::{
    Credential, PlatformError, PlatformProvider, PlatformRunner, PlatformRunnerHealth,
    RunnersHealthResponse,
};
use crate::queue::{Delivery, JobQueue, QueueError};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn test_metadata() -> RunnerMetadata {
    RunnerMetadata {
        platform: PlatformKind::HostedVcs,
        runner_id: None,
        url: "https://platform.example".to_string(),
    }
}

// --- cloud ---

#[derive(Default)]
pub struct FakeCloudState {
    pub instances: Vec<CloudRunnerInstance>,
    pub launched: Vec<InstanceId>,
    pub deleted: Vec<InstanceId>,
    pub cleanup_calls: usize,
    pub fail_launch: bool,
    pub fail_ssh: bool,
}

pub struct FakeCloud {
    prefix: String,
    pub state: Mutex<FakeCloudState>,
    pub ssh_commands: Arc<Mutex<Vec<String>>>,
}

impl FakeCloud {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            state: Mutex::new(FakeCloudState::default()),
            ssh_commands: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn active_instance(instance_id: &InstanceId, age_minutes: i64) -> CloudRunnerInstance {
        CloudRunnerInstance {
            instance_id: instance_id.clone(),
            server_id: format!("srv-{instance_id}"),
            status: CloudStatus::Active,
            created_at: Some(Utc::now() - ChronoDuration::minutes(age_minutes)),
            ssh_address: Some("10.0.0.9".to_string()),
        }
    }

    pub fn seed(&self, instance: CloudRunnerInstance) {
        self.state.lock().unwrap().instances.push(instance);
    }

    pub fn launched(&self) -> Vec<InstanceId> {
        self.state.lock().unwrap().launched.clone()
    }

    pub fn deleted(&self) -> Vec<InstanceId> {
        self.state.lock().unwrap().deleted.clone()
    }
}

#[async_trait]
impl CloudProvider for FakeCloud {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn launch(
        &self,
        instance_id: &InstanceId,
        _user_data: &str,
    ) -> Result<CloudRunnerInstance, CloudError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_launch {
            return Err(CloudError::Launch {
                instance_id: instance_id.clone(),
                reason: "quota exceeded".to_string(),
            });
        }
        let instance = Self::active_instance(instance_id, 0);
        state.launched.push(instance_id.clone());
        state.instances.push(instance.clone());
        Ok(instance)
    }

    async fn list(&self) -> Result<Vec<CloudRunnerInstance>, CloudError> {
        Ok(self.state.lock().unwrap().instances.clone())
    }

    async fn delete(&self, instance_id: &InstanceId) -> Result<(), CloudError> {
        let mut state = self.state.lock().unwrap();
        state.deleted.push(instance_id.clone());
        state
            .instances
            .retain(|instance| instance.instance_id != *instance_id);
        Ok(())
    }

    async fn open_ssh(
        &self,
        _instance: &CloudRunnerInstance,
    ) -> Result<Box<dyn SshSession>, CloudError> {
        if self.state.lock().unwrap().fail_ssh {
            return Err(CloudError::Ssh(SshError::NoAddress));
        }
        Ok(Box::new(FakeSsh {
            commands: Arc::clone(&self.ssh_commands),
        }))
    }

    async fn cleanup(&self) -> Result<(), CloudError> {
        self.state.lock().unwrap().cleanup_calls += 1;
        Ok(())
    }
}

pub struct FakeSsh {
    commands: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl SshSession for FakeSsh {
    async fn run(&mut self, command: &str, _timeout: Duration) -> Result<SshOutput, SshError> {
        self.commands.lock().unwrap().push(command.to_string());
        Ok(SshOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn read_file(&mut self, _path: &str, _timeout: Duration) -> Result<Vec<u8>, SshError> {
        Ok(b"1700000000".to_vec())
    }
}

// --- platform ---

#[derive(Clone, Copy, Debug)]
pub struct HealthScript {
    pub online: bool,
    pub busy: bool,
    pub deletable: bool,
}

impl HealthScript {
    pub const OFFLINE: HealthScript = HealthScript {
        online: false,
        busy: false,
        deletable: false,
    };
    pub const IDLE: HealthScript = HealthScript {
        online: true,
        busy: false,
        deletable: false,
    };
    pub const BUSY: HealthScript = HealthScript {
        online: true,
        busy: true,
        deletable: false,
    };
    pub const DELETABLE: HealthScript = HealthScript {
        online: true,
        busy: false,
        deletable: true,
    };
}

#[derive(Default)]
struct FakePlatformState {
    issued: Vec<RunnerIdentity>,
    deleted: Vec<RunnerIdentity>,
    fail_issue: bool,
    // Per-runner health scripts keyed by name; the last entry repeats.
    health: HashMap<String, VecDeque<HealthScript>>,
    failed_queries: Vec<String>,
    non_requested: Vec<RunnerIdentity>,
    dispatched: VecDeque<bool>,
    dispatch_checks: usize,
}

#[derive(Default)]
pub struct FakePlatform {
    state: Mutex<FakePlatformState>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_issue(&self) {
        self.state.lock().unwrap().fail_issue = true;
    }

    /// Health returned to every poll for `name`; the last script entry
    /// repeats once the sequence is exhausted.
    pub fn script_health(&self, name: &str, script: &[HealthScript]) {
        self.state
            .lock()
            .unwrap()
            .health
            .insert(name.to_string(), script.iter().copied().collect());
    }

    pub fn script_health_for_new_runners(&self, script: HealthScript) {
        // Registered under a reserved key consulted when no per-name script
        // exists.
        self.script_health("*", &[script]);
    }

    pub fn fail_query(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .failed_queries
            .push(name.to_string());
    }

    pub fn add_ghost(&self, identity: RunnerIdentity) {
        self.state.lock().unwrap().non_requested.push(identity);
    }

    pub fn script_dispatched(&self, script: &[bool]) {
        self.state.lock().unwrap().dispatched = script.iter().copied().collect();
    }

    pub fn issued(&self) -> Vec<RunnerIdentity> {
        self.state.lock().unwrap().issued.clone()
    }

    pub fn deleted(&self) -> Vec<RunnerIdentity> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn dispatch_checks(&self) -> usize {
        self.state.lock().unwrap().dispatch_checks
    }

    fn next_health(state: &mut FakePlatformState, name: &str) -> Option<HealthScript> {
        let key = if state.health.contains_key(name) { name } else { "*" };
        let script = state.health.get_mut(key)?;
        if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().copied()
        }
    }
}

#[async_trait]
impl PlatformProvider for FakePlatform {
    async fn issue_credential(
        &self,
        identity: &RunnerIdentity,
        _labels: &[String],
    ) -> Result<(Credential, PlatformRunner), PlatformError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_issue {
            return Err(PlatformError::Transient("registration unavailable".into()));
        }
        let registered = RunnerIdentity {
            instance_id: identity.instance_id.clone(),
            metadata: identity.metadata.with_runner_id("99"),
        };
        state.issued.push(registered.clone());
        Ok((
            Credential::new("one-time-token"),
            PlatformRunner {
                identity: registered,
            },
        ))
    }

    async fn get_runner_health(
        &self,
        identity: &RunnerIdentity,
    ) -> Result<PlatformRunnerHealth, PlatformError> {
        let name = identity.instance_id.to_string();
        let mut state = self.state.lock().unwrap();
        if state.failed_queries.contains(&name) {
            return Err(PlatformError::Transient("health query failed".into()));
        }
        Ok(match Self::next_health(&mut state, &name) {
            Some(script) => PlatformRunnerHealth {
                identity: identity.clone(),
                online: script.online,
                busy: script.busy,
                deletable: script.deletable,
            },
            None => PlatformRunnerHealth::not_found(identity.clone()),
        })
    }

    async fn get_runners_health(
        &self,
        identities: &[RunnerIdentity],
    ) -> Result<RunnersHealthResponse, PlatformError> {
        let mut state = self.state.lock().unwrap();
        let mut response = RunnersHealthResponse {
            non_requested: state.non_requested.clone(),
            ..Default::default()
        };
        for identity in identities {
            let name = identity.instance_id.to_string();
            if state.failed_queries.contains(&name) {
                response.failed_requested.push(identity.clone());
                continue;
            }
            match Self::next_health(&mut state, &name) {
                Some(script) => response.requested.push(PlatformRunnerHealth {
                    identity: identity.clone(),
                    online: script.online,
                    busy: script.busy,
                    deletable: script.deletable,
                }),
                None => response
                    .requested
                    .push(PlatformRunnerHealth::not_found(identity.clone())),
            }
        }
        Ok(response)
    }

    async fn delete_runner(&self, identity: &RunnerIdentity) -> Result<(), PlatformError> {
        self.state.lock().unwrap().deleted.push(identity.clone());
        Ok(())
    }

    async fn check_job_dispatched(
        &self,
        _metadata: &RunnerMetadata,
        _job_url: &str,
    ) -> Result<bool, PlatformError> {
        let mut state = self.state.lock().unwrap();
        state.dispatch_checks += 1;
        Ok(if state.dispatched.len() > 1 {
            state.dispatched.pop_front().unwrap_or(false)
        } else {
            state.dispatched.front().copied().unwrap_or(false)
        })
    }

    async fn get_removal_token(&self) -> Result<String, PlatformError> {
        Ok("remove-token".to_string())
    }
}

// --- metrics ---

#[derive(Default)]
pub struct MemorySink {
    pub events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(Event::kind)
            .collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.kinds().iter().filter(|k| **k == kind).count()
    }
}

impl MetricSink for MemorySink {
    fn issue(&self, event: Event) -> Result<(), MetricError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

// --- queue ---

#[derive(Default)]
pub struct FakeQueueState {
    pub messages: VecDeque<String>,
    pub acked: Vec<String>,
    pub rejected: Vec<(String, bool)>,
    pub sentinels_published: usize,
    pub depth: u64,
    pub pending_when_empty: bool,
}

#[derive(Default)]
pub struct FakeQueue {
    pub state: Arc<Mutex<FakeQueueState>>,
}

impl FakeQueue {
    pub fn new(messages: &[&str]) -> Self {
        let queue = Self::default();
        {
            let mut state = queue.state.lock().unwrap();
            state.messages = messages.iter().map(|m| m.to_string()).collect();
            state.depth = messages.len() as u64;
        }
        queue
    }

    /// A queue whose receive blocks when drained instead of erroring, for
    /// tests that need long-lived consumers.
    pub fn pending(messages: &[&str]) -> Self {
        let queue = Self::new(messages);
        queue.state.lock().unwrap().pending_when_empty = true;
        queue
    }

    pub fn set_depth(&self, depth: u64) {
        self.state.lock().unwrap().depth = depth;
    }

    pub fn sentinels_published(&self) -> usize {
        self.state.lock().unwrap().sentinels_published
    }

    pub fn acked(&self) -> Vec<String> {
        self.state.lock().unwrap().acked.clone()
    }

    pub fn rejected(&self) -> Vec<(String, bool)> {
        self.state.lock().unwrap().rejected.clone()
    }
}

#[async_trait]
impl JobQueue for FakeQueue {
    async fn receive(&self) -> Result<Box<dyn Delivery>, QueueError> {
        loop {
            let pending = {
                let mut state = self.state.lock().unwrap();
                match state.messages.pop_front() {
                    Some(payload) => {
                        return Ok(Box::new(FakeDelivery {
                            payload,
                            state: Arc::clone(&self.state),
                        }));
                    }
                    None => state.pending_when_empty,
                }
            };
            if !pending {
                return Err(QueueError::Closed);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.state.lock().unwrap().depth)
    }

    async fn publish_end_sentinel(&self) -> Result<(), QueueError> {
        self.state.lock().unwrap().sentinels_published += 1;
        Ok(())
    }
}

struct FakeDelivery {
    payload: String,
    state: Arc<Mutex<FakeQueueState>>,
}

#[async_trait]
impl Delivery for FakeDelivery {
    fn payload(&self) -> &[u8] {
        self.payload.as_bytes()
    }

    async fn ack(self: Box<Self>) -> Result<(), QueueError> {
        self.state.lock().unwrap().acked.push(self.payload.clone());
        Ok(())
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), QueueError> {
        self.state
            .lock()
            .unwrap()
            .rejected
            .push((self.payload.clone(), requeue));
        Ok(())
    }
}

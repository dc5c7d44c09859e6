use crate::cloud::{
    CloudError, CloudProvider, CloudRunnerInstance, CloudStatus, SshError, SshOutput, SshSession,
};
use crate::config::CloudConfig;
use crate::model::InstanceId;
use async_trait::async_trait;
use base64::prelude::*;
use chrono::{DateTime, TimeDelta, Utc};
use openstack_sdk::{
    AsyncOpenStack,
    api::{
        self, QueryAsync,
        compute::v2::server::{create_20, delete, list_detailed},
    },
    auth::AuthState,
    config::ConfigFile,
    types::ServiceType,
};
use serde::Deserialize;
use std::borrow::Cow;
use std::collections::HashMap;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::instrument;

#[derive(Debug, Error)]
pub enum OpenStackError {
    #[error("openstack profile not found: {0}")]
    Profile(String),

    #[error(transparent)]
    Config(#[from] openstack_sdk::config::ConfigError),

    #[error("failed to build network request")]
    BuildNetworkRequest(#[from] create_20::NetworksBuilderError),

    #[error("failed to build server request")]
    BuildServerRequest(#[from] create_20::ServerBuilderError),

    #[error("failed to build request")]
    BuildRequest(#[from] create_20::RequestBuilderError),

    #[error("failed to build server list request")]
    BuildServerListRequest(#[from] list_detailed::RequestBuilderError),

    #[error("failed to build server deletion request")]
    BuildServerDeletionRequest(#[from] delete::RequestBuilderError),

    #[error(transparent)]
    Api(#[from] openstack_sdk::api::ApiError<openstack_sdk::RestError>),

    #[error(transparent)]
    OpenStack(#[from] openstack_sdk::OpenStackError),
}

/// Deserialization targets for the compute API; only the fields the
/// reconciler joins on.
#[derive(Clone, Debug, Deserialize)]
struct ServerDetail {
    id: String,
    name: String,
    status: Option<String>,
    created: Option<String>,
    addresses: Option<HashMap<String, Vec<ServerAddress>>>,
}

#[derive(Clone, Debug, Deserialize)]
struct ServerAddress {
    addr: String,
    version: Option<u8>,
}

#[derive(Deserialize)]
struct CreatedServer {
    id: String,
}

impl ServerDetail {
    fn ssh_address(&self) -> Option<String> {
        let networks = self.addresses.as_ref()?;
        networks
            .values()
            .flatten()
            .find(|address| address.version.unwrap_or(4) == 4)
            .map(|address| address.addr.clone())
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        let created = self.created.as_deref()?;
        match DateTime::parse_from_rfc3339(created) {
            Ok(dt) => Some(dt.with_timezone(&Utc)),
            Err(e) => {
                tracing::warn!(error = %e, server = %self.name, "invalid server creation time");
                None
            }
        }
    }
}

pub struct OpenStackCloud {
    prefix: String,
    config: CloudConfig,
    session: Mutex<AsyncOpenStack>,
}

impl OpenStackCloud {
    pub async fn connect(prefix: &str, config: CloudConfig) -> Result<Self, OpenStackError> {
        let profile = match ConfigFile::new()?.get_cloud_config(&config.auth)? {
            Some(profile) => profile,
            None => return Err(OpenStackError::Profile(config.auth.clone())),
        };
        let mut session = AsyncOpenStack::new(&profile).await?;
        session
            .discover_service_endpoint(&ServiceType::Compute)
            .await?;
        Ok(Self {
            prefix: prefix.to_string(),
            config,
            session: Mutex::new(session),
        })
    }

    async fn session(&self) -> Result<MutexGuard<'_, AsyncOpenStack>, OpenStackError> {
        let mut session = self.session.lock().await;
        match session.get_auth_state(Some(TimeDelta::seconds(10))) {
            Some(AuthState::Expired) | Some(AuthState::AboutToExpire) => {
                session.authorize(None, false, true).await?;
                session
                    .discover_service_endpoint(&ServiceType::Compute)
                    .await?;
            }
            _ => {}
        }
        Ok(session)
    }

    #[instrument(skip(self))]
    async fn list_servers(&self) -> Result<Vec<ServerDetail>, OpenStackError> {
        let session = self.session().await?;
        let ep = list_detailed::Request::builder().build().map_err(|e| {
            tracing::error!(error = %e, "failed to build server list request");
            e
        })?;
        let servers: Vec<ServerDetail> = ep.query_async(&*session).await.map_err(|e| {
            tracing::error!(error = %e, "failed to query server list");
            e
        })?;
        let scope = format!("{}-", self.prefix);
        Ok(servers
            .into_iter()
            .filter(|server| server.name.starts_with(&scope))
            .collect())
    }

    #[instrument(skip(self, user_data), fields(name = %instance_id))]
    async fn launch_server(
        &self,
        instance_id: &InstanceId,
        image: &str,
        flavor: &str,
        network: &str,
        user_data: &str,
    ) -> Result<String, OpenStackError> {
        let name = instance_id.to_string();
        let ep = create_20::Request::builder()
            .server(
                create_20::ServerBuilder::default()
                    .name(name.as_str())
                    .image_ref(image)
                    .flavor_ref(flavor)
                    .networks(vec![
                        create_20::NetworksBuilder::default().uuid(network).build()?,
                    ])
                    .key_name(self.config.key_name.as_str())
                    .user_data(Some(Cow::Owned(BASE64_STANDARD.encode(user_data))))
                    .build()?,
            )
            .build()?;

        let session = self.session().await?;
        let created: CreatedServer = ep.query_async(&*session).await?;
        tracing::info!(server_id = %created.id, "successfully spawned server");
        Ok(created.id)
    }

    #[instrument(skip(self))]
    async fn delete_server(&self, server_id: &str) -> Result<(), OpenStackError> {
        let session = self.session().await?;
        let ep = delete::Request::builder().id(server_id).build()?;
        match api::ignore(ep).query_async(&*session).await {
            Ok(()) => Ok(()),
            // A server deleted underneath us is the outcome we wanted.
            Err(e) if is_gone(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn to_instance(&self, server: &ServerDetail) -> Option<CloudRunnerInstance> {
        let instance_id = match InstanceId::parse(&server.name) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, server = %server.name, "skipping unparsable server name");
                return None;
            }
        };
        Some(CloudRunnerInstance {
            instance_id,
            server_id: server.id.clone(),
            status: server
                .status
                .as_deref()
                .map(CloudStatus::from_server_status)
                .unwrap_or(CloudStatus::Unknown),
            created_at: server.created_at(),
            ssh_address: server.ssh_address(),
        })
    }
}

fn is_gone(err: &openstack_sdk::api::ApiError<openstack_sdk::RestError>) -> bool {
    let msg = err.to_string();
    msg.contains("404") || msg.to_ascii_lowercase().contains("not found")
}

#[async_trait]
impl CloudProvider for OpenStackCloud {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn launch(
        &self,
        instance_id: &InstanceId,
        user_data: &str,
    ) -> Result<CloudRunnerInstance, CloudError> {
        let (Some(image), Some(flavor), Some(network)) = (
            self.config.image.as_deref(),
            self.config.flavor.as_deref(),
            self.config.network.as_deref(),
        ) else {
            return Err(CloudError::MissingServerConfig);
        };
        let server_id = self
            .launch_server(instance_id, image, flavor, network, user_data)
            .await
            .map_err(|e| CloudError::Launch {
                instance_id: instance_id.clone(),
                reason: e.to_string(),
            })?;
        Ok(CloudRunnerInstance {
            instance_id: instance_id.clone(),
            server_id,
            status: CloudStatus::Building,
            created_at: Some(Utc::now()),
            ssh_address: None,
        })
    }

    async fn list(&self) -> Result<Vec<CloudRunnerInstance>, CloudError> {
        let servers = self
            .list_servers()
            .await
            .map_err(|e| CloudError::List(e.to_string()))?;
        Ok(servers
            .iter()
            .filter_map(|server| self.to_instance(server))
            .collect())
    }

    async fn delete(&self, instance_id: &InstanceId) -> Result<(), CloudError> {
        let servers = self
            .list_servers()
            .await
            .map_err(|e| CloudError::List(e.to_string()))?;
        let name = instance_id.to_string();
        let Some(server) = servers.iter().find(|server| server.name == name) else {
            tracing::debug!(instance = %name, "server already absent, nothing to delete");
            return Ok(());
        };
        self.delete_server(&server.id)
            .await
            .map_err(|e| CloudError::Delete {
                instance_id: instance_id.clone(),
                reason: e.to_string(),
            })
    }

    async fn open_ssh(
        &self,
        instance: &CloudRunnerInstance,
    ) -> Result<Box<dyn SshSession>, CloudError> {
        let Some(address) = instance.ssh_address.clone() else {
            return Err(CloudError::Ssh(SshError::NoAddress));
        };
        Ok(Box::new(Ssh2Session {
            address,
            user: self.config.ssh_user.clone(),
            key_file: self.config.ssh_key_file.clone(),
        }))
    }

    #[instrument(skip(self), fields(prefix = %self.prefix))]
    async fn cleanup(&self) -> Result<(), CloudError> {
        let servers = self
            .list_servers()
            .await
            .map_err(|e| CloudError::List(e.to_string()))?;
        for server in servers {
            let status = server
                .status
                .as_deref()
                .map(CloudStatus::from_server_status)
                .unwrap_or(CloudStatus::Unknown);
            if matches!(status, CloudStatus::Error | CloudStatus::Deleted) {
                tracing::info!(server = %server.name, ?status, "reclaiming dead server");
                if let Err(e) = self.delete_server(&server.id).await {
                    tracing::warn!(error = %e, server = %server.name, "failed to reclaim server");
                }
            }
        }
        Ok(())
    }
}

struct Ssh2Session {
    address: String,
    user: String,
    key_file: PathBuf,
}

impl Ssh2Session {
    fn connect(
        address: &str,
        user: &str,
        key_file: &Path,
        timeout: Duration,
    ) -> Result<ssh2::Session, SshError> {
        let target = format!("{address}:22");
        let addr = target
            .to_socket_addrs()
            .map_err(|e| SshError::Connect {
                addr: target.clone(),
                source: e,
            })?
            .next()
            .ok_or(SshError::NoAddress)?;
        let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| SshError::Connect {
            addr: target.clone(),
            source: e,
        })?;
        let mut session = ssh2::Session::new().map_err(SshError::Auth)?;
        session.set_tcp_stream(tcp);
        session.set_timeout(timeout.as_millis() as u32);
        session.handshake().map_err(SshError::Auth)?;
        session
            .userauth_pubkey_file(user, None, key_file, None)
            .map_err(SshError::Auth)?;
        Ok(session)
    }

    fn run_blocking(
        address: &str,
        user: &str,
        key_file: &Path,
        command: &str,
        timeout: Duration,
    ) -> Result<SshOutput, SshError> {
        let session = Self::connect(address, user, key_file, timeout)?;
        let mut channel = session.channel_session().map_err(SshError::Exec)?;
        channel.exec(command).map_err(SshError::Exec)?;
        let mut stdout = String::new();
        channel
            .read_to_string(&mut stdout)
            .map_err(|_| SshError::Timeout(timeout))?;
        let mut stderr = String::new();
        channel
            .stderr()
            .read_to_string(&mut stderr)
            .map_err(|_| SshError::Timeout(timeout))?;
        channel.wait_close().map_err(SshError::Exec)?;
        let exit_code = channel.exit_status().map_err(SshError::Exec)?;
        Ok(SshOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    fn read_file_blocking(
        address: &str,
        user: &str,
        key_file: &Path,
        path: &str,
        timeout: Duration,
    ) -> Result<Vec<u8>, SshError> {
        let session = Self::connect(address, user, key_file, timeout)?;
        let (mut remote, _stat) = session
            .scp_recv(Path::new(path))
            .map_err(SshError::Exec)?;
        let mut contents = Vec::new();
        remote
            .read_to_end(&mut contents)
            .map_err(|_| SshError::Timeout(timeout))?;
        Ok(contents)
    }
}

#[async_trait]
impl SshSession for Ssh2Session {
    async fn run(&mut self, command: &str, timeout: Duration) -> Result<SshOutput, SshError> {
        let (address, user, key_file) =
            (self.address.clone(), self.user.clone(), self.key_file.clone());
        let command = command.to_string();
        tokio::task::spawn_blocking(move || {
            Self::run_blocking(&address, &user, &key_file, &command, timeout)
        })
        .await
        .map_err(|e| SshError::Task(e.to_string()))?
    }

    async fn read_file(&mut self, path: &str, timeout: Duration) -> Result<Vec<u8>, SshError> {
        let (address, user, key_file) =
            (self.address.clone(), self.user.clone(), self.key_file.clone());
        let path = path.to_string();
        tokio::task::spawn_blocking(move || {
            Self::read_file_blocking(&address, &user, &key_file, &path, timeout)
        })
        .await
        .map_err(|e| SshError::Task(e.to_string()))?
    }
}

use crate::config::SupportConfig;
use crate::platform::Credential;
use rand::prelude::IndexedRandom;
use serde::Serialize;

pub const METRICS_EXCHANGE_PATH: &str = "/home/ubuntu/metrics-exchange";

const START_SCRIPT_PATH: &str = "/start-runner.sh";

#[derive(Debug, Serialize)]
pub struct Data {
    pub write_files: Vec<WriteFile>,
    pub runcmd: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct WriteFile {
    pub path: String,
    pub content: String,
    pub permissions: String,
}

impl Data {
    /// Render the first-boot script. The credential is embedded verbatim;
    /// this payload must only ever travel to the instance it was minted for.
    pub fn build(
        credential: &Credential,
        support: &SupportConfig,
        repo_policy_token: Option<&str>,
    ) -> Self {
        let template = include_str!("../templates/runner-userdata.sh");
        let ssh_debug = support.ssh_debug_endpoints.choose(&mut rand::rng());
        let aproxy_address = if support.use_aproxy {
            support.http_proxy.as_deref().unwrap_or_default()
        } else {
            ""
        };
        let content = template
            .replace("___REGISTRATION_CREDENTIAL___", credential.expose())
            .replace(
                "___HTTP_PROXY___",
                support.http_proxy.as_deref().unwrap_or_default(),
            )
            .replace(
                "___HTTPS_PROXY___",
                support.https_proxy.as_deref().unwrap_or_default(),
            )
            .replace(
                "___NO_PROXY___",
                support.no_proxy.as_deref().unwrap_or_default(),
            )
            .replace("___APROXY_ADDRESS___", aproxy_address)
            .replace(
                "___DOCKERHUB_MIRROR___",
                support.dockerhub_mirror.as_deref().unwrap_or_default(),
            )
            .replace(
                "___SSH_DEBUG_HOST___",
                ssh_debug.map(|endpoint| endpoint.host.as_str()).unwrap_or_default(),
            )
            .replace(
                "___SSH_DEBUG_PORT___",
                &ssh_debug.map(|endpoint| endpoint.port.to_string()).unwrap_or_default(),
            )
            .replace("___METRICS_EXCHANGE_PATH___", METRICS_EXCHANGE_PATH)
            .replace(
                "___DO_REPO_POLICY_CHECK___",
                if repo_policy_token.is_some() { "true" } else { "false" },
            )
            .replace(
                "___REPO_POLICY_BASE_URL___",
                support
                    .repo_policy_compliance
                    .as_ref()
                    .map(|policy| policy.url.as_str())
                    .unwrap_or_default(),
            )
            .replace("___REPO_POLICY_ONE_TIME_TOKEN___", repo_policy_token.unwrap_or_default());

        Self {
            write_files: vec![WriteFile {
                path: START_SCRIPT_PATH.into(),
                permissions: "0755".into(),
                content,
            }],
            runcmd: vec![START_SCRIPT_PATH.into()],
        }
    }

    pub fn to_user_data(&self) -> serde_yaml::Result<String> {
        Ok(format!("#cloud-config\n{}", serde_yaml::to_string(self)?))
    }
}

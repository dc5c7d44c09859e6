use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const REACTIVE_TAG: &str = "reactive";
const NON_REACTIVE_TAG: &str = "non-reactive";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Reactivity {
    Reactive,
    NonReactive,
}

impl Reactivity {
    pub fn tag(self) -> &'static str {
        match self {
            Reactivity::Reactive => REACTIVE_TAG,
            Reactivity::NonReactive => NON_REACTIVE_TAG,
        }
    }

}

#[derive(Debug, Error)]
pub enum MalformedName {
    #[error("runner name {0:?} has no reactivity tag")]
    MissingTag(String),
    #[error("runner name {0:?} is missing segments")]
    MissingSegments(String),
}

/// Canonical runner name: `<prefix>-<reactivity-tag>-<suffix>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct InstanceId {
    prefix: String,
    reactivity: Reactivity,
    suffix: String,
}

impl InstanceId {
    pub fn generate(prefix: &str, reactivity: Reactivity) -> Self {
        let suffix: String = rand::rng()
            .sample_iter(rand::distr::Alphanumeric)
            .filter(|c| c.is_ascii_lowercase())
            .take(8)
            .map(char::from)
            .collect();
        Self {
            prefix: prefix.to_string(),
            reactivity,
            suffix,
        }
    }

    pub fn parse(name: &str) -> Result<Self, MalformedName> {
        let Some((head, suffix)) = name.rsplit_once('-') else {
            return Err(MalformedName::MissingSegments(name.to_string()));
        };
        if suffix.is_empty() {
            return Err(MalformedName::MissingSegments(name.to_string()));
        }
        // "-reactive" is a suffix of "-non-reactive"; test the longer tag first.
        let (prefix, reactivity) =
            if let Some(prefix) = head.strip_suffix(&format!("-{NON_REACTIVE_TAG}")) {
                (prefix, Reactivity::NonReactive)
            } else if let Some(prefix) = head.strip_suffix(&format!("-{REACTIVE_TAG}")) {
                (prefix, Reactivity::Reactive)
            } else {
                return Err(MalformedName::MissingTag(name.to_string()));
            };
        if prefix.is_empty() {
            return Err(MalformedName::MissingSegments(name.to_string()));
        }
        Ok(Self {
            prefix: prefix.to_string(),
            reactivity,
            suffix: suffix.to_string(),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn reactivity(&self) -> Reactivity {
        self.reactivity
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.prefix, self.reactivity.tag(), self.suffix)
    }
}

impl From<InstanceId> for String {
    fn from(id: InstanceId) -> String {
        id.to_string()
    }
}

impl TryFrom<String> for InstanceId {
    type Error = MalformedName;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        InstanceId::parse(&name)
    }
}

pub fn owns(prefix: &str, id: &InstanceId) -> bool {
    id.prefix == prefix
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlatformKind {
    HostedVcs,
    JobDispatcher,
}

/// Platform-side identity of a runner: which backend it registered with,
/// the id that backend assigned, and the backend base URL.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunnerMetadata {
    pub platform: PlatformKind,
    pub runner_id: Option<String>,
    pub url: String,
}

impl RunnerMetadata {
    pub fn with_runner_id(&self, runner_id: impl Into<String>) -> Self {
        Self {
            runner_id: Some(runner_id.into()),
            ..self.clone()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunnerIdentity {
    pub instance_id: InstanceId,
    pub metadata: RunnerMetadata,
}

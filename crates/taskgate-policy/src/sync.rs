use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::tables::PolicyDocument;
use crate::PolicyError;

const DEFAULT_FETCH_TIMEOUT_MS: u64 = 10_000;

/// Somewhere a policy document can be fetched from.
pub trait PolicySource {
    fn describe(&self) -> String;

    #[allow(clippy::missing_errors_doc)]
    fn fetch(&self) -> Result<PolicyDocument, PolicyError>;
}

#[derive(Debug, Clone)]
pub struct FilePolicySource {
    path: PathBuf,
}

impl FilePolicySource {
    #[must_use]
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl PolicySource for FilePolicySource {
    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }

    fn fetch(&self) -> Result<PolicyDocument, PolicyError> {
        let text = fs::read_to_string(&self.path)
            .map_err(|err| PolicyError::Fetch(format!("{}: {err}", self.path.display())))?;
        PolicyDocument::parse(&text)
    }
}

/// Fetches a YAML or JSON policy document with a plain GET.
#[derive(Debug, Clone)]
pub struct HttpPolicySource {
    url: String,
    timeout_ms: u64,
    auth_bearer_token: Option<String>,
}

impl HttpPolicySource {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            auth_bearer_token: None,
        }
    }

    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.auth_bearer_token = Some(token.into());
        self
    }
}

impl PolicySource for HttpPolicySource {
    fn describe(&self) -> String {
        self.url.clone()
    }

    fn fetch(&self) -> Result<PolicyDocument, PolicyError> {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(self.timeout_ms))
            .build();
        let mut request = agent.get(&self.url).set("accept", "application/json");
        if let Some(token) = &self.auth_bearer_token {
            request = request.set("authorization", &format!("Bearer {token}"));
        }

        let body = match request.call() {
            Ok(response) => response
                .into_string()
                .map_err(|err| PolicyError::Fetch(format!("unreadable policy body: {err}")))?,
            Err(ureq::Error::Status(code, _)) => {
                return Err(PolicyError::Fetch(format!("http status {code}")));
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(PolicyError::Fetch(format!("http transport failure: {err}")));
            }
        };

        PolicyDocument::parse(&body)
    }
}

/// Result of one sync attempt. The engine's tables change only on `Applied`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Applied { version: u64 },
    KeptCached { version: u64, reason: String },
}

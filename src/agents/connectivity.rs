use crate::agents::mirror::CancelToken;
use crate::config::{UpdaterConfig, scp_remote};
use crate::error::{Result, UpdaterError};
use reqwest::blocking::Client;
use std::thread;
use std::time::Duration;
use url::Url;

const DEFAULT_ATTEMPTS: u32 = 18;
const DEFAULT_DELAY: Duration = Duration::from_secs(10);

/// Waits for the upstream host to answer before anything is fetched.
///
/// Boot-time runs start before the network is up; the probe gives it a few
/// minutes before giving up.
pub struct ConnectivityProbe {
    client: Client,
    url: String,
    attempts: u32,
    delay: Duration,
}

impl ConnectivityProbe {
    pub fn new(config: &UpdaterConfig) -> Result<Self> {
        Ok(Self {
            client: Self::build_client()?,
            url: probe_url(&config.git_url)?,
            attempts: DEFAULT_ATTEMPTS,
            delay: DEFAULT_DELAY,
        })
    }

    #[cfg(test)]
    pub fn with_schedule(mut self, attempts: u32, delay: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.delay = delay;
        self
    }

    fn build_client() -> Result<Client> {
        Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(concat!("catalog-updater/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| UpdaterError::Connectivity(format!("cannot build HTTP client: {e}")))
    }

    fn reachable(&self) -> bool {
        match self.client.head(&self.url).send() {
            Ok(response) => {
                tracing::debug!(url = %self.url, status = %response.status(), "host answered");
                true
            }
            Err(e) => {
                tracing::debug!(url = %self.url, error = %e, "host unreachable");
                false
            }
        }
    }

    /// Block until the host answers, the attempts run out or `cancel` fires.
    pub fn wait(&self, cancel: &CancelToken) -> Result<()> {
        for attempt in 1..=self.attempts {
            if cancel.is_cancelled() {
                break;
            }
            if self.reachable() {
                return Ok(());
            }
            if attempt < self.attempts {
                tracing::info!(attempt, "no internet connection yet, waiting");
                thread::sleep(self.delay);
            }
        }
        Err(UpdaterError::Connectivity(format!(
            "{} failed to respond",
            self.url
        )))
    }
}

/// Origin of the repository URL; any answer from the host counts.
///
/// scp-style remotes are probed over https on the same host.
fn probe_url(git_url: &str) -> Result<String> {
    if let Some((host, _)) = scp_remote(git_url) {
        return Ok(format!("https://{host}"));
    }
    let url = Url::parse(git_url)
        .map_err(|e| UpdaterError::Config(format!("invalid repository URL {git_url}: {e}")))?;
    let Some(host) = url.host_str() else {
        return Err(UpdaterError::Config(format!(
            "repository URL {git_url} has no host"
        )));
    };
    Ok(match url.port() {
        Some(port) => format!("{}://{host}:{port}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    })
}

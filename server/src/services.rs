//! Account API clients consumed by the server
//!
//! The core only sees two narrow seams: [`TokenValidator`] for the connect
//! handshake and [`AchievementSink`] for gameplay events. The HTTP versions
//! talk JSON to the account API; the offline versions let a server run (and
//! be tested) without one.

use crate::achievements::Unlock;
use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Timeout for every account API and master server request.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Whether `token` is a valid session token for `account`.
    async fn validate(&self, account: &str, token: &str) -> Result<bool>;

    /// Display name of `account`, if the API knows one.
    async fn display_name(&self, account: &str) -> Result<Option<String>>;
}

/// An unlock the account API confirmed, with the achievement's title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AchievementNotice {
    pub account: String,
    pub title: String,
}

/// Fire-and-forget achievement delivery. Must never block the caller.
pub trait AchievementSink: Send + Sync {
    fn unlock(&self, account: &str, id: u32);
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ValidateResponse {
    success: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NameResponse {
    success: bool,
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct UnlockResponse {
    success: bool,
    #[serde(default)]
    message: String,
}

/// Account API over HTTP.
#[derive(Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    base_url: reqwest::Url,
}

impl HttpApi {
    pub fn new(client: reqwest::Client, base_url: &str) -> Result<Self> {
        let base_url = reqwest::Url::parse(base_url)
            .map_err(|e| ServerError::Config(format!("invalid api_server {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ServerError::Config(format!(
                "api_server {} cannot take a path",
                base_url
            )));
        }
        Ok(Self { client, base_url })
    }

    /// `base_url` with each of `segments` appended as one escaped path segment.
    fn endpoint(&self, segments: &[&str]) -> Result<reqwest::Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ServerError::Config(format!("api_server {} cannot take a path", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl TokenValidator for HttpApi {
    async fn validate(&self, account: &str, token: &str) -> Result<bool> {
        let url = self.endpoint(&["validate-token", account, token])?;
        let response: ValidateResponse = self.client.get(url).send().await?.json().await?;
        Ok(response.success)
    }

    async fn display_name(&self, account: &str) -> Result<Option<String>> {
        let url = self.endpoint(&["get-name", account])?;
        let response: NameResponse = self.client.get(url).send().await?.json().await?;
        Ok((response.success && !response.name.is_empty()).then_some(response.name))
    }
}

/// Accepts every token. Used in insecure setups and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl TokenValidator for AllowAll {
    async fn validate(&self, _account: &str, _token: &str) -> Result<bool> {
        Ok(true)
    }

    async fn display_name(&self, _account: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Token validation plus the insecure fallback rules.
pub struct AuthPolicy {
    validator: Arc<dyn TokenValidator>,
    insecure: bool,
    auto_insecure: bool,
    /// Set while the API is unreachable and tokens are accepted blindly
    degraded: AtomicBool,
}

impl AuthPolicy {
    pub fn new(validator: Arc<dyn TokenValidator>, insecure: bool, auto_insecure: bool) -> Self {
        Self {
            validator,
            insecure,
            auto_insecure,
            degraded: AtomicBool::new(false),
        }
    }

    pub fn from_config(validator: Arc<dyn TokenValidator>, config: &ServerConfig) -> Self {
        Self::new(validator, config.insecure, config.auto_insecure)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Decides whether `account` may connect with `token`.
    pub async fn check(&self, account: &str, token: &str) -> bool {
        if self.insecure {
            return true;
        }

        match self.validator.validate(account, token).await {
            Ok(valid) => {
                if self.degraded.swap(false, Ordering::Relaxed) {
                    info!("Authentication server has been reached. Server is now in secure mode");
                }
                valid
            }
            Err(e) if self.auto_insecure => {
                if !self.degraded.swap(true, Ordering::Relaxed) {
                    info!("Authentication server is unreachable ({}). Server is now in insecure mode", e);
                }
                true
            }
            Err(e) => {
                warn!("Could not validate the token of {}: {}", account, e);
                false
            }
        }
    }

    /// Display name for `account`, falling back to the account id.
    pub async fn display_name(&self, account: &str) -> String {
        match self.validator.display_name(account).await {
            Ok(Some(name)) => name,
            Ok(None) => account.to_string(),
            Err(e) => {
                debug!("Name lookup for {} failed: {}", account, e);
                account.to_string()
            }
        }
    }
}

/// Drops every achievement.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAchievements;

impl AchievementSink for NoAchievements {
    fn unlock(&self, account: &str, id: u32) {
        debug!("Achievement {} for {} not delivered (offline)", id, account);
    }
}

/// Queues achievements for a background worker that calls the account API.
///
/// Confirmed unlocks are published on `notices` so the server can announce
/// them in chat.
#[derive(Clone)]
pub struct HttpAchievements {
    queue: mpsc::Sender<Unlock>,
}

impl HttpAchievements {
    /// Starts the delivery worker. Must be called inside a tokio runtime.
    pub fn spawn(
        api: HttpApi,
        capacity: usize,
        notices: broadcast::Sender<AchievementNotice>,
    ) -> Self {
        let (queue, requests) = mpsc::channel(capacity);
        tokio::spawn(Self::deliver(api, requests, notices));
        Self { queue }
    }

    async fn deliver(
        api: HttpApi,
        mut requests: mpsc::Receiver<Unlock>,
        notices: broadcast::Sender<AchievementNotice>,
    ) {
        let mut lost = false;
        while let Some(unlock) = requests.recv().await {
            let id = unlock.id.to_string();
            let result = async {
                let url = api.endpoint(&["unlock-achievements", &unlock.account, &id])?;
                let response: UnlockResponse = api.client.get(url).send().await?.json().await?;
                Ok::<_, ServerError>(response)
            }
            .await;

            match result {
                Ok(response) => {
                    if lost {
                        info!("Regained connection with the account API");
                        lost = false;
                    }
                    if response.success {
                        let notice = AchievementNotice {
                            account: unlock.account,
                            title: response.message,
                        };
                        if notices.send(notice).is_err() {
                            debug!("Nobody listens for achievement notices");
                        }
                    }
                }
                Err(e) => {
                    if !lost {
                        warn!("Lost connection to the account API: {}", e);
                        lost = true;
                    }
                }
            }
        }
    }
}

impl AchievementSink for HttpAchievements {
    fn unlock(&self, account: &str, id: u32) {
        let request = Unlock {
            account: account.to_string(),
            id,
        };
        if self.queue.try_send(request).is_err() {
            debug!("Achievement queue full, dropping {} for {}", id, account);
        }
    }
}

/// External collaborators handed to the server at startup.
#[derive(Clone)]
pub struct Services {
    pub auth: Arc<AuthPolicy>,
    pub achievements: Arc<dyn AchievementSink>,
    /// Client for the master server heartbeat; `None` disables it
    pub http: Option<reqwest::Client>,
    pub notices: broadcast::Sender<AchievementNotice>,
}

impl Services {
    /// HTTP-backed services for a production server.
    pub fn http(config: &ServerConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        let api = HttpApi::new(client.clone(), &config.api_server)?;
        let (notices, _) = broadcast::channel(config.channel_size);
        Ok(Self {
            auth: Arc::new(AuthPolicy::from_config(Arc::new(api.clone()), config)),
            achievements: Arc::new(HttpAchievements::spawn(
                api,
                config.channel_size,
                notices.clone(),
            )),
            http: Some(client),
            notices,
        })
    }

    /// Services that never leave the process: every token is accepted.
    pub fn offline() -> Self {
        Self {
            auth: Arc::new(AuthPolicy::new(Arc::new(AllowAll), false, false)),
            achievements: Arc::new(NoAchievements),
            http: None,
            notices: broadcast::channel(1).0,
        }
    }
}

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::Url;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, RETRY_AFTER};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::battle::RawBattle;
use crate::error::SourceError;
use crate::http_client::http_client;

pub const DEFAULT_BASE_URL: &str = "https://api.clashroyale.com/v1";

const MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;
const ERROR_SNIPPET_CHARS: usize = 220;

/// Anything that can hand out a player's recent battles.
pub trait BattleSource: Send + Sync {
    fn fetch_battlelog(&self, tag: &str) -> Result<Vec<RawBattle>, SourceError>;
}

/// One GET exchange with the upstream API, before any classification.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub retry_after: Option<String>,
    pub body: String,
}

pub trait Transport: Send + Sync {
    fn get(&self, url: &Url, api_key: &str) -> Result<RawResponse>;
}

pub struct ReqwestTransport {
    client: &'static Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: http_client()?,
        })
    }
}

impl Transport for ReqwestTransport {
    fn get(&self, url: &Url, api_key: &str) -> Result<RawResponse> {
        let resp = self
            .client
            .get(url.clone())
            .bearer_auth(api_key)
            .header(ACCEPT, "application/json")
            .send()
            .context("request failed")?;
        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let body = resp.text().context("failed reading body")?;
        Ok(RawResponse {
            status,
            retry_after,
            body,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopPlayer {
    pub tag: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub trophies: i64,
    #[serde(default)]
    pub rank: i64,
}

/// Rankings wrap their rows in `items`; the battlelog is a bare array.
#[derive(Deserialize)]
#[serde(untagged)]
enum Listing<T> {
    Items { items: Vec<T> },
    Bare(Vec<T>),
}

impl<T> Listing<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            Listing::Items { items } => items,
            Listing::Bare(items) => items,
        }
    }
}

#[derive(Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

type Sleeper = Box<dyn Fn(Duration) + Send + Sync>;

pub struct SourceClient {
    transport: Box<dyn Transport>,
    base_url: Url,
    api_key: String,
    backoff_unit: Duration,
    sleep: Sleeper,
}

impl SourceClient {
    pub fn new(api_key: &str, base_url: &str) -> Result<Self> {
        Self::with_transport(ReqwestTransport::new()?, api_key, base_url)
    }

    pub fn with_transport(
        transport: impl Transport + 'static,
        api_key: &str,
        base_url: &str,
    ) -> Result<Self> {
        let base_url =
            Url::parse(base_url.trim()).with_context(|| format!("invalid api base url {base_url}"))?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("api base url {base_url} cannot carry a path"));
        }
        if api_key.trim().is_empty() {
            return Err(anyhow!("api key is empty"));
        }
        Ok(Self {
            transport: Box::new(transport),
            base_url,
            api_key: api_key.trim().to_string(),
            backoff_unit: Duration::from_secs(1),
            sleep: Box::new(thread::sleep),
        })
    }

    /// Base delay for exponential backoff; attempt `n` waits `unit * 2^n`.
    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    /// Replaces the blocking wait between attempts.
    pub fn with_sleeper(mut self, sleep: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleep = Box::new(sleep);
        self
    }

    pub fn fetch_battlelog(&self, tag: &str) -> Result<Vec<RawBattle>, SourceError> {
        let url = self.url_for(&["players", tag, "battlelog"], None);
        Ok(self.get_json::<Listing<RawBattle>>(&url)?.into_vec())
    }

    pub fn fetch_top_players(
        &self,
        location: &str,
        limit: u32,
    ) -> Result<Vec<TopPlayer>, SourceError> {
        let url = self.url_for(
            &["locations", location, "rankings", "players"],
            Some(("limit", limit.to_string())),
        );
        Ok(self.get_json::<Listing<TopPlayer>>(&url)?.into_vec())
    }

    /// Path segments are percent-encoded, so `#TAG` travels as `%23TAG`.
    pub fn url_for(&self, segments: &[&str], query: Option<(&str, String)>) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        if let Some((key, value)) = query {
            url.query_pairs_mut().append_pair(key, &value);
        }
        url
    }

    fn get_json<T: DeserializeOwned>(&self, url: &Url) -> Result<T, SourceError> {
        let endpoint = endpoint_of(url);
        let mut attempt = 0u32;
        loop {
            let result = match self.transport.get(url, &self.api_key) {
                Ok(resp) => classify(resp, &endpoint),
                Err(err) => Err(SourceError::Transport {
                    endpoint: endpoint.clone(),
                    attempts: attempt + 1,
                    message: format!("{err:#}"),
                }),
            };

            let error = match result {
                Ok(body) => {
                    return serde_json::from_str::<T>(body.trim()).map_err(|err| {
                        SourceError::Decode {
                            endpoint: endpoint.clone(),
                            message: err.to_string(),
                        }
                    });
                }
                Err(error) => error,
            };
            if !error.is_retryable() || attempt + 1 >= MAX_ATTEMPTS {
                return Err(error);
            }

            let wait = self.retry_wait(&error, attempt);
            warn!(
                endpoint = %endpoint,
                attempt = attempt + 1,
                wait_ms = wait.as_millis() as u64,
                error = %error,
                "retrying upstream call"
            );
            (self.sleep)(wait);
            attempt += 1;
        }
    }

    /// Rate limits wait what the server asked for; everything else backs off.
    fn retry_wait(&self, error: &SourceError, attempt: u32) -> Duration {
        match error {
            SourceError::RateLimited {
                retry_after_secs, ..
            } => Duration::from_secs(*retry_after_secs),
            _ => self.backoff(attempt),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_unit.saturating_mul(2u32.saturating_pow(attempt))
    }
}

fn classify(resp: RawResponse, endpoint: &str) -> Result<String, SourceError> {
    match resp.status {
        200..=299 => Ok(resp.body),
        404 => {
            debug!(endpoint, "upstream has no data");
            Err(SourceError::NotFound {
                endpoint: endpoint.to_string(),
            })
        }
        429 => Err(SourceError::RateLimited {
            endpoint: endpoint.to_string(),
            retry_after_secs: parse_retry_after(resp.retry_after.as_deref()),
        }),
        status if status >= 500 => Err(SourceError::Server {
            status,
            endpoint: endpoint.to_string(),
        }),
        status => Err(SourceError::Client {
            status,
            endpoint: endpoint.to_string(),
            message: api_error_message(&resp.body),
        }),
    }
}

impl BattleSource for SourceClient {
    fn fetch_battlelog(&self, tag: &str) -> Result<Vec<RawBattle>, SourceError> {
        SourceClient::fetch_battlelog(self, tag)
    }
}

fn endpoint_of(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

/// Seconds form only; anything else falls back to the default.
pub fn parse_retry_after(value: Option<&str>) -> u64 {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}

fn api_error_message(body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ApiErrorBody>(body)
        && (!parsed.reason.is_empty() || !parsed.message.is_empty())
    {
        return format!("{}: {}", parsed.reason, parsed.message);
    }
    body.trim()
        .replace(['\n', '\r'], " ")
        .chars()
        .take(ERROR_SNIPPET_CHARS)
        .collect()
}

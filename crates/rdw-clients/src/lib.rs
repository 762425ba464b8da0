//! HTTP fetch policy and the chat / video / spreadsheet API clients.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdw_core::ReleaseVideo;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::info_span;

pub const CRATE_NAME: &str = "rdw-clients";

/// Epoch of chat-platform snowflake ids, milliseconds since the Unix epoch.
pub const SNOWFLAKE_EPOCH_MS: u64 = 1_420_070_400_000;

const CHAT_API_BASE: &str = "https://discord.com/api/v10";
const VIDEO_API_BASE: &str = "https://www.googleapis.com/youtube/v3";
const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4";

/// One playlist page per request; the API caps at 50.
const PLAYLIST_PAGE_SIZE: u8 = 50;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} (getting {url})")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Retrying page fetcher. Success is HTTP 200 with a text body; any terminal
/// non-success status surfaces as [`FetchError::HttpStatus`] with the final
/// URL attached.
#[derive(Debug)]
pub struct PageFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl PageFetcher {
    pub fn new(config: HttpConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building http client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let span = info_span!("page_fetch", url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;
        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
        Err(FetchError::Request(
            last_request_error.expect("retry loop always captures a request error"),
        ))
    }
}

/// Channel of the chat platform, as listed for a guild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: String,
    pub name: String,
}

/// Message of the chat platform. The id doubles as a creation timestamp via
/// [`snowflake_timestamp`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub content: String,
    pub author_id: String,
}

/// Creation instant encoded in a snowflake id, or `None` for ids that are
/// not decimal snowflakes.
pub fn snowflake_timestamp(id: &str) -> Option<DateTime<Utc>> {
    let raw: u64 = id.parse().ok()?;
    let ms = (raw >> 22) + SNOWFLAKE_EPOCH_MS;
    DateTime::<Utc>::from_timestamp_millis(i64::try_from(ms).ok()?)
}

/// Chat-platform operations the engine consumes. Implemented over REST for
/// production and by in-memory fakes in tests.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn guild_channels(&self, guild_id: &str) -> Result<Vec<Channel>, FetchError>;
    async fn recent_messages(&self, channel_id: &str, limit: u8)
        -> Result<Vec<Message>, FetchError>;
    async fn pinned_messages(&self, channel_id: &str) -> Result<Vec<Message>, FetchError>;
    async fn post_message(&self, channel_id: &str, content: &str) -> Result<(), FetchError>;
}

#[derive(Debug, Deserialize)]
struct WireChannel {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct WireAuthor {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    id: String,
    #[serde(default)]
    content: String,
    author: WireAuthor,
}

impl From<WireMessage> for Message {
    fn from(wire: WireMessage) -> Self {
        Self {
            id: wire.id,
            content: wire.content,
            author_id: wire.author.id,
        }
    }
}

/// REST client for the chat platform, authenticated with a bot token.
#[derive(Debug, Clone)]
pub struct DiscordClient {
    client: reqwest::Client,
    token: String,
    base: String,
}

impl DiscordClient {
    pub fn new(token: impl Into<String>) -> anyhow::Result<Self> {
        Self::with_base(token, CHAT_API_BASE)
    }

    pub fn with_base(token: impl Into<String>, base: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .context("building chat http client")?;
        Ok(Self {
            client,
            token: token.into(),
            base: base.into(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: String) -> Result<T, FetchError> {
        let resp = self
            .client
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, format!("Bot {}", self.token))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        Ok(resp.json::<T>().await?)
    }
}

#[async_trait]
impl ChatClient for DiscordClient {
    async fn guild_channels(&self, guild_id: &str) -> Result<Vec<Channel>, FetchError> {
        let url = format!("{}/guilds/{}/channels", self.base, guild_id);
        let wire: Vec<WireChannel> = self.get_json(url).await?;
        Ok(wire
            .into_iter()
            .map(|c| Channel { id: c.id, name: c.name })
            .collect())
    }

    async fn recent_messages(
        &self,
        channel_id: &str,
        limit: u8,
    ) -> Result<Vec<Message>, FetchError> {
        let url = format!(
            "{}/channels/{}/messages?limit={}",
            self.base, channel_id, limit
        );
        let wire: Vec<WireMessage> = self.get_json(url).await?;
        Ok(wire.into_iter().map(Message::from).collect())
    }

    async fn pinned_messages(&self, channel_id: &str) -> Result<Vec<Message>, FetchError> {
        let url = format!("{}/channels/{}/pins", self.base, channel_id);
        let wire: Vec<WireMessage> = self.get_json(url).await?;
        Ok(wire.into_iter().map(Message::from).collect())
    }

    async fn post_message(&self, channel_id: &str, content: &str) -> Result<(), FetchError> {
        let url = format!("{}/channels/{}/messages", self.base, channel_id);
        let resp = self
            .client
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, format!("Bot {}", self.token))
            .json(&serde_json::json!({ "content": content }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct PlaylistSnippet {
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct PlaylistContentDetails {
    #[serde(rename = "videoId")]
    video_id: String,
}

#[derive(Debug, Deserialize)]
struct PlaylistWireItem {
    snippet: PlaylistSnippet,
    #[serde(rename = "contentDetails")]
    content_details: PlaylistContentDetails,
}

#[derive(Debug, Deserialize)]
struct PlaylistPage {
    #[serde(default, rename = "nextPageToken")]
    next_page_token: Option<String>,
    #[serde(default)]
    items: Vec<PlaylistWireItem>,
}

/// Video-catalog client; lists a playlist page by page until exhausted.
#[derive(Debug, Clone)]
pub struct VideoCatalogClient {
    client: reqwest::Client,
    api_key: String,
    base: String,
}

impl VideoCatalogClient {
    pub fn new(api_key: impl Into<String>) -> anyhow::Result<Self> {
        Self::with_base(api_key, VIDEO_API_BASE)
    }

    pub fn with_base(api_key: impl Into<String>, base: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .context("building video http client")?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            base: base.into(),
        })
    }

    pub async fn playlist_videos(&self, playlist_id: &str) -> Result<Vec<ReleaseVideo>, FetchError> {
        let mut videos = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = format!(
                "{}/playlistItems?part=snippet,contentDetails&playlistId={}&maxResults={}&key={}",
                self.base, playlist_id, PLAYLIST_PAGE_SIZE, self.api_key
            );
            if let Some(token) = &page_token {
                url.push_str("&pageToken=");
                url.push_str(token);
            }
            let resp = self.client.get(&url).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url,
                });
            }
            let page: PlaylistPage = resp.json().await?;
            videos.extend(page.items.into_iter().map(|item| ReleaseVideo {
                video_id: item.content_details.video_id,
                title: item.snippet.title,
            }));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(videos),
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<JsonValue>>,
}

/// Spreadsheet values client. Credential acquisition is the caller's
/// responsibility; this takes a ready bearer token.
#[derive(Debug, Clone)]
pub struct SheetsClient {
    client: reqwest::Client,
    token: String,
    base: String,
}

impl SheetsClient {
    pub fn new(token: impl Into<String>) -> anyhow::Result<Self> {
        Self::with_base(token, SHEETS_API_BASE)
    }

    pub fn with_base(token: impl Into<String>, base: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .context("building sheets http client")?;
        Ok(Self {
            client,
            token: token.into(),
            base: base.into(),
        })
    }

    /// Reads a range of cell values; `unformatted` requests raw cell values
    /// instead of their rendered text.
    pub async fn read_values(
        &self,
        spreadsheet_id: &str,
        range: &str,
        unformatted: bool,
    ) -> Result<Vec<Vec<JsonValue>>, FetchError> {
        let mut url = format!(
            "{}/spreadsheets/{}/values/{}",
            self.base,
            spreadsheet_id,
            urlencoding::encode(range)
        );
        if unformatted {
            url.push_str("?valueRenderOption=UNFORMATTED_VALUE");
        }
        let resp = self.client.get(&url).bearer_auth(&self.token).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        let range: ValueRange = resp.json().await?;
        Ok(range.values)
    }

    pub async fn write_values(
        &self,
        spreadsheet_id: &str,
        range: &str,
        values: Vec<Vec<JsonValue>>,
    ) -> Result<(), FetchError> {
        let url = format!(
            "{}/spreadsheets/{}/values/{}?valueInputOption=RAW",
            self.base,
            spreadsheet_id,
            urlencoding::encode(range)
        );
        let resp = self
            .client
            .put(&url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "values": values }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn snowflake_decodes_to_its_documented_creation_instant() {
        // Reference snowflake from the platform docs.
        let decoded = snowflake_timestamp("175928847299117063").unwrap();
        let expected = Utc
            .with_ymd_and_hms(2016, 4, 30, 11, 18, 25)
            .single()
            .unwrap()
            + chrono::Duration::milliseconds(796);
        assert_eq!(decoded, expected);
    }

    #[test]
    fn non_numeric_ids_do_not_decode() {
        assert!(snowflake_timestamp("not-a-snowflake").is_none());
        assert!(snowflake_timestamp("").is_none());
    }

    #[test]
    fn backoff_delays_are_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_and_throttles_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }
}

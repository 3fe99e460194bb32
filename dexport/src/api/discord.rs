use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, Response, StatusCode, header};
use serde::de::DeserializeOwned;

use crate::error::{ApiError, Result};
use crate::models::*;

pub const DEFAULT_API_URL: &str = "https://discord.com/api/v10";

const MAX_RATE_LIMIT_RETRIES: usize = 5;
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Remote conversation API consumed by the crawler.
#[async_trait]
pub trait DiscordApi: Send + Sync {
    async fn current_user(&self) -> Result<User>;
    async fn private_channels(&self) -> Result<Vec<Channel>>;
    async fn channel(&self, channel_id: Snowflake) -> Result<Channel>;
    async fn guild(&self, guild_id: Snowflake) -> Result<Guild>;
    async fn guild_channels(&self, guild_id: Snowflake) -> Result<Vec<Channel>>;

    /// Up to `limit` messages created strictly after `after`, in no
    /// guaranteed order.
    async fn fetch_messages(
        &self,
        channel_id: Snowflake,
        after: Snowflake,
        limit: u16,
    ) -> Result<Vec<Message>>;

    /// Up to `limit` users who reacted with `emoji` (in path form), with ids
    /// greater than `after`. Fails with [`ApiError::NotFound`] when the emoji
    /// is not encoded the way the API expects.
    async fn fetch_reaction_users(
        &self,
        channel_id: Snowflake,
        message_id: Snowflake,
        emoji: &str,
        after: Option<Snowflake>,
        limit: u16,
    ) -> Result<Vec<User>>;

    /// Guild membership of a user, or `None` when they are not a member.
    async fn resolve_member(&self, guild_id: Snowflake, user_id: Snowflake)
    -> Result<Option<Member>>;
}

pub struct DiscordClient {
    client: Client,
    base_url: String,
}

impl DiscordClient {
    /// `bot` selects the `Bot` authorization scheme; user tokens are sent as is.
    pub fn new(base_url: String, token: &str, bot: bool) -> anyhow::Result<Self> {
        let authorization = if bot {
            format!("Bot {token}")
        } else {
            token.to_string()
        };

        let mut headers = header::HeaderMap::new();
        let mut value = header::HeaderValue::from_str(&authorization)
            .context("token contains characters not allowed in a header")?;
        value.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, value);

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(format!(
                "DiscordBot ({}, {})",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            ))
            .default_headers(headers)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);

        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let response = self.client.get(&url).query(query).send().await?;
            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                let wait = retry_after(response).await;
                warn!(
                    "rate limited on {path} (attempt {}), retrying in {:.2}s",
                    attempt + 1,
                    wait.as_secs_f64()
                );
                tokio::time::sleep(wait).await;
                continue;
            }

            if status.is_success() {
                let body = response.text().await?;
                return serde_json::from_str(&body)
                    .map_err(|e| ApiError::Decode(format!("{path}: {e}")));
            }

            let body = response.text().await.unwrap_or_default();
            debug!("{status} from {path}: {body}");
            return Err(match status {
                StatusCode::NOT_FOUND => ApiError::NotFound(path.to_string()),
                StatusCode::FORBIDDEN => ApiError::Forbidden(path.to_string()),
                StatusCode::UNAUTHORIZED => ApiError::Unauthorized(path.to_string()),
                _ => ApiError::Status { status, url, body },
            });
        }

        Err(ApiError::RateLimited(path.to_string()))
    }

    async fn get_channels(&self, path: &str) -> Result<Vec<Channel>> {
        let raw: Vec<RawChannel> = self.get_json(path, &[]).await?;
        raw.into_iter()
            .map(|raw| Channel::try_from(raw).map_err(ApiError::Decode))
            .collect()
    }
}

/// Wait requested by a 429 response: the JSON `retry_after` field, then the
/// `Retry-After` header, then a fixed second.
async fn retry_after(response: Response) -> Duration {
    let header_wait = response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.parse::<f64>().ok());

    let body_wait = response
        .json::<serde_json::Value>()
        .await
        .ok()
        .and_then(|body| body.get("retry_after").and_then(|v| v.as_f64()));

    retry_wait(body_wait, header_wait)
}

/// Turns the advertised wait into a sleep, never longer than
/// [`MAX_RETRY_AFTER`].
fn retry_wait(body_secs: Option<f64>, header_secs: Option<f64>) -> Duration {
    body_secs
        .or(header_secs)
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .map(|wait| wait.min(MAX_RETRY_AFTER))
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

#[async_trait]
impl DiscordApi for DiscordClient {
    async fn current_user(&self) -> Result<User> {
        self.get_json("/users/@me", &[]).await
    }

    async fn private_channels(&self) -> Result<Vec<Channel>> {
        self.get_channels("/users/@me/channels").await
    }

    async fn channel(&self, channel_id: Snowflake) -> Result<Channel> {
        let raw: RawChannel = self
            .get_json(&format!("/channels/{channel_id}"), &[])
            .await?;
        Channel::try_from(raw).map_err(ApiError::Decode)
    }

    async fn guild(&self, guild_id: Snowflake) -> Result<Guild> {
        self.get_json(
            &format!("/guilds/{guild_id}"),
            &[("with_counts", "true".to_string())],
        )
        .await
    }

    async fn guild_channels(&self, guild_id: Snowflake) -> Result<Vec<Channel>> {
        self.get_channels(&format!("/guilds/{guild_id}/channels"))
            .await
    }

    async fn fetch_messages(
        &self,
        channel_id: Snowflake,
        after: Snowflake,
        limit: u16,
    ) -> Result<Vec<Message>> {
        self.get_json(
            &format!("/channels/{channel_id}/messages"),
            &[("after", after.to_string()), ("limit", limit.to_string())],
        )
        .await
    }

    async fn fetch_reaction_users(
        &self,
        channel_id: Snowflake,
        message_id: Snowflake,
        emoji: &str,
        after: Option<Snowflake>,
        limit: u16,
    ) -> Result<Vec<User>> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(after) = after {
            query.push(("after", after.to_string()));
        }
        self.get_json(
            &format!("/channels/{channel_id}/messages/{message_id}/reactions/{emoji}"),
            &query,
        )
        .await
    }

    async fn resolve_member(
        &self,
        guild_id: Snowflake,
        user_id: Snowflake,
    ) -> Result<Option<Member>> {
        match self
            .get_json(&format!("/guilds/{guild_id}/members/{user_id}"), &[])
            .await
        {
            Ok(member) => Ok(Some(member)),
            Err(ApiError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const ALICE: &str = r#"{"id": "42", "username": "alice"}"#;

    /// Answers one connection per canned `(status, body)` pair, in order, and
    /// keeps the request heads it received.
    async fn serve(responses: Vec<(u16, &'static str)>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();

        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut head = Vec::new();
                let mut chunk = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    head.extend_from_slice(&chunk[..n]);
                }
                seen.lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(&head).to_string());

                let reply = format!(
                    "HTTP/1.1 {status} Canned\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
        });

        (format!("http://{addr}"), requests)
    }

    fn client(base_url: String) -> DiscordClient {
        DiscordClient::new(base_url, "secret", true).unwrap()
    }

    #[tokio::test]
    async fn rate_limited_request_is_repeated() {
        let (url, requests) = serve(vec![(429, r#"{"retry_after": 0}"#), (200, ALICE)]).await;

        let me = client(url).current_user().await.unwrap();
        assert_eq!(me.id, Snowflake(42));
        assert_eq!(me.username, "alice");

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].starts_with("GET /users/@me "));
        assert!(
            requests[1]
                .to_ascii_lowercase()
                .contains("authorization: bot secret")
        );
    }

    #[tokio::test]
    async fn rate_limit_gives_up_after_retry_budget() {
        let responses = vec![(429, r#"{"retry_after": 0}"#); MAX_RATE_LIMIT_RETRIES + 1];
        let (url, requests) = serve(responses).await;

        let err = client(url).current_user().await.unwrap_err();
        assert!(matches!(err, ApiError::RateLimited(_)), "{err}");
        assert_eq!(requests.lock().unwrap().len(), MAX_RATE_LIMIT_RETRIES + 1);
    }

    #[tokio::test]
    async fn missing_reaction_is_not_found() {
        let (url, requests) = serve(vec![(404, r#"{"message": "Unknown Emoji"}"#)]).await;

        let err = client(url)
            .fetch_reaction_users(Snowflake(1), Snowflake(2), "%F0%9F%91%8D", Some(Snowflake(9)), 100)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)), "{err}");

        let requests = requests.lock().unwrap();
        assert!(
            requests[0].starts_with(
                "GET /channels/1/messages/2/reactions/%F0%9F%91%8D?limit=100&after=9 "
            ),
            "{}",
            requests[0]
        );
    }

    #[tokio::test]
    async fn unknown_member_is_none() {
        let (url, _) = serve(vec![(404, r#"{"message": "Unknown Member"}"#)]).await;

        let member = client(url)
            .resolve_member(Snowflake(7), Snowflake(42))
            .await
            .unwrap();
        assert_eq!(member, None);
    }

    #[tokio::test]
    async fn statuses_map_to_error_kinds() {
        let (url, _) = serve(vec![
            (401, r#"{"message": "401: Unauthorized"}"#),
            (403, r#"{"message": "Missing Access"}"#),
            (500, "oops"),
        ])
        .await;
        let client = client(url);

        let unauthorized = client.current_user().await.unwrap_err();
        assert!(matches!(unauthorized, ApiError::Unauthorized(_)));
        let forbidden = client
            .fetch_messages(Snowflake(1), Snowflake(0), 100)
            .await
            .unwrap_err();
        assert!(matches!(forbidden, ApiError::Forbidden(_)));
        let other = client.guild(Snowflake(7)).await.unwrap_err();
        assert!(
            matches!(&other, ApiError::Status { status, body, .. } if status.as_u16() == 500 && body == "oops")
        );
    }

    #[test]
    fn advertised_wait_is_bounded() {
        assert_eq!(retry_wait(Some(1e30), None), MAX_RETRY_AFTER);
        assert_eq!(retry_wait(Some(f64::INFINITY), None), DEFAULT_RETRY_AFTER);
        assert_eq!(retry_wait(Some(-3.0), None), DEFAULT_RETRY_AFTER);
        assert_eq!(retry_wait(Some(0.25), Some(9.0)), Duration::from_millis(250));
        assert_eq!(retry_wait(None, Some(2.0)), Duration::from_secs(2));
        assert_eq!(retry_wait(None, None), DEFAULT_RETRY_AFTER);
    }
}

use log::{debug, warn};

use crate::api::DiscordApi;
use crate::error::{ApiError, Result};
use crate::models::{Emoji, Snowflake, User};

pub const REACTION_PAGE_SIZE: u16 = 100;

/// Emoji as it appears in the reactions endpoint path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmojiPath {
    Unicode { raw: String, encoded: bool },
    Custom { name: String, id: Snowflake },
}

impl EmojiPath {
    pub fn new(emoji: &Emoji) -> Self {
        match emoji.id {
            Some(id) => EmojiPath::Custom {
                name: emoji.name.clone().unwrap_or_default(),
                id,
            },
            None => EmojiPath::Unicode {
                raw: emoji.name.clone().unwrap_or_default(),
                encoded: false,
            },
        }
    }

    pub fn segment(&self) -> String {
        match self {
            EmojiPath::Unicode {
                raw,
                encoded: false,
            } => raw.clone(),
            EmojiPath::Unicode { raw, encoded: true } => urlencoding::encode(raw).into_owned(),
            EmojiPath::Custom { name, id } => format!("{name}:{id}"),
        }
    }

    /// Custom emoji and already encoded unicode emoji have no other form.
    pub fn is_canonical(&self) -> bool {
        match self {
            EmojiPath::Unicode { encoded, .. } => *encoded,
            EmojiPath::Custom { .. } => true,
        }
    }

    fn encode(&mut self) {
        if let EmojiPath::Unicode { encoded, .. } = self {
            *encoded = true;
        }
    }
}

/// Result of one reaction page request under the fallback policy.
#[derive(Debug)]
pub enum FetchOutcome {
    Success(Vec<User>),
    /// re-encode the emoji and repeat the same request
    RetryableFailure,
    FatalFailure(ApiError),
}

impl FetchOutcome {
    /// A not-found response earns one retry with the emoji re-encoded, and
    /// only before any user was produced.
    pub fn classify(
        result: Result<Vec<User>>,
        retried: bool,
        yielded: usize,
        emoji: &EmojiPath,
    ) -> Self {
        match result {
            Ok(users) => FetchOutcome::Success(users),
            Err(ApiError::NotFound(_)) if !retried && yielded == 0 && !emoji.is_canonical() => {
                FetchOutcome::RetryableFailure
            }
            Err(e) => FetchOutcome::FatalFailure(e),
        }
    }
}

/// Pulls the users of one reaction, one page per call.
pub struct ReactionUsers<'a, A: DiscordApi + ?Sized> {
    api: &'a A,
    channel_id: Snowflake,
    message_id: Snowflake,
    emoji: EmojiPath,
    after: Option<Snowflake>,
    retried: bool,
    yielded: usize,
    exhausted: bool,
}

impl<'a, A: DiscordApi + ?Sized> ReactionUsers<'a, A> {
    pub fn new(api: &'a A, channel_id: Snowflake, message_id: Snowflake, emoji: &Emoji) -> Self {
        Self {
            api,
            channel_id,
            message_id,
            emoji: EmojiPath::new(emoji),
            after: None,
            retried: false,
            yielded: 0,
            exhausted: false,
        }
    }

    pub async fn next_page(&mut self) -> Result<Option<Vec<User>>> {
        if self.exhausted {
            return Ok(None);
        }

        loop {
            let result = self
                .api
                .fetch_reaction_users(
                    self.channel_id,
                    self.message_id,
                    &self.emoji.segment(),
                    self.after,
                    REACTION_PAGE_SIZE,
                )
                .await;

            match FetchOutcome::classify(result, self.retried, self.yielded, &self.emoji) {
                FetchOutcome::Success(users) => {
                    if users.len() < usize::from(REACTION_PAGE_SIZE) {
                        self.exhausted = true;
                    }
                    let Some(last) = users.last() else {
                        return Ok(None);
                    };
                    self.after = Some(last.id);
                    self.yielded += users.len();
                    return Ok(Some(users));
                }
                FetchOutcome::RetryableFailure => {
                    warn!(
                        "reaction {} on message {} not found, retrying with encoded emoji",
                        self.emoji.segment(),
                        self.message_id
                    );
                    self.retried = true;
                    self.emoji.encode();
                }
                FetchOutcome::FatalFailure(e) => {
                    debug!(
                        "reaction {} on message {} failed after {} users",
                        self.emoji.segment(),
                        self.message_id,
                        self.yielded
                    );
                    return Err(e);
                }
            }
        }
    }

    pub fn emoji(&self) -> &EmojiPath {
        &self.emoji
    }
}

/// Every user of one reaction, in API order.
pub async fn resolve_reaction_users<A: DiscordApi + ?Sized>(
    api: &A,
    channel_id: Snowflake,
    message_id: Snowflake,
    emoji: &Emoji,
) -> Result<Vec<User>> {
    let mut pager = ReactionUsers::new(api, channel_id, message_id, emoji);
    let mut users = Vec::new();
    while let Some(page) = pager.next_page().await? {
        users.extend(page);
    }
    Ok(users)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unicode(raw: &str) -> EmojiPath {
        EmojiPath::new(&Emoji {
            id: None,
            name: Some(raw.to_string()),
            animated: false,
        })
    }

    #[test]
    fn unicode_emoji_encodes_once() {
        let mut emoji = unicode("👍");
        assert_eq!(emoji.segment(), "👍");
        assert!(!emoji.is_canonical());
        emoji.encode();
        assert_eq!(emoji.segment(), "%F0%9F%91%8D");
        assert!(emoji.is_canonical());
    }

    #[test]
    fn custom_emoji_uses_name_and_id() {
        let emoji = EmojiPath::new(&Emoji {
            id: Some(Snowflake(42)),
            name: Some("thonk".to_string()),
            animated: true,
        });
        assert_eq!(emoji.segment(), "thonk:42");
        assert!(emoji.is_canonical());
    }

    #[test]
    fn not_found_is_retryable_only_on_first_unencoded_attempt() {
        let emoji = unicode("🎉");
        let not_found = || Err(ApiError::NotFound("reactions".to_string()));

        assert!(matches!(
            FetchOutcome::classify(not_found(), false, 0, &emoji),
            FetchOutcome::RetryableFailure
        ));
        assert!(matches!(
            FetchOutcome::classify(not_found(), true, 0, &emoji),
            FetchOutcome::FatalFailure(_)
        ));
        assert!(matches!(
            FetchOutcome::classify(not_found(), false, 3, &emoji),
            FetchOutcome::FatalFailure(_)
        ));

        let mut encoded = emoji.clone();
        encoded.encode();
        assert!(matches!(
            FetchOutcome::classify(not_found(), false, 0, &encoded),
            FetchOutcome::FatalFailure(_)
        ));
    }

    #[test]
    fn other_errors_are_fatal() {
        let emoji = unicode("🎉");
        let result = Err(ApiError::Forbidden("reactions".to_string()));
        assert!(matches!(
            FetchOutcome::classify(result, false, 0, &emoji),
            FetchOutcome::FatalFailure(ApiError::Forbidden(_))
        ));
    }
}

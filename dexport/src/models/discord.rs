use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Snowflake, epoch_seconds};

pub const CDN_URL: &str = "https://cdn.discordapp.com";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Snowflake,
    pub username: String,
    /// "0" for accounts migrated to unique usernames
    #[serde(default)]
    pub discriminator: Option<String>,
    #[serde(default)]
    pub global_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

impl User {
    pub fn display_name(&self) -> &str {
        self.global_name.as_deref().unwrap_or(&self.username)
    }

    pub fn avatar_url(&self) -> Option<String> {
        self.avatar.as_ref().map(|hash| {
            let ext = if hash.starts_with("a_") { "gif" } else { "png" };
            format!("{CDN_URL}/avatars/{}/{hash}.{ext}", self.id)
        })
    }

    pub fn default_avatar_url(&self) -> String {
        let index = match self
            .discriminator
            .as_deref()
            .and_then(|d| d.parse::<u64>().ok())
        {
            Some(discriminator) if discriminator != 0 => discriminator % 5,
            _ => (self.id.0 >> 22) % 6,
        };
        format!("{CDN_URL}/embed/avatars/{index}.png")
    }
}

/// Guild-scoped view of a user.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Member {
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub nick: Option<String>,
    #[serde(default)]
    pub roles: Vec<Snowflake>,
    #[serde(default)]
    pub joined_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub id: Snowflake,
    pub name: String,
    #[serde(default)]
    pub color: u32,
    #[serde(default)]
    pub position: i32,
    #[serde(default)]
    pub permissions: String,
    #[serde(default)]
    pub hoist: bool,
    #[serde(default)]
    pub managed: bool,
    #[serde(default)]
    pub mentionable: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Guild {
    pub id: Snowflake,
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub owner_id: Option<Snowflake>,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub approximate_member_count: Option<u64>,
    #[serde(default)]
    pub afk_channel_id: Option<Snowflake>,
    /// seconds
    #[serde(default)]
    pub afk_timeout: Option<u64>,
    #[serde(default)]
    pub verification_level: Option<u8>,
    #[serde(default)]
    pub mfa_level: Option<u8>,
    #[serde(default)]
    pub splash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuildChannelKind {
    Text,
    Voice,
    Category,
    Announcement,
    Forum,
    Other(u8),
}

impl GuildChannelKind {
    fn from_code(code: u8) -> Self {
        match code {
            0 => GuildChannelKind::Text,
            2 => GuildChannelKind::Voice,
            4 => GuildChannelKind::Category,
            5 => GuildChannelKind::Announcement,
            15 => GuildChannelKind::Forum,
            other => GuildChannelKind::Other(other),
        }
    }

    /// Whether the channel carries a readable message history.
    pub fn has_history(&self) -> bool {
        matches!(self, GuildChannelKind::Text | GuildChannelKind::Announcement)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuildChannel {
    pub id: Snowflake,
    pub guild_id: Snowflake,
    pub name: String,
    pub kind: GuildChannelKind,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub position: i32,
    #[serde(default)]
    pub parent_id: Option<Snowflake>,
    /// epoch seconds, from the id
    #[serde(default)]
    pub created_at: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectChannel {
    pub id: Snowflake,
    pub recipient: User,
    #[serde(default)]
    pub created_at: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupChannel {
    pub id: Snowflake,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    pub recipients: Vec<User>,
    #[serde(default)]
    pub owner_id: Option<Snowflake>,
    #[serde(default)]
    pub created_at: f64,
}

/// A message container. Each variant carries only the fields valid for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Channel {
    Guild(GuildChannel),
    Direct(DirectChannel),
    Group(GroupChannel),
}

impl Channel {
    pub fn id(&self) -> Snowflake {
        match self {
            Channel::Guild(ch) => ch.id,
            Channel::Direct(ch) => ch.id,
            Channel::Group(ch) => ch.id,
        }
    }

    pub fn guild_id(&self) -> Option<Snowflake> {
        match self {
            Channel::Guild(ch) => Some(ch.guild_id),
            Channel::Direct(_) | Channel::Group(_) => None,
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            Channel::Guild(ch) => ch.name.clone(),
            Channel::Direct(ch) => ch.recipient.username.clone(),
            Channel::Group(GroupChannel {
                name: Some(name), ..
            }) if !name.is_empty() => name.clone(),
            Channel::Group(ch) => {
                let first = ch
                    .recipients
                    .first()
                    .map(|u| u.username.as_str())
                    .unwrap_or("unknown");
                format!("group-{first}")
            }
        }
    }
}

/// Channel object as returned by the API, before it is narrowed to a
/// [`Channel`] variant.
#[derive(Debug, Clone, Deserialize)]
pub struct RawChannel {
    pub id: Snowflake,
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub position: Option<i32>,
    #[serde(default)]
    pub parent_id: Option<Snowflake>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub owner_id: Option<Snowflake>,
    #[serde(default)]
    pub recipients: Vec<User>,
}

impl TryFrom<RawChannel> for Channel {
    type Error = String;

    fn try_from(raw: RawChannel) -> Result<Self, Self::Error> {
        let created_at = epoch_seconds(raw.id.timestamp());
        match raw.kind {
            1 => {
                let recipient = raw
                    .recipients
                    .into_iter()
                    .next()
                    .ok_or_else(|| format!("direct channel {} has no recipient", raw.id))?;
                Ok(Channel::Direct(DirectChannel {
                    id: raw.id,
                    recipient,
                    created_at,
                }))
            }
            3 => Ok(Channel::Group(GroupChannel {
                id: raw.id,
                name: raw.name,
                icon: raw.icon,
                recipients: raw.recipients,
                owner_id: raw.owner_id,
                created_at,
            })),
            code => {
                let guild_id = raw
                    .guild_id
                    .ok_or_else(|| format!("channel {} (type {code}) has no guild", raw.id))?;
                Ok(Channel::Guild(GuildChannel {
                    id: raw.id,
                    guild_id,
                    name: raw.name.unwrap_or_default(),
                    kind: GuildChannelKind::from_code(code),
                    topic: raw.topic,
                    position: raw.position.unwrap_or_default(),
                    parent_id: raw.parent_id,
                    created_at,
                }))
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: Snowflake,
    pub filename: String,
    pub url: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Emoji {
    #[serde(default)]
    pub id: Option<Snowflake>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub animated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Reaction {
    pub count: u64,
    #[serde(default)]
    pub me: bool,
    pub emoji: Emoji,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Message {
    pub id: Snowflake,
    pub channel_id: Snowflake,
    pub author: User,
    #[serde(default)]
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub edited_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tts: bool,
    #[serde(default)]
    pub mention_everyone: bool,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub mentions: Vec<User>,
    #[serde(default)]
    pub mention_roles: Vec<Snowflake>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub embeds: Vec<serde_json::Value>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> User {
        User {
            id: Snowflake(1),
            username: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn raw_channels_narrow_by_type() {
        let raw: RawChannel = serde_json::from_str(
            r#"{"id": "10", "type": 0, "guild_id": "7", "name": "general", "position": 3}"#,
        )
        .unwrap();
        let channel = Channel::try_from(raw).unwrap();
        assert_eq!(channel.guild_id(), Some(Snowflake(7)));
        assert_eq!(channel.display_name(), "general");
        let Channel::Guild(guild_channel) = &channel else {
            panic!("expected a guild channel");
        };
        assert_eq!(guild_channel.created_at, epoch_seconds(Snowflake(10).timestamp()));

        let raw: RawChannel = serde_json::from_str(
            r#"{"id": "11", "type": 1, "recipients": [{"id": "5", "username": "alice"}]}"#,
        )
        .unwrap();
        let channel = Channel::try_from(raw).unwrap();
        assert_eq!(channel.guild_id(), None);
        assert_eq!(channel.display_name(), "alice");
    }

    #[test]
    fn unnamed_group_is_named_after_first_recipient() {
        let channel = Channel::Group(GroupChannel {
            id: Snowflake(3),
            name: None,
            icon: None,
            recipients: vec![user("bob"), user("carol")],
            owner_id: None,
            created_at: 0.0,
        });
        assert_eq!(channel.display_name(), "group-bob");
    }

    #[test]
    fn direct_channel_without_recipient_is_rejected() {
        let raw: RawChannel = serde_json::from_str(r#"{"id": "12", "type": 1}"#).unwrap();
        assert!(Channel::try_from(raw).is_err());
    }

    #[test]
    fn default_avatar_uses_discriminator_or_id() {
        let mut legacy = user("dave");
        legacy.discriminator = Some("0007".to_string());
        assert!(legacy.default_avatar_url().ends_with("/embed/avatars/2.png"));

        let mut migrated = user("erin");
        migrated.id = Snowflake(5 << 22);
        migrated.discriminator = Some("0".to_string());
        assert!(migrated.default_avatar_url().ends_with("/embed/avatars/5.png"));
    }
}

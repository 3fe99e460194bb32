//! Append-only record log.
//!
//! Every line is `<kind>,<json-payload>`. A run appends one `run_info` line,
//! one `server_info` or `channels_info` snapshot, any number of `user` and
//! `message` lines, and a closing `run_finished` line if it ended in a
//! consistent state. Resumed runs append to the same file.

use std::{
    collections::BTreeMap,
    fmt,
    fs::{File, OpenOptions},
    io::{BufRead, BufWriter, Write},
    path::Path,
    str::FromStr,
    sync::LazyLock,
};

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::RecordError;
use crate::models::{
    Attachment, CDN_URL, Channel, Emoji, Guild, Member, Message, Reaction, Role, Snowflake, User,
    epoch_seconds,
};

static CHANNEL_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<#(\d+)>").expect("valid channel mention pattern"));

/// What a run exports. Stored as `conf` in `run_info` so that a resumed run
/// can rebuild the same channel set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "id", rename_all = "snake_case")]
pub enum Target {
    /// every private channel of the account
    Dm,
    /// every readable text channel of one guild
    Server(Snowflake),
    /// an explicit list of channels sharing one source
    Channels(Vec<Snowflake>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    #[serde(default)]
    pub argv: Vec<String>,
    pub time: f64,
    #[serde(default)]
    pub user_id: Option<Snowflake>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub server: Option<Snowflake>,
    pub conf: Target,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub channels: Vec<Snowflake>,
    /// per-channel checkpoints this run resumed from
    #[serde(default)]
    pub timestamps: BTreeMap<Snowflake, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: Snowflake,
    pub name: String,
    pub icon: Option<String>,
    pub owner: Option<Snowflake>,
    #[serde(default)]
    pub features: Vec<String>,
    pub member_count: Option<u64>,
    #[serde(default)]
    pub afk_channel: Option<Snowflake>,
    #[serde(default)]
    pub afk_timeout: Option<u64>,
    #[serde(default)]
    pub verification_level: Option<u8>,
    #[serde(default)]
    pub mfa_level: Option<u8>,
    #[serde(default)]
    pub splash: Option<String>,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub channels: Vec<Channel>,
    pub created_at: f64,
}

impl ServerInfo {
    pub fn new(guild: &Guild, channels: Vec<Channel>) -> Self {
        let mut roles = guild.roles.clone();
        roles.sort_by_key(|role| std::cmp::Reverse(role.position));
        Self {
            id: guild.id,
            name: guild.name.clone(),
            icon: guild.icon.clone(),
            owner: guild.owner_id,
            features: guild.features.clone(),
            member_count: guild.approximate_member_count,
            afk_channel: guild.afk_channel_id,
            afk_timeout: guild.afk_timeout,
            verification_level: guild.verification_level,
            mfa_level: guild.mfa_level,
            splash: guild.splash.clone(),
            roles,
            channels,
            created_at: epoch_seconds(guild.id.timestamp()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Snowflake,
    pub name: String,
    pub discriminator: Option<String>,
    pub display_name: String,
    pub avatar: Option<String>,
    pub avatar_url: Option<String>,
    pub default_avatar_url: String,
    pub bot: bool,
    pub created_at: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nick: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<Snowflake>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined_at: Option<f64>,
    /// highest-positioned role the member holds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_role: Option<Snowflake>,
    /// colour of the highest-positioned coloured role, 0 without one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
}

impl UserRecord {
    /// Bare user projection, enriched with guild membership when known.
    /// `guild_roles` are the roles of the member's guild.
    pub fn new(user: &User, member: Option<&Member>, guild_roles: &[Role]) -> Self {
        let nick = member.and_then(|m| m.nick.clone());
        let mut held: Vec<&Role> = member
            .map(|m| {
                guild_roles
                    .iter()
                    .filter(|role| m.roles.contains(&role.id))
                    .collect()
            })
            .unwrap_or_default();
        held.sort_by_key(|role| std::cmp::Reverse((role.position, role.id)));

        Self {
            id: user.id,
            name: user.username.clone(),
            discriminator: user.discriminator.clone(),
            display_name: nick
                .clone()
                .unwrap_or_else(|| user.display_name().to_string()),
            avatar: user.avatar.clone(),
            avatar_url: user.avatar_url(),
            default_avatar_url: user.default_avatar_url(),
            bot: user.bot,
            created_at: epoch_seconds(user.id.timestamp()),
            nick,
            roles: member.map(|m| m.roles.clone()),
            joined_at: member.and_then(|m| m.joined_at).map(epoch_seconds),
            top_role: held.first().map(|role| role.id),
            color: member.map(|_| {
                held.iter()
                    .map(|role| role.color)
                    .find(|color| *color != 0)
                    .unwrap_or(0)
            }),
        }
    }
}

/// Unicode emoji serialize as a bare string, custom emoji as an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmojiRecord {
    Unicode(String),
    Custom {
        id: Snowflake,
        name: Option<String>,
        animated: bool,
        url: String,
    },
}

impl From<&Emoji> for EmojiRecord {
    fn from(emoji: &Emoji) -> Self {
        match emoji.id {
            Some(id) => {
                let ext = if emoji.animated { "gif" } else { "png" };
                EmojiRecord::Custom {
                    id,
                    name: emoji.name.clone(),
                    animated: emoji.animated,
                    url: format!("{CDN_URL}/emojis/{id}.{ext}"),
                }
            }
            None => EmojiRecord::Unicode(emoji.name.clone().unwrap_or_default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionRecord {
    pub count: u64,
    pub me: bool,
    pub emoji: EmojiRecord,
    pub users: Vec<Snowflake>,
}

impl ReactionRecord {
    pub fn new(reaction: &Reaction, users: Vec<Snowflake>) -> Self {
        Self {
            count: reaction.count,
            me: reaction.me,
            emoji: EmojiRecord::from(&reaction.emoji),
            users,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: Snowflake,
    pub channel: Snowflake,
    pub author: Snowflake,
    pub content: String,
    pub timestamp: f64,
    pub edited_timestamp: Option<f64>,
    pub tts: bool,
    pub mention_everyone: bool,
    pub pinned: bool,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub embeds: Vec<serde_json::Value>,
    #[serde(default)]
    pub mentions: Vec<Snowflake>,
    #[serde(default)]
    pub channel_mentions: Vec<Snowflake>,
    #[serde(default)]
    pub role_mentions: Vec<Snowflake>,
    #[serde(default)]
    pub reactions: Vec<ReactionRecord>,
}

impl MessageRecord {
    /// Message without its reactions; those are resolved separately.
    pub fn new(message: &Message) -> Self {
        let channel_mentions = CHANNEL_MENTION
            .captures_iter(&message.content)
            .filter_map(|caps| caps[1].parse().ok())
            .collect();

        Self {
            id: message.id,
            channel: message.channel_id,
            author: message.author.id,
            content: message.content.clone(),
            timestamp: epoch_seconds(message.timestamp),
            edited_timestamp: message.edited_timestamp.map(epoch_seconds),
            tts: message.tts,
            mention_everyone: message.mention_everyone,
            pinned: message.pinned,
            attachments: message.attachments.clone(),
            embeds: message.embeds.clone(),
            mentions: message.mentions.iter().map(|u| u.id).collect(),
            channel_mentions,
            role_mentions: message.mention_roles.clone(),
            reactions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFinished {
    pub time: f64,
    #[serde(default)]
    pub interrupted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    RunInfo,
    ServerInfo,
    ChannelsInfo,
    User,
    Message,
    RunFinished,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::RunInfo => "run_info",
            RecordKind::ServerInfo => "server_info",
            RecordKind::ChannelsInfo => "channels_info",
            RecordKind::User => "user",
            RecordKind::Message => "message",
            RecordKind::RunFinished => "run_finished",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run_info" => Ok(RecordKind::RunInfo),
            "server_info" => Ok(RecordKind::ServerInfo),
            "channels_info" => Ok(RecordKind::ChannelsInfo),
            "user" => Ok(RecordKind::User),
            "message" => Ok(RecordKind::Message),
            "run_finished" => Ok(RecordKind::RunFinished),
            other => Err(RecordError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    RunInfo(Box<RunInfo>),
    ServerInfo(Box<ServerInfo>),
    ChannelsInfo(Vec<Channel>),
    User(UserRecord),
    Message(MessageRecord),
    RunFinished(RunFinished),
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::RunInfo(_) => RecordKind::RunInfo,
            Record::ServerInfo(_) => RecordKind::ServerInfo,
            Record::ChannelsInfo(_) => RecordKind::ChannelsInfo,
            Record::User(_) => RecordKind::User,
            Record::Message(_) => RecordKind::Message,
            Record::RunFinished(_) => RecordKind::RunFinished,
        }
    }

    /// Encodes the record as one log line, without the trailing newline.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let payload = match self {
            Record::RunInfo(info) => serde_json::to_string(info)?,
            Record::ServerInfo(info) => serde_json::to_string(info)?,
            Record::ChannelsInfo(channels) => serde_json::to_string(channels)?,
            Record::User(user) => serde_json::to_string(user)?,
            Record::Message(message) => serde_json::to_string(message)?,
            Record::RunFinished(finished) => serde_json::to_string(finished)?,
        };
        Ok(format!("{},{payload}", self.kind()))
    }

    pub fn parse_line(line: &str) -> Result<Self, RecordError> {
        let (kind, payload) = line
            .split_once(',')
            .ok_or(RecordError::MissingSeparator)?;
        let kind: RecordKind = kind.parse()?;

        Ok(match kind {
            RecordKind::RunInfo => Record::RunInfo(Box::new(decode(kind, payload)?)),
            RecordKind::ServerInfo => Record::ServerInfo(Box::new(decode(kind, payload)?)),
            RecordKind::ChannelsInfo => Record::ChannelsInfo(decode(kind, payload)?),
            RecordKind::User => Record::User(decode(kind, payload)?),
            RecordKind::Message => Record::Message(decode(kind, payload)?),
            RecordKind::RunFinished => Record::RunFinished(decode(kind, payload)?),
        })
    }
}

fn decode<T: DeserializeOwned>(kind: RecordKind, payload: &str) -> Result<T, RecordError> {
    serde_json::from_str(payload).map_err(|source| RecordError::Payload {
        kind: kind.as_str(),
        source,
    })
}

/// Reads every record of a log in file order. Blank lines are ignored; any
/// other undecodable line is an error carrying its line number.
pub fn read_records<R: BufRead>(reader: R) -> impl Iterator<Item = Result<Record>> {
    reader
        .lines()
        .enumerate()
        .filter_map(|(index, line)| {
            let line_no = index + 1;
            match line {
                Ok(line) if line.trim().is_empty() => None,
                Ok(line) => Some(
                    Record::parse_line(line.trim_end_matches('\r'))
                        .with_context(|| format!("malformed record on line {line_no}")),
                ),
                Err(e) => Some(Err(e).with_context(|| format!("failed to read line {line_no}"))),
            }
        })
}

/// Buffered appender over the log file.
pub struct RecordLog<W: Write> {
    writer: BufWriter<W>,
    appended: usize,
}

impl RecordLog<File> {
    pub fn append_to(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open record log {}", path.display()))?;
        Ok(Self::new(file))
    }
}

impl<W: Write> RecordLog<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: BufWriter::new(inner),
            appended: 0,
        }
    }

    pub fn append(&mut self, record: &Record) -> Result<()> {
        let line = record
            .to_line()
            .with_context(|| format!("failed to encode {} record", record.kind()))?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.appended += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("failed to flush record log")
    }

    /// Number of records appended through this handle.
    pub fn appended(&self) -> usize {
        self.appended
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| anyhow::Error::new(e.into_error()))
    }
}

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use dexport::api::DiscordApi;
use dexport::checkpoint::Checkpoint;
use dexport::crawl::CrawlOptions;
use dexport::error::{ApiError, Result};
use dexport::models::*;
use dexport::record::{Record, Target, read_records};
use dexport::services::ExportRequest;

/// 2020-09-13T12:26:40Z, all test messages are placed relative to it.
pub const BASE_SECS: i64 = 1_600_000_000;

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(BASE_SECS + secs, 0).unwrap()
}

pub fn message_id(secs: i64, seq: u64) -> Snowflake {
    Snowflake(Snowflake::from_datetime(at(secs)).0 + seq)
}

pub fn user(id: u64, name: &str) -> User {
    User {
        id: Snowflake(id),
        username: name.to_string(),
        discriminator: Some("0".to_string()),
        ..Default::default()
    }
}

pub fn dm_channel(id: u64, recipient: &User) -> Channel {
    Channel::Direct(DirectChannel {
        id: Snowflake(id),
        recipient: recipient.clone(),
        created_at: epoch_seconds(Snowflake(id).timestamp()),
    })
}

pub fn guild_channel(id: u64, guild_id: u64, name: &str, kind: GuildChannelKind, position: i32) -> Channel {
    Channel::Guild(GuildChannel {
        id: Snowflake(id),
        guild_id: Snowflake(guild_id),
        name: name.to_string(),
        kind,
        topic: None,
        position,
        parent_id: None,
        created_at: epoch_seconds(Snowflake(id).timestamp()),
    })
}

pub fn message(channel_id: u64, secs: i64, author: &User) -> Message {
    Message {
        id: message_id(secs, 0),
        channel_id: Snowflake(channel_id),
        author: author.clone(),
        content: format!("message at {secs}"),
        timestamp: at(secs),
        ..Default::default()
    }
}

pub fn unicode_reaction(emoji: &str, count: u64) -> Reaction {
    Reaction {
        count,
        me: false,
        emoji: Emoji {
            id: None,
            name: Some(emoji.to_string()),
            animated: false,
        },
    }
}

pub fn custom_reaction(id: u64, name: &str, count: u64) -> Reaction {
    Reaction {
        count,
        me: false,
        emoji: Emoji {
            id: Some(Snowflake(id)),
            name: Some(name.to_string()),
            animated: false,
        },
    }
}

#[derive(Default)]
struct State {
    me: User,
    channels: Vec<Channel>,
    guilds: HashMap<Snowflake, Guild>,
    messages: HashMap<Snowflake, Vec<Message>>,
    /// keyed by message id and the exact path segment the API accepts
    reactions: HashMap<(Snowflake, String), Vec<User>>,
    members: HashMap<(Snowflake, Snowflake), Member>,
    forbidden: HashSet<Snowflake>,
    failing_later_pages: HashSet<Snowflake>,
    message_fetches: HashMap<Snowflake, usize>,
    reaction_requests: Vec<String>,
    member_lookups: usize,
    /// every request fails as unauthorized once this many message pages were served
    revoke_after: Option<usize>,
    cancel_on_reaction: Option<CancellationToken>,
}

/// In-memory stand-in for the remote API.
pub struct FakeApi {
    state: Mutex<State>,
}

impl State {
    fn revoked(&self) -> bool {
        self.revoke_after
            .is_some_and(|limit| self.message_fetches.values().sum::<usize>() >= limit)
    }
}

impl FakeApi {
    pub fn new() -> Self {
        let state = State {
            me: user(1, "exporter"),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn add_channel(&self, channel: Channel) {
        self.state.lock().unwrap().channels.push(channel);
    }

    pub fn add_guild(&self, guild: Guild) {
        self.state.lock().unwrap().guilds.insert(guild.id, guild);
    }

    pub fn add_message(&self, message: Message) {
        self.state
            .lock()
            .unwrap()
            .messages
            .entry(message.channel_id)
            .or_default()
            .push(message);
    }

    pub fn set_reaction_users(&self, message_id: Snowflake, segment: &str, users: Vec<User>) {
        self.state
            .lock()
            .unwrap()
            .reactions
            .insert((message_id, segment.to_string()), users);
    }

    pub fn add_member(&self, guild_id: Snowflake, member: Member) {
        let user_id = member.user.as_ref().map(|u| u.id).unwrap_or_default();
        self.state
            .lock()
            .unwrap()
            .members
            .insert((guild_id, user_id), member);
    }

    pub fn forbid(&self, channel_id: Snowflake) {
        self.state.lock().unwrap().forbidden.insert(channel_id);
    }

    /// Reaction pages after the first one of `message_id` answer not found.
    pub fn fail_later_reaction_pages(&self, message_id: Snowflake) {
        self.state
            .lock()
            .unwrap()
            .failing_later_pages
            .insert(message_id);
    }

    /// The token stops working after `fetches` message pages.
    pub fn revoke_after_message_fetches(&self, fetches: usize) {
        self.state.lock().unwrap().revoke_after = Some(fetches);
    }

    /// The first reaction request cancels `token` and never answers.
    pub fn cancel_on_reaction(&self, token: CancellationToken) {
        self.state.lock().unwrap().cancel_on_reaction = Some(token);
    }

    pub fn message_fetches(&self, channel_id: Snowflake) -> usize {
        self.state
            .lock()
            .unwrap()
            .message_fetches
            .get(&channel_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn reaction_requests(&self) -> Vec<String> {
        self.state.lock().unwrap().reaction_requests.clone()
    }

    pub fn member_lookups(&self) -> usize {
        self.state.lock().unwrap().member_lookups
    }
}

#[async_trait]
impl DiscordApi for FakeApi {
    async fn current_user(&self) -> Result<User> {
        Ok(self.state.lock().unwrap().me.clone())
    }

    async fn private_channels(&self) -> Result<Vec<Channel>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .channels
            .iter()
            .filter(|c| c.guild_id().is_none())
            .cloned()
            .collect())
    }

    async fn channel(&self, channel_id: Snowflake) -> Result<Channel> {
        let state = self.state.lock().unwrap();
        if state.revoked() {
            return Err(ApiError::Unauthorized(format!("/channels/{channel_id}")));
        }
        state
            .channels
            .iter()
            .find(|c| c.id() == channel_id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("/channels/{channel_id}")))
    }

    async fn guild(&self, guild_id: Snowflake) -> Result<Guild> {
        let state = self.state.lock().unwrap();
        state
            .guilds
            .get(&guild_id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("/guilds/{guild_id}")))
    }

    async fn guild_channels(&self, guild_id: Snowflake) -> Result<Vec<Channel>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .channels
            .iter()
            .filter(|c| c.guild_id() == Some(guild_id))
            .cloned()
            .collect())
    }

    async fn fetch_messages(
        &self,
        channel_id: Snowflake,
        after: Snowflake,
        limit: u16,
    ) -> Result<Vec<Message>> {
        let mut state = self.state.lock().unwrap();
        if state.revoked() {
            return Err(ApiError::Unauthorized(format!("/channels/{channel_id}/messages")));
        }
        *state.message_fetches.entry(channel_id).or_default() += 1;
        if state.forbidden.contains(&channel_id) {
            return Err(ApiError::Forbidden(format!("/channels/{channel_id}/messages")));
        }

        let mut page: Vec<Message> = state
            .messages
            .get(&channel_id)
            .map(|messages| messages.iter().filter(|m| m.id > after).cloned().collect())
            .unwrap_or_default();
        page.sort_by_key(|m| m.id);
        page.truncate(usize::from(limit));
        // the API answers newest first
        page.reverse();
        Ok(page)
    }

    async fn fetch_reaction_users(
        &self,
        _channel_id: Snowflake,
        message_id: Snowflake,
        emoji: &str,
        after: Option<Snowflake>,
        limit: u16,
    ) -> Result<Vec<User>> {
        let (hang, result) = {
            let mut state = self.state.lock().unwrap();
            state.reaction_requests.push(emoji.to_string());

            let hang = match state.cancel_on_reaction.take() {
                Some(token) => {
                    token.cancel();
                    true
                }
                None => false,
            };

            let result = if after.is_some() && state.failing_later_pages.contains(&message_id) {
                Err(ApiError::NotFound(format!("reactions/{emoji}")))
            } else {
                match state.reactions.get(&(message_id, emoji.to_string())) {
                    Some(users) => {
                        let mut page: Vec<User> = users
                            .iter()
                            .filter(|u| after.is_none_or(|after| u.id > after))
                            .cloned()
                            .collect();
                        page.sort_by_key(|u| u.id);
                        page.truncate(usize::from(limit));
                        Ok(page)
                    }
                    None => Err(ApiError::NotFound(format!("reactions/{emoji}"))),
                }
            };
            (hang, result)
        };

        if hang {
            std::future::pending::<()>().await;
        }
        result
    }

    async fn resolve_member(
        &self,
        guild_id: Snowflake,
        user_id: Snowflake,
    ) -> Result<Option<Member>> {
        let mut state = self.state.lock().unwrap();
        if state.revoked() {
            return Err(ApiError::Unauthorized(format!("/guilds/{guild_id}/members/{user_id}")));
        }
        state.member_lookups += 1;
        Ok(state.members.get(&(guild_id, user_id)).cloned())
    }
}

pub fn new_request(target: Target, output_dir: &Path) -> ExportRequest {
    ExportRequest {
        target,
        file: None,
        output_dir: output_dir.to_path_buf(),
        checkpoint: None,
        options: CrawlOptions::default(),
        argv: vec![],
    }
}

pub fn resume_request(file: &Path) -> ExportRequest {
    let checkpoint = Checkpoint::resolve(file).unwrap();
    ExportRequest {
        target: checkpoint.target.clone(),
        file: Some(file.to_path_buf()),
        output_dir: file.parent().unwrap().to_path_buf(),
        checkpoint: Some(checkpoint),
        options: CrawlOptions::default(),
        argv: vec!["continue".to_string(), file.display().to_string()],
    }
}

pub fn read_log(path: &Path) -> Vec<Record> {
    let file = File::open(path).unwrap();
    read_records(BufReader::new(file))
        .collect::<anyhow::Result<Vec<_>>>()
        .unwrap()
}

pub fn kinds(records: &[Record]) -> Vec<&'static str> {
    records.iter().map(|r| r.kind().as_str()).collect()
}

/// Records of the entity kinds only, as `kind:id` labels.
pub fn entity_labels(records: &[Record]) -> Vec<String> {
    records
        .iter()
        .filter_map(|record| match record {
            Record::User(user) => Some(format!("user:{}", user.id)),
            Record::Message(message) => Some(format!("message:{}", message.id)),
            _ => None,
        })
        .collect()
}

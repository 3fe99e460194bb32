use std::io::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use super::paginator::{MAX_PAGE_SIZE, MessagePager};
use super::reactions::ReactionUsers;
use super::users::UserCache;
use crate::api::DiscordApi;
use crate::checkpoint::Resume;
use crate::models::{Channel, Message, Snowflake, User, epoch_seconds};
use crate::record::{MessageRecord, ReactionRecord, Record, RecordLog};

/// Default distance the checkpoint is moved back before a resumed channel is
/// paginated again.
pub const DEFAULT_OVERLAP_MINUTES: i64 = 60;

/// Largest accepted overlap, twenty years.
pub const MAX_OVERLAP_MINUTES: i64 = 20 * 366 * 24 * 60;

#[derive(Debug, Clone)]
pub struct CrawlOptions {
    pub page_size: u16,
    pub overlap: Duration,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            page_size: MAX_PAGE_SIZE,
            overlap: Duration::minutes(DEFAULT_OVERLAP_MINUTES),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOutcome {
    Completed,
    /// `consistent` is false when a message was abandoned halfway through
    /// its reactions.
    Interrupted { consistent: bool },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkStats {
    pub channels: usize,
    pub skipped: usize,
    pub messages: usize,
    pub users: usize,
}

enum ChannelOutcome {
    Done,
    Skipped,
    Interrupted { consistent: bool },
}

/// Share of a channel's backlog covered once pagination reached `last`,
/// measured from the first message to now.
pub fn progress_percent(now: DateTime<Utc>, first: DateTime<Utc>, last: DateTime<Utc>) -> f64 {
    let timespan = (now - first).num_milliseconds();
    if timespan <= 0 {
        return 100.0;
    }
    let covered = (now - last).num_milliseconds().max(0);
    ((1.0 - covered as f64 / timespan as f64) * 100.0).clamp(0.0, 100.0)
}

/// Walks channels one after another, writing users and messages to the log.
pub struct ChannelWalker<'a, A: DiscordApi + ?Sized, W: Write> {
    api: &'a A,
    log: &'a mut RecordLog<W>,
    resume: Resume,
    users: UserCache,
    options: CrawlOptions,
    cancel: CancellationToken,
    now: DateTime<Utc>,
    stats: WalkStats,
}

impl<'a, A: DiscordApi + ?Sized, W: Write> ChannelWalker<'a, A, W> {
    pub fn new(
        api: &'a A,
        log: &'a mut RecordLog<W>,
        resume: Resume,
        users: UserCache,
        options: CrawlOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            api,
            log,
            resume,
            users,
            options,
            cancel,
            now: Utc::now(),
            stats: WalkStats::default(),
        }
    }

    pub fn stats(&self) -> WalkStats {
        self.stats
    }

    pub async fn walk(&mut self, channels: &[Channel]) -> Result<WalkOutcome> {
        info!("starting crawl of {} channels", channels.len());

        for (index, channel) in channels.iter().enumerate() {
            if self.cancel.is_cancelled() {
                self.log.flush()?;
                return Ok(WalkOutcome::Interrupted { consistent: true });
            }

            info!("==> {} ({})", channel.id(), channel.display_name());

            match self.walk_channel(index + 1, channels.len(), channel).await? {
                ChannelOutcome::Done => self.stats.channels += 1,
                ChannelOutcome::Skipped => self.stats.skipped += 1,
                ChannelOutcome::Interrupted { consistent } => {
                    self.log.flush()?;
                    return Ok(WalkOutcome::Interrupted { consistent });
                }
            }
        }

        self.log.flush()?;
        Ok(WalkOutcome::Completed)
    }

    async fn walk_channel(
        &mut self,
        position: usize,
        total: usize,
        channel: &Channel,
    ) -> Result<ChannelOutcome> {
        let channel_id = channel.id();
        let name = channel.display_name();
        let guild_id = channel.guild_id();

        let after = self.resume.lower_bound(channel_id, self.options.overlap);
        let mut pager = MessagePager::new(
            self.api,
            channel_id,
            Snowflake::from_datetime(after),
            self.options.page_size,
        );

        let mut first: Option<DateTime<Utc>> = None;
        let mut emitted = 0usize;

        loop {
            let page = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Ok(ChannelOutcome::Interrupted { consistent: true });
                }
                page = pager.next_page() => page,
            };

            let page = match page {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(e) if first.is_none() && e.is_inaccessible() => {
                    warn!("{channel_id} ({name}) is not accessible, skipping: {e}");
                    return Ok(ChannelOutcome::Skipped);
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("failed to fetch messages of {channel_id} ({name})"));
                }
            };

            let (Some(head), Some(tail)) = (page.first(), page.last()) else {
                break;
            };
            let first_time = *first.get_or_insert(head.timestamp);
            let last_time = tail.timestamp;

            for message in &page {
                if self.cancel.is_cancelled() {
                    return Ok(ChannelOutcome::Interrupted { consistent: true });
                }

                self.ensure_user(guild_id, &message.author).await?;

                let timestamp = epoch_seconds(message.timestamp);
                if self.resume.is_recorded(channel_id, message.id, timestamp) {
                    continue;
                }

                let Some(record) = self.resolve_message(guild_id, message).await? else {
                    warn!("interrupted while resolving reactions of message {}", message.id);
                    return Ok(ChannelOutcome::Interrupted { consistent: false });
                };

                self.log.append(&Record::Message(record))?;
                self.log.flush()?;
                self.resume.messages.insert(message.id);
                emitted += 1;
                self.stats.messages += 1;
            }

            info!(
                "{position}/{total} {channel_id} ({name}): {:.2}% ({emitted} messages, at {})",
                progress_percent(self.now, first_time, last_time),
                last_time.format("%Y-%m-%d")
            );
        }

        if first.is_none() {
            info!("{channel_id} ({name}) has no messages");
        } else {
            info!("{channel_id} ({name}) done");
        }

        Ok(ChannelOutcome::Done)
    }

    async fn ensure_user(&mut self, guild_id: Option<Snowflake>, user: &User) -> Result<()> {
        let record = self
            .users
            .ensure(self.api, guild_id, user)
            .await
            .with_context(|| format!("failed to resolve user {}", user.id))?;

        if let Some(record) = record {
            self.log.append(&record)?;
            self.stats.users += 1;
        }
        Ok(())
    }

    /// Message record with every reaction resolved, or `None` when the walk
    /// was cancelled before all reactions were.
    async fn resolve_message(
        &mut self,
        guild_id: Option<Snowflake>,
        message: &Message,
    ) -> Result<Option<MessageRecord>> {
        let mut record = MessageRecord::new(message);

        for reaction in &message.reactions {
            let mut pager =
                ReactionUsers::new(self.api, message.channel_id, message.id, &reaction.emoji);
            let mut user_ids = Vec::new();

            loop {
                let page = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Ok(None),
                    page = pager.next_page() => page,
                };

                let Some(users) = page.with_context(|| {
                    format!(
                        "failed to resolve reaction {} on message {}",
                        pager.emoji().segment(),
                        message.id
                    )
                })?
                else {
                    break;
                };

                for user in &users {
                    self.ensure_user(guild_id, user).await?;
                    user_ids.push(user.id);
                }
            }

            record
                .reactions
                .push(ReactionRecord::new(reaction, user_ids));
        }

        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_runs_from_first_message_to_now() {
        let now = Utc::now();
        let first = now - Duration::days(100);
        assert_eq!(progress_percent(now, first, first), 0.0);
        assert_eq!(progress_percent(now, first, now), 100.0);
        let half = progress_percent(now, first, now - Duration::days(50));
        assert!((half - 50.0).abs() < 1e-6);
    }

    #[test]
    fn progress_of_fresh_channel_is_complete() {
        let now = Utc::now();
        assert_eq!(progress_percent(now, now, now), 100.0);
    }
}

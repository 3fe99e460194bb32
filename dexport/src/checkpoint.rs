//! Rebuilds the state of previous runs from an existing record log.

use std::{
    collections::{BTreeMap, HashSet},
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, TimeZone, Utc};
use log::debug;

use crate::models::{Snowflake, from_epoch_seconds};
use crate::record::{Record, Target, read_records};

/// Lower bound for channels that were never crawled. Predates every message
/// on the platform.
pub fn platform_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2015, 5, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// What the walker needs to know about already recorded messages.
#[derive(Debug, Clone, Default)]
pub struct Resume {
    /// highest recorded message timestamp per channel, epoch seconds
    pub timestamps: BTreeMap<Snowflake, f64>,
    /// ids of every recorded message
    pub messages: HashSet<Snowflake>,
}

impl Resume {
    pub fn checkpoint(&self, channel_id: Snowflake) -> Option<f64> {
        self.timestamps.get(&channel_id).copied()
    }

    /// Where pagination for `channel_id` starts: the checkpoint moved back by
    /// `overlap`, or the platform epoch for a channel seen for the first time.
    pub fn lower_bound(&self, channel_id: Snowflake, overlap: Duration) -> DateTime<Utc> {
        self.checkpoint(channel_id)
            .and_then(from_epoch_seconds)
            .and_then(|time| time.checked_sub_signed(overlap))
            .map(|time| time.max(platform_epoch()))
            .unwrap_or_else(platform_epoch)
    }

    /// Whether a message was already written by an earlier run.
    pub fn is_recorded(&self, channel_id: Snowflake, message_id: Snowflake, timestamp: f64) -> bool {
        self.messages.contains(&message_id)
            || self
                .checkpoint(channel_id)
                .is_some_and(|checkpoint| timestamp <= checkpoint)
    }

    fn observe(&mut self, channel_id: Snowflake, timestamp: f64) {
        let current = self.timestamps.entry(channel_id).or_insert(timestamp);
        if timestamp > *current {
            *current = timestamp;
        }
    }
}

#[derive(Debug, Clone)]
pub struct Checkpoint {
    /// configuration of the first run in the log
    pub target: Target,
    pub resume: Resume,
    /// ids of every user record in the log
    pub users: HashSet<Snowflake>,
    /// number of `run_info` records
    pub runs: usize,
    /// whether the last run ended with `run_finished`
    pub finished: bool,
    /// whether that `run_finished` marks a cancelled run
    pub interrupted: bool,
}

impl Checkpoint {
    pub fn resolve(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open record log {}", path.display()))?;
        Self::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to resolve checkpoint from {}", path.display()))
    }

    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut target = None;
        let mut resume = Resume::default();
        let mut users = HashSet::new();
        let mut runs = 0;
        let mut finished = false;
        let mut interrupted = false;

        for record in read_records(reader) {
            match record? {
                Record::RunInfo(info) => {
                    runs += 1;
                    finished = false;
                    interrupted = false;
                    if target.is_none() {
                        target = Some(info.conf);
                    }
                    for (channel_id, timestamp) in info.timestamps {
                        resume.observe(channel_id, timestamp);
                    }
                }
                Record::Message(message) => {
                    resume.observe(message.channel, message.timestamp);
                    resume.messages.insert(message.id);
                }
                Record::User(user) => {
                    users.insert(user.id);
                }
                Record::RunFinished(end) => {
                    finished = true;
                    interrupted = end.interrupted;
                }
                Record::ServerInfo(_) | Record::ChannelsInfo(_) => {}
            }
        }

        let Some(target) = target else {
            bail!("no run_info record found");
        };

        debug!(
            "checkpoint: {} runs, {} channels, {} messages, {} users",
            runs,
            resume.timestamps.len(),
            resume.messages.len(),
            users.len()
        );

        Ok(Self {
            target,
            resume,
            users,
            runs,
            finished,
            interrupted,
        })
    }
}

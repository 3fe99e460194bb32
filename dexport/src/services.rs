use std::{
    collections::HashSet,
    path::PathBuf,
    sync::LazyLock,
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{Local, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::api::discord::DEFAULT_API_URL;
use crate::api::{DiscordApi, DiscordClient};
use crate::checkpoint::{Checkpoint, Resume};
use crate::cli::{Args, Mode};
use crate::crawl::{ChannelWalker, CrawlOptions, UserCache, WalkOutcome, WalkStats};
use crate::models::{Channel, Guild, Snowflake, epoch_seconds};
use crate::record::{Record, RecordLog, RunFinished, RunInfo, ServerInfo, Target};
use crate::settings;

static UNSAFE_FILE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z\d_()-]").expect("valid file name pattern"));

/// Channels a run will walk, and where they come from.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub guild: Option<Guild>,
    pub channels: Vec<Channel>,
    pub container_id: String,
    pub container_name: String,
}

/// Everything an export needs besides the API.
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub target: Target,
    /// log to append to; a new file in `output_dir` when unset
    pub file: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub checkpoint: Option<Checkpoint>,
    pub options: CrawlOptions,
    pub argv: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub file: PathBuf,
    pub outcome: WalkOutcome,
    pub stats: WalkStats,
}

pub async fn run(args: Args) -> Result<ExportSummary> {
    let args = settings::merge_settings_with_args(&args)?;

    let (target, file, checkpoint) = match &args.command {
        Mode::Continue { file } => {
            info!("reading previous run info from {}", file.display());
            let checkpoint = Checkpoint::resolve(file)?;
            (checkpoint.target.clone(), Some(file.clone()), Some(checkpoint))
        }
        mode => (mode.target()?, None, None),
    };

    let token = args
        .token
        .clone()
        .filter(|token| !token.is_empty())
        .ok_or_else(|| anyhow!("no credentials are set, use --token or DISCORD_TOKEN"))?;
    let api_url = args
        .api_url
        .clone()
        .unwrap_or_else(|| DEFAULT_API_URL.to_string());
    let client = DiscordClient::new(api_url, &token, args.bot)?;

    let request = ExportRequest {
        target,
        file,
        output_dir: args.output_dir.clone().unwrap_or_else(|| PathBuf::from(".")),
        checkpoint,
        options: args.crawl_options(),
        argv: std::env::args().skip(1).collect(),
    };

    let cancel = CancellationToken::new();
    tokio::spawn(listen_for_shutdown(cancel.clone()));

    export(&client, request, cancel).await
}

/// Cancels `cancel` on Ctrl-C or SIGTERM.
async fn listen_for_shutdown(cancel: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("interrupted"),
                    _ = sigterm.recv() => info!("terminated"),
                }
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                ctrl_c.await.ok();
                info!("interrupted");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("interrupted");
    }
    cancel.cancel();
}

/// Runs one export against `api`: resolves the channels, appends the run's
/// records to the log, and closes it with `run_finished` unless the run
/// stopped in the middle of a message.
pub async fn export<A: DiscordApi + ?Sized>(
    api: &A,
    request: ExportRequest,
    cancel: CancellationToken,
) -> Result<ExportSummary> {
    if let Some(checkpoint) = &request.checkpoint {
        if !checkpoint.finished {
            warn!("previous run did not finish cleanly, resuming from its last recorded messages");
        } else if checkpoint.interrupted {
            warn!("previous run was interrupted, resuming from its last recorded messages");
        }
        info!(
            "resuming after {} runs with {} channel checkpoints",
            checkpoint.runs,
            checkpoint.resume.timestamps.len()
        );
    }

    let me = api
        .current_user()
        .await
        .context("failed to log in")?;
    info!("logged in as {} ({})", me.username, me.id);

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner} {msg}")?);
    spinner.set_message("Resolving channels...");
    spinner.enable_steady_tick(Duration::from_millis(100));
    let resolved = resolve_target(api, &request.target).await;
    spinner.finish_and_clear();
    let resolved = resolved?;

    let file = match &request.file {
        Some(file) => file.clone(),
        None => request.output_dir.join(log_file_name(
            &resolved.container_id,
            &resolved.container_name,
        )),
    };

    info!("file: {}", file.display());
    match &resolved.guild {
        Some(guild) => info!("server: {} ({})", guild.id, guild.name),
        None => info!("server: dm"),
    }
    for channel in &resolved.channels {
        info!("channel: {} ({})", channel.id(), channel.display_name());
    }

    let (resume, mut users) = match request.checkpoint {
        Some(checkpoint) => (checkpoint.resume, UserCache::with_known(checkpoint.users)),
        None => (Resume::default(), UserCache::new()),
    };
    if let Some(guild) = &resolved.guild {
        users.set_guild_roles(guild.roles.clone());
    }

    let mut log = RecordLog::append_to(&file)?;

    let run_info = RunInfo {
        argv: request.argv,
        time: epoch_seconds(Utc::now()),
        user_id: Some(me.id),
        version: env!("CARGO_PKG_VERSION").to_string(),
        server: resolved.guild.as_ref().map(|g| g.id),
        conf: request.target,
        file: file.display().to_string(),
        channels: resolved.channels.iter().map(Channel::id).collect(),
        timestamps: resume.timestamps.clone(),
    };
    log.append(&Record::RunInfo(Box::new(run_info)))?;

    match &resolved.guild {
        Some(guild) => {
            info!("serializing server info");
            let channels = api
                .guild_channels(guild.id)
                .await
                .with_context(|| format!("failed to list channels of server {}", guild.id))?;
            log.append(&Record::ServerInfo(Box::new(ServerInfo::new(guild, channels))))?;
        }
        None => {
            info!("serializing channels info");
            log.append(&Record::ChannelsInfo(resolved.channels.clone()))?;
        }
    }
    log.flush()?;

    let mut walker = ChannelWalker::new(api, &mut log, resume, users, request.options, cancel);
    let walked = walker.walk(&resolved.channels).await;
    let stats = walker.stats();
    let outcome = match walked {
        Ok(outcome) => outcome,
        Err(e) => {
            log.flush()?;
            return Err(e);
        }
    };

    match outcome {
        WalkOutcome::Completed | WalkOutcome::Interrupted { consistent: true } => {
            let interrupted = outcome != WalkOutcome::Completed;
            log.append(&Record::RunFinished(RunFinished {
                time: epoch_seconds(Utc::now()),
                interrupted,
            }))?;
        }
        WalkOutcome::Interrupted { consistent: false } => {
            warn!("last message was not fully resolved, leaving the run unfinished");
        }
    }
    log.flush()?;

    info!(
        "{} channels walked, {} skipped, {} messages and {} users written to {}",
        stats.channels,
        stats.skipped,
        stats.messages,
        stats.users,
        file.display()
    );

    Ok(ExportSummary {
        file,
        outcome,
        stats,
    })
}

/// Turns a configured target into the channels to walk. Channels that cannot
/// be read are logged and left out.
pub async fn resolve_target<A: DiscordApi + ?Sized>(
    api: &A,
    target: &Target,
) -> Result<ResolvedTarget> {
    let resolved = match target {
        Target::Dm => {
            let channels = api
                .private_channels()
                .await
                .context("failed to list private channels")?;
            ResolvedTarget {
                guild: None,
                channels,
                container_id: "dm".to_string(),
                container_name: "dm".to_string(),
            }
        }
        Target::Server(guild_id) => {
            let guild = api
                .guild(*guild_id)
                .await
                .with_context(|| format!("server {guild_id} does not exist"))?;
            let channels = api
                .guild_channels(*guild_id)
                .await
                .with_context(|| format!("failed to list channels of server {guild_id}"))?;
            let mut channels = filter_channels(channels);
            channels.sort_by_key(|channel| match channel {
                Channel::Guild(ch) => (ch.position, ch.id),
                _ => (0, channel.id()),
            });
            ResolvedTarget {
                container_id: guild.id.to_string(),
                container_name: guild.name.clone(),
                guild: Some(guild),
                channels,
            }
        }
        Target::Channels(ids) => resolve_channel_list(api, ids).await?,
    };

    if resolved.channels.is_empty() {
        bail!("no channels to work with");
    }
    Ok(resolved)
}

async fn resolve_channel_list<A: DiscordApi + ?Sized>(
    api: &A,
    ids: &[Snowflake],
) -> Result<ResolvedTarget> {
    let mut seen = HashSet::new();
    let mut channels = Vec::new();
    for id in ids {
        if !seen.insert(*id) {
            warn!("repeated channel identifier {id}");
            continue;
        }
        match api.channel(*id).await {
            Ok(channel) => channels.push(channel),
            Err(e) if e.is_inaccessible() => error!("channel {id} does not exist: {e}"),
            Err(e) => return Err(e).with_context(|| format!("failed to look up channel {id}")),
        }
    }

    let sources: HashSet<Option<Snowflake>> = channels.iter().map(Channel::guild_id).collect();
    if sources.len() > 1 {
        bail!("when specifying channels only one source is allowed");
    }

    let Some(guild_id) = channels.first().and_then(Channel::guild_id) else {
        let container_name = match channels.as_slice() {
            [only] => only.display_name(),
            _ => "dm".to_string(),
        };
        return Ok(ResolvedTarget {
            guild: None,
            channels,
            container_id: "dm".to_string(),
            container_name,
        });
    };

    let guild = api
        .guild(guild_id)
        .await
        .with_context(|| format!("server {guild_id} does not exist"))?;
    Ok(ResolvedTarget {
        container_id: guild.id.to_string(),
        container_name: guild.name.clone(),
        guild: Some(guild),
        channels: filter_channels(channels),
    })
}

/// Keeps guild channels that have a message history.
fn filter_channels(channels: Vec<Channel>) -> Vec<Channel> {
    channels
        .into_iter()
        .filter(|channel| match channel {
            Channel::Guild(ch) if !ch.kind.has_history() => {
                info!("filtering out {} ({}), type {:?}", ch.id, ch.name, ch.kind);
                false
            }
            _ => true,
        })
        .collect()
}

/// `<container id>.<local date and minute>.<sanitised container name>.records`
pub fn log_file_name(container_id: &str, container_name: &str) -> String {
    let date = Local::now().format("%Y-%m-%dT%H-%M");
    let name = UNSAFE_FILE_CHARS.replace_all(container_name, "_");
    format!("{container_id}.{date}.{name}.records")
}

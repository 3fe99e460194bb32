pub mod paginator;
pub mod reactions;
pub mod users;
pub mod walker;

pub use paginator::MessagePager;
pub use reactions::{ReactionUsers, resolve_reaction_users};
pub use users::UserCache;
pub use walker::{ChannelWalker, CrawlOptions, MAX_OVERLAP_MINUTES, WalkOutcome, WalkStats};

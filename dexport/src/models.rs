pub mod discord;
pub mod snowflake;

pub use discord::*;
pub use snowflake::{Snowflake, epoch_seconds, from_epoch_seconds};

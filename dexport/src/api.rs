pub mod discord;

pub use discord::{DiscordApi, DiscordClient};

use log::trace;

use crate::api::DiscordApi;
use crate::error::Result;
use crate::models::{Message, Snowflake};

/// Largest page the messages endpoint serves.
pub const MAX_PAGE_SIZE: u16 = 100;

/// Pulls one channel's messages in ascending time order, one page per call.
pub struct MessagePager<'a, A: DiscordApi + ?Sized> {
    api: &'a A,
    channel_id: Snowflake,
    cursor: Snowflake,
    page_size: u16,
    exhausted: bool,
    pages: usize,
}

impl<'a, A: DiscordApi + ?Sized> MessagePager<'a, A> {
    pub fn new(api: &'a A, channel_id: Snowflake, after: Snowflake, page_size: u16) -> Self {
        Self {
            api,
            channel_id,
            cursor: after,
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
            exhausted: false,
            pages: 0,
        }
    }

    /// Next batch of messages strictly after the previous one, or `None` once
    /// the channel is exhausted. The cursor only moves after a successful
    /// fetch, so a dropped or failed call can be repeated.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Message>>> {
        if self.exhausted {
            return Ok(None);
        }

        let mut page = self
            .api
            .fetch_messages(self.channel_id, self.cursor, self.page_size)
            .await?;

        if page.is_empty() {
            self.exhausted = true;
            return Ok(None);
        }

        page.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));

        // ids encode creation time, so the newest id is the last message's
        if let Some(newest) = page.iter().map(|m| m.id).max() {
            self.cursor = self.cursor.max(newest);
        }
        if page.len() < usize::from(self.page_size) {
            self.exhausted = true;
        }
        self.pages += 1;

        trace!(
            "channel {} page {}: {} messages, cursor {}",
            self.channel_id,
            self.pages,
            page.len(),
            self.cursor
        );

        Ok(Some(page))
    }

    pub fn cursor(&self) -> Snowflake {
        self.cursor
    }

    pub fn pages(&self) -> usize {
        self.pages
    }
}

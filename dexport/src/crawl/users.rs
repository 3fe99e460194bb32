use std::collections::HashSet;

use log::{debug, warn};

use crate::api::DiscordApi;
use crate::error::Result;
use crate::models::{Role, Snowflake, User};
use crate::record::{Record, UserRecord};

/// User ids already written to the log. One per run; a resumed run starts
/// from the ids of the log it appends to.
#[derive(Debug, Default)]
pub struct UserCache {
    seen: HashSet<Snowflake>,
    /// roles of the guild being walked, for the member projection
    roles: Vec<Role>,
}

impl UserCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_known(ids: impl IntoIterator<Item = Snowflake>) -> Self {
        Self {
            seen: ids.into_iter().collect(),
            roles: Vec::new(),
        }
    }

    pub fn set_guild_roles(&mut self, roles: Vec<Role>) {
        self.roles = roles;
    }

    pub fn contains(&self, id: Snowflake) -> bool {
        self.seen.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// A user record for `user` if it was not emitted yet. Inside a guild the
    /// member projection is preferred; a member that cannot be looked up
    /// falls back to the bare user.
    pub async fn ensure<A: DiscordApi + ?Sized>(
        &mut self,
        api: &A,
        guild_id: Option<Snowflake>,
        user: &User,
    ) -> Result<Option<Record>> {
        if self.seen.contains(&user.id) {
            return Ok(None);
        }

        let member = match guild_id {
            Some(guild_id) => match api.resolve_member(guild_id, user.id).await {
                Ok(member) => member,
                Err(e) if e.is_inaccessible() => {
                    warn!("member lookup for {} in {guild_id} failed: {e}", user.id);
                    None
                }
                Err(e) => return Err(e),
            },
            None => None,
        };

        debug!("new user {} ({})", user.id, user.username);
        self.seen.insert(user.id);
        Ok(Some(Record::User(UserRecord::new(user, member.as_ref(), &self.roles))))
    }
}

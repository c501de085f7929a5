use std::collections::HashMap;

use uuid::Uuid;

use crate::error::Result;
use crate::models::Member;

/// Display attributes of group members. Only used to decorate output; ledger rules
/// never consult it.
#[rocket::async_trait]
pub trait ParticipantDirectory: Send + Sync {
    async fn group_members(&self, group_id: Uuid) -> Result<Vec<Member>>;
}

/// Fixed member lists, for running without a database.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    groups: HashMap<Uuid, Vec<Member>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(mut self, group_id: Uuid, members: Vec<Member>) -> Self {
        self.groups.insert(group_id, members);
        self
    }
}

#[rocket::async_trait]
impl ParticipantDirectory for StaticDirectory {
    async fn group_members(&self, group_id: Uuid) -> Result<Vec<Member>> {
        Ok(self.groups.get(&group_id).cloned().unwrap_or_default())
    }
}

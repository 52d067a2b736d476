use std::collections::HashMap;

use shared::{
    domain::{ConversationRef, GroupId, UserId},
    protocol::{FriendDetails, FriendSummary, GroupMember, GroupSummary},
};
use tracing::info;

use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub id: UserId,
    pub name: String,
    pub user_name: String,
    pub avatar: Option<String>,
    /// Synthesized for a sender the directory did not know about.
    pub placeholder: bool,
}

impl Profile {
    fn placeholder(id: UserId) -> Self {
        Self {
            id,
            name: format!("User {id}"),
            user_name: String::new(),
            avatar: None,
            placeholder: true,
        }
    }
}

impl From<&FriendDetails> for Profile {
    fn from(details: &FriendDetails) -> Self {
        Self {
            id: details.id,
            name: details.name.clone(),
            user_name: details.user_name.clone(),
            avatar: details.avatar.clone(),
            placeholder: false,
        }
    }
}

impl From<&GroupMember> for Profile {
    fn from(member: &GroupMember) -> Self {
        Self {
            id: member.id,
            name: member.name.clone(),
            user_name: member.user_name.clone(),
            avatar: member.avatar.clone(),
            placeholder: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupProfile {
    pub id: GroupId,
    pub name: String,
    /// Server-defined member order.
    pub members: Vec<Profile>,
    pub placeholder: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub conversation: ConversationRef,
    pub synthesized: bool,
}

/// Participant and group directory for the session, in sidebar order.
#[derive(Debug, Default)]
pub struct IdentityResolver {
    slots: Vec<ConversationRef>,
    friends: HashMap<UserId, Profile>,
    groups: HashMap<GroupId, GroupProfile>,
}

impl IdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_summaries(friends: &[FriendSummary], groups: &[GroupSummary]) -> Self {
        let mut resolver = Self::new();
        resolver.merge_summaries(friends, groups);
        resolver
    }

    /// Upserts a freshly fetched directory. Known entries keep their slot,
    /// placeholders are upgraded in place, new entries are appended.
    pub fn merge_summaries(&mut self, friends: &[FriendSummary], groups: &[GroupSummary]) {
        for summary in friends {
            let profile = Profile::from(&summary.friend_details);
            let conversation = ConversationRef::Direct(profile.id);
            if self.friends.insert(profile.id, profile).is_none() {
                self.slots.push(conversation);
            }
        }

        for summary in groups {
            let group = GroupProfile {
                id: summary.id,
                name: summary.name.clone(),
                members: summary.users.iter().map(Profile::from).collect(),
                placeholder: false,
            };
            if self.groups.insert(summary.id, group).is_none() {
                self.slots.push(ConversationRef::Group(summary.id));
            }
        }
    }

    pub fn resolve(&self, id: UserId) -> Result<ConversationRef, SyncError> {
        if self.friends.contains_key(&id) {
            Ok(ConversationRef::Direct(id))
        } else {
            Err(SyncError::UnknownSender(id))
        }
    }

    /// Resolves `id`, synthesizing a `"User {id}"` entry at the top of the
    /// list when the directory has never heard of it.
    pub fn resolve_or_placeholder(&mut self, id: UserId) -> Resolution {
        match self.resolve(id) {
            Ok(conversation) => Resolution {
                conversation,
                synthesized: false,
            },
            Err(_) => {
                let conversation = ConversationRef::Direct(id);
                let profile = self
                    .group_member(id)
                    .cloned()
                    .unwrap_or_else(|| Profile::placeholder(id));
                info!(user_id = id.0, name = %profile.name, "identity: synthesized conversation for unknown sender");
                self.friends.insert(id, profile);
                self.slots.insert(0, conversation);
                Resolution {
                    conversation,
                    synthesized: true,
                }
            }
        }
    }

    /// Makes sure `id` has an entry; returns whether one had to be created.
    pub fn ensure_group(&mut self, id: GroupId) -> bool {
        if self.groups.contains_key(&id) {
            return false;
        }
        info!(group_id = id.0, "identity: synthesized unknown group");
        self.groups.insert(
            id,
            GroupProfile {
                id,
                name: format!("Group {id}"),
                members: Vec::new(),
                placeholder: true,
            },
        );
        self.slots.insert(0, ConversationRef::Group(id));
        true
    }

    pub fn profile(&self, id: UserId) -> Option<&Profile> {
        self.friends.get(&id).or_else(|| self.group_member(id))
    }

    pub fn group(&self, id: GroupId) -> Option<&GroupProfile> {
        self.groups.get(&id)
    }

    pub fn member_name(&self, group_id: GroupId, user_id: UserId) -> Option<&str> {
        self.groups
            .get(&group_id)?
            .members
            .iter()
            .find(|member| member.id == user_id)
            .map(|member| member.name.as_str())
    }

    pub fn display_name(&self, conversation: ConversationRef) -> String {
        match conversation {
            ConversationRef::Direct(id) => self
                .friends
                .get(&id)
                .map(|profile| profile.name.clone())
                .unwrap_or_else(|| format!("User {id}")),
            ConversationRef::Group(id) => self
                .groups
                .get(&id)
                .map(|group| group.name.clone())
                .unwrap_or_else(|| format!("Group {id}")),
        }
    }

    /// Friends, placeholders and members of any known group.
    pub fn is_known(&self, id: UserId) -> bool {
        self.friends.contains_key(&id) || self.group_member(id).is_some()
    }

    pub fn slots(&self) -> &[ConversationRef] {
        &self.slots
    }

    pub fn friend_ids(&self) -> impl Iterator<Item = UserId> + '_ {
        self.slots.iter().filter_map(ConversationRef::direct_peer)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.friends.clear();
        self.groups.clear();
    }

    fn group_member(&self, id: UserId) -> Option<&Profile> {
        self.groups
            .values()
            .flat_map(|group| group.members.iter())
            .find(|member| member.id == id)
    }
}

#[cfg(test)]
#[path = "tests/identity_tests.rs"]
mod tests;

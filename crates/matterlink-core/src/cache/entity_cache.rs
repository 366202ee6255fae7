use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwapOption;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use matterlink_api::RestClient;
use matterlink_api::models::{Channel, Team, User};

use super::normalize::normalized_name;
use crate::error::CoreError;
use crate::ratelimit::retry_rate_limited;

/// The currently authenticated REST client, swapped on every login.
pub type ClientSlot = Arc<ArcSwapOption<RestClient>>;

/// One team and everything cached under it.
#[derive(Debug, Clone)]
pub struct TeamEntry {
    pub team: Team,
    /// Channels the session user has joined (DMs and groups included).
    pub channels: Arc<Vec<Channel>>,
    /// Public channels the session user has not joined.
    pub more_channels: Arc<Vec<Channel>>,
    /// Members of the team.
    pub users: HashMap<String, Arc<User>>,
}

impl TeamEntry {
    fn new(team: Team, users: HashMap<String, Arc<User>>) -> Self {
        Self {
            team,
            channels: Arc::new(Vec::new()),
            more_channels: Arc::new(Vec::new()),
            users,
        }
    }

    fn find_channel(&self, channel_id: &str) -> Option<&Channel> {
        self.channels
            .iter()
            .chain(self.more_channels.iter())
            .find(|c| c.id == channel_id)
    }
}

#[derive(Debug, Default)]
struct CacheState {
    me: Option<Arc<User>>,
    primary_team_id: Option<String>,
    teams: Vec<TeamEntry>,
    users: HashMap<String, Arc<User>>,
}

/// Session-wide cache of organizational entities.
///
/// All reads take the read lock; fills and refreshes take the write lock.
/// Lookups that miss and cannot be filled return `None`.
pub struct EntityCache {
    state: RwLock<CacheState>,
    client: ClientSlot,
    channel_refresh_in_flight: AtomicBool,
}

impl EntityCache {
    pub fn new(client: ClientSlot) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            client,
            channel_refresh_in_flight: AtomicBool::new(false),
        }
    }

    fn client(&self) -> Result<Arc<RestClient>, CoreError> {
        self.client.load_full().ok_or(CoreError::NotConnected)
    }

    // ── Population ───────────────────────────────────────────────────

    /// Record the logged-in user.
    pub async fn set_me(&self, user: User) {
        let user = Arc::new(user);
        let mut state = self.state.write().await;
        state.users.insert(user.id.clone(), Arc::clone(&user));
        state.me = Some(user);
    }

    /// Enumerate the session user's teams and their members, and select
    /// `primary_team` by name.
    ///
    /// Fails with [`CoreError::TeamNotFound`] listing the valid names when
    /// the user is not a member of `primary_team`.
    pub async fn load_teams(&self, primary_team: &str) -> Result<(), CoreError> {
        let client = self.client()?;
        let me = self.me().await.ok_or(CoreError::NotConnected)?;

        let teams =
            retry_rate_limited("teams_for_user", || client.teams_for_user(&me.id)).await?;
        let Some(primary) = teams.iter().find(|t| t.name == primary_team) else {
            return Err(CoreError::TeamNotFound {
                team: primary_team.to_owned(),
                valid: teams.iter().map(|t| t.name.clone()).collect(),
            });
        };
        let primary_id = primary.id.clone();

        let mut entries = Vec::with_capacity(teams.len());
        for team in teams {
            let members =
                retry_rate_limited("users_in_team", || client.users_in_team(&team.id)).await?;
            debug!(team = %team.name, members = members.len(), "loaded team members");
            let users = members
                .into_iter()
                .map(|u| (u.id.clone(), Arc::new(u)))
                .collect();
            entries.push(TeamEntry::new(team, users));
        }

        let mut state = self.state.write().await;
        for entry in &entries {
            for (id, user) in &entry.users {
                state.users.insert(id.clone(), Arc::clone(user));
            }
        }
        // Keep channel slots of teams that survive a reload.
        for entry in &mut entries {
            if let Some(old) = state.teams.iter().find(|t| t.team.id == entry.team.id) {
                entry.channels = Arc::clone(&old.channels);
                entry.more_channels = Arc::clone(&old.more_channels);
            }
        }
        info!(teams = entries.len(), primary = primary_team, "teams loaded");
        state.teams = entries;
        state.primary_team_id = Some(primary_id);
        Ok(())
    }

    /// Refetch joined and discoverable channels of one team, swapping both
    /// slots at once.
    pub async fn refresh_channels(&self, team_id: &str) -> Result<(), CoreError> {
        let client = self.client()?;
        let me = self.me().await.ok_or(CoreError::NotConnected)?;

        let joined = retry_rate_limited("channels_for_user", || {
            client.channels_for_user(&me.id, team_id)
        })
        .await?;
        let joined_ids: HashSet<&str> = joined.iter().map(|c| c.id.as_str()).collect();
        let more: Vec<Channel> =
            retry_rate_limited("public_channels", || client.public_channels(team_id))
                .await?
                .into_iter()
                .filter(|c| !joined_ids.contains(c.id.as_str()))
                .collect();

        debug!(
            team_id,
            joined = joined.len(),
            more = more.len(),
            "refreshed channels"
        );

        let mut state = self.state.write().await;
        match state.teams.iter_mut().find(|t| t.team.id == team_id) {
            Some(entry) => {
                entry.channels = Arc::new(joined);
                entry.more_channels = Arc::new(more);
                Ok(())
            }
            None => Err(CoreError::Internal(format!("unknown team {team_id}"))),
        }
    }

    /// [`refresh_channels`](Self::refresh_channels) for every team.
    pub async fn refresh_all_channels(&self) -> Result<(), CoreError> {
        let team_ids: Vec<String> = self
            .state
            .read()
            .await
            .teams
            .iter()
            .map(|t| t.team.id.clone())
            .collect();
        for team_id in team_ids {
            self.refresh_channels(&team_id).await?;
        }
        Ok(())
    }

    /// Spawn a background [`refresh_all_channels`](Self::refresh_all_channels)
    /// unless one is already running. Returns whether a refresh was started.
    pub fn schedule_channel_refresh(self: &Arc<Self>) -> bool {
        if self
            .channel_refresh_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = cache.refresh_all_channels().await {
                warn!(error = %e, "background channel refresh failed");
            }
            cache
                .channel_refresh_in_flight
                .store(false, Ordering::Release);
        });
        true
    }

    /// Bulk-fetch every visible user into the flat map.
    pub async fn refresh_all_users(&self) -> Result<(), CoreError> {
        let client = self.client()?;
        let users = retry_rate_limited("all_users", || client.all_users()).await?;
        let mut state = self.state.write().await;
        for user in users {
            state.users.insert(user.id.clone(), Arc::new(user));
        }
        debug!(users = state.users.len(), "refreshed all users");
        Ok(())
    }

    // ── Users ────────────────────────────────────────────────────────

    /// Look up a user, fetching and memoizing on a miss. A rate-limited
    /// fetch waits for the reset and retries; `None` when the fetch fails.
    pub async fn resolve_user(&self, user_id: &str) -> Option<Arc<User>> {
        if let Some(user) = self.state.read().await.users.get(user_id) {
            return Some(Arc::clone(user));
        }

        let mut state = self.state.write().await;
        if let Some(user) = state.users.get(user_id) {
            return Some(Arc::clone(user));
        }

        let client = self.client().ok()?;
        match retry_rate_limited("user", || client.user(user_id)).await {
            Ok(user) => {
                let user = Arc::new(user);
                state.users.insert(user_id.to_owned(), Arc::clone(&user));
                Some(user)
            }
            Err(e) => {
                warn!(user_id, error = %e, "user lookup failed");
                None
            }
        }
    }

    /// Batch variant of [`resolve_user`](Self::resolve_user): misses are
    /// fetched in one call. Ids that cannot be resolved are absent.
    pub async fn resolve_users(&self, user_ids: &[String]) -> HashMap<String, Arc<User>> {
        let mut found = HashMap::new();
        let mut missing = Vec::new();
        {
            let state = self.state.read().await;
            for id in user_ids {
                match state.users.get(id) {
                    Some(user) => {
                        found.insert(id.clone(), Arc::clone(user));
                    }
                    None => missing.push(id.clone()),
                }
            }
        }
        if missing.is_empty() {
            return found;
        }

        let fetched = match self.client() {
            Ok(client) => {
                retry_rate_limited("users_by_ids", || client.users_by_ids(&missing)).await
            }
            Err(_) => return found,
        };
        match fetched {
            Ok(users) => {
                let mut state = self.state.write().await;
                for user in users {
                    let user = Arc::new(user);
                    state.users.insert(user.id.clone(), Arc::clone(&user));
                    found.insert(user.id.clone(), user);
                }
            }
            Err(e) => warn!(count = missing.len(), error = %e, "batch user lookup failed"),
        }
        found
    }

    /// Insert or replace a user record (e.g. after `user_updated`).
    pub async fn upsert_user(&self, user: User) {
        let user = Arc::new(user);
        let mut state = self.state.write().await;
        for entry in &mut state.teams {
            if entry.users.contains_key(&user.id) {
                entry.users.insert(user.id.clone(), Arc::clone(&user));
            }
        }
        if state.me.as_ref().is_some_and(|me| me.id == user.id) {
            state.me = Some(Arc::clone(&user));
        }
        state.users.insert(user.id.clone(), user);
    }

    // ── Channel lookups ──────────────────────────────────────────────

    /// A cached channel by id.
    pub async fn channel(&self, channel_id: &str) -> Option<Channel> {
        let state = self.state.read().await;
        state
            .teams
            .iter()
            .find_map(|t| t.find_channel(channel_id))
            .cloned()
    }

    /// Normalized name of a channel.
    pub async fn channel_name(&self, channel_id: &str) -> Option<String> {
        self.channel(channel_id).await.map(|c| normalized_name(&c))
    }

    /// Id of the channel whose normalized name is `name`, optionally
    /// restricted to one team.
    pub async fn channel_id(&self, name: &str, team_id: Option<&str>) -> Option<String> {
        let state = self.state.read().await;
        state
            .teams
            .iter()
            .filter(|t| team_id.is_none_or(|id| t.team.id == id))
            .flat_map(|t| t.channels.iter().chain(t.more_channels.iter()))
            .find(|c| normalized_name(c) == name)
            .map(|c| c.id.clone())
    }

    /// Owning team of a channel. DM and group channels have no team of
    /// their own; the team whose listing contains them is returned.
    pub async fn channel_team_id(&self, channel_id: &str) -> Option<String> {
        let state = self.state.read().await;
        state.teams.iter().find_map(|t| {
            t.find_channel(channel_id).map(|c| {
                if c.team_id.is_empty() {
                    t.team.id.clone()
                } else {
                    c.team_id.clone()
                }
            })
        })
    }

    pub async fn team_name(&self, team_id: &str) -> Option<String> {
        let state = self.state.read().await;
        state
            .teams
            .iter()
            .find(|t| t.team.id == team_id)
            .map(|t| t.team.name.clone())
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub async fn me(&self) -> Option<Arc<User>> {
        self.state.read().await.me.clone()
    }

    pub async fn primary_team(&self) -> Option<Team> {
        let state = self.state.read().await;
        let id = state.primary_team_id.as_deref()?;
        state
            .teams
            .iter()
            .find(|t| t.team.id == id)
            .map(|t| t.team.clone())
    }

    pub async fn teams(&self) -> Vec<TeamEntry> {
        self.state.read().await.teams.clone()
    }

    /// Snapshot of the flat user map.
    pub async fn users(&self) -> HashMap<String, Arc<User>> {
        self.state.read().await.users.clone()
    }

    /// Joined channels across all teams, each listed once.
    pub async fn channels(&self) -> Vec<Channel> {
        let state = self.state.read().await;
        dedup_channels(state.teams.iter().map(|t| &t.channels))
    }

    /// Discoverable-but-unjoined channels across all teams.
    pub async fn more_channels(&self) -> Vec<Channel> {
        let state = self.state.read().await;
        dedup_channels(state.teams.iter().map(|t| &t.more_channels))
    }
}

fn dedup_channels<'a>(lists: impl Iterator<Item = &'a Arc<Vec<Channel>>>) -> Vec<Channel> {
    let mut seen = HashSet::new();
    lists
        .flat_map(|l| l.iter())
        .filter(|c| seen.insert(c.id.clone()))
        .cloned()
        .collect()
}

impl std::fmt::Debug for EntityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityCache").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use matterlink_api::models::ChannelKind;

    fn empty_cache() -> EntityCache {
        EntityCache::new(Arc::new(ArcSwapOption::empty()))
    }

    async fn seeded_cache() -> EntityCache {
        let cache = empty_cache();
        {
            let mut state = cache.state.write().await;
            let mut entry = TeamEntry::new(
                Team {
                    id: "t1".into(),
                    name: "eng".into(),
                    display_name: "Engineering".into(),
                },
                HashMap::new(),
            );
            entry.channels = Arc::new(vec![
                Channel {
                    id: "c1".into(),
                    team_id: "t1".into(),
                    kind: ChannelKind::Open,
                    name: "town-square".into(),
                    ..Channel::default()
                },
                Channel {
                    id: "g1".into(),
                    kind: ChannelKind::Group,
                    name: "3f9a".into(),
                    display_name: "Alice Smith, Bob".into(),
                    ..Channel::default()
                },
            ]);
            state.teams.push(entry);
            state.primary_team_id = Some("t1".into());
        }
        cache
    }

    #[tokio::test]
    async fn lookups_apply_normalization() {
        let cache = seeded_cache().await;
        assert_eq!(cache.channel_name("g1").await.as_deref(), Some("Alice_Smith-Bob"));
        assert_eq!(cache.channel_id("Alice_Smith-Bob", None).await.as_deref(), Some("g1"));
        assert_eq!(cache.channel_id("town-square", Some("t1")).await.as_deref(), Some("c1"));
        assert_eq!(cache.channel_id("town-square", Some("t2")).await, None);
    }

    #[tokio::test]
    async fn group_channels_inherit_listing_team() {
        let cache = seeded_cache().await;
        assert_eq!(cache.channel_team_id("g1").await.as_deref(), Some("t1"));
        assert_eq!(cache.team_name("t1").await.as_deref(), Some("eng"));
        assert_eq!(cache.primary_team().await.unwrap().name, "eng");
    }

    #[tokio::test]
    async fn miss_without_client_is_unknown() {
        let cache = empty_cache();
        assert!(cache.resolve_user("u1").await.is_none());
        assert!(cache.resolve_users(&["u1".into()]).await.is_empty());
        assert!(cache.channel_name("nope").await.is_none());
    }

    #[tokio::test]
    async fn upsert_replaces_cached_user() {
        let cache = empty_cache();
        cache
            .upsert_user(User {
                id: "u1".into(),
                username: "old".into(),
                ..User::default()
            })
            .await;
        cache
            .upsert_user(User {
                id: "u1".into(),
                username: "new".into(),
                ..User::default()
            })
            .await;
        assert_eq!(cache.resolve_user("u1").await.unwrap().username, "new");
    }
}

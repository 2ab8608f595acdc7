//! Replication teams, the storage wiggler, and exclusion safety.
//!
//! A team is an ordered set of storage servers, one per fault domain (zone),
//! sized to the replication factor. The collection tracks server health and
//! exclusion, hands out destination teams for relocations, and rolls servers
//! through replacement via the wiggler: wrong-configured servers first, then
//! oldest, never servers younger than the configured minimum age.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::keys;
use crate::store::Transaction;
use crate::{unix_time_ms, unix_time_secs, Uid};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locality {
    pub dc: String,
    pub zone: String,
    pub machine: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageEngineKind {
    SsdBtreeV2,
    Memory,
    SsdRocksdbV1,
    SsdShardedRocksdb,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageServerInfo {
    pub id: Uid,
    pub addr: String,
    pub locality: Locality,
    pub engine: StorageEngineKind,
    /// Unix seconds when the server registered.
    pub created_at: f64,
    /// Engine or locality disagrees with the current configuration.
    pub wrong_configured: bool,
    pub is_tss: bool,
}

pub fn read_server_list(tr: &mut Transaction<'_>) -> Result<Vec<StorageServerInfo>> {
    let prefix = keys::server_list_prefix();
    let end = keys::prefix_end(&prefix);
    let mut servers = Vec::new();
    for (_, value) in tr.get_range(&prefix, &end) {
        servers.push(serde_json::from_slice(&value)?);
    }
    Ok(servers)
}

pub fn write_server(tr: &mut Transaction<'_>, info: &StorageServerInfo) -> Result<()> {
    tr.set(&keys::server_list_key(info.id), &serde_json::to_vec(info)?);
    Ok(())
}

pub fn server_exists(tr: &mut Transaction<'_>, id: Uid) -> bool {
    tr.get(&keys::server_list_key(id)).is_some()
}

/// Metadata the wiggler orders servers by.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StorageMetadata {
    pub created_at: f64,
    pub wrong_configured: bool,
}

impl StorageMetadata {
    pub fn of(info: &StorageServerInfo) -> Self {
        Self {
            created_at: info.created_at,
            wrong_configured: info.wrong_configured,
        }
    }
}

/// Rolls storage servers through replacement one at a time.
pub struct StorageWiggler {
    entries: BTreeMap<Uid, StorageMetadata>,
    min_age: Duration,
    last_state_change_ms: u64,
}

impl StorageWiggler {
    pub fn new(min_age: Duration) -> Self {
        Self {
            entries: BTreeMap::new(),
            min_age,
            last_state_change_ms: 0,
        }
    }

    pub fn add_server(&mut self, id: Uid, metadata: StorageMetadata) {
        let prior = self.entries.insert(id, metadata);
        debug_assert!(prior.is_none(), "server already queued for wiggle");
        self.last_state_change_ms = unix_time_ms();
    }

    pub fn remove_server(&mut self, id: Uid) {
        if self.entries.remove(&id).is_some() {
            self.last_state_change_ms = unix_time_ms();
        }
    }

    pub fn update_metadata(&mut self, id: Uid, metadata: StorageMetadata) {
        if let Some(slot) = self.entries.get_mut(&id) {
            *slot = metadata;
        }
    }

    pub fn contains(&self, id: Uid) -> bool {
        self.entries.contains_key(&id)
    }

    /// A wiggle is necessary when the server is wrong-configured or old
    /// enough that a rolling replacement is due.
    pub fn necessary(&self, metadata: &StorageMetadata) -> bool {
        metadata.wrong_configured
            || unix_time_secs() - metadata.created_at > self.min_age.as_secs_f64()
    }

    /// Pop the next wiggle candidate: wrong-configured before healthy, then
    /// oldest first.
    pub fn next_server_id(&mut self, necessary_only: bool) -> Option<Uid> {
        let (id, metadata) = self
            .entries
            .iter()
            .min_by(|(a_id, a), (b_id, b)| {
                (!a.wrong_configured)
                    .cmp(&!b.wrong_configured)
                    .then(a.created_at.total_cmp(&b.created_at))
                    .then(a_id.cmp(b_id))
            })
            .map(|(id, meta)| (*id, *meta))?;
        if necessary_only && !self.necessary(&metadata) {
            return None;
        }
        self.entries.remove(&id);
        self.last_state_change_ms = unix_time_ms();
        Some(id)
    }

    pub fn queue_len(&self) -> usize {
        self.entries.len()
    }

    pub fn last_state_change_ms(&self) -> u64 {
        self.last_state_change_ms
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub servers: Vec<Uid>,
}

/// Per-region set of replication teams.
pub struct TeamCollection {
    pub primary: bool,
    team_size: usize,
    servers: BTreeMap<Uid, StorageServerInfo>,
    excluded: HashSet<Uid>,
    failed: HashSet<Uid>,
    teams: Vec<Team>,
    pub wiggler: StorageWiggler,
}

impl TeamCollection {
    pub fn new(primary: bool, team_size: usize, wiggle_min_age: Duration) -> Self {
        Self {
            primary,
            team_size: team_size.max(1),
            servers: BTreeMap::new(),
            excluded: HashSet::new(),
            failed: HashSet::new(),
            teams: Vec::new(),
            wiggler: StorageWiggler::new(wiggle_min_age),
        }
    }

    pub fn add_server(&mut self, info: StorageServerInfo) {
        if !info.is_tss && !self.wiggler.contains(info.id) {
            self.wiggler.add_server(info.id, StorageMetadata::of(&info));
        }
        self.servers.insert(info.id, info);
        self.rebuild_teams();
    }

    pub fn remove_server(&mut self, id: Uid) {
        self.servers.remove(&id);
        self.excluded.remove(&id);
        self.failed.remove(&id);
        self.wiggler.remove_server(id);
        self.rebuild_teams();
    }

    pub fn mark_excluded(&mut self, id: Uid) {
        self.excluded.insert(id);
    }

    pub fn report_server_failure(&mut self, id: Uid) {
        self.failed.insert(id);
    }

    pub fn server(&self, id: Uid) -> Option<&StorageServerInfo> {
        self.servers.get(&id)
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn team_count(&self) -> usize {
        self.teams.len()
    }

    fn server_healthy(&self, id: &Uid) -> bool {
        self.servers.contains_key(id) && !self.excluded.contains(id) && !self.failed.contains(id)
    }

    fn team_healthy(&self, team: &Team) -> bool {
        team.servers.iter().all(|id| self.server_healthy(id))
    }

    /// Rebuild the team set so every healthy server serves on at least one
    /// zone-diverse team. Teams pick one server per zone; with fewer zones
    /// than the replication factor no team can be formed.
    pub fn rebuild_teams(&mut self) {
        let mut by_zone: BTreeMap<&str, Vec<Uid>> = BTreeMap::new();
        for (id, info) in &self.servers {
            if info.is_tss || !self.server_healthy(id) {
                continue;
            }
            by_zone.entry(info.locality.zone.as_str()).or_default().push(*id);
        }
        let zones: Vec<Vec<Uid>> = by_zone.into_values().collect();
        let mut teams = Vec::new();
        if zones.len() >= self.team_size {
            let rounds = zones.iter().map(|z| z.len()).max().unwrap_or(0);
            for round in 0..rounds {
                for start in 0..zones.len() {
                    let mut servers = Vec::with_capacity(self.team_size);
                    for i in 0..self.team_size {
                        let zone = &zones[(start + i) % zones.len()];
                        // Staggered index keeps the generated teams diverse
                        // instead of pairing the same servers every round.
                        servers.push(zone[(round + i) % zone.len()]);
                    }
                    servers.sort_unstable();
                    let team = Team { servers };
                    if !teams.contains(&team) {
                        teams.push(team);
                    }
                }
            }
        }
        self.teams = teams;
    }

    pub fn healthy_team_count(&self) -> usize {
        self.teams.iter().filter(|t| self.team_healthy(t)).count()
    }

    /// Destination for a relocation: any healthy team disjoint from `avoid`.
    pub fn pick_destination_team(&self, avoid: &HashSet<Uid>) -> Option<Team> {
        let candidates: Vec<&Team> = self
            .teams
            .iter()
            .filter(|t| self.team_healthy(t))
            .filter(|t| t.servers.iter().all(|id| !avoid.contains(id)))
            .collect();
        candidates
            .choose(&mut rand::thread_rng())
            .map(|t| (*t).clone())
    }

    /// A healthy team that does not contain `excluding`, used to re-home
    /// ranges drained from a failed server.
    pub fn random_healthy_team(&self, excluding: Uid) -> Option<Team> {
        let mut avoid = HashSet::new();
        avoid.insert(excluding);
        self.pick_destination_team(&avoid)
    }

    /// Safe to exclude iff at least two healthy teams survive the removal.
    pub fn exclusion_safety_check(&self, exclude: &[Uid]) -> bool {
        if self.teams.len() <= 1 {
            return false;
        }
        let doomed: HashSet<Uid> = exclude.iter().copied().collect();
        let surviving = self
            .teams
            .iter()
            .filter(|t| self.team_healthy(t))
            .filter(|t| t.servers.iter().all(|id| !doomed.contains(id)))
            .count();
        surviving >= 2
    }

    /// Wiggle step: pop the next candidate and mark it undesired so the
    /// tracker relocates its shards.
    pub fn wiggle_next(&mut self) -> Option<Uid> {
        let id = self.wiggler.next_server_id(true)?;
        info!(server = %id, primary = self.primary, "wiggling storage server");
        self.excluded.insert(id);
        Some(id)
    }
}

pub fn resolve_exclusions(
    servers: &[StorageServerInfo],
    address_exclusions: &[String],
) -> Vec<Uid> {
    let mut ids = Vec::new();
    for excl in address_exclusions {
        for server in servers {
            if server.addr == *excl || server.addr.starts_with(&format!("{excl}:")) {
                ids.push(server.id);
            }
        }
    }
    ids
}

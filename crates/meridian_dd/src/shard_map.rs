//! In-memory map from key range to the storage teams serving it, with an
//! inverse index from team to ranges. This is the single source of truth
//! for "which teams own which ranges right now" while the distributor is
//! alive; the relocation queue consults it to find the ranges affected by
//! a team failure.

use std::collections::{BTreeMap, BTreeSet};

use tokio::sync::mpsc;

use crate::keyspace::{all_keys, KeyRange, RangeMap};
use crate::Uid;

/// An ordered-by-id set of storage servers holding one replica-set's worth
/// of shards in one DC. Value object: equal member sets compare equal.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Team {
    servers: Vec<Uid>,
    primary: bool,
}

impl Team {
    pub fn new(mut servers: Vec<Uid>, primary: bool) -> Self {
        servers.sort();
        servers.dedup();
        Self { servers, primary }
    }

    pub fn servers(&self) -> &[Uid] {
        &self.servers
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn contains(&self, id: Uid) -> bool {
        self.servers.binary_search(&id).is_ok()
    }
}

/// Per-range team assignment: the teams currently serving the range and,
/// while a relocation is in flight, the teams it is being moved from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShardTeams {
    pub src: Vec<Team>,
    pub dest: Vec<Team>,
}

impl ShardTeams {
    fn all_teams(&self) -> Vec<Team> {
        let mut teams = self.src.clone();
        teams.extend(self.dest.iter().cloned());
        teams.sort();
        teams.dedup();
        teams
    }
}

pub struct ShardsAffectedByTeamFailure {
    shard_teams: RangeMap<ShardTeams>,
    team_shards: BTreeMap<Team, BTreeSet<KeyRange>>,
    restart_tracker_tx: mpsc::UnboundedSender<KeyRange>,
}

impl ShardsAffectedByTeamFailure {
    /// Returns the map plus the stream of ranges whose shard tracker must
    /// re-observe metrics.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<KeyRange>) {
        let (restart_tracker_tx, restart_rx) = mpsc::unbounded_channel();
        (
            Self {
                shard_teams: RangeMap::new(all_keys(), ShardTeams::default()),
                team_shards: BTreeMap::new(),
                restart_tracker_tx,
            },
            restart_rx,
        )
    }

    /// Make `range` one contiguous entry, splitting or merging at the
    /// boundaries as needed. The merged entry carries the union of the
    /// covered teams; assignments outside `range` are preserved exactly.
    pub fn define_shard(&mut self, range: &KeyRange) {
        if range.is_empty() {
            return;
        }
        let covered: Vec<(KeyRange, ShardTeams)> = self
            .shard_teams
            .intersecting(range)
            .map(|(r, v)| (r, v.clone()))
            .collect();

        let mut merged = ShardTeams::default();
        for (r, teams) in &covered {
            merged.src.extend(teams.src.iter().cloned());
            merged.dest.extend(teams.dest.iter().cloned());
            for team in teams.all_teams() {
                self.erase_pair(&team, r);
            }
        }
        merged.src.sort();
        merged.src.dedup();
        merged.dest.sort();
        merged.dest.dedup();

        self.reinsert_remnants(range, &covered);
        for team in merged.all_teams() {
            self.insert_pair(&team, range);
        }
        self.shard_teams.insert(range, merged);
    }

    /// Replace the serving team list over `range` with `teams`; the teams
    /// previously serving the covered region are retained as move sources
    /// until [`Self::finish_move`]. Teams left with no ranges disappear
    /// from the inverse index.
    pub fn move_shard(&mut self, range: &KeyRange, teams: Vec<Team>) {
        if range.is_empty() {
            return;
        }
        let covered: Vec<(KeyRange, ShardTeams)> = self
            .shard_teams
            .intersecting(range)
            .map(|(r, v)| (r, v.clone()))
            .collect();

        let mut prev = Vec::new();
        for (r, old) in &covered {
            prev.extend(old.src.iter().cloned());
            for team in old.all_teams() {
                self.erase_pair(&team, r);
            }
        }
        prev.sort();
        prev.dedup();

        let mut src = teams;
        src.sort();
        src.dedup();
        let value = ShardTeams { src, dest: prev };

        self.reinsert_remnants(range, &covered);
        for team in value.all_teams() {
            self.insert_pair(&team, range);
        }
        self.shard_teams.insert(range, value);
    }

    /// Drop the move-source teams once a relocation over `range` is done.
    pub fn finish_move(&mut self, range: &KeyRange) {
        let covered: Vec<(KeyRange, ShardTeams)> = self
            .shard_teams
            .intersecting(range)
            .filter(|(r, _)| range.contains_range(r))
            .map(|(r, v)| (r, v.clone()))
            .collect();
        for (r, mut teams) in covered {
            for team in &teams.dest {
                if !teams.src.contains(team) {
                    self.erase_pair(team, &r);
                }
            }
            teams.dest.clear();
            self.shard_teams.insert(&r, teams);
        }
    }

    /// One-shot signal that the tracker observing `range` must re-observe.
    pub fn restart_shard_tracker(&self, range: KeyRange) {
        let _ = self.restart_tracker_tx.send(range);
    }

    pub fn teams_for(&self, key: &[u8]) -> &ShardTeams {
        self.shard_teams.get(key)
    }

    pub fn ranges_for_team(&self, team: &Team) -> Vec<KeyRange> {
        self.team_shards
            .get(team)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn team_count(&self) -> usize {
        self.team_shards.len()
    }

    pub fn clear(&mut self) {
        self.shard_teams.clear(ShardTeams::default());
        self.team_shards.clear();
    }

    /// Validate the structural invariants: the keyspace is covered exactly
    /// once, team lists carry no duplicates, and the inverse index is the
    /// exact transpose of the forward map. Panics on violation.
    pub fn check(&self) {
        let mut expected: BTreeMap<Team, BTreeSet<KeyRange>> = BTreeMap::new();
        let mut cursor = all_keys().begin;
        for (range, teams) in self.shard_teams.ranges() {
            assert_eq!(range.begin, cursor, "coverage gap at {range:?}");
            cursor = range.end.clone();
            let mut sorted = teams.src.clone();
            sorted.dedup();
            assert_eq!(sorted.len(), teams.src.len(), "duplicate src team");
            let mut sorted = teams.dest.clone();
            sorted.dedup();
            assert_eq!(sorted.len(), teams.dest.len(), "duplicate dest team");
            for team in teams.all_teams() {
                expected.entry(team).or_default().insert(range.clone());
            }
        }
        assert_eq!(cursor, all_keys().end, "coverage ends early");
        assert_eq!(
            expected, self.team_shards,
            "inverse index out of sync with forward map"
        );
    }

    fn erase_pair(&mut self, team: &Team, range: &KeyRange) {
        if let Some(set) = self.team_shards.get_mut(team) {
            set.remove(range);
            if set.is_empty() {
                self.team_shards.remove(team);
            }
        }
    }

    fn insert_pair(&mut self, team: &Team, range: &KeyRange) {
        self.team_shards
            .entry(team.clone())
            .or_default()
            .insert(range.clone());
    }

    /// Re-add inverse entries for the parts of boundary-overlapping ranges
    /// that fall outside `range` and keep their old assignment.
    fn reinsert_remnants(&mut self, range: &KeyRange, covered: &[(KeyRange, ShardTeams)]) {
        if let Some((first_range, first_teams)) = covered.first() {
            if first_range.begin < range.begin {
                let remnant = KeyRange::new(first_range.begin.clone(), range.begin.clone());
                for team in first_teams.all_teams() {
                    self.insert_pair(&team, &remnant);
                }
            }
        }
        if let Some((last_range, last_teams)) = covered.last() {
            if last_range.end > range.end {
                let remnant = KeyRange::new(range.end.clone(), last_range.end.clone());
                for team in last_teams.all_teams() {
                    self.insert_pair(&team, &remnant);
                }
            }
        }
    }
}

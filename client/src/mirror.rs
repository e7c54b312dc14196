//! Local mirror of the server's world
//!
//! The mirror holds what the gameplay layer draws: every synced object and
//! every other player, as of the newest snapshot merged so far. The local
//! player is never mirrored since the client simulates it itself.

use log::{debug, info};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use sync_shared::{ClientId, ObjectId, Vec2, WorldSnapshot};

/// A backwards jump in ticks larger than this means the server restarted
pub const RESTART_TICK_GAP: u32 = 90;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MirroredObject {
    pub type_id: u32,
    pub position: Vec2,
}

/// What one merge changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MirrorState {
    local_id: Option<ClientId>,
    last_tick: Option<u32>,
    objects: BTreeMap<ObjectId, MirroredObject>,
    players: BTreeMap<ClientId, Vec2>,
}

impl MirrorState {
    pub fn new(local_id: Option<ClientId>) -> Self {
        Self {
            local_id,
            ..Self::default()
        }
    }

    pub fn local_id(&self) -> Option<ClientId> {
        self.local_id
    }

    /// Tick of the newest merged snapshot
    pub fn last_tick(&self) -> Option<u32> {
        self.last_tick
    }

    pub fn objects(&self) -> &BTreeMap<ObjectId, MirroredObject> {
        &self.objects
    }

    pub fn object(&self, id: ObjectId) -> Option<&MirroredObject> {
        self.objects.get(&id)
    }

    /// Every mirrored player except the local one
    pub fn players(&self) -> &BTreeMap<ClientId, Vec2> {
        &self.players
    }

    pub fn player(&self, id: ClientId) -> Option<Vec2> {
        self.players.get(&id).copied()
    }

    /// Merges `snapshot` into the mirror
    ///
    /// Returns None and leaves the mirror untouched when the snapshot is
    /// older than the last one merged. Players missing from a snapshot are
    /// dropped even if the snapshot that announced their removal was lost.
    pub fn merge(&mut self, snapshot: &WorldSnapshot) -> Option<MergeReport> {
        if let Some(last) = self.last_tick {
            if snapshot.tick < last {
                if last - snapshot.tick <= RESTART_TICK_GAP {
                    debug!("Ignoring stale snapshot {} (have {})", snapshot.tick, last);
                    return None;
                }
                info!(
                    "Snapshot tick went back from {} to {}, assuming server restart",
                    last, snapshot.tick
                );
                self.objects.clear();
                self.players.clear();
            }
        }

        let mut report = MergeReport::default();

        for data in &snapshot.synced_objects {
            let mirrored = MirroredObject {
                type_id: data.type_id,
                position: data.position,
            };
            match self.objects.entry(data.id) {
                Entry::Vacant(slot) => {
                    slot.insert(mirrored);
                    report.created += 1;
                }
                Entry::Occupied(mut slot) => {
                    *slot.get_mut() = mirrored;
                    report.updated += 1;
                }
            }
        }

        report.removed += self.apply_removals(&snapshot.removed_ids);

        let before = self.players.len();
        self.players.retain(|id, _| snapshot.player_ids.contains(id));
        report.removed += before - self.players.len();

        for (id, position) in snapshot.players() {
            if Some(id) == self.local_id {
                continue;
            }
            if self.players.insert(id, position).is_some() {
                report.updated += 1;
            } else {
                report.created += 1;
            }
        }

        self.last_tick = Some(snapshot.tick);
        Some(report)
    }

    /// Drops the mirrors of `ids`; ids not mirrored are skipped
    ///
    /// Returns how many mirrors were actually removed.
    pub fn apply_removals(&mut self, ids: &[ClientId]) -> usize {
        ids.iter()
            .filter(|id| self.players.remove(id).is_some())
            .count()
    }
}

//! Moving entities between chunks.

use tracing::debug;

use super::Inner;
use crate::EntityHandle;
use crate::chunk::ChunkState;
use crate::coord::ChunkCoord;
use crate::error::ChunkError;
use crate::occupant::{ChunkAffiliation, OccupantKind, Placement};
use strata_spatial::SpatialIndex;

/// What [`ChunkManager::migrate_object`](super::ChunkManager::migrate_object) did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Source and destination are the same chunk.
    Unchanged,
    /// The destination is active; the entity stayed live and was reindexed.
    Reindexed,
    /// The destination is dormant; the entity was serialized into its
    /// buffer and removed from the simulation.
    Buffered,
}

fn unindex(index: &SpatialIndex, handle: EntityHandle, at: &Placement) -> bool {
    match at.kind {
        OccupantKind::Static => index.remove_static(handle, at.x, at.y),
        OccupantKind::Dynamic => index.remove_dynamic(handle, at.x, at.y),
    }
}

fn reindex(index: &SpatialIndex, handle: EntityHandle, at: &Placement) {
    match at.kind {
        OccupantKind::Static => index.add_static(handle, at.x, at.y),
        OccupantKind::Dynamic => index.add_dynamic(handle, at.x, at.y),
    }
}

impl Inner {
    /// Transfers `handle` from the active chunk `from` to `to`.
    ///
    /// Both chunks' transition locks are held, in coordinate order, so
    /// neither can activate, deactivate or evict mid-transfer. A dormant
    /// destination that has no data yet gets a load request.
    ///
    /// The entity must be indexed in `from` at its current placement; the
    /// caller updates the source index before migrating a moved entity.
    /// Nothing is changed when it is not.
    pub(super) fn migrate_object(
        &self,
        handle: EntityHandle,
        from: ChunkCoord,
        to: ChunkCoord,
    ) -> Result<MigrationOutcome, ChunkError> {
        if from == to {
            return Ok(MigrationOutcome::Unchanged);
        }
        let source = self.get_chunk(from).ok_or(ChunkError::ChunkNotFound(from))?;

        loop {
            let dest = self.get_or_create_chunk(to);
            let (_first, _second) = if from < to {
                let a = source.lock_transition();
                (a, dest.lock_transition())
            } else {
                let b = dest.lock_transition();
                (source.lock_transition(), b)
            };
            if dest.is_retired() {
                continue;
            }
            if source.is_retired() {
                return Err(ChunkError::ChunkNotFound(from));
            }
            if source.try_state()? != ChunkState::Active {
                return Err(ChunkError::ChunkNotActive(from));
            }

            let components = &self.deps.components;
            let affiliation = components
                .affiliation(handle)
                .ok_or(ChunkError::EntityNotFound(handle))?;
            if affiliation.current != from {
                return Err(ChunkError::EntityNotInChunk {
                    entity: handle,
                    expected: from,
                    actual: affiliation.current,
                });
            }
            let placement = components
                .placement(handle)
                .ok_or(ChunkError::EntityNotFound(handle))?;
            let moved = ChunkAffiliation {
                current: to,
                previous: Some(from),
            };

            let dest_state = dest.try_state()?;
            let not_indexed = ChunkError::EntityNotIndexed {
                entity: handle,
                chunk: from,
            };
            if dest_state == ChunkState::Active {
                if !unindex(source.index(), handle, &placement) {
                    return Err(not_indexed);
                }
                reindex(dest.index(), handle, &placement);
                components.set_affiliation(handle, moved);
                debug!(%handle, %from, %to, "entity reindexed");
                return Ok(MigrationOutcome::Reindexed);
            }

            let mut record = self.deps.factory.serialize(handle)?;
            record.coord = to;
            record.layer = self.layer;
            if !unindex(source.index(), handle, &placement) {
                return Err(not_indexed);
            }
            components.set_affiliation(handle, moved);
            self.deps.factory.despawn(handle);
            dest.push_buffered(record);
            debug!(%handle, %from, %to, state = ?dest_state, "entity buffered into dormant chunk");

            if dest_state == ChunkState::Unloaded {
                drop((_first, _second));
                self.request_load(to);
            }
            return Ok(MigrationOutcome::Buffered);
        }
    }
}

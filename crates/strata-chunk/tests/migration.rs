mod common;

use common::*;
use strata_chunk::{
    ChunkAffiliation, ChunkCoord, ChunkError, ChunkState, EntityComponents, EntityHandle,
    MigrationOutcome,
};

const A: ChunkCoord = ChunkCoord::new(0, 0);
const B: ChunkCoord = ChunkCoord::new(1, 0);

/// Loads A and B, activates A, and returns the handle of occupant 1 in A.
fn setup(h: &Harness) -> EntityHandle {
    seed(&h.store, A, 0, &[1]);
    seed(&h.store, B, 0, &[]);
    load(&h.manager, A);
    load(&h.manager, B);
    h.manager.activate(A).unwrap();
    h.world.handle_of(1).expect("occupant 1 is live")
}

/// Moves a live entity and keeps `coord`'s index in step, the way a tick
/// loop does before migrating.
fn move_indexed(h: &Harness, coord: ChunkCoord, handle: EntityHandle, x: f64, y: f64) {
    let old = h.world.move_to(handle, x, y).expect("entity is live");
    let chunk = h.manager.get_chunk(coord).unwrap();
    let index = chunk.spatial().expect("source is active");
    assert!(index.update_dynamic(handle, old.x, old.y, x, y));
}

fn indexed(h: &Harness, coord: ChunkCoord) -> Vec<EntityHandle> {
    h.manager
        .get_chunk(coord)
        .and_then(|c| c.spatial().map(|index| index.all_handles()))
        .unwrap_or_default()
}

#[test]
fn test_migrate_between_active_chunks_reindexes() {
    let h = harness();
    let handle = setup(&h);
    h.manager.activate(B).unwrap();

    let outcome = h.manager.migrate_object(handle, A, B).unwrap();
    assert_eq!(outcome, MigrationOutcome::Reindexed);

    assert!(!indexed(&h, A).contains(&handle));
    assert!(indexed(&h, B).contains(&handle));
    assert!(h.world.is_live(handle));
    assert_eq!(
        h.world.affiliation(handle),
        Some(ChunkAffiliation {
            current: B,
            previous: Some(A),
        })
    );
}

#[test]
fn test_migrate_into_dormant_chunk_buffers_record() {
    let h = harness();
    let handle = setup(&h);
    move_indexed(&h, A, handle, 40.0, 2.0);

    let outcome = h.manager.migrate_object(handle, A, B).unwrap();
    assert_eq!(outcome, MigrationOutcome::Buffered);

    assert!(!h.world.is_live(handle));
    assert!(!indexed(&h, A).contains(&handle));
    let buffered = h.manager.get_chunk(B).unwrap().buffered_occupants();
    assert_eq!(buffered.len(), 1);
    assert_eq!(buffered[0].id, 1);
    assert_eq!(buffered[0].coord, B);
    assert_eq!((buffered[0].x, buffered[0].y), (40.0, 2.0));

    h.manager.activate(B).unwrap();
    let revived = h.world.handle_of(1).expect("occupant revived in B");
    assert!(indexed(&h, B).contains(&revived));
    assert_eq!(h.world.affiliation(revived).unwrap().current, B);
}

#[test]
fn test_migrate_into_unloaded_chunk_requests_load() {
    let h = harness();
    let handle = setup(&h);
    let far = ChunkCoord::new(9, 9);
    seed(&h.store, far, 4, &[]);

    let outcome = h.manager.migrate_object(handle, A, far).unwrap();
    assert_eq!(outcome, MigrationOutcome::Buffered);
    assert!(matches!(
        state_of(&h.manager, far),
        Some(ChunkState::Loading | ChunkState::Preloaded)
    ));

    wait_state(&h.manager, far, ChunkState::Preloaded);
    let chunk = h.manager.get_chunk(far).unwrap();
    assert_eq!(chunk.tile(0, 0), Some(4));
    assert_eq!(buffered_ids(&h.manager, far), vec![1]);
}

#[test]
fn test_migrated_occupant_survives_eviction() {
    let h = harness();
    let handle = setup(&h);
    h.manager.migrate_object(handle, A, B).unwrap();

    assert!(h.manager.evict(B));
    wait_until("save of migrated occupant", || h.manager.stats().pending_saves == 0);
    let stored = h.store.occupants_of(REGION, LAYER, B);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, 1);
    assert!(h.store.occupants_of(REGION, LAYER, A).is_empty());
}

#[test]
fn test_migrate_rejects_wrong_source() {
    let h = harness();
    let handle = setup(&h);
    h.manager.activate(B).unwrap();

    let err = h.manager.migrate_object(handle, B, A).unwrap_err();
    assert!(matches!(
        err,
        ChunkError::EntityNotInChunk { entity, expected, actual }
            if entity == handle && expected == B && actual == A
    ));
    assert!(indexed(&h, A).contains(&handle));
    assert!(!indexed(&h, B).contains(&handle));
}

#[test]
fn test_migrate_requires_active_source() {
    let h = harness();
    let handle = setup(&h);

    let err = h.manager.migrate_object(handle, B, A).unwrap_err();
    assert!(matches!(err, ChunkError::ChunkNotActive(c) if c == B));

    let err = h.manager.migrate_object(handle, ChunkCoord::new(7, 7), A).unwrap_err();
    assert!(matches!(err, ChunkError::ChunkNotFound(_)));
}

#[test]
fn test_migrate_unknown_entity() {
    let h = harness();
    setup(&h);
    let err = h.manager.migrate_object(EntityHandle(9999), A, B).unwrap_err();
    assert!(matches!(err, ChunkError::EntityNotFound(_)));
}

#[test]
fn test_migrate_to_same_chunk_is_noop() {
    let h = harness();
    let handle = setup(&h);
    assert_eq!(
        h.manager.migrate_object(handle, A, A).unwrap(),
        MigrationOutcome::Unchanged
    );
    assert!(indexed(&h, A).contains(&handle));
}

#[test]
fn test_migrate_then_deactivate_keeps_single_copy() {
    let h = harness();
    let handle = setup(&h);
    h.manager.activate(B).unwrap();
    h.manager.migrate_object(handle, A, B).unwrap();

    h.manager.deactivate(A).unwrap();
    h.manager.deactivate(B).unwrap();
    assert_eq!(h.world.live_count(), 0);
    assert!(buffered_ids(&h.manager, A).is_empty());
    assert_eq!(buffered_ids(&h.manager, B), vec![1]);
}

#[test]
fn test_migrate_refuses_unindexed_placement_into_active_chunk() {
    let h = harness();
    let handle = setup(&h);
    h.manager.activate(B).unwrap();
    // The entity moves to another cell but A's index is not told.
    h.world.move_to(handle, 40.0, 2.0);

    let err = h.manager.migrate_object(handle, A, B).unwrap_err();
    assert!(matches!(
        err,
        ChunkError::EntityNotIndexed { entity, chunk } if entity == handle && chunk == A
    ));
    assert_eq!(indexed(&h, A), vec![handle]);
    assert!(indexed(&h, B).is_empty());
    assert!(h.world.is_live(handle));
    assert_eq!(h.world.affiliation(handle).unwrap().current, A);
}

#[test]
fn test_migrate_refuses_unindexed_placement_into_dormant_chunk() {
    let h = harness();
    let handle = setup(&h);
    h.world.move_to(handle, 40.0, 2.0);

    let err = h.manager.migrate_object(handle, A, B).unwrap_err();
    assert!(matches!(err, ChunkError::EntityNotIndexed { chunk, .. } if chunk == A));
    assert!(h.world.is_live(handle));
    assert_eq!(indexed(&h, A), vec![handle]);
    assert!(buffered_ids(&h.manager, B).is_empty());
    assert_eq!(h.world.affiliation(handle).unwrap().current, A);

    // Once the index agrees with the placement the same move goes through.
    h.world.move_to(handle, 1.0, 1.0);
    assert_eq!(
        h.manager.migrate_object(handle, A, B).unwrap(),
        MigrationOutcome::Buffered
    );
    assert_eq!(buffered_ids(&h.manager, B), vec![1]);
    assert_eq!(h.world.live_count(), 0);
}

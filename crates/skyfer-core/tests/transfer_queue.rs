//! Integration tests for the transfer queue: priority assignment, moves,
//! renumbering, demotion, pause and the persisted-record round-trip.

use skyfer_core::cache::CacheBatch;
use skyfer_core::chunkmacs::{ChunkMac, MAC_LEN};
use skyfer_core::config::EngineConfig;
use skyfer_core::engine::Engine;
use skyfer_core::localpath::LocalPath;
use skyfer_core::transfer::{
    Direction, File, TargetKind, Transfer, TransferSlot, TransferState,
};
use skyfer_core::transfer_list::{PRIORITY_START, PRIORITY_STEP};

fn add_put(eng: &mut Engine, size: u64) -> u64 {
    let mut batch = CacheBatch::new();
    let id = eng.create_transfer(Direction::Put);
    {
        let t = eng.pool.get_mut(id).unwrap();
        t.size = size;
        t.files
            .push(File::new(TargetKind::Upload, "f", LocalPath::from("/src/f")));
    }
    eng.addtransfer(id, false, &mut batch);
    id
}

fn add_get(eng: &mut Engine, size: u64) -> u64 {
    let mut batch = CacheBatch::new();
    let id = eng.create_transfer(Direction::Get);
    {
        let t = eng.pool.get_mut(id).unwrap();
        t.size = size;
        t.localfilename = LocalPath::from("/dl/f.part");
        t.files
            .push(File::new(TargetKind::Download, "f", LocalPath::from("/dl/f")));
    }
    eng.addtransfer(id, false, &mut batch);
    id
}

#[test]
fn appended_puts_get_stepped_priorities_and_are_dispatchable() {
    let mut eng = Engine::new(EngineConfig::default());
    let a = add_put(&mut eng, 100);
    let b = add_put(&mut eng, 100);

    assert_eq!(
        eng.pool.get(a).unwrap().priority,
        PRIORITY_START + PRIORITY_STEP
    );
    assert_eq!(
        eng.pool.get(b).unwrap().priority,
        PRIORITY_START + 2 * PRIORITY_STEP
    );

    let mut batch = CacheBatch::new();
    let mut cont = |_: &Transfer| true;
    let mut dcont = |_: Direction| true;
    let buckets = eng.nexttransfers(&mut cont, &mut dcont, 0, &mut batch);
    // both are small PUTs: bucket 5
    assert_eq!(buckets[5], vec![a, b]);
    assert!(buckets[2].is_empty() && buckets[3].is_empty() && buckets[4].is_empty());
}

#[test]
fn move_tail_before_head_takes_midpoint_and_demotes_head() {
    let mut eng = Engine::new(EngineConfig::default());
    let head = add_put(&mut eng, 100);
    let tail = add_put(&mut eng, 100);
    let head_priority = eng.pool.get(head).unwrap().priority;

    // the head is currently running
    {
        let t = eng.pool.get_mut(head).unwrap();
        t.state = TransferState::Active;
        t.slot = Some(TransferSlot::new());
    }

    let mut batch = CacheBatch::new();
    eng.movetofirst(tail, 0, &mut batch);

    // midpoint of (head - 2*step, head) is head - step
    let tail_t = eng.pool.get(tail).unwrap();
    assert_eq!(tail_t.priority, head_priority - PRIORITY_STEP);
    assert_eq!(eng.list.ids(Direction::Put), vec![tail, head]);

    let head_t = eng.pool.get(head).unwrap();
    assert!(head_t.slot.is_none(), "head must surrender its slot");
    assert_eq!(head_t.state, TransferState::Queued);

    let priorities = eng.list.priorities(Direction::Put);
    assert!(priorities.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn priority_collision_triggers_renumbering() {
    let mut eng = Engine::new(EngineConfig::default());

    // craft adjacent priorities with no space between them
    let mut ids = Vec::new();
    for (i, priority) in [(1u64, 1_000_000u64), (2, 1_000_001), (3, 5_000_000)] {
        let mut t = Transfer::new(i, Direction::Put, &EngineConfig::default());
        t.priority = priority;
        let record = t.serialize();
        eng.restore_transfer(i, &record).unwrap();
        ids.push(i);
    }

    let mut batch = CacheBatch::new();
    // move the tail between the two adjacent ones: no midpoint exists
    eng.movetransfer_before(ids[2], ids[1], 0, &mut batch);

    let priorities = eng.list.priorities(Direction::Put);
    assert!(
        priorities.windows(2).all(|w| w[0] < w[1]),
        "renumbering must keep the sequence strictly ascending: {:?}",
        priorities
    );
    let mut listed = eng.list.ids(Direction::Put);
    assert_eq!(listed, vec![ids[0], ids[2], ids[1]]);
    listed.sort_unstable();
    assert_eq!(listed, ids, "moves must preserve the set of transfers");
    for &id in &ids {
        assert_eq!(
            eng.pool.get(id).unwrap().priority,
            priorities[eng.list.index_of(Direction::Put, id).unwrap()]
        );
    }
}

#[test]
fn paused_get_roundtrips_through_the_record() {
    let mut eng = Engine::new(EngineConfig::default());
    let id = add_get(&mut eng, 500_000);
    {
        let t = eng.pool.get_mut(id).unwrap();
        t.state = TransferState::Active;
        t.slot = Some(TransferSlot::new());
        t.chunkmacs.insert(
            0,
            ChunkMac {
                mac: [0xCD; MAC_LEN],
                finished: true,
            },
        );
        t.tempurls = vec!["http://server/x".into()];
    }

    let mut batch = CacheBatch::new();
    eng.pause_transfer(id, true, 0, &mut batch).unwrap();

    let t = eng.pool.get(id).unwrap();
    assert!(t.slot.is_none(), "pausing destroys the slot");
    assert_eq!(t.state, TransferState::Paused);

    let record = t.serialize();
    let restored = Transfer::unserialize(id, &record, &EngineConfig::default()).unwrap();
    assert_eq!(restored.state, TransferState::Paused);
    assert_eq!(restored.priority, t.priority);
    assert_eq!(restored.chunkmacs, t.chunkmacs);
    assert_eq!(restored.tempurls, t.tempurls);
}

#[test]
fn unpausing_requeues_and_keeps_order() {
    let mut eng = Engine::new(EngineConfig::default());
    let id = add_get(&mut eng, 100);
    let mut batch = CacheBatch::new();
    eng.pause_transfer(id, true, 0, &mut batch).unwrap();
    assert_eq!(eng.pool.get(id).unwrap().state, TransferState::Paused);

    // paused transfers are not dispatchable
    let mut cont = |_: &Transfer| true;
    let mut dcont = |_: Direction| true;
    let buckets = eng.nexttransfers(&mut cont, &mut dcont, 0, &mut batch);
    assert!(buckets.iter().all(|b| b.is_empty()));

    eng.pause_transfer(id, false, 0, &mut batch).unwrap();
    assert_eq!(eng.pool.get(id).unwrap().state, TransferState::Queued);
    let buckets = eng.nexttransfers(&mut cont, &mut dcont, 0, &mut batch);
    assert_eq!(buckets[3], vec![id]);
}

#[test]
fn cancelled_files_are_reaped_at_dispatch() {
    let mut eng = Engine::new(EngineConfig::default());
    let id = add_get(&mut eng, 100);
    eng.pool.get_mut(id).unwrap().files[0].cancel_token.cancel();

    let mut batch = CacheBatch::new();
    let mut cont = |_: &Transfer| true;
    let mut dcont = |_: Direction| true;
    let buckets = eng.nexttransfers(&mut cont, &mut dcont, 0, &mut batch);
    assert!(buckets.iter().all(|b| b.is_empty()));
    assert!(
        eng.pool.get(id).is_none(),
        "a transfer with all files cancelled is destroyed"
    );
    assert!(eng.list.is_empty(Direction::Get));
}

#[test]
fn large_and_small_files_land_in_separate_buckets() {
    let mut eng = Engine::new(EngineConfig::default());
    let small = add_get(&mut eng, 1_000);
    let large = add_get(&mut eng, 1_000_000);

    let mut batch = CacheBatch::new();
    let mut cont = |_: &Transfer| true;
    let mut dcont = |_: Direction| true;
    let buckets = eng.nexttransfers(&mut cont, &mut dcont, 0, &mut batch);
    assert_eq!(buckets[2], vec![large]);
    assert_eq!(buckets[3], vec![small]);
}

#[test]
fn direction_continue_fn_caps_a_direction() {
    let mut eng = Engine::new(EngineConfig::default());
    add_put(&mut eng, 100);
    add_put(&mut eng, 100);
    let g = add_get(&mut eng, 100);

    let mut batch = CacheBatch::new();
    let mut admitted_puts = 0;
    let mut cont = |_: &Transfer| true;
    let mut dcont = |d: Direction| {
        if d == Direction::Put {
            admitted_puts += 1;
            admitted_puts <= 1
        } else {
            true
        }
    };
    let buckets = eng.nexttransfers(&mut cont, &mut dcont, 0, &mut batch);
    assert_eq!(buckets[5].len(), 1, "second PUT must not be admitted");
    assert_eq!(buckets[3], vec![g]);
}

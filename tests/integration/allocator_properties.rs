#![allow(missing_docs)]

use std::sync::Arc;

use penumbra::primitives::io::MemFileIo;
use penumbra::primitives::pager::{BufferPool, FileHandle, FreeSpaceManager, PageManager, PageRange};
use penumbra::types::FileId;
use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn page_manager() -> PageManager {
    let pool = Arc::new(BufferPool::new(64));
    let fh = FileHandle::new(FileId(0), Arc::new(MemFileIo::new()), pool, 1);
    PageManager::new(Arc::new(fh))
}

#[derive(Clone, Debug)]
enum Op {
    Allocate(u64),
    Free(usize),
    Commit,
    Rollback,
    Checkpoint,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1u64..20).prop_map(Op::Allocate),
        3 => any::<usize>().prop_map(Op::Free),
        2 => Just(Op::Commit),
        1 => Just(Op::Rollback),
        1 => Just(Op::Checkpoint),
    ]
}

/// Mirror of what the caller believes it owns.
#[derive(Default)]
struct Model {
    committed: Vec<PageRange>,
    txn_allocated: Vec<PageRange>,
    txn_freed: Vec<PageRange>,
    /// Freed and committed, not yet checkpointed.
    pending: Vec<PageRange>,
}

impl Model {
    fn live(&self) -> impl Iterator<Item = &PageRange> {
        self.committed.iter().chain(self.txn_allocated.iter())
    }

    fn unavailable(&self) -> impl Iterator<Item = &PageRange> {
        self.live()
            .chain(self.txn_freed.iter())
            .chain(self.pending.iter())
    }
}

fn run_ops(ops: &[Op]) -> Result<(), TestCaseError> {
    let pm = page_manager();
    let mut model = Model::default();
    for op in ops {
        match op {
            Op::Allocate(n) => {
                let range = pm.allocate_page_range(*n).unwrap();
                prop_assert_eq!(range.num_pages, *n);
                prop_assert!(range.start_page_idx >= 1, "header page handed out");
                for other in model.unavailable() {
                    prop_assert!(
                        !range.overlaps(other),
                        "{} overlaps owned or deferred range {}",
                        range,
                        other
                    );
                }
                model.txn_allocated.push(range);
            }
            Op::Free(idx) => {
                let live: Vec<PageRange> = model.live().copied().collect();
                if live.is_empty() {
                    continue;
                }
                let victim = live[idx % live.len()];
                pm.free_page_range(victim);
                model.committed.retain(|r| *r != victim);
                model.txn_allocated.retain(|r| *r != victim);
                model.txn_freed.push(victim);
            }
            Op::Commit => {
                pm.commit();
                model.committed.append(&mut model.txn_allocated);
                model.pending.append(&mut model.txn_freed);
            }
            Op::Rollback => {
                pm.rollback();
                // Allocations go back to the free list; frees of committed
                // ranges are forgotten and the ranges stay owned.
                let allocated = std::mem::take(&mut model.txn_allocated);
                let freed = std::mem::take(&mut model.txn_freed);
                model
                    .committed
                    .extend(freed.into_iter().filter(|r| !allocated.contains(r)));
            }
            Op::Checkpoint => {
                pm.commit();
                model.committed.append(&mut model.txn_allocated);
                model.pending.append(&mut model.txn_freed);
                pm.finalize_checkpoint();
                model.pending.clear();
            }
        }
    }
    let free = pm.free_entries(0, pm.num_free_entries());
    for range in &free {
        for owned in model.live() {
            prop_assert!(!range.overlaps(owned), "free {} overlaps owned {}", range, owned);
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn allocations_never_overlap(ops in prop::collection::vec(op_strategy(), 1..120)) {
        run_ops(&ops)?;
    }

    #[test]
    fn pending_frees_are_not_reused(sizes in prop::collection::vec(1u64..16, 1..24)) {
        let pm = page_manager();
        let ranges: Vec<PageRange> = sizes
            .iter()
            .map(|n| pm.allocate_page_range(*n).unwrap())
            .collect();
        pm.commit();
        for range in &ranges {
            pm.free_page_range(*range);
        }
        pm.commit();
        for n in &sizes {
            let fresh = pm.allocate_page_range(*n).unwrap();
            for freed in &ranges {
                prop_assert!(!fresh.overlaps(freed));
            }
        }
    }

    #[test]
    fn serialize_then_deserialize_keeps_entries(
        runs in prop::collection::btree_map(0u64..1_000, 1u64..8, 0..40)
    ) {
        let mut fsm = FreeSpaceManager::new();
        let mut next_start = 1;
        for (gap, len) in runs {
            let start = next_start + gap % 3 + 1;
            fsm.add_free_pages(PageRange::new(start, len));
            next_start = start + len;
        }
        let mut ser = penumbra::primitives::bytes::Serializer::new();
        fsm.serialize(&mut ser);
        let bytes = ser.into_inner();
        let restored = FreeSpaceManager::deserialize(
            &mut penumbra::primitives::bytes::Deserializer::new(&bytes),
        )
        .unwrap();
        prop_assert_eq!(restored.total_free_pages(), fsm.total_free_pages());
        prop_assert_eq!(
            restored.entries(0, restored.num_entries()),
            fsm.entries(0, fsm.num_entries())
        );
    }
}

#[test]
fn seeded_workload_reuses_space_after_checkpoints() {
    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed_2024);
    let pm = page_manager();
    let mut live: Vec<PageRange> = Vec::new();
    let mut high_water = 1;
    for round in 0..50 {
        for _ in 0..20 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let range = pm.allocate_page_range(rng.gen_range(1..32)).unwrap();
                assert!(live.iter().all(|r| !r.overlaps(&range)), "round {round}");
                high_water = high_water.max(range.end());
                live.push(range);
            } else {
                let idx = rng.gen_range(0..live.len());
                pm.free_page_range(live.swap_remove(idx));
            }
        }
        pm.commit();
        pm.finalize_checkpoint();
    }
    let live_pages: u64 = live.iter().map(|r| r.num_pages).sum();
    assert_eq!(
        pm.data_fh().num_pages(),
        high_water,
        "file grows only when nothing fits"
    );
    assert_eq!(live_pages + pm.total_free_pages() + 1, high_water);
}

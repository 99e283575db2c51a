//! Inode allocation scenarios on an in-memory volume.

use agfs_alloc::{PeragTable, init_free_space, verify_ag};
use agfs_block::{BufCache, MemBlockDevice};
use agfs_error::AgfsError;
use agfs_inode::{
    AgiState, Freed, IallocPolicy, InodeTreeReport, dialloc, difree, imap, imap_untrusted,
    init_inodes, read_dinode, verify_inobt,
};
use agfs_ondisk::{AllocRec, Geometry, InobtRec, Superblock};
use agfs_trans::resv::create_block_res;
use agfs_trans::{Log, MemLog, SbCounterSnapshot, SbField, TransConfig, TransManager, TransRes};
use agfs_types::{AgBlock, AgNumber, BlockNumber, InodeNumber};
use proptest::prelude::*;
use std::sync::Arc;

const AG_BLOCKS: u32 = 1024;
/// 512-byte blocks with 256-byte inodes: 32 blocks per chunk, chunk
/// aligned, 2 inodes per block, AG inode numbers 11 bits wide.
const CHUNK_BLOCKS: u32 = 32;

struct Vol {
    mgr: Arc<TransManager>,
    perag: PeragTable,
}

/// One AG per entry; each AG gets the free list 7..11 and the given free
/// extents.
fn volume(free: &[&[(u32, u32)]]) -> Vol {
    let ag_count = u32::try_from(free.len()).unwrap();
    let blocks = u64::from(AG_BLOCKS) * u64::from(ag_count);
    let sb = Superblock::for_volume(512, 256, AG_BLOCKS, ag_count, blocks);
    let geo = Geometry::from_superblock(&sb).unwrap();
    assert_eq!(geo.chunk_blocks, CHUNK_BLOCKS);
    let fdblocks = free
        .iter()
        .map(|ag| ag.iter().map(|&(_, len)| u64::from(len)).sum::<u64>() + 4)
        .sum();
    let dev = MemBlockDevice::zeroed(512, blocks).unwrap();
    let bufs = Arc::new(BufCache::new(Arc::new(dev), 8192));
    let log: Arc<dyn Log> = Arc::new(MemLog::new(1 << 32).without_retention());
    let mgr = Arc::new(TransManager::new(
        geo,
        SbCounterSnapshot {
            dblocks: blocks,
            fdblocks,
            ..SbCounterSnapshot::default()
        },
        log,
        bufs,
        TransConfig::default(),
    ));
    let mut tp = mgr.alloc().unwrap();
    let res = TransRes {
        log_res: 1 << 24,
        log_count: 1,
        permanent: false,
    };
    tp.reserve(&res, 0, 0).unwrap();
    let freelist: Vec<AgBlock> = (7..11).map(AgBlock).collect();
    for (agno, extents) in free.iter().enumerate() {
        let agno = AgNumber(u32::try_from(agno).unwrap());
        let recs: Vec<AllocRec> = extents.iter().map(|&(s, l)| AllocRec::new(s, l)).collect();
        init_free_space(&mut tp, agno, &recs, &freelist).unwrap();
        init_inodes(&mut tp, agno).unwrap();
    }
    tp.commit().unwrap();
    Vol {
        mgr,
        perag: PeragTable::new(ag_count),
    }
}

fn fresh(ag_count: usize) -> Vol {
    let ag: &[(u32, u32)] = &[(11, AG_BLOCKS - 11)];
    volume(&vec![ag; ag_count])
}

impl Vol {
    fn create(&self, parent: Option<u64>, policy: &IallocPolicy) -> Option<InodeNumber> {
        let mut locks = self.perag.lock_set();
        let mut tp = self.mgr.alloc().unwrap();
        tp.reserve(&self.mgr.resv().create, create_block_res(self.mgr.geometry()), 0)
            .unwrap();
        let ino = dialloc(&mut tp, &mut locks, parent.map(InodeNumber), policy).unwrap();
        tp.commit().unwrap();
        ino
    }

    fn remove(&self, ino: u64, policy: &IallocPolicy) -> Result<Freed, AgfsError> {
        let mut locks = self.perag.lock_set();
        let mut tp = self.mgr.alloc().unwrap();
        tp.reserve(&self.mgr.resv().remove, 0, 0).unwrap();
        let freed = difree(&mut tp, &mut locks, InodeNumber(ino), policy)?;
        tp.commit().unwrap();
        Ok(freed)
    }

    fn inobt(&self, agno: u32) -> InodeTreeReport {
        let mut tp = self.mgr.alloc().unwrap();
        let mut locks = self.perag.lock_set();
        locks.lock(AgNumber(agno)).unwrap();
        let report = verify_inobt(&mut tp, AgNumber(agno)).unwrap();
        tp.cancel();
        report
    }

    fn free_extents(&self, agno: u32) -> Vec<(u32, u32)> {
        let mut tp = self.mgr.alloc().unwrap();
        let mut locks = self.perag.lock_set();
        locks.lock(AgNumber(agno)).unwrap();
        let report = verify_ag(&mut tp, AgNumber(agno)).unwrap();
        tp.cancel();
        report.extents.iter().map(|r| (r.start, r.len)).collect()
    }

    fn counter(&self, field: SbField) -> u64 {
        self.mgr.counters().get(field)
    }
}

fn policy() -> IallocPolicy {
    IallocPolicy::default()
}

// ── Allocation ──────────────────────────────────────────────────────────────

#[test]
fn first_inode_creates_a_chunk() {
    let vol = fresh(1);
    let before = vol.counter(SbField::Fdblocks);

    // Chunks are aligned to 32 blocks: block 32 is the first candidate,
    // which is AG inode 64.
    assert_eq!(vol.create(None, &policy()), Some(InodeNumber(64)));

    let report = vol.inobt(0);
    assert_eq!(
        report.chunks,
        vec![InobtRec {
            start_ino: 64,
            free_count: 63,
            free_mask: u64::MAX << 1,
        }]
    );
    assert_eq!((report.count, report.freecount), (64, 63));
    assert_eq!(vol.free_extents(0), vec![(11, 21), (64, 960)]);
    assert_eq!(vol.counter(SbField::Fdblocks), before - u64::from(CHUNK_BLOCKS));
    assert_eq!(vol.counter(SbField::Icount), 64);
    assert_eq!(vol.counter(SbField::Ifree), 63);
}

#[test]
fn lowest_free_inode_is_used() {
    let vol = fresh(1);
    for expect in 64..70 {
        assert_eq!(vol.create(None, &policy()), Some(InodeNumber(expect)));
    }
    vol.remove(66, &policy()).unwrap();
    assert_eq!(vol.create(None, &policy()), Some(InodeNumber(66)));
    assert_eq!(vol.create(None, &policy()), Some(InodeNumber(70)));
}

#[test]
fn new_chunk_follows_the_newest_one() {
    let vol = fresh(1);
    for _ in 0..64 {
        vol.create(None, &policy()).unwrap();
    }
    assert_eq!(vol.inobt(0).freecount, 0);
    // Blocks 64..96 sit right after the first chunk.
    assert_eq!(vol.create(None, &policy()), Some(InodeNumber(128)));
    let starts: Vec<u32> = vol.inobt(0).chunks.iter().map(|c| c.start_ino).collect();
    assert_eq!(starts, vec![64, 128]);
}

#[test]
fn parent_hint_picks_the_nearby_chunk() {
    let vol = fresh(1);
    for _ in 0..65 {
        vol.create(None, &policy()).unwrap();
    }
    // Chunk 64 is full except for 70; chunk 128 has 128 in use.
    vol.remove(70, &policy()).unwrap();

    assert_eq!(vol.create(Some(100), &policy()), Some(InodeNumber(70)));
    assert_eq!(vol.create(Some(100), &policy()), Some(InodeNumber(129)));
    assert_eq!(vol.create(Some(130), &policy()), Some(InodeNumber(130)));
}

#[test]
fn search_distance_zero_falls_back_to_newest_chunk() {
    let vol = fresh(1);
    for _ in 0..65 {
        vol.create(None, &policy()).unwrap();
    }
    let narrow = IallocPolicy {
        search_distance: 0,
        ..IallocPolicy::default()
    };
    // The hint's own chunk (64) is full; without neighbours to look at the
    // newest chunk wins.
    assert_eq!(vol.create(Some(64), &narrow), Some(InodeNumber(129)));
}

#[test]
fn full_ag_is_skipped() {
    // AG 0 has no room for a 32-block chunk.
    let vol = volume(&[&[(11, 20)], &[(11, AG_BLOCKS - 11)]]);
    let ino = vol.create(None, &policy()).unwrap();
    let geo = *vol.mgr.geometry();
    assert_eq!(geo.ino_to_ag(ino).map(|(ag, _)| ag), Some(AgNumber(1)));
    assert_eq!(vol.inobt(0).count, 0);
    assert_eq!(vol.inobt(1).count, 64);
}

#[test]
fn no_room_anywhere_is_none() {
    // Enough blocks for the reservation, none of them a whole aligned chunk.
    let vol = volume(&[&[(11, 20), (40, 20), (70, 20)]]);
    assert_eq!(vol.create(None, &policy()), None);
    assert_eq!(vol.counter(SbField::Icount), 0);
}

// ── Free ────────────────────────────────────────────────────────────────────

#[test]
fn double_free_is_corruption_and_changes_nothing() {
    let vol = fresh(1);
    vol.create(None, &policy()).unwrap();
    vol.create(None, &policy()).unwrap();
    assert_eq!(vol.remove(65, &policy()).unwrap(), Freed::Inode);

    let before = vol.inobt(0);
    let ifree = vol.counter(SbField::Ifree);
    let err = vol.remove(65, &policy()).unwrap_err();
    assert!(err.is_corruption(), "{err}");
    assert_eq!(vol.inobt(0), before);
    assert_eq!(vol.counter(SbField::Ifree), ifree);
    assert!(!vol.mgr.is_shutdown());
}

#[test]
fn freeing_an_unallocated_range_is_corruption() {
    let vol = fresh(1);
    vol.create(None, &policy()).unwrap();
    let err = vol.remove(600, &policy()).unwrap_err();
    assert!(err.is_corruption());
    let err = vol.remove(1 << 40, &policy()).unwrap_err();
    assert!(err.is_corruption(), "{err}");
    let report = vol.inobt(0);
    assert_eq!(report.count - report.freecount, 1);
}

#[test]
fn empty_chunk_returns_its_blocks() {
    let vol = fresh(1);
    let fd = vol.counter(SbField::Fdblocks);
    vol.create(None, &policy()).unwrap();

    assert_eq!(
        vol.remove(64, &policy()).unwrap(),
        Freed::Chunk {
            start: AgBlock(32),
            blocks: CHUNK_BLOCKS,
        }
    );
    let report = vol.inobt(0);
    assert!(report.chunks.is_empty());
    assert_eq!((report.count, report.freecount), (0, 0));
    assert_eq!(vol.free_extents(0), vec![(11, AG_BLOCKS - 11)]);
    assert_eq!(vol.counter(SbField::Fdblocks), fd);
    assert_eq!(vol.counter(SbField::Icount), 0);
    assert_eq!(vol.counter(SbField::Ifree), 0);
}

#[test]
fn empty_chunk_is_kept_when_asked() {
    let vol = fresh(1);
    let keep = IallocPolicy {
        keep_empty_chunks: true,
        ..IallocPolicy::default()
    };
    vol.create(None, &keep).unwrap();
    assert_eq!(vol.remove(64, &keep).unwrap(), Freed::Inode);
    let report = vol.inobt(0);
    assert_eq!(report.chunks, vec![InobtRec::all_free(64)]);
    assert_eq!((report.count, report.freecount), (64, 64));
    // Reused without creating another chunk.
    assert_eq!(vol.create(None, &keep), Some(InodeNumber(64)));
    assert_eq!(vol.inobt(0).chunks.len(), 1);
}

// ── Mapping ─────────────────────────────────────────────────────────────────

#[test]
fn imap_finds_cluster_and_slot() {
    let vol = fresh(1);
    for _ in 0..40 {
        vol.create(None, &policy()).unwrap();
    }
    let mut tp = vol.mgr.alloc().unwrap();

    let first = imap(&mut tp, InodeNumber(64)).unwrap();
    assert_eq!(first.chunk, AgBlock(32));
    assert_eq!(first.block, BlockNumber(32));
    assert_eq!(first.cluster, BlockNumber(32));
    assert_eq!(first.offset, 0);

    // AG inode 99: block 49, second slot, in the cluster at 48 (16 blocks
    // of 512 bytes per 8 KiB cluster).
    let loc = imap(&mut tp, InodeNumber(99)).unwrap();
    assert_eq!(loc.block, BlockNumber(49));
    assert_eq!(loc.cluster, BlockNumber(48));
    assert_eq!(loc.cluster_blocks, 16);
    assert_eq!(loc.offset, 256);
    assert_eq!(loc.cluster_offset, 512 + 256);
    assert_eq!(imap_untrusted(&mut tp, InodeNumber(99)).unwrap(), loc);

    let core = read_dinode(&mut tp, &loc).unwrap();
    assert!(core.is_unused());

    assert!(matches!(
        imap_untrusted(&mut tp, InodeNumber(600)),
        Err(AgfsError::NotFound(_))
    ));
    // Only a number from outside the filesystem may be plain bad input.
    assert!(imap(&mut tp, InodeNumber(1 << 40)).unwrap_err().is_corruption());
    assert!(matches!(
        imap_untrusted(&mut tp, InodeNumber(1 << 40)),
        Err(AgfsError::InvalidArgument(_))
    ));
    tp.cancel();
}

#[test]
fn location_serialises() {
    let vol = fresh(1);
    vol.create(None, &policy()).unwrap();
    let mut tp = vol.mgr.alloc().unwrap();
    let loc = imap(&mut tp, InodeNumber(64)).unwrap();
    tp.cancel();
    let json = serde_json::to_value(loc).unwrap();
    assert_eq!(json["agino"], 64);
    assert_eq!(json["cluster_blocks"], 16);
    let policy: IallocPolicy = serde_json::from_str(r#"{"keep_empty_chunks":true,"search_distance":3}"#).unwrap();
    assert_eq!(policy.search_distance, 3);
}

// ── Scrub ───────────────────────────────────────────────────────────────────

#[test]
fn verify_catches_a_bad_agi_count() {
    let vol = fresh(1);
    vol.create(None, &policy()).unwrap();
    vol.create(None, &policy()).unwrap();

    let mut tp = vol.mgr.alloc().unwrap();
    tp.reserve(&vol.mgr.resv().sb, 0, 0).unwrap();
    let mut st = AgiState::read(&mut tp, AgNumber(0)).unwrap();
    st.agi.freecount += 1;
    st.write(&mut tp).unwrap();
    tp.commit().unwrap();

    let mut tp = vol.mgr.alloc().unwrap();
    let err = verify_inobt(&mut tp, AgNumber(0)).unwrap_err();
    assert!(err.is_corruption());
}

#[test]
fn chunk_extents_cover_the_chunk_blocks() {
    let vol = fresh(1);
    for _ in 0..65 {
        vol.create(None, &policy()).unwrap();
    }
    let geo = *vol.mgr.geometry();
    let report = vol.inobt(0);
    assert_eq!(
        report.chunk_extents(&geo),
        vec![AllocRec::new(32, 32), AllocRec::new(64, 32)]
    );
}

// ── Random sequences ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Op {
    Create(Option<u8>),
    Remove(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => proptest::option::of(any::<u8>()).prop_map(Op::Create),
        2 => any::<u8>().prop_map(Op::Remove),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn inode_and_block_counts_stay_consistent(
        ops in proptest::collection::vec(op(), 1..120),
        keep in any::<bool>(),
    ) {
        let vol = fresh(1);
        let policy = IallocPolicy { keep_empty_chunks: keep, ..IallocPolicy::default() };
        let mut live: Vec<u64> = Vec::new();
        for op in ops {
            match op {
                Op::Create(parent) => {
                    let parent = parent
                        .and_then(|i| live.get(usize::from(i) % live.len().max(1)).copied());
                    if let Some(ino) = vol.create(parent, &policy) {
                        prop_assert!(!live.contains(&ino.0));
                        live.push(ino.0);
                    }
                }
                Op::Remove(i) => {
                    if live.is_empty() {
                        continue;
                    }
                    let ino = live.swap_remove(usize::from(i) % live.len());
                    vol.remove(ino, &policy).unwrap();
                }
            }
        }

        let report = vol.inobt(0);
        let used = u64::from(report.count - report.freecount);
        prop_assert_eq!(used, live.len() as u64);
        prop_assert_eq!(vol.counter(SbField::Icount), u64::from(report.count));
        prop_assert_eq!(vol.counter(SbField::Ifree), u64::from(report.freecount));
        if !keep {
            prop_assert!(report.chunks.iter().all(|c| c.free_mask != u64::MAX));
        }

        // Chunk blocks, free space, free list and tree blocks partition the
        // AG after the four headers and the inode tree root.
        let mut tp = vol.mgr.alloc().unwrap();
        let free = verify_ag(&mut tp, AgNumber(0)).unwrap();
        tp.cancel();
        let chunk_blocks = report.chunks.len() as u64 * u64::from(CHUNK_BLOCKS);
        let inobt_extra = report.tree_blocks.len() as u64 - 1;
        prop_assert_eq!(
            5 + free.counted_free() + 2 + chunk_blocks + inobt_extra,
            u64::from(AG_BLOCKS)
        );
        prop_assert_eq!(vol.counter(SbField::Fdblocks), free.counted_free());
    }
}

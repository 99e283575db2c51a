//! Random mixes of inode and extent operations leave a volume that scrubs
//! clean and whose counters match what the operations handed out.

use agfs_block::{BlockDevice, MemBlockDevice};
use agfs_core::{
    AgNumber, AgfsError, AllocArgs, AllocTarget, BlockExtent, Filesystem, FormatParams,
    InodeNumber, MountOptions, Owner, format,
};
use proptest::prelude::*;
use std::sync::Arc;

const AG_BLOCKS: u32 = 256;
const AG_COUNT: u32 = 2;

#[derive(Debug, Clone)]
enum Op {
    Create { uid: u32 },
    Remove { pick: usize },
    Alloc { ag: u32, len: u32, charge: Option<usize> },
    Free { pick: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        2 => (0_u32..3).prop_map(|uid| Op::Create { uid }),
        1 => any::<usize>().prop_map(|pick| Op::Remove { pick }),
        3 => (0..AG_COUNT, 1_u32..24, proptest::option::of(any::<usize>()))
            .prop_map(|(ag, len, charge)| Op::Alloc { ag, len, charge }),
        2 => any::<usize>().prop_map(|pick| Op::Free { pick }),
    ]
}

fn mounted(keep_empty_inode_chunks: bool) -> Filesystem {
    let dev: Arc<dyn BlockDevice> = Arc::new(
        MemBlockDevice::zeroed(512, u64::from(AG_COUNT) * u64::from(AG_BLOCKS)).unwrap(),
    );
    let params = FormatParams {
        block_size: 512,
        inode_size: 256,
        ag_blocks: AG_BLOCKS,
        ..FormatParams::default()
    };
    format(Arc::clone(&dev), &params).unwrap();
    let options = MountOptions {
        keep_empty_inode_chunks,
        ..MountOptions::default()
    };
    Filesystem::mount(dev, options).unwrap()
}

/// An inode the test created, with the extents charged to it.
struct Live {
    ino: InodeNumber,
    extents: Vec<BlockExtent>,
}

fn run(fs: &Filesystem, ops: Vec<Op>) {
    let mut live: Vec<Live> = Vec::new();
    let mut loose: Vec<BlockExtent> = Vec::new();
    for op in ops {
        match op {
            Op::Create { uid } => {
                let parent = live.first().map(|l| l.ino);
                let owner = Owner {
                    uid,
                    ..Owner::default()
                };
                match fs.create_inode(parent, 0o100_644, owner) {
                    Ok(ino) => live.push(Live {
                        ino,
                        extents: Vec::new(),
                    }),
                    Err(AgfsError::NoSpace) => {}
                    Err(err) => panic!("create failed: {err}"),
                }
            }
            Op::Remove { pick } => {
                if live.is_empty() {
                    continue;
                }
                let gone = live.swap_remove(pick % live.len());
                fs.free_extents(&gone.extents, Some(gone.ino)).unwrap();
                fs.remove_inode(gone.ino).unwrap();
            }
            Op::Alloc { ag, len, charge } => {
                let args = AllocArgs::new(AllocTarget::StartAg(AgNumber(ag)), 1, len);
                let target = charge.filter(|_| !live.is_empty()).map(|c| c % live.len());
                let ino = target.map(|i| live[i].ino);
                match fs.alloc_extent(&args, ino) {
                    Ok(ext) => match target {
                        Some(i) => live[i].extents.push(ext),
                        None => loose.push(ext),
                    },
                    Err(AgfsError::NoSpace) => {}
                    Err(err) => panic!("alloc failed: {err}"),
                }
            }
            Op::Free { pick } => {
                if loose.is_empty() {
                    continue;
                }
                let ext = loose.swap_remove(pick % loose.len());
                fs.free_extent(ext, None).unwrap();
            }
        }
    }

    for l in &live {
        let held: u64 = l.extents.iter().map(|e| u64::from(e.len)).sum();
        assert_eq!(fs.read_inode(l.ino).unwrap().nblocks, held);
    }
    let report = fs.verify().unwrap();
    assert!(report.counters_checked);
    let st = fs.statfs();
    assert_eq!(st.free_blocks, report.fdblocks);
    assert_eq!(st.inodes - st.free_inodes, live.len() as u64);
    assert!(!fs.is_shutdown());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn random_operations_scrub_clean(ops in proptest::collection::vec(op(), 1..80)) {
        run(&mounted(false), ops);
    }

    #[test]
    fn random_operations_scrub_clean_with_kept_chunks(
        ops in proptest::collection::vec(op(), 1..80),
    ) {
        run(&mounted(true), ops);
    }
}

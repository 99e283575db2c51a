use agfs_block::{BufCache, MemBlockDevice};
use agfs_btree::node::Node;
use agfs_btree::{BtreeOps, Cursor, LookupDir};
use agfs_error::Result;
use agfs_ondisk::{AllocRec, BtreeKey, BtreeKind, Geometry, Record, Superblock};
use agfs_trans::{Log, MemLog, SbCounterSnapshot, TransConfig, TransManager, TransRes, Transaction};
use agfs_types::{AgBlock, AgNumber};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;

const AG_BLOCKS: u32 = 16384;

struct BumpOps {
    root: AgBlock,
    levels: u32,
    next: u32,
}

impl BtreeOps for BumpOps {
    fn kind(&self) -> BtreeKind {
        BtreeKind::Bno
    }

    fn agno(&self) -> AgNumber {
        AgNumber(0)
    }

    fn root(&self) -> (AgBlock, u32) {
        (self.root, self.levels)
    }

    fn set_root(&mut self, _tp: &mut Transaction, root: AgBlock, levels: u32) -> Result<()> {
        self.root = root;
        self.levels = levels;
        Ok(())
    }

    fn alloc_block(&mut self, _tp: &mut Transaction, _near: AgBlock) -> Result<Option<AgBlock>> {
        self.next += 1;
        Ok((self.next < AG_BLOCKS).then_some(AgBlock(self.next)))
    }

    fn free_block(&mut self, _tp: &mut Transaction, _block: AgBlock) -> Result<()> {
        Ok(())
    }
}

fn open() -> (Transaction, BumpOps) {
    let sb = Superblock::for_volume(512, 256, AG_BLOCKS, 1, u64::from(AG_BLOCKS));
    let geo = Geometry::from_superblock(&sb).unwrap();
    let dev = MemBlockDevice::zeroed(512, u64::from(AG_BLOCKS)).unwrap();
    let bufs = Arc::new(BufCache::new(Arc::new(dev), 4096));
    let log: Arc<dyn Log> = Arc::new(MemLog::new(1 << 40));
    let mgr = Arc::new(TransManager::new(
        geo,
        SbCounterSnapshot::default(),
        log,
        bufs,
        TransConfig::default(),
    ));
    let mut tp = mgr.alloc().unwrap();
    let res = TransRes {
        log_res: 1 << 32,
        log_count: 1,
        permanent: true,
    };
    tp.reserve(&res, 0, 0).unwrap();
    let ops = BumpOps {
        root: AgBlock(8),
        levels: 1,
        next: 8,
    };
    let loc = Cursor::new(&ops, &tp).loc();
    Node::empty(&loc, ops.root, 0).store_new(&mut tp, &loc).unwrap();
    (tp, ops)
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("bno_insert");
    for count in [256_u32, 2048] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let (mut tp, mut ops) = open();
                let mut cur = Cursor::new(&ops, &tp);
                // Stride scatters inserts across leaves.
                for i in 0..count {
                    let start = (i * 7919) % (AG_BLOCKS - 1);
                    let rec = Record::FreeSpaceByBno(AllocRec::new(start, 1));
                    cur.insert(&mut tp, &mut ops, &rec).unwrap();
                }
                black_box(ops.levels);
                tp.cancel();
            });
        });
    }
    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let (mut tp, mut ops) = open();
    let mut cur = Cursor::new(&ops, &tp);
    for i in 0..4096_u32 {
        let rec = Record::FreeSpaceByBno(AllocRec::new(i * 2, 1));
        cur.insert(&mut tp, &mut ops, &rec).unwrap();
    }
    c.bench_function("bno_lookup_le", |b| {
        let mut probe = 0_u32;
        b.iter(|| {
            probe = (probe + 4099) % 8192;
            let key = BtreeKey::Bno { start: probe };
            black_box(cur.lookup(&mut tp, &ops, &key, LookupDir::Le).unwrap())
        });
    });
}

criterion_group!(benches, bench_insert, bench_lookup);
criterion_main!(benches);

//! Log service: space grants, tickets and the commit record format.
//!
//! The engine only needs "reserve N bytes, then append one record". Records
//! are checksummed with CRC32C and carry every dirty buffer region, every
//! superblock counter delta and every dquot delta of one transaction.
//!
//! ```text
//! Record:
//! +------------------+---------+
//! | record_len       | 4 bytes | length excluding this field
//! | record_type      | 1 byte  | = 1 (transaction)
//! | lsn              | 8 bytes |
//! | txn_id           | 8 bytes |
//! | num_regions      | 4 bytes |
//! | num_deltas       | 4 bytes |
//! | num_dquots       | 4 bytes |
//! +------------------+---------+
//! | region: block u64, offset u32, len u32, bytes  |
//! | delta:  field u8, value i64                    |
//! | dquot:  type u8, id u32, blocks/inodes/rtblocks i64 x3 |
//! +------------------+---------+
//! | record_crc       | 4 bytes | CRC32C of everything after record_len
//! +------------------+---------+
//! ```

use crate::counters::SbField;
use crate::quota::{DquotId, QuotaType};
use crate::resv::TransRes;
use agfs_error::{AgfsError, Result};
use agfs_types::{BlockNumber, Lsn, TxnId};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

pub const RECORD_TYPE_TRANS: u8 = 1;

/// Fixed header bytes after `record_len`, plus the CRC trailer.
pub const RECORD_FIXED_SIZE: usize = 1 + 8 + 8 + 4 + 4 + 4 + 4;
pub const REGION_HEADER_SIZE: usize = 8 + 4 + 4;
pub const DELTA_SIZE: usize = 1 + 8;
pub const DQUOT_ITEM_SIZE: usize = 1 + 4 + 8 * 3;

// ── Record ──────────────────────────────────────────────────────────────────

/// New bytes for one contiguous range of one buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRegion {
    pub block: BlockNumber,
    pub offset: u32,
    pub bytes: Vec<u8>,
}

/// Usage change applied to one dquot at commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DquotLogItem {
    pub id: DquotId,
    pub blocks: i64,
    pub inodes: i64,
    pub rtblocks: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub tid: TxnId,
    pub regions: Vec<LogRegion>,
    pub deltas: Vec<(SbField, i64)>,
    pub dquots: Vec<DquotLogItem>,
}

impl LogRecord {
    /// Encoded length including the length prefix.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        4 + RECORD_FIXED_SIZE
            + self
                .regions
                .iter()
                .map(|r| REGION_HEADER_SIZE + r.bytes.len())
                .sum::<usize>()
            + self.deltas.len() * DELTA_SIZE
            + self.dquots.len() * DQUOT_ITEM_SIZE
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty() && self.deltas.is_empty() && self.dquots.is_empty()
    }
}

fn len_u32(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len).map_err(|_| AgfsError::InvalidArgument(format!("{what} exceeds u32")))
}

pub fn encode_record(record: &LogRecord) -> Result<Vec<u8>> {
    let total = record.encoded_len();
    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&len_u32(total - 4, "log record length")?.to_le_bytes());
    buf.push(RECORD_TYPE_TRANS);
    buf.extend_from_slice(&record.lsn.0.to_le_bytes());
    buf.extend_from_slice(&record.tid.0.to_le_bytes());
    buf.extend_from_slice(&len_u32(record.regions.len(), "region count")?.to_le_bytes());
    buf.extend_from_slice(&len_u32(record.deltas.len(), "delta count")?.to_le_bytes());
    buf.extend_from_slice(&len_u32(record.dquots.len(), "dquot count")?.to_le_bytes());
    for region in &record.regions {
        buf.extend_from_slice(&region.block.0.to_le_bytes());
        buf.extend_from_slice(&region.offset.to_le_bytes());
        buf.extend_from_slice(&len_u32(region.bytes.len(), "region length")?.to_le_bytes());
        buf.extend_from_slice(&region.bytes);
    }
    for (field, delta) in &record.deltas {
        buf.push(field.code());
        buf.extend_from_slice(&delta.to_le_bytes());
    }
    for item in &record.dquots {
        buf.push(item.id.ty.code());
        buf.extend_from_slice(&item.id.id.to_le_bytes());
        buf.extend_from_slice(&item.blocks.to_le_bytes());
        buf.extend_from_slice(&item.inodes.to_le_bytes());
        buf.extend_from_slice(&item.rtblocks.to_le_bytes());
    }
    let crc = crc32c::crc32c(&buf[4..]);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Result of decoding one record from the front of a byte slice.
#[derive(Debug)]
pub enum DecodeResult {
    /// A complete record and the bytes it occupied.
    Record(LogRecord, usize),
    /// The slice ends inside a record that needs this many bytes.
    NeedMore(usize),
    Corrupted(String),
    EndOfData,
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let end = self.pos.checked_add(N)?;
        let out = self.bytes.get(self.pos..end)?.try_into().ok()?;
        self.pos = end;
        Some(out)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take::<1>().map(|b| b[0])
    }

    fn u32(&mut self) -> Option<u32> {
        self.take::<4>().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Option<u64> {
        self.take::<8>().map(u64::from_le_bytes)
    }

    fn i64(&mut self) -> Option<i64> {
        self.take::<8>().map(i64::from_le_bytes)
    }

    fn slice(&mut self, len: usize) -> Option<&[u8]> {
        let end = self.pos.checked_add(len)?;
        let out = self.bytes.get(self.pos..end)?;
        self.pos = end;
        Some(out)
    }
}

#[must_use]
pub fn decode_record(bytes: &[u8]) -> DecodeResult {
    if bytes.is_empty() {
        return DecodeResult::EndOfData;
    }
    let Some(len_bytes) = bytes.get(0..4) else {
        return DecodeResult::NeedMore(4);
    };
    let record_len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
    if record_len == 0 {
        return DecodeResult::EndOfData;
    }
    let record_len = record_len as usize;
    if record_len < RECORD_FIXED_SIZE {
        return DecodeResult::Corrupted(format!(
            "record length too small: {record_len} < {RECORD_FIXED_SIZE}"
        ));
    }
    let total = 4 + record_len;
    if bytes.len() < total {
        return DecodeResult::NeedMore(total);
    }
    let body = &bytes[4..total];
    let crc_offset = body.len() - 4;
    let stored = u32::from_le_bytes([
        body[crc_offset],
        body[crc_offset + 1],
        body[crc_offset + 2],
        body[crc_offset + 3],
    ]);
    let computed = crc32c::crc32c(&body[..crc_offset]);
    if stored != computed {
        return DecodeResult::Corrupted(format!(
            "CRC mismatch: stored {stored:#010x}, computed {computed:#010x}"
        ));
    }
    match decode_body(&body[..crc_offset]) {
        Some(record) => DecodeResult::Record(record, total),
        None => DecodeResult::Corrupted("record body truncated or malformed".to_owned()),
    }
}

fn decode_body(body: &[u8]) -> Option<LogRecord> {
    let mut r = Reader { bytes: body, pos: 0 };
    if r.u8()? != RECORD_TYPE_TRANS {
        return None;
    }
    let lsn = Lsn(r.u64()?);
    let tid = TxnId(r.u64()?);
    let nregions = r.u32()?;
    let ndeltas = r.u32()?;
    let ndquots = r.u32()?;
    let mut record = LogRecord {
        lsn,
        tid,
        ..LogRecord::default()
    };
    for _ in 0..nregions {
        let block = BlockNumber(r.u64()?);
        let offset = r.u32()?;
        let len = r.u32()? as usize;
        let bytes = r.slice(len)?.to_vec();
        record.regions.push(LogRegion {
            block,
            offset,
            bytes,
        });
    }
    for _ in 0..ndeltas {
        let field = SbField::from_code(r.u8()?)?;
        record.deltas.push((field, r.i64()?));
    }
    for _ in 0..ndquots {
        let ty = QuotaType::from_code(r.u8()?)?;
        let id = r.u32()?;
        record.dquots.push(DquotLogItem {
            id: DquotId { ty, id },
            blocks: r.i64()?,
            inodes: r.i64()?,
            rtblocks: r.i64()?,
        });
    }
    (r.pos == body.len()).then_some(record)
}

// ── Tickets and the log service ─────────────────────────────────────────────

/// Log space held by one transaction (or one chain of rolled transactions).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTicket {
    pub tid: TxnId,
    /// Bytes one commit may use.
    pub unit_bytes: u64,
    /// Units granted up front; permanent tickets regrant when exhausted.
    pub count: u32,
    /// Units not yet consumed by a commit.
    pub remaining: u32,
    pub permanent: bool,
}

impl LogTicket {
    #[must_use]
    pub fn granted_bytes(&self) -> u64 {
        self.unit_bytes * u64::from(self.remaining)
    }
}

/// Append-only log service consumed by the transaction engine.
pub trait Log: Send + Sync {
    /// Grant space for `res`, waiting up to `wait` for other tickets to drain.
    fn reserve(&self, tid: TxnId, res: &TransRes, wait: Duration) -> Result<LogTicket>;

    /// Refill a permanent ticket after a roll consumed a unit.
    fn regrant(&self, ticket: &mut LogTicket, wait: Duration) -> Result<()>;

    /// Return every unit still held by the ticket.
    fn ungrant(&self, ticket: LogTicket);

    /// Append one record; returns its sequence number once accepted.
    fn write(&self, ticket: &mut LogTicket, record: LogRecord) -> Result<Lsn>;

    /// Sequence number of the last accepted record.
    fn last_lsn(&self) -> Lsn;

    /// Bytes not granted to any ticket.
    fn free_bytes(&self) -> u64;
}

#[derive(Debug)]
struct MemLogState {
    granted: u64,
    last_lsn: Lsn,
    records: Vec<Vec<u8>>,
}

/// In-memory log with a bounded grant head.
///
/// Metadata is written in place at commit, so a record's space is only
/// needed while its ticket lives; granted bytes return on ungrant.
#[derive(Debug)]
pub struct MemLog {
    capacity: u64,
    state: Mutex<MemLogState>,
    space: Condvar,
    fail_writes: AtomicBool,
    retain_records: bool,
}

impl MemLog {
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            state: Mutex::new(MemLogState {
                granted: 0,
                last_lsn: Lsn::ZERO,
                records: Vec::new(),
            }),
            space: Condvar::new(),
            fail_writes: AtomicBool::new(false),
            retain_records: true,
        }
    }

    /// Keep only counts, not record bytes (long-running workloads).
    #[must_use]
    pub fn without_retention(mut self) -> Self {
        self.retain_records = false;
        self
    }

    /// Make every subsequent `write` fail with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Decode every retained record, oldest first.
    pub fn records(&self) -> Result<Vec<LogRecord>> {
        let state = self.state.lock();
        let mut out = Vec::with_capacity(state.records.len());
        for bytes in &state.records {
            match decode_record(bytes) {
                DecodeResult::Record(record, _) => out.push(record),
                other => {
                    return Err(AgfsError::Parse(format!("retained log record: {other:?}")));
                }
            }
        }
        Ok(out)
    }

    fn grant(&self, bytes: u64, wait: Duration) -> Result<()> {
        if bytes > self.capacity {
            return Err(AgfsError::LogSpace { needed: bytes });
        }
        let deadline = Instant::now() + wait;
        let mut state = self.state.lock();
        while state.granted + bytes > self.capacity {
            trace!(needed = bytes, granted = state.granted, "log_grant_wait");
            if self.space.wait_until(&mut state, deadline).timed_out()
                && state.granted + bytes > self.capacity
            {
                warn!(needed = bytes, granted = state.granted, "log_grant_timeout");
                return Err(AgfsError::LogSpace { needed: bytes });
            }
        }
        state.granted += bytes;
        Ok(())
    }

    fn release(&self, bytes: u64) {
        let mut state = self.state.lock();
        state.granted = state.granted.saturating_sub(bytes);
        drop(state);
        self.space.notify_all();
    }
}

impl Log for MemLog {
    fn reserve(&self, tid: TxnId, res: &TransRes, wait: Duration) -> Result<LogTicket> {
        let count = res.log_count.max(1);
        self.grant(res.log_res * u64::from(count), wait)?;
        debug!(
            txn = tid.0,
            unit = res.log_res,
            count,
            permanent = res.permanent,
            "log_ticket_granted"
        );
        Ok(LogTicket {
            tid,
            unit_bytes: res.log_res,
            count,
            remaining: count,
            permanent: res.permanent,
        })
    }

    fn regrant(&self, ticket: &mut LogTicket, wait: Duration) -> Result<()> {
        if ticket.remaining > 0 {
            return Ok(());
        }
        self.grant(ticket.unit_bytes, wait)?;
        ticket.remaining = 1;
        trace!(txn = ticket.tid.0, "log_ticket_regranted");
        Ok(())
    }

    fn ungrant(&self, ticket: LogTicket) {
        self.release(ticket.granted_bytes());
    }

    fn write(&self, ticket: &mut LogTicket, mut record: LogRecord) -> Result<Lsn> {
        let needed = u64::try_from(record.encoded_len()).unwrap_or(u64::MAX);
        if ticket.remaining == 0 || needed > ticket.unit_bytes {
            return Err(AgfsError::ReservationOverrun {
                resource: "log",
                reserved: if ticket.remaining == 0 {
                    0
                } else {
                    ticket.unit_bytes
                },
                requested: needed,
            });
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AgfsError::Io(std::io::Error::other("injected log write failure")));
        }
        let mut state = self.state.lock();
        let lsn = state.last_lsn.next();
        record.lsn = lsn;
        let encoded = encode_record(&record)?;
        state.last_lsn = lsn;
        if self.retain_records {
            state.records.push(encoded);
        }
        drop(state);
        // The unit is consumed; its bytes stay granted until ungrant or
        // until the ticket regrants for a continuation.
        ticket.remaining -= 1;
        self.release(ticket.unit_bytes);
        trace!(txn = ticket.tid.0, lsn = lsn.0, bytes = needed, "log_record_written");
        Ok(lsn)
    }

    fn last_lsn(&self) -> Lsn {
        self.state.lock().last_lsn
    }

    fn free_bytes(&self) -> u64 {
        self.capacity.saturating_sub(self.state.lock().granted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LogRecord {
        LogRecord {
            lsn: Lsn(9),
            tid: TxnId(4),
            regions: vec![
                LogRegion {
                    block: BlockNumber(1),
                    offset: 0,
                    bytes: vec![0xAB; 128],
                },
                LogRegion {
                    block: BlockNumber(77),
                    offset: 384,
                    bytes: vec![1, 2, 3],
                },
            ],
            deltas: vec![(SbField::Fdblocks, -12), (SbField::Ifree, 63)],
            dquots: vec![DquotLogItem {
                id: DquotId {
                    ty: QuotaType::Group,
                    id: 100,
                },
                blocks: 12,
                inodes: 1,
                rtblocks: 0,
            }],
        }
    }

    #[test]
    fn record_decodes_to_same_content() {
        let record = sample();
        let bytes = encode_record(&record).unwrap();
        assert_eq!(bytes.len(), record.encoded_len());
        match decode_record(&bytes) {
            DecodeResult::Record(decoded, used) => {
                assert_eq!(decoded, record);
                assert_eq!(used, bytes.len());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn default_record_is_empty_and_encodes() {
        let record = LogRecord {
            lsn: Lsn(1),
            ..LogRecord::default()
        };
        assert_eq!(record.tid, TxnId(0));
        assert!(record.is_empty());
        let bytes = encode_record(&record).unwrap();
        assert_eq!(bytes.len(), record.encoded_len());
        assert!(matches!(decode_record(&bytes), DecodeResult::Record(r, _) if r == record));
    }

    #[test]
    fn crc_detects_flipped_bit() {
        let mut bytes = encode_record(&sample()).unwrap();
        bytes[40] ^= 0x10;
        assert!(matches!(decode_record(&bytes), DecodeResult::Corrupted(_)));
    }

    #[test]
    fn truncation_and_end_of_data() {
        let bytes = encode_record(&sample()).unwrap();
        assert!(matches!(
            decode_record(&bytes[..bytes.len() - 3]),
            DecodeResult::NeedMore(n) if n == bytes.len()
        ));
        assert!(matches!(decode_record(&[]), DecodeResult::EndOfData));
        assert!(matches!(decode_record(&[0, 0, 0, 0]), DecodeResult::EndOfData));
    }

    fn res(bytes: u64, count: u32, permanent: bool) -> TransRes {
        TransRes {
            log_res: bytes,
            log_count: count,
            permanent,
        }
    }

    #[test]
    fn grant_head_is_bounded_and_released() {
        let log = MemLog::new(10_000);
        let t1 = log.reserve(TxnId(1), &res(6000, 1, false), Duration::ZERO).unwrap();
        assert_eq!(log.free_bytes(), 4000);
        let err = log
            .reserve(TxnId(2), &res(6000, 1, false), Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, AgfsError::LogSpace { needed: 6000 }));
        log.ungrant(t1);
        assert_eq!(log.free_bytes(), 10_000);
    }

    #[test]
    fn waiter_proceeds_when_space_returns() {
        let log = std::sync::Arc::new(MemLog::new(1000));
        let t1 = log.reserve(TxnId(1), &res(800, 1, false), Duration::ZERO).unwrap();
        let waiter = {
            let log = std::sync::Arc::clone(&log);
            std::thread::spawn(move || {
                log.reserve(TxnId(2), &res(800, 1, false), Duration::from_secs(5))
                    .map(|t| t.unit_bytes)
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        log.ungrant(t1);
        assert_eq!(waiter.join().unwrap().unwrap(), 800);
    }

    #[test]
    fn write_assigns_monotonic_lsns_and_consumes_units() {
        let log = MemLog::new(1 << 20);
        let mut ticket = log.reserve(TxnId(1), &res(4096, 2, true), Duration::ZERO).unwrap();
        let a = log.write(&mut ticket, sample()).unwrap();
        let b = log.write(&mut ticket, sample()).unwrap();
        assert!(b > a);
        assert_eq!(ticket.remaining, 0);
        assert!(log.write(&mut ticket, sample()).is_err());
        log.regrant(&mut ticket, Duration::ZERO).unwrap();
        assert_eq!(ticket.remaining, 1);
        let c = log.write(&mut ticket, sample()).unwrap();
        assert_eq!(c, Lsn(3));
        assert_eq!(log.records().unwrap().len(), 3);
        assert_eq!(log.records().unwrap()[2].lsn, Lsn(3));
        log.ungrant(ticket);
        assert_eq!(log.free_bytes(), 1 << 20);
    }

    #[test]
    fn oversized_record_is_an_overrun() {
        let log = MemLog::new(1 << 20);
        let mut ticket = log.reserve(TxnId(1), &res(64, 1, false), Duration::ZERO).unwrap();
        let err = log.write(&mut ticket, sample()).unwrap_err();
        assert!(matches!(err, AgfsError::ReservationOverrun { resource: "log", .. }));
        assert_eq!(log.last_lsn(), Lsn::ZERO);
    }

    #[test]
    fn injected_failure_surfaces_as_io() {
        let log = MemLog::new(1 << 20);
        log.set_fail_writes(true);
        let mut ticket = log.reserve(TxnId(1), &res(4096, 1, false), Duration::ZERO).unwrap();
        assert!(matches!(log.write(&mut ticket, sample()), Err(AgfsError::Io(_))));
    }

    proptest::proptest! {
        #[test]
        fn decode_never_panics_on_garbage(bytes in proptest::collection::vec(proptest::num::u8::ANY, 0..512)) {
            let _ = decode_record(&bytes);
        }

        #[test]
        fn truncated_record_never_decodes(cut in 0_usize..200) {
            let bytes = encode_record(&sample()).unwrap();
            let cut = cut.min(bytes.len() - 1);
            proptest::prop_assert!(!matches!(decode_record(&bytes[..cut]), DecodeResult::Record(..)));
        }
    }
}

//! Write-ahead journal of pending metadata operations.
//!
//! Every operation of a transaction is appended here before the transaction
//! is handed to the manager, so work that has not reached the coordination
//! store yet survives a crash. The journal is split into segment files
//! (`journal-NNNNNNNN.log`); each record is framed as
//!
//! ```text
//! len: u32 LE | state: u8 | crc32: u32 LE | bincode(JournalRecord)
//! ```
//!
//! Deleting a record rewrites its state byte in place. Segments whose
//! records are all deleted are reclaimed by [`MetaJournal::compact`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::JournalConfig;
use crate::error::{MetaError, MetaResult};
use crate::manager::TransactionManager;
use crate::transaction::Transaction;
use crate::types::{now_millis, OperationKind, TransactionId};

const SEGMENT_PREFIX: &str = "journal-";
const SEGMENT_SUFFIX: &str = ".log";
const FRAME_HEADER_LEN: u64 = 9;
const STATE_OFFSET: u64 = 4;
const STATE_LIVE: u8 = b'L';
const STATE_DELETED: u8 = b'D';
const MAX_RECORD_LEN: u32 = 64 * 1024 * 1024;

/// Handle of one journal record, used to delete it once committed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JournalLocation {
    /// Segment number.
    pub segment: u32,
    /// Byte offset of the frame within the segment.
    pub offset: u64,
}

/// One journaled operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRecord {
    /// Transaction the operation belongs to.
    pub transaction_id: TransactionId,
    /// Operation kind.
    pub kind: OperationKind,
    /// Target path, absent for COMMIT.
    pub path: Option<String>,
    /// Payload, absent for REMOVE and COMMIT.
    pub data: Option<Vec<u8>>,
    /// Milliseconds since the epoch when the record was written.
    pub timestamp: u64,
}

/// Summary of a journal recovery run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Committed transactions handed back to the manager.
    pub resubmitted: usize,
    /// Incomplete transactions whose records were dropped.
    pub discarded: usize,
}

struct Segment {
    file: File,
    len: u64,
    live: HashSet<u64>,
}

struct JournalInner {
    segments: BTreeMap<u32, Segment>,
    active: u32,
}

struct ScannedFrame {
    offset: u64,
    state: u8,
    payload: Vec<u8>,
}

struct SegmentScan {
    frames: Vec<ScannedFrame>,
    valid_len: u64,
    file_len: u64,
}

/// Durable, segmented write-ahead journal.
pub struct MetaJournal {
    config: JournalConfig,
    inner: Mutex<JournalInner>,
    cleaner: Mutex<Option<JoinHandle<()>>>,
}

fn segment_path(dir: &Path, segment: u32) -> PathBuf {
    dir.join(format!("{}{:08}{}", SEGMENT_PREFIX, segment, SEGMENT_SUFFIX))
}

fn parse_segment_name(name: &str) -> Option<u32> {
    name.strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

fn list_segments(dir: &Path) -> MetaResult<Vec<u32>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(id) = entry.file_name().to_str().and_then(parse_segment_name) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

fn create_segment(dir: &Path, segment: u32) -> MetaResult<Segment> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(segment_path(dir, segment))?;
    Ok(Segment {
        file,
        len: 0,
        live: HashSet::new(),
    })
}

/// Reads frames from the start of a segment until the end of the file or the
/// first frame that is short, malformed or fails its checksum.
fn scan_segment(file: &File) -> MetaResult<SegmentScan> {
    let file_len = file.metadata()?.len();
    let mut frames = Vec::new();
    let mut offset = 0u64;
    let mut header = [0u8; FRAME_HEADER_LEN as usize];

    while offset + FRAME_HEADER_LEN <= file_len {
        file.read_exact_at(&mut header, offset)?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let state = header[4];
        let crc = u32::from_le_bytes([header[5], header[6], header[7], header[8]]);
        if len == 0 || len > MAX_RECORD_LEN || (state != STATE_LIVE && state != STATE_DELETED) {
            break;
        }
        let end = offset + FRAME_HEADER_LEN + len as u64;
        if end > file_len {
            break;
        }
        let mut payload = vec![0u8; len as usize];
        file.read_exact_at(&mut payload, offset + FRAME_HEADER_LEN)?;
        if crc32fast::hash(&payload) != crc {
            break;
        }
        frames.push(ScannedFrame {
            offset,
            state,
            payload,
        });
        offset = end;
    }

    Ok(SegmentScan {
        frames,
        valid_len: offset,
        file_len,
    })
}

fn encode_frame(record: &JournalRecord) -> MetaResult<Vec<u8>> {
    let payload = bincode::serialize(record)?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN as usize + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.push(STATE_LIVE);
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

impl MetaJournal {
    /// Opens the journal in `config.dir`, creating it if necessary.
    ///
    /// A torn tail in the newest segment is truncated; a bad frame in an
    /// older, sealed segment is reported as corruption.
    pub fn open(config: JournalConfig) -> MetaResult<Self> {
        fs::create_dir_all(&config.dir)?;
        let ids = list_segments(&config.dir)?;
        let newest = ids.last().copied();

        let mut segments = BTreeMap::new();
        for id in ids {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(segment_path(&config.dir, id))?;
            let scan = scan_segment(&file)?;
            if scan.valid_len < scan.file_len {
                if Some(id) != newest {
                    return Err(MetaError::JournalCorrupted {
                        segment: id,
                        offset: scan.valid_len,
                        reason: "invalid frame inside sealed segment".to_string(),
                    });
                }
                warn!(
                    segment = id,
                    valid_len = scan.valid_len,
                    file_len = scan.file_len,
                    "truncating torn journal tail"
                );
                file.set_len(scan.valid_len)?;
                file.sync_all()?;
            }
            let live = scan
                .frames
                .iter()
                .filter(|f| f.state == STATE_LIVE)
                .map(|f| f.offset)
                .collect();
            segments.insert(
                id,
                Segment {
                    file,
                    len: scan.valid_len,
                    live,
                },
            );
        }

        let active = match newest {
            Some(id) => id,
            None => {
                segments.insert(1, create_segment(&config.dir, 1)?);
                1
            }
        };

        info!(
            dir = %config.dir.display(),
            segments = segments.len(),
            active,
            "journal opened"
        );

        Ok(Self {
            config,
            inner: Mutex::new(JournalInner { segments, active }),
            cleaner: Mutex::new(None),
        })
    }

    /// Directory holding the segment files.
    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// Durably appends one operation and returns its location.
    ///
    /// COMMIT records are synced to disk before this returns. Any failure is
    /// reported as [`MetaError::Durability`].
    pub fn append(
        &self,
        transaction_id: TransactionId,
        kind: OperationKind,
        path: Option<&str>,
        data: Option<&[u8]>,
    ) -> MetaResult<JournalLocation> {
        let record = JournalRecord {
            transaction_id,
            kind,
            path: path.map(str::to_string),
            data: data.map(<[u8]>::to_vec),
            timestamp: now_millis(),
        };
        self.append_record(&record).map_err(|e| {
            error!(txn = %transaction_id, kind = %kind, error = %e, "journal append failed");
            MetaError::Durability {
                txn_id: transaction_id.as_u64(),
                reason: e.to_string(),
            }
        })
    }

    fn append_record(&self, record: &JournalRecord) -> MetaResult<JournalLocation> {
        let frame = encode_frame(record)?;
        let mut inner = self.inner.lock();

        let active_len = inner
            .segments
            .get(&inner.active)
            .map(|s| s.len)
            .unwrap_or(0);
        if active_len > 0 && active_len + frame.len() as u64 > self.config.max_segment_bytes {
            self.roll(&mut inner)?;
        }

        let segment_id = inner.active;
        let segment = inner
            .segments
            .get_mut(&segment_id)
            .ok_or_else(|| MetaError::JournalCorrupted {
                segment: segment_id,
                offset: 0,
                reason: "active segment missing".to_string(),
            })?;
        let offset = segment.len;
        segment.file.write_all_at(&frame, offset)?;
        if record.kind == OperationKind::Commit {
            segment.file.sync_data()?;
        }
        segment.len += frame.len() as u64;
        segment.live.insert(offset);

        Ok(JournalLocation {
            segment: segment_id,
            offset,
        })
    }

    fn roll(&self, inner: &mut JournalInner) -> MetaResult<()> {
        if let Some(current) = inner.segments.get(&inner.active) {
            current.file.sync_data()?;
        }
        let next = inner.active + 1;
        inner
            .segments
            .insert(next, create_segment(&self.config.dir, next)?);
        inner.active = next;
        debug!(segment = next, "rolled journal segment");
        Ok(())
    }

    /// Marks a record reclaimable. Unknown or already-deleted locations are
    /// ignored.
    pub fn delete(&self, location: JournalLocation) -> MetaResult<()> {
        let mut inner = self.inner.lock();
        let Some(segment) = inner.segments.get_mut(&location.segment) else {
            return Ok(());
        };
        if !segment.live.remove(&location.offset) {
            return Ok(());
        }
        segment
            .file
            .write_all_at(&[STATE_DELETED], location.offset + STATE_OFFSET)?;
        Ok(())
    }

    /// Returns all live records in append order.
    pub fn redo(&self) -> MetaResult<Vec<(JournalLocation, JournalRecord)>> {
        let inner = self.inner.lock();
        let mut records = Vec::new();
        for (&id, segment) in &inner.segments {
            let scan = scan_segment(&segment.file)?;
            for frame in scan.frames {
                if frame.offset >= segment.len || !segment.live.contains(&frame.offset) {
                    continue;
                }
                let record: JournalRecord =
                    bincode::deserialize(&frame.payload).map_err(|e| {
                        MetaError::JournalCorrupted {
                            segment: id,
                            offset: frame.offset,
                            reason: e.to_string(),
                        }
                    })?;
                records.push((
                    JournalLocation {
                        segment: id,
                        offset: frame.offset,
                    },
                    record,
                ));
            }
        }
        Ok(records)
    }

    /// Reclaims segments without live records. Returns the number of segment
    /// files removed.
    pub fn compact(&self) -> MetaResult<usize> {
        let mut inner = self.inner.lock();
        let active = inner.active;
        let dead: Vec<u32> = inner
            .segments
            .iter()
            .filter(|(id, s)| **id != active && s.live.is_empty())
            .map(|(id, _)| *id)
            .collect();

        for id in &dead {
            inner.segments.remove(id);
            match fs::remove_file(segment_path(&self.config.dir, *id)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(segment) = inner.segments.get_mut(&active) {
            if segment.live.is_empty() && segment.len > 0 {
                segment.file.set_len(0)?;
                segment.file.sync_all()?;
                segment.len = 0;
            }
        }

        if !dead.is_empty() {
            debug!(removed = dead.len(), "compacted journal");
        }
        Ok(dead.len())
    }

    /// Number of records not yet deleted.
    pub fn live_records(&self) -> usize {
        self.inner.lock().segments.values().map(|s| s.live.len()).sum()
    }

    /// Number of segment files on disk.
    pub fn segment_count(&self) -> usize {
        self.inner.lock().segments.len()
    }

    /// Starts the periodic compaction task on the current tokio runtime.
    pub fn start_cleaner(self: &Arc<Self>) {
        let interval = self.config.cleanup_interval;
        if interval.is_zero() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(journal) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = journal.compact() {
                    warn!(error = %e, "journal compaction failed");
                }
            }
        });
        if let Some(previous) = self.cleaner.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Replays the journal into `manager`.
    ///
    /// Records are scanned in append order and each transaction is
    /// resubmitted as committed when its COMMIT record is reached, so
    /// committed transactions are staged in the order they were originally
    /// submitted. Their operations are marked replayed so the commit
    /// tolerates targets already in their post-commit state. Transactions
    /// still without a COMMIT at the end of the scan are incomplete; they
    /// are deleted and never resubmitted. The manager's id counter is
    /// advanced past every replayed id.
    pub fn recover(self: &Arc<Self>, manager: &Arc<TransactionManager>) -> MetaResult<RecoveryStats> {
        if manager.is_stopped() {
            return Err(MetaError::Stopped);
        }
        let records = self.redo()?;
        if let Some(max) = records.iter().map(|(_, r)| r.transaction_id).max() {
            manager.advance_transaction_id(max);
        }

        let mut stats = RecoveryStats::default();
        let mut open: HashMap<TransactionId, Vec<(JournalLocation, JournalRecord)>> =
            HashMap::new();
        for (location, record) in records {
            let id = record.transaction_id;
            let is_commit = record.kind == OperationKind::Commit;
            open.entry(id).or_default().push((location, record));
            if !is_commit {
                continue;
            }
            let Some(txn_records) = open.remove(&id) else {
                continue;
            };
            let txn = Transaction::replayed(id, txn_records, Arc::clone(self));
            info!(txn = %id, ops = txn.len(), "resubmitting committed transaction from journal");
            manager.add_transaction(txn)?;
            stats.resubmitted += 1;
        }

        let mut incomplete: Vec<_> = open.into_iter().collect();
        incomplete.sort_by_key(|(id, _)| *id);
        for (id, records) in incomplete {
            warn!(
                txn = %id,
                records = records.len(),
                "discarding incomplete transaction from journal"
            );
            for (location, _) in records {
                self.delete(location)?;
            }
            stats.discarded += 1;
        }

        info!(
            resubmitted = stats.resubmitted,
            discarded = stats.discarded,
            "journal recovery finished"
        );
        Ok(stats)
    }
}

impl Drop for MetaJournal {
    fn drop(&mut self) {
        if let Some(handle) = self.cleaner.lock().take() {
            handle.abort();
        }
    }
}

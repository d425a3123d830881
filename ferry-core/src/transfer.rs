//! Transfer registry: track in-flight transfers, chunk accounting, idle expiry.
//!
//! The registry is a bookkeeper. It never moves payload bytes; the hub
//! consults it before forwarding and notifies peers of its verdicts.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::protocol::expected_chunks;

/// Idle cap after which the periodic sweep removes a transfer.
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(5 * 60);

/// Default admission ceiling on a declared file size.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024; // 100 MiB

/// Lifecycle of one transfer as seen by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    /// Announced by the sender, awaiting the recipient's verdict.
    Proposed,
    /// Recipient consented; payload may flow.
    Accepted,
    /// At least one chunk observed.
    InFlight,
    Completed,
    Rejected,
    Aborted,
}

impl TransferPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferPhase::Completed | TransferPhase::Rejected | TransferPhase::Aborted
        )
    }
}

/// One registry entry. Sequence numbers are recorded as a set; the hub does
/// not buffer payload bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    pub id: String,
    pub file_name: String,
    pub size: u64,
    pub sender: String,
    pub target: String,
    pub phase: TransferPhase,
    pub expected_chunks: u64,
    pub bytes_accounted: u64,
    pub created_at: Instant,
    pub last_activity: Instant,
    seen: HashSet<u32>,
}

impl Transfer {
    pub fn seen_chunks(&self) -> u64 {
        self.seen.len() as u64
    }

    pub fn is_complete(&self) -> bool {
        self.seen.len() as u64 == self.expected_chunks
    }
}

/// Admission policy applied when a transfer is announced. The file-type
/// allow-list hook slots in here if a deployment wants one.
#[derive(Debug, Clone)]
pub struct TransferPolicy {
    pub max_file_size: u64,
}

impl Default for TransferPolicy {
    fn default() -> Self {
        TransferPolicy {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl TransferPolicy {
    fn admit(&self, file_name: &str, size: i64) -> Result<u64, OpenError> {
        if size < 0 {
            return Err(OpenError::Denied("negative file size"));
        }
        let size = size as u64;
        if size > self.max_file_size {
            return Err(OpenError::Denied("file exceeds size cap"));
        }
        if file_name.is_empty() || file_name.contains(['/', '\\']) {
            return Err(OpenError::Denied("file name must be a bare name"));
        }
        Ok(size)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OpenError {
    #[error("transfer id already in use")]
    Duplicate,
    #[error("{0}")]
    Denied(&'static str),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("unknown transfer id")]
    NotFound,
    #[error("transfer is not awaiting acceptance")]
    NotProposed,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("unknown transfer id")]
    UnknownTransfer,
    #[error("transfer has not been accepted")]
    NotAccepted,
    #[error("sequence {0} out of range")]
    SeqOutOfRange(i32),
    #[error("sequence {0} already recorded")]
    DuplicateSeq(i32),
}

/// Verdict on a recorded chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    Recorded,
    /// The seen-sequence set is now full.
    Complete,
}

/// Process-wide table of in-flight transfers, keyed by transfer id.
pub struct TransferRegistry {
    policy: TransferPolicy,
    inner: Mutex<HashMap<String, Transfer>>,
}

impl TransferRegistry {
    pub fn new(policy: TransferPolicy) -> Self {
        TransferRegistry {
            policy,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Admit a newly announced transfer as Proposed.
    pub fn open(
        &self,
        id: &str,
        file_name: &str,
        size: i64,
        sender: &str,
        target: &str,
    ) -> Result<(), OpenError> {
        let size = self.policy.admit(file_name, size)?;
        let mut inner = self.inner.lock().unwrap();
        if inner.contains_key(id) {
            return Err(OpenError::Duplicate);
        }
        let now = Instant::now();
        inner.insert(
            id.to_owned(),
            Transfer {
                id: id.to_owned(),
                file_name: file_name.to_owned(),
                size,
                sender: sender.to_owned(),
                target: target.to_owned(),
                phase: TransferPhase::Proposed,
                expected_chunks: expected_chunks(size),
                bytes_accounted: 0,
                created_at: now,
                last_activity: now,
                seen: HashSet::new(),
            },
        );
        Ok(())
    }

    /// Proposed → Accepted. Returns a snapshot so the hub can reach the
    /// original sender.
    pub fn accept(&self, id: &str) -> Result<Transfer, TransferError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.get_mut(id).ok_or(TransferError::NotFound)?;
        if entry.phase != TransferPhase::Proposed {
            return Err(TransferError::NotProposed);
        }
        entry.phase = TransferPhase::Accepted;
        entry.last_activity = Instant::now();
        Ok(entry.clone())
    }

    /// Proposed → Rejected; the entry is removed and returned so the hub can
    /// notify the sender.
    pub fn reject(&self, id: &str) -> Result<Transfer, TransferError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.get(id) {
            None => return Err(TransferError::NotFound),
            Some(t) if t.phase != TransferPhase::Proposed => {
                return Err(TransferError::NotProposed)
            }
            Some(_) => {}
        }
        let mut entry = inner.remove(id).unwrap();
        entry.phase = TransferPhase::Rejected;
        Ok(entry)
    }

    /// Record one chunk. Out-of-range and duplicate sequences are errors that
    /// leave the entry untouched; the registry never double-counts.
    pub fn observe_chunk(
        &self,
        id: &str,
        seq: i32,
        len: usize,
    ) -> Result<ChunkOutcome, ChunkError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.get_mut(id).ok_or(ChunkError::UnknownTransfer)?;
        match entry.phase {
            TransferPhase::Accepted | TransferPhase::InFlight => {}
            _ => return Err(ChunkError::NotAccepted),
        }
        if seq < 0 || seq as u64 >= entry.expected_chunks {
            return Err(ChunkError::SeqOutOfRange(seq));
        }
        if !entry.seen.insert(seq as u32) {
            return Err(ChunkError::DuplicateSeq(seq));
        }
        entry.phase = TransferPhase::InFlight;
        entry.bytes_accounted += len as u64;
        entry.last_activity = Instant::now();
        if entry.is_complete() {
            Ok(ChunkOutcome::Complete)
        } else {
            Ok(ChunkOutcome::Recorded)
        }
    }

    /// Terminal transition; the entry is removed. Returns it for logging and
    /// notification, or None when the id is unknown (already swept or closed).
    pub fn close(&self, id: &str, success: bool) -> Option<Transfer> {
        let mut entry = self.inner.lock().unwrap().remove(id)?;
        entry.phase = if success {
            TransferPhase::Completed
        } else {
            TransferPhase::Aborted
        };
        Some(entry)
    }

    /// Remove every entry idle for at least `max_idle`, returning them so the
    /// hub can notify both sides.
    pub fn sweep(&self, now: Instant, max_idle: Duration) -> Vec<Transfer> {
        let mut inner = self.inner.lock().unwrap();
        let expired: Vec<String> = inner
            .iter()
            .filter(|(_, t)| now.saturating_duration_since(t.last_activity) >= max_idle)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .iter()
            .map(|id| {
                let mut entry = inner.remove(id).unwrap();
                entry.phase = TransferPhase::Aborted;
                entry
            })
            .collect()
    }

    /// Remove every transfer the given peer participates in, as sender or
    /// target. Used by the hub when a peer is lost.
    pub fn abort_for_peer(&self, peer: &str) -> Vec<Transfer> {
        let mut inner = self.inner.lock().unwrap();
        let involved: Vec<String> = inner
            .iter()
            .filter(|(_, t)| t.sender == peer || t.target == peer)
            .map(|(id, _)| id.clone())
            .collect();
        involved
            .iter()
            .map(|id| {
                let mut entry = inner.remove(id).unwrap();
                entry.phase = TransferPhase::Aborted;
                entry
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TransferRegistry {
    fn default() -> Self {
        TransferRegistry::new(TransferPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CHUNK_SIZE;

    const ID: &str = "550e8400-e29b-41d4-a716-446655440000";

    fn open_default(reg: &TransferRegistry, size: i64) {
        reg.open(ID, "x.bin", size, "aaaa1111", "bbbb2222")
            .expect("open");
    }

    #[test]
    fn open_computes_expected_chunks() {
        let reg = TransferRegistry::default();
        open_default(&reg, 20000);
        let t = reg.accept(ID).unwrap();
        assert_eq!(t.expected_chunks, 3);
        assert_eq!(t.phase, TransferPhase::Accepted);
    }

    #[test]
    fn duplicate_id_rejected() {
        let reg = TransferRegistry::default();
        open_default(&reg, 100);
        assert_eq!(
            reg.open(ID, "y.bin", 100, "cccc3333", "dddd4444"),
            Err(OpenError::Duplicate)
        );
    }

    #[test]
    fn policy_denies_bad_announcements() {
        let reg = TransferRegistry::default();
        assert!(matches!(
            reg.open(ID, "x.bin", -1, "a", "b"),
            Err(OpenError::Denied(_))
        ));
        assert!(matches!(
            reg.open(ID, "x.bin", DEFAULT_MAX_FILE_SIZE as i64 + 1, "a", "b"),
            Err(OpenError::Denied(_))
        ));
        assert!(matches!(
            reg.open(ID, "../etc/passwd", 10, "a", "b"),
            Err(OpenError::Denied(_))
        ));
        assert!(matches!(
            reg.open(ID, "", 10, "a", "b"),
            Err(OpenError::Denied(_))
        ));
        assert!(reg.is_empty());
    }

    #[test]
    fn chunks_gated_on_acceptance() {
        let reg = TransferRegistry::default();
        open_default(&reg, 20000);
        assert_eq!(reg.observe_chunk(ID, 0, 8192), Err(ChunkError::NotAccepted));
        reg.accept(ID).unwrap();
        assert_eq!(reg.observe_chunk(ID, 0, 8192), Ok(ChunkOutcome::Recorded));
    }

    #[test]
    fn completion_requires_full_sequence_set() {
        let reg = TransferRegistry::default();
        open_default(&reg, 20000);
        reg.accept(ID).unwrap();
        assert_eq!(reg.observe_chunk(ID, 0, 8192), Ok(ChunkOutcome::Recorded));
        assert_eq!(reg.observe_chunk(ID, 2, 3616), Ok(ChunkOutcome::Recorded));
        assert_eq!(reg.observe_chunk(ID, 1, 8192), Ok(ChunkOutcome::Complete));
        let closed = reg.close(ID, true).unwrap();
        assert_eq!(closed.phase, TransferPhase::Completed);
        assert_eq!(closed.bytes_accounted, 20000);
        assert!(closed.is_complete());
    }

    #[test]
    fn out_of_range_and_duplicate_sequences_do_not_mutate() {
        let reg = TransferRegistry::default();
        open_default(&reg, 20000);
        reg.accept(ID).unwrap();
        reg.observe_chunk(ID, 0, 8192).unwrap();

        assert_eq!(
            reg.observe_chunk(ID, 3, 100),
            Err(ChunkError::SeqOutOfRange(3))
        );
        assert_eq!(
            reg.observe_chunk(ID, -1, 100),
            Err(ChunkError::SeqOutOfRange(-1))
        );
        assert_eq!(
            reg.observe_chunk(ID, 0, 8192),
            Err(ChunkError::DuplicateSeq(0))
        );

        // Bytes were counted exactly once.
        reg.observe_chunk(ID, 1, 8192).unwrap();
        reg.observe_chunk(ID, 2, 3616).unwrap();
        let t = reg.close(ID, true).unwrap();
        assert_eq!(t.bytes_accounted, 20000);
        assert_eq!(t.seen_chunks(), 3);
    }

    #[test]
    fn exact_multiple_of_chunk_size_has_no_empty_tail() {
        let reg = TransferRegistry::default();
        open_default(&reg, (CHUNK_SIZE * 2) as i64);
        reg.accept(ID).unwrap();
        assert_eq!(
            reg.observe_chunk(ID, 0, CHUNK_SIZE),
            Ok(ChunkOutcome::Recorded)
        );
        assert_eq!(
            reg.observe_chunk(ID, 1, CHUNK_SIZE),
            Ok(ChunkOutcome::Complete)
        );
        assert_eq!(
            reg.observe_chunk(ID, 2, 0),
            Err(ChunkError::SeqOutOfRange(2))
        );
    }

    #[test]
    fn empty_file_expects_zero_chunks() {
        let reg = TransferRegistry::default();
        open_default(&reg, 0);
        let t = reg.accept(ID).unwrap();
        assert_eq!(t.expected_chunks, 0);
        assert_eq!(
            reg.observe_chunk(ID, 0, 0),
            Err(ChunkError::SeqOutOfRange(0))
        );
        assert!(reg.close(ID, true).is_some());
    }

    #[test]
    fn reject_removes_entry() {
        let reg = TransferRegistry::default();
        open_default(&reg, 100);
        let t = reg.reject(ID).unwrap();
        assert_eq!(t.phase, TransferPhase::Rejected);
        assert_eq!(t.sender, "aaaa1111");
        assert_eq!(reg.reject(ID), Err(TransferError::NotFound));
        assert_eq!(
            reg.observe_chunk(ID, 0, 10),
            Err(ChunkError::UnknownTransfer)
        );
    }

    #[test]
    fn accept_twice_fails() {
        let reg = TransferRegistry::default();
        open_default(&reg, 100);
        reg.accept(ID).unwrap();
        assert_eq!(reg.accept(ID), Err(TransferError::NotProposed));
    }

    #[test]
    fn closed_id_is_gone() {
        let reg = TransferRegistry::default();
        open_default(&reg, 100);
        reg.accept(ID).unwrap();
        assert!(reg.close(ID, false).is_some());
        assert!(reg.close(ID, false).is_none());
        assert_eq!(reg.accept(ID), Err(TransferError::NotFound));
    }

    #[test]
    fn sweep_removes_only_idle_entries() {
        let reg = TransferRegistry::default();
        open_default(&reg, 100);
        reg.open("other", "y.bin", 100, "cccc3333", "dddd4444")
            .unwrap();

        // Nothing is stale yet.
        assert!(reg.sweep(Instant::now(), DEFAULT_MAX_IDLE).is_empty());
        assert_eq!(reg.len(), 2);

        // Viewed from far enough in the future, both entries are stale.
        let later = Instant::now() + DEFAULT_MAX_IDLE + Duration::from_secs(1);
        let removed = reg.sweep(later, DEFAULT_MAX_IDLE);
        assert_eq!(removed.len(), 2);
        assert!(removed.iter().all(|t| t.phase == TransferPhase::Aborted));
        assert!(reg.is_empty());
    }

    #[test]
    fn abort_for_peer_covers_both_roles() {
        let reg = TransferRegistry::default();
        reg.open("t1", "a.bin", 10, "peer1111", "peer2222").unwrap();
        reg.open("t2", "b.bin", 10, "peer3333", "peer1111").unwrap();
        reg.open("t3", "c.bin", 10, "peer3333", "peer4444").unwrap();

        let aborted = reg.abort_for_peer("peer1111");
        assert_eq!(aborted.len(), 2);
        assert!(aborted.iter().all(|t| t.phase == TransferPhase::Aborted));
        assert_eq!(reg.len(), 1);
    }
}

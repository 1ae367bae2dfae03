//! Commit Log
//!
//! Every kernel state mutation becomes a [`Commit`] whose id hashes its
//! contents together with the previous commit's id. Editing, reordering or
//! dropping a commit in the middle of the retained window breaks the chain,
//! which [`CommitLog::verify_integrity`] detects.
//!
//! Only the newest `retain` commits are kept. The window slides from the
//! front, so the oldest retained commit's `prev` anchors verification.

use alloc::collections::VecDeque;
use alloc::string::String;
use serde::{Deserialize, Serialize};

use crate::types::{CommitId, EnvRef, EventId, Fnv1a, NodeRef};

/// One journaled mutation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Commit {
    /// Position in the chain; genesis is 0
    pub seq: u64,
    /// Nanoseconds since boot
    pub at: u64,
    /// Syscall request that caused this change, if any
    pub cause: Option<EventId>,
    pub change: CommitType,
    /// Id of the commit before this one (zero for genesis)
    pub prev: CommitId,
    pub id: CommitId,
}

impl Commit {
    fn digest(seq: u64, at: u64, change: &CommitType, prev: &CommitId) -> CommitId {
        let mut h = Fnv1a::new();
        h.bytes(prev).u64(seq).u64(at);
        change.hash_into(&mut h);
        h.finish_wide()
    }

    fn seal(seq: u64, at: u64, cause: Option<EventId>, change: CommitType, prev: CommitId) -> Self {
        let id = Self::digest(seq, at, &change, &prev);
        Self {
            seq,
            at,
            cause,
            change,
            prev,
            id,
        }
    }

    /// Whether the id still matches the stored fields
    fn intact(&self) -> bool {
        Self::digest(self.seq, self.at, &self.change, &self.prev) == self.id
    }
}

/// Kinds of kernel state mutation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum CommitType {
    /// Genesis commit (kernel boot)
    Genesis,

    // === Environment lifecycle ===
    /// Environment allocated
    EnvCreated { env: EnvRef, parent: EnvRef },
    /// Environment destroyed and its slot returned to the free list
    EnvDestroyed { env: EnvRef },
    /// Environment status changed (raw status code)
    EnvStatusChanged { env: EnvRef, status: u8 },
    /// Environment destroyed because of an unhandled fault
    EnvFaulted {
        env: EnvRef,
        /// Trap vector that killed it
        vector: u32,
        /// Human-readable reason
        description: String,
    },

    // === Address space ===
    /// Page installed (or replaced) in an address space
    PageMapped {
        env: EnvRef,
        va: u64,
        frame: u32,
        perm: u32,
    },
    /// Page removed from an address space
    PageUnmapped { env: EnvRef, va: u64 },

    // === IPC / faults ===
    /// IPC rendezvous completed
    IpcDelivered {
        from: EnvRef,
        to: EnvRef,
        value: u64,
        /// Whether a page was transferred
        page: bool,
    },
    /// Page fault redirected to the environment's user-level handler
    FaultUpcall { env: EnvRef, fault_va: u64 },

    // === Migration ===
    /// Origin froze the environment and sent its record
    MigrationStarted { env: EnvRef, target: NodeRef },
    /// Target acknowledged; origin copy destroyed
    MigrationCompleted { env: EnvRef, target: NodeRef },
    /// Migration failed; origin copy resumed with `error`
    MigrationAborted {
        env: EnvRef,
        target: NodeRef,
        error: i64,
    },
    /// Environment reconstituted from a migration record
    EnvMigratedIn { env: EnvRef, origin: NodeRef },
}

impl CommitType {
    /// Stable discriminant used in the hash chain
    pub fn tag(&self) -> u8 {
        match self {
            CommitType::Genesis => 0,
            CommitType::EnvCreated { .. } => 1,
            CommitType::EnvDestroyed { .. } => 2,
            CommitType::EnvStatusChanged { .. } => 3,
            CommitType::EnvFaulted { .. } => 4,
            CommitType::PageMapped { .. } => 5,
            CommitType::PageUnmapped { .. } => 6,
            CommitType::IpcDelivered { .. } => 7,
            CommitType::FaultUpcall { .. } => 8,
            CommitType::MigrationStarted { .. } => 9,
            CommitType::MigrationCompleted { .. } => 10,
            CommitType::MigrationAborted { .. } => 11,
            CommitType::EnvMigratedIn { .. } => 12,
        }
    }

    /// Environment this mutation concerns (the receiver for IPC)
    pub fn env(&self) -> Option<EnvRef> {
        match self {
            CommitType::Genesis => None,
            CommitType::EnvCreated { env, .. }
            | CommitType::EnvDestroyed { env }
            | CommitType::EnvStatusChanged { env, .. }
            | CommitType::EnvFaulted { env, .. }
            | CommitType::PageMapped { env, .. }
            | CommitType::PageUnmapped { env, .. }
            | CommitType::FaultUpcall { env, .. }
            | CommitType::MigrationStarted { env, .. }
            | CommitType::MigrationCompleted { env, .. }
            | CommitType::MigrationAborted { env, .. }
            | CommitType::EnvMigratedIn { env, .. } => Some(*env),
            CommitType::IpcDelivered { to, .. } => Some(*to),
        }
    }

    fn hash_into(&self, h: &mut Fnv1a) {
        h.u8(self.tag());
        match self {
            CommitType::Genesis => {}
            CommitType::EnvCreated { env, parent } => {
                h.u64(*env).u64(*parent);
            }
            CommitType::EnvDestroyed { env } => {
                h.u64(*env);
            }
            CommitType::EnvStatusChanged { env, status } => {
                h.u64(*env).u8(*status);
            }
            CommitType::EnvFaulted {
                env,
                vector,
                description,
            } => {
                h.u64(*env).u32(*vector).bytes(description.as_bytes());
            }
            CommitType::PageMapped {
                env,
                va,
                frame,
                perm,
            } => {
                h.u64(*env).u64(*va).u32(*frame).u32(*perm);
            }
            CommitType::PageUnmapped { env, va } => {
                h.u64(*env).u64(*va);
            }
            CommitType::IpcDelivered {
                from,
                to,
                value,
                page,
            } => {
                h.u64(*from).u64(*to).u64(*value).u8(*page as u8);
            }
            CommitType::FaultUpcall { env, fault_va } => {
                h.u64(*env).u64(*fault_va);
            }
            CommitType::MigrationStarted { env, target }
            | CommitType::MigrationCompleted { env, target } => {
                h.u64(*env).u16(*target);
            }
            CommitType::MigrationAborted { env, target, error } => {
                h.u64(*env).u16(*target).i64(*error);
            }
            CommitType::EnvMigratedIn { env, origin } => {
                h.u64(*env).u16(*origin);
            }
        }
    }
}

/// Commits retained by default
pub const DEFAULT_RETAIN: usize = 100_000;

/// Hash-chained, append-only log of kernel state mutations.
pub struct CommitLog {
    window: VecDeque<Commit>,
    retain: usize,
    next_seq: u64,
    head: CommitId,
}

impl CommitLog {
    /// Start a chain with a genesis commit stamped `at`.
    pub fn new(at: u64) -> Self {
        Self::with_retention(at, DEFAULT_RETAIN)
    }

    /// Start a chain that keeps at most `retain` commits (at least one).
    pub fn with_retention(at: u64, retain: usize) -> Self {
        let genesis = Commit::seal(0, at, None, CommitType::Genesis, [0u8; 32]);
        let head = genesis.id;
        let mut window = VecDeque::new();
        window.push_back(genesis);
        Self {
            window,
            retain: retain.max(1),
            next_seq: 1,
            head,
        }
    }

    /// Chain a new commit after the current head and return its id.
    pub fn append(&mut self, change: CommitType, cause: Option<EventId>, at: u64) -> CommitId {
        let commit = Commit::seal(self.next_seq, at, cause, change, self.head);
        self.head = commit.id;
        self.next_seq += 1;
        self.window.push_back(commit);
        while self.window.len() > self.retain {
            self.window.pop_front();
        }
        self.head
    }

    /// Retained commits, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Commit> {
        self.window.iter()
    }

    /// Commit with sequence number `seq`, if still retained.
    pub fn get(&self, seq: u64) -> Option<&Commit> {
        let first = self.window.front()?.seq;
        let offset = usize::try_from(seq.checked_sub(first)?).ok()?;
        self.window.get(offset)
    }

    /// Retained commits with a sequence number of at least `seq`.
    pub fn since(&self, seq: u64) -> impl Iterator<Item = &Commit> {
        self.window.iter().filter(move |c| c.seq >= seq)
    }

    /// Commits touching one environment, oldest first.
    pub fn for_env(&self, env: EnvRef) -> impl Iterator<Item = &Commit> {
        self.window
            .iter()
            .filter(move |c| c.change.env() == Some(env))
    }

    pub fn head(&self) -> CommitId {
        self.head
    }

    /// Sequence number of the newest commit
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// Never true: the window always holds the newest commit.
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Check every retained commit's id and its link to its predecessor.
    pub fn verify_integrity(&self) -> bool {
        let Some(oldest) = self.window.front() else {
            return false;
        };
        let mut prev = oldest.prev;
        let mut seq = oldest.seq;
        for commit in &self.window {
            if commit.prev != prev || commit.seq != seq || !commit.intact() {
                return false;
            }
            prev = commit.id;
            seq += 1;
        }
        prev == self.head
    }
}

impl Default for CommitLog {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    // ========================================================================
    // Chain
    // ========================================================================

    #[test]
    fn test_genesis_only() {
        let log = CommitLog::new(7);
        assert_eq!(log.len(), 1);
        assert_eq!(log.last_seq(), 0);
        let genesis = log.get(0).unwrap();
        assert_eq!(genesis.change, CommitType::Genesis);
        assert_eq!(genesis.prev, [0u8; 32]);
        assert_eq!(log.head(), genesis.id);
        assert!(log.verify_integrity());
    }

    #[test]
    fn test_append_links_to_head() {
        let mut log = CommitLog::new(0);
        let before = log.head();
        let id = log.append(
            CommitType::PageMapped {
                env: 1,
                va: 0x1000,
                frame: 7,
                perm: 0x7,
            },
            Some(3),
            2000,
        );

        let commit = log.get(1).unwrap();
        assert_eq!(commit.prev, before);
        assert_eq!(commit.id, id);
        assert_eq!(commit.cause, Some(3));
        assert_eq!(log.head(), id);
    }

    #[test]
    fn test_tampering_is_detected() {
        let mut log = CommitLog::new(0);
        log.append(CommitType::EnvCreated { env: 1, parent: 0 }, None, 1);
        log.append(CommitType::EnvDestroyed { env: 1 }, None, 2);
        assert!(log.verify_integrity());

        log.window[1].change = CommitType::EnvCreated { env: 2, parent: 0 };
        assert!(!log.verify_integrity());
    }

    #[test]
    fn test_dropped_commit_is_detected() {
        let mut log = CommitLog::new(0);
        for env in 1..=3 {
            log.append(CommitType::EnvDestroyed { env }, None, env);
        }
        log.window.remove(2);
        assert!(!log.verify_integrity());
    }

    #[test]
    fn test_identical_histories_hash_identically() {
        let changes = vec![
            CommitType::EnvCreated { env: 1, parent: 0 },
            CommitType::MigrationStarted { env: 1, target: 2 },
            CommitType::MigrationAborted {
                env: 1,
                target: 2,
                error: -4,
            },
        ];
        let mut a = CommitLog::new(1000);
        let mut b = CommitLog::new(1000);
        for (i, change) in changes.into_iter().enumerate() {
            let at = (i as u64 + 1) * 1000;
            assert_eq!(a.append(change.clone(), None, at), b.append(change, None, at));
        }
        assert_eq!(a.head(), b.head());
    }

    #[test]
    fn test_distinct_variants_hash_differently() {
        let mut a = CommitLog::new(0);
        let mut b = CommitLog::new(0);
        let ia = a.append(CommitType::MigrationStarted { env: 1, target: 2 }, None, 5);
        let ib = b.append(CommitType::MigrationCompleted { env: 1, target: 2 }, None, 5);
        assert_ne!(ia, ib);
    }

    // ========================================================================
    // Retention and queries
    // ========================================================================

    #[test]
    fn test_retention_window_slides() {
        let mut log = CommitLog::with_retention(0, 3);
        for env in 1..=5 {
            log.append(CommitType::EnvDestroyed { env }, None, env);
        }
        assert_eq!(log.len(), 3);
        assert!(log.get(2).is_none());
        assert_eq!(log.get(3).unwrap().seq, 3);
        assert_eq!(log.last_seq(), 5);
        assert!(log.verify_integrity());
    }

    #[test]
    fn test_since_and_for_env() {
        let mut log = CommitLog::new(0);
        log.append(CommitType::EnvCreated { env: 1, parent: 0 }, None, 1);
        log.append(CommitType::EnvCreated { env: 2, parent: 1 }, None, 2);
        log.append(
            CommitType::IpcDelivered {
                from: 1,
                to: 2,
                value: 42,
                page: false,
            },
            None,
            3,
        );
        log.append(CommitType::EnvDestroyed { env: 1 }, None, 4);

        assert_eq!(log.since(3).count(), 2);
        // IPC is attributed to the receiver
        assert_eq!(log.for_env(1).count(), 2);
        assert_eq!(log.for_env(2).count(), 2);
    }
}

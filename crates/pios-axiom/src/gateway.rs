//! Axiom Gateway
//!
//! The runtime executes a syscall under the kernel state lock, drains the
//! commits the core produced, and only then hands everything to the
//! gateway. The gateway writes the request, the commits (tagged with the
//! request's event id) and the response, in that order.
//!
//! Mutations with no syscall behind them (boot, timer preemption, fault
//! kills, cluster traffic) go through [`AxiomGateway::record_commit`].

use alloc::vec::Vec;

use crate::commitlog::{Commit, CommitLog, CommitType};
use crate::syslog::SysLog;
use crate::types::{CommitId, EnvRef, EventId};

/// One completed syscall as seen at the trap boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyscallRecord {
    /// Calling environment
    pub sender: EnvRef,
    pub num: u32,
    pub args: [u64; 5],
    /// Value written to the result register (negative = error)
    pub result: i64,
}

pub struct AxiomGateway {
    syslog: SysLog,
    commitlog: CommitLog,
}

impl AxiomGateway {
    /// Open both logs; the commit chain starts with a genesis commit.
    pub fn new(timestamp: u64) -> Self {
        Self {
            syslog: SysLog::new(),
            commitlog: CommitLog::new(timestamp),
        }
    }

    /// Journal a syscall and the mutations it caused.
    ///
    /// Returns the request's event id, which every appended commit carries
    /// in `cause`.
    pub fn syscall(
        &mut self,
        call: SyscallRecord,
        commits: Vec<CommitType>,
        timestamp: u64,
    ) -> EventId {
        let request = self
            .syslog
            .log_request(call.sender, call.num, call.args, timestamp);
        for commit in commits {
            self.commitlog.append(commit, Some(request), timestamp);
        }
        self.syslog
            .log_response(call.sender, request, call.result, timestamp);
        request
    }

    /// Journal a mutation that no syscall caused.
    pub fn record_commit(&mut self, commit: CommitType, timestamp: u64) -> CommitId {
        self.commitlog.append(commit, None, timestamp)
    }

    /// Commits appended on behalf of one syscall request.
    pub fn caused_by(&self, request: EventId) -> impl Iterator<Item = &Commit> {
        self.commitlog
            .iter()
            .filter(move |c| c.cause == Some(request))
    }

    /// Number of syscalls an environment issued that are still retained.
    pub fn syscall_count(&self, env: EnvRef) -> usize {
        self.syslog.requests_from(env).count()
    }

    pub fn syslog(&self) -> &SysLog {
        &self.syslog
    }

    pub fn commitlog(&self) -> &CommitLog {
        &self.commitlog
    }

    pub fn verify_integrity(&self) -> bool {
        self.commitlog.verify_integrity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syslog::SysEventType;
    use alloc::string::String;

    fn call(sender: EnvRef, num: u32, result: i64) -> SyscallRecord {
        SyscallRecord {
            sender,
            num,
            args: [0; 5],
            result,
        }
    }

    #[test]
    fn test_syscall_without_mutation() {
        let mut gateway = AxiomGateway::new(0);
        gateway.syscall(call(0x401, 0x00, 0x401), Vec::new(), 10);

        // request and response, genesis only
        assert_eq!(gateway.syslog().len(), 2);
        assert_eq!(gateway.commitlog().len(), 1);
    }

    #[test]
    fn test_commits_carry_request_id() {
        let mut gateway = AxiomGateway::new(0);
        gateway.syscall(call(1, 0x02, 0), Vec::new(), 5);
        let request = gateway.syscall(
            call(0x401, 0x04, 0x802),
            alloc::vec![
                CommitType::EnvCreated {
                    env: 0x802,
                    parent: 0x401
                },
                CommitType::EnvStatusChanged {
                    env: 0x802,
                    status: 3
                },
            ],
            20,
        );

        assert_eq!(request, 2);
        assert_eq!(gateway.caused_by(request).count(), 2);
        assert_eq!(gateway.caused_by(0).count(), 0);
        assert_eq!(gateway.commitlog().len(), 3);
    }

    #[test]
    fn test_response_follows_commits() {
        let mut gateway = AxiomGateway::new(0);
        gateway.syscall(
            SyscallRecord {
                sender: 5,
                num: 0x0B,
                args: [0, 0x1000, 7, 0, 0],
                result: 0,
            },
            alloc::vec![CommitType::PageMapped {
                env: 5,
                va: 0x1000,
                frame: 3,
                perm: 7
            }],
            10,
        );

        let events: Vec<_> = gateway.syslog().iter().collect();
        assert!(matches!(
            events[0].event_type,
            SysEventType::Request {
                syscall_num: 0x0B,
                args: [0, 0x1000, 7, 0, 0],
            }
        ));
        assert_eq!(
            events[1].event_type,
            SysEventType::Response {
                request_id: 0,
                result: 0
            }
        );
        assert_eq!(gateway.syscall_count(5), 1);
    }

    #[test]
    fn test_record_commit_bypasses_syslog() {
        let mut gateway = AxiomGateway::new(0);
        let id = gateway.record_commit(
            CommitType::EnvFaulted {
                env: 1,
                vector: 14,
                description: String::from("page fault with no handler"),
            },
            1000,
        );

        assert_eq!(gateway.commitlog().head(), id);
        assert!(gateway.syslog().is_empty());
        assert!(gateway.commitlog().get(1).unwrap().cause.is_none());
        assert!(gateway.verify_integrity());
    }
}

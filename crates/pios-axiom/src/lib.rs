//! PIOS Axiom Layer
//!
//! The Axiom layer provides:
//! - **SysLog**: Audit trail of all syscalls (request + response)
//! - **CommitLog**: Hash-chained record of every kernel state mutation
//! - **AxiomGateway**: Entry point that ties both logs to syscall dispatch
//!
//! # Core Guarantee
//!
//! > Every state mutation the kernel performs appears exactly once, in order,
//! > in the CommitLog, and the chain of commit hashes is verifiable.

#![no_std]
extern crate alloc;

pub mod commitlog;
pub mod gateway;
pub mod syslog;
pub mod types;

// Re-export main types
pub use commitlog::{Commit, CommitLog, CommitType};
pub use gateway::{AxiomGateway, SyscallRecord};
pub use syslog::{SysEvent, SysEventType, SysLog};
pub use types::*;

//! PIOS Kernel Core - HAL-free kernel state machine
//!
//! This crate contains everything one node's kernel decides, with no platform
//! dependency: physical frames, address spaces, the environment table, the
//! scheduler, trap and syscall dispatch, IPC and migration records.
//!
//! # Design Principles
//!
//! 1. **No HAL dependency**: console, disk and network work is returned as a
//!    [`HostCall`] for `pios-kernel` to perform
//! 2. **Journaled mutations**: every state change is recorded as an Axiom
//!    `CommitType` and drained with [`KernelState::take_commits`]
//! 3. **Checked frames**: physical memory is an arena of [`FrameNumber`]s;
//!    only the address-space manager changes reference counts
//! 4. **Fatal invariants**: structural corruption halts via
//!    [`invariants::fatal`], user faults only destroy the environment
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    pios-kernel-core                         │
//! │                                                             │
//! │   Trap ──▶ trap::dispatch ──┬──▶ syscall ──▶ ipc / migrate  │
//! │                             ├──▶ page-fault upcall          │
//! │                             └──▶ sched::schedule            │
//! │                                                             │
//! │   ┌───────────────┐   ┌───────────────┐   ┌─────────────┐   │
//! │   │  KernelState  │──▶│   EnvTable    │──▶│ AddressSpace│   │
//! │   │  - cpus       │   │  - slots      │   │  - tables   │   │
//! │   │  - journal    │   │  - index      │   │  - tlb      │   │
//! │   └───────────────┘   └───────────────┘   └──────┬──────┘   │
//! │                                                  ▼          │
//! │                                       ┌──────────────────┐  │
//! │                                       │  PhysicalMemory  │  │
//! │                                       └──────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              │ used by
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        pios-kernel                          │
//! │   - HAL integration (console, disk, transport, time)        │
//! │   - Locking across CPUs                                     │
//! │   - CommitLog / SysLog recording                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! - `types` - Identifiers, layout constants, page flags, trap frames
//! - `error` - `KernelError` and result codes
//! - `pmem` - Reference-counted physical frame allocator
//! - `pmap` - Address spaces and checked user memory access
//! - `env` - Environment table and lifecycle
//! - `image` - Executable image format and loader
//! - `sched` - Round-robin scheduler
//! - `state` - `KernelState`, the per-node kernel
//! - `trap` - Trap classification, dispatch, fault upcalls
//! - `syscall` - Syscall ABI and services
//! - `ipc` - Rendezvous send/receive
//! - `migrate` - Migration records and the origin/target protocol steps
//! - `invariants` - Structural invariant checks

#![no_std]
extern crate alloc;

pub mod env;
pub mod error;
pub mod image;
pub mod invariants;
pub mod ipc;
pub mod migrate;
pub mod pmap;
pub mod pmem;
pub mod sched;
pub mod state;
pub mod syscall;
pub mod trap;
pub mod types;

pub use env::{Destroyed, Env, EnvTable, IpcState, PendingMigration, IDLE_SLOT};
pub use error::{to_code, KernelError, KernelResult};
pub use image::{build_image, load_image, ImageHeader, IMAGE_MAGIC};
pub use invariants::{check_all_invariants, InvariantViolation};
pub use migrate::{MigrationRecord, PageImage};
pub use pmap::{AddressSpace, Pte, UserFault};
pub use pmem::{FrameNumber, PhysicalMemory};
pub use sched::CpuState;
pub use state::KernelState;
pub use syscall::{nr, Syscall};
pub use trap::{
    classify, complete_disk_read, complete_host_call, dispatch, Dispatch, HostCall, Outcome,
    Resume, SyscallAudit, Trap, TrapKind, UTrapframe,
};
pub use types::{
    CpuId, EnvId, EnvStatus, NodeId, PteFlags, Registers, TrapFrame, PGSIZE, UINFO, USTACKTOP,
    UTOP, UXSTACKTOP,
};

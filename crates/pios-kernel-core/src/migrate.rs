//! Cross-node migration
//!
//! The protocol between two kernels, driven by the runtime:
//!
//! ```text
//!   origin                                   target
//!   ──────                                   ──────
//!   begin()      freeze env, build record
//!                ──── Migrate(record) ────▶  reconstitute()
//!                ◀─── MigrateAck(result) ──
//!   complete()   destroy origin copy     (Ok)
//!   reject()     resume origin copy      (Err)
//!   abort()      resume origin copy      (send failure)
//! ```
//!
//! Acks are only honored from the node the record was sent to.
//!
//! Between `begin` and the ack the origin copy is NotRunnable with a
//! [`PendingMigration`] marker, so the two copies are never runnable at the
//! same time.

use alloc::vec;
use alloc::vec::Vec;

use pios_axiom::CommitType;
use serde::{Deserialize, Serialize};

use crate::env::PendingMigration;
use crate::error::{KernelError, KernelResult};
use crate::pmap::{map_fresh, AddressSpace};
use crate::pmem::PhysicalMemory;
use crate::state::KernelState;
use crate::types::{
    page_aligned, CpuId, EnvId, EnvStatus, NodeId, PteFlags, TrapFrame, NODE_MAX, PGSIZE, UTOP,
};

/// Contents of one user page
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageImage {
    pub va: u64,
    /// Raw `PteFlags` bits
    pub perm: u32,
    pub data: Vec<u8>,
}

/// Everything needed to rebuild an environment on another node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub env: EnvId,
    pub parent: EnvId,
    /// Node the environment leaves
    pub origin: NodeId,
    /// Frame to resume with
    pub frame: TrapFrame,
    pub pgfault_upcall: Option<u64>,
    /// Every mapping below UTOP, ascending by address
    pub pages: Vec<PageImage>,
}

/// Freeze `id` and capture its state for `target`.
///
/// `syscall_cpu` is the CPU on which the environment itself asked to
/// migrate; it must be Running there, and on arrival it sees a result of 0.
/// Otherwise the environment must not be Running anywhere.
pub fn begin(
    state: &mut KernelState,
    mem: &PhysicalMemory,
    id: EnvId,
    target: NodeId,
    syscall_cpu: Option<CpuId>,
) -> KernelResult<MigrationRecord> {
    if target == state.node || target > NODE_MAX {
        return Err(KernelError::InvalidArgument);
    }
    if id == state.idle_id() {
        return Err(KernelError::PermissionDenied);
    }
    let origin = state.node;
    let env = state.envs.lookup_mut(id)?;
    if env.migration.is_some() {
        return Err(KernelError::MigrationInProgress);
    }
    if env.ipc.recving {
        return Err(KernelError::InvalidArgument);
    }
    match syscall_cpu {
        Some(cpu) if env.status == EnvStatus::Running && env.cpu == Some(cpu) => {}
        None if env.status != EnvStatus::Running => {}
        _ => return Err(KernelError::InvalidArgument),
    }

    let mut frame = env.tf;
    if syscall_cpu.is_some() {
        frame.set_result(0);
    }
    let pages = env
        .space()?
        .user_mappings()
        .map(|(va, pte)| {
            let mut data = vec![0u8; PGSIZE as usize];
            mem.read(pte.frame, 0, &mut data);
            PageImage {
                va,
                perm: pte.flags.bits(),
                data,
            }
        })
        .collect();
    let record = MigrationRecord {
        env: id,
        parent: env.parent,
        origin,
        frame,
        pgfault_upcall: env.pgfault_upcall,
        pages,
    };

    // A caller that was Running goes back to the run queue on abort
    let resume = match env.status {
        EnvStatus::Running => EnvStatus::Runnable,
        other => other,
    };
    env.status = EnvStatus::NotRunnable;
    env.cpu = None;
    env.migration = Some(PendingMigration {
        target,
        from_syscall: syscall_cpu.is_some(),
        resume,
    });
    state.commit(CommitType::EnvStatusChanged {
        env: id.0,
        status: EnvStatus::NotRunnable.code(),
    });
    state.commit(CommitType::MigrationStarted { env: id.0, target });
    Ok(record)
}

/// Rebuild a migrated environment as Runnable under its original id.
pub fn reconstitute(
    state: &mut KernelState,
    mem: &PhysicalMemory,
    record: &MigrationRecord,
) -> KernelResult<EnvId> {
    if record.origin == state.node || record.env.is_self() {
        return Err(KernelError::InvalidArgument);
    }
    let space = build_space(mem, state.info_frame(), &record.pages)?;
    state
        .envs
        .install(record.env, record.parent, space, record.frame)
        .map_err(|(e, space)| {
            space.destroy(mem);
            e
        })?;
    state.envs.lookup_mut(record.env)?.pgfault_upcall = record.pgfault_upcall;
    state.commit(CommitType::EnvMigratedIn {
        env: record.env.0,
        origin: record.origin,
    });
    Ok(record.env)
}

fn build_space(
    mem: &PhysicalMemory,
    shared: crate::pmem::FrameNumber,
    pages: &[PageImage],
) -> KernelResult<AddressSpace> {
    let mut space = AddressSpace::create(mem, shared)?;
    for page in pages {
        let flags = PteFlags::from_bits(page.perm).filter(|f| f.contains(PteFlags::PRESENT));
        let valid = page.va < UTOP && page_aligned(page.va) && page.data.len() == PGSIZE as usize;
        let mapped = match flags {
            Some(flags) if valid => map_fresh(&mut space, mem, page.va, flags),
            _ => Err(KernelError::InvalidArgument),
        };
        match mapped {
            Ok(frame) => mem.write(frame, 0, &page.data),
            Err(e) => {
                space.destroy(mem);
                return Err(e);
            }
        }
    }
    Ok(space)
}

/// The pending migration of `id`, if `from` is the node it was sent to.
fn pending_for(state: &KernelState, id: EnvId, from: NodeId) -> KernelResult<PendingMigration> {
    let pending = state
        .envs
        .lookup(id)?
        .migration
        .ok_or(KernelError::InvalidArgument)?;
    if pending.target != from {
        return Err(KernelError::InvalidArgument);
    }
    Ok(pending)
}

/// Node `from` accepted the record: destroy the frozen origin copy.
///
/// An ack from any node other than the migration's target is refused and
/// leaves the origin copy frozen.
pub fn complete(
    state: &mut KernelState,
    mem: &PhysicalMemory,
    id: EnvId,
    from: NodeId,
) -> KernelResult<()> {
    let target = pending_for(state, id, from)?.target;
    state.destroy_env(mem, id)?;
    state.commit(CommitType::MigrationCompleted { env: id.0, target });
    Ok(())
}

/// Node `from` refused the record: thaw the origin copy.
pub fn reject(state: &mut KernelState, id: EnvId, from: NodeId, error: KernelError) -> KernelResult<()> {
    pending_for(state, id, from)?;
    abort(state, id, error)
}

/// The migration failed locally (or was refused): thaw the origin copy
/// with the status it had before `begin`.
///
/// If the environment asked to migrate, its syscall returns `error`.
pub fn abort(state: &mut KernelState, id: EnvId, error: KernelError) -> KernelResult<()> {
    let env = state.envs.lookup_mut(id)?;
    let pending = env.migration.take().ok_or(KernelError::InvalidArgument)?;
    if pending.from_syscall {
        env.tf.set_result(error.code());
    }
    env.status = pending.resume;
    state.commit(CommitType::EnvStatusChanged {
        env: id.0,
        status: pending.resume.code(),
    });
    state.commit(CommitType::MigrationAborted {
        env: id.0,
        target: pending.target,
        error: error.code(),
    });
    Ok(())
}

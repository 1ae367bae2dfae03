//! System call decoding and execution
//!
//! ABI: the call number is in `rax`; up to five word arguments are taken
//! from `rdx`, `rcx`, `rbx`, `rdi`, `rsi` in that order. The result is
//! written back into `rax`: 0 or a non-negative value on success, a
//! negative [`KernelError::code`] on failure.
//!
//! Environment arguments use 0 for "the caller". Calls that act on another
//! environment require it to be a direct child of the caller.

use alloc::vec;

use crate::error::{KernelError, KernelResult};
use crate::ipc;
use crate::migrate;
use crate::pmem::PhysicalMemory;
use crate::state::KernelState;
use crate::trap::{Dispatch, HostCall, Outcome, SyscallAudit};
use crate::types::{
    page_aligned, CpuId, EnvId, EnvStatus, NodeId, PteFlags, PGSIZE, UTOP, UXSTACKTOP,
};

/// Syscall numbers
pub mod nr {
    pub const GETENVID: u32 = 0x00;
    pub const CPUTS: u32 = 0x01;
    pub const YIELD: u32 = 0x02;
    pub const ENV_DESTROY: u32 = 0x03;
    pub const EXOFORK: u32 = 0x04;
    pub const IPC_TRY_SEND: u32 = 0x05;
    pub const IPC_RECV: u32 = 0x06;
    pub const ENV_SET_PGFAULT_UPCALL: u32 = 0x07;
    pub const PAGE_PROTECT: u32 = 0x08;
    pub const ENV_SET_STATUS: u32 = 0x09;
    pub const PAGE_UNMAP: u32 = 0x0A;
    pub const PAGE_ALLOC: u32 = 0x0B;
    pub const PAGE_MAP: u32 = 0x0C;
    pub const DISK_READ: u32 = 0x0D;
    pub const MIGRATE: u32 = 0x0E;
}

/// Longest console write accepted in one call
pub const CPUTS_MAX: u64 = 4 * PGSIZE;

/// Disk transfer unit
pub const DISK_SECTOR_SIZE: u64 = 512;

/// Longest disk read accepted in one call
pub const DISK_READ_MAX: u64 = 8 * PGSIZE;

/// A decoded system call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Syscall {
    GetEnvId,
    Cputs { va: u64, len: u64 },
    Yield,
    EnvDestroy { env: EnvId },
    Exofork,
    /// `srcva` is None when the argument is at or above UTOP
    IpcTrySend {
        to: EnvId,
        value: u64,
        srcva: Option<u64>,
        perm: u64,
    },
    IpcRecv { dstva: Option<u64> },
    SetPgfaultUpcall { env: EnvId, upcall: u64 },
    PageProtect { env: EnvId, va: u64, perm: u64 },
    EnvSetStatus { env: EnvId, status: u64 },
    PageUnmap { env: EnvId, va: u64 },
    PageAlloc { env: EnvId, va: u64, perm: u64 },
    PageMap {
        src_env: EnvId,
        src_va: u64,
        dst_env: EnvId,
        dst_va: u64,
        perm: u64,
    },
    DiskRead { sector: u64, va: u64, len: u64 },
    Migrate { node: u64 },
}

fn below_utop(va: u64) -> Option<u64> {
    (va < UTOP).then_some(va)
}

impl Syscall {
    pub fn decode(num: u32, a: [u64; 5]) -> KernelResult<Self> {
        Ok(match num {
            nr::GETENVID => Syscall::GetEnvId,
            nr::CPUTS => Syscall::Cputs { va: a[0], len: a[1] },
            nr::YIELD => Syscall::Yield,
            nr::ENV_DESTROY => Syscall::EnvDestroy { env: EnvId(a[0]) },
            nr::EXOFORK => Syscall::Exofork,
            nr::IPC_TRY_SEND => Syscall::IpcTrySend {
                to: EnvId(a[0]),
                value: a[1],
                srcva: below_utop(a[2]),
                perm: a[3],
            },
            nr::IPC_RECV => Syscall::IpcRecv {
                dstva: below_utop(a[0]),
            },
            nr::ENV_SET_PGFAULT_UPCALL => Syscall::SetPgfaultUpcall {
                env: EnvId(a[0]),
                upcall: a[1],
            },
            nr::PAGE_PROTECT => Syscall::PageProtect {
                env: EnvId(a[0]),
                va: a[1],
                perm: a[2],
            },
            nr::ENV_SET_STATUS => Syscall::EnvSetStatus {
                env: EnvId(a[0]),
                status: a[1],
            },
            nr::PAGE_UNMAP => Syscall::PageUnmap {
                env: EnvId(a[0]),
                va: a[1],
            },
            nr::PAGE_ALLOC => Syscall::PageAlloc {
                env: EnvId(a[0]),
                va: a[1],
                perm: a[2],
            },
            nr::PAGE_MAP => Syscall::PageMap {
                src_env: EnvId(a[0]),
                src_va: a[1],
                dst_env: EnvId(a[2]),
                dst_va: a[3],
                perm: a[4],
            },
            nr::DISK_READ => Syscall::DiskRead {
                sector: a[0],
                va: a[1],
                len: a[2],
            },
            nr::MIGRATE => Syscall::Migrate { node: a[0] },
            _ => return Err(KernelError::NotSupported),
        })
    }
}

/// How a call leaves the caller
enum Step {
    /// Write the result and resume the caller
    Return(i64),
    /// Write the result (if any, and if the caller survives), then schedule
    Switch(Option<i64>),
    /// Platform work; the caller stays on the CPU until it completes
    Host(HostCall),
}

/// Handle a syscall trap from `caller`, whose frame is already saved.
pub(crate) fn handle(
    state: &mut KernelState,
    mem: &PhysicalMemory,
    cpu: CpuId,
    caller: EnvId,
) -> Dispatch {
    let regs = match state.envs.lookup(caller) {
        Ok(env) => env.tf.regs,
        Err(_) => {
            state.schedule(cpu);
            return Dispatch::resume();
        }
    };
    let num = u32::try_from(regs.rax).unwrap_or(u32::MAX);
    let args = [regs.rdx, regs.rcx, regs.rbx, regs.rdi, regs.rsi];

    let step = Syscall::decode(num, args)
        .and_then(|call| execute(state, mem, cpu, caller, call))
        .unwrap_or_else(|e| Step::Return(e.code()));

    let mut audit = SyscallAudit {
        sender: caller,
        num,
        args,
        result: None,
    };
    let outcome = match step {
        Step::Return(code) => {
            set_result(state, caller, code);
            audit.result = Some(code);
            Outcome::Resume
        }
        Step::Switch(code) => {
            if let Some(code) = code {
                set_result(state, caller, code);
            }
            audit.result = code;
            state.schedule(cpu);
            Outcome::Resume
        }
        Step::Host(call) => Outcome::HostCall(call),
    };
    Dispatch {
        outcome,
        syscall: Some(audit),
    }
}

fn set_result(state: &mut KernelState, id: EnvId, code: i64) {
    if let Ok(env) = state.envs.lookup_mut(id) {
        env.tf.set_result(code);
    }
}

fn user_page(va: u64) -> KernelResult<u64> {
    if va >= UTOP || !page_aligned(va) {
        return Err(KernelError::InvalidArgument);
    }
    Ok(va)
}

fn user_perm(perm: u64) -> KernelResult<PteFlags> {
    PteFlags::from_user(perm).ok_or(KernelError::InvalidArgument)
}

fn execute(
    state: &mut KernelState,
    mem: &PhysicalMemory,
    cpu: CpuId,
    caller: EnvId,
    call: Syscall,
) -> KernelResult<Step> {
    match call {
        Syscall::GetEnvId => Ok(Step::Return(caller.0 as i64)),

        Syscall::Cputs { va, len } => {
            if len > CPUTS_MAX {
                return Err(KernelError::InvalidArgument);
            }
            let mut bytes = vec![0u8; len as usize];
            state
                .envs
                .lookup_mut(caller)?
                .space_mut()?
                .copy_from_user(mem, va, &mut bytes)
                .map_err(|_| KernelError::BadAddress)?;
            Ok(Step::Host(HostCall::ConsoleWrite { env: caller, bytes }))
        }

        Syscall::Yield => Ok(Step::Switch(Some(0))),

        Syscall::EnvDestroy { env } => {
            let target = state.envs.resolve(caller, env, true)?;
            if state.envs.lookup(target)?.migration.is_some() {
                return Err(KernelError::MigrationInProgress);
            }
            state.destroy_env(mem, target)?;
            if target == caller {
                Ok(Step::Switch(Some(0)))
            } else {
                Ok(Step::Return(0))
            }
        }

        Syscall::Exofork => {
            let tf = state.envs.lookup(caller)?.tf;
            let child = state.alloc_env(mem, caller)?;
            let env = state.envs.lookup_mut(child)?;
            env.tf = tf;
            env.tf.set_result(0);
            state.set_status(child, EnvStatus::NotRunnable)?;
            Ok(Step::Return(child.0 as i64))
        }

        Syscall::IpcTrySend {
            to,
            value,
            srcva,
            perm,
        } => {
            ipc::try_send(state, mem, caller, to, value, srcva, perm)?;
            Ok(Step::Return(0))
        }

        Syscall::IpcRecv { dstva } => {
            ipc::recv(state, caller, dstva)?;
            Ok(Step::Switch(None))
        }

        Syscall::SetPgfaultUpcall { env, upcall } => {
            let target = state.envs.resolve(caller, env, true)?;
            if upcall >= UTOP {
                return Err(KernelError::InvalidArgument);
            }
            let xstack = UXSTACKTOP - PGSIZE;
            let mapped = state.envs.lookup(target)?.space()?.lookup(xstack).is_some();
            if !mapped {
                let flags = PteFlags::PRESENT | PteFlags::USER | PteFlags::WRITABLE;
                state.alloc_page(mem, target, xstack, flags)?;
            }
            state.envs.lookup_mut(target)?.pgfault_upcall = (upcall != 0).then_some(upcall);
            Ok(Step::Return(0))
        }

        Syscall::PageProtect { env, va, perm } => {
            let target = state.envs.resolve(caller, env, true)?;
            let va = user_page(va)?;
            let flags = user_perm(perm)?;
            let pte = state
                .envs
                .lookup(target)?
                .space()?
                .lookup(va)
                .ok_or(KernelError::BadAddress)?;
            // Write access can be dropped here, never granted
            if flags.contains(PteFlags::WRITABLE) && !pte.writable() {
                return Err(KernelError::PermissionDenied);
            }
            state.protect_page(target, va, flags)?;
            Ok(Step::Return(0))
        }

        Syscall::EnvSetStatus { env, status } => {
            let target = state.envs.resolve(caller, env, true)?;
            let status = EnvStatus::from_code(status).ok_or(KernelError::InvalidArgument)?;
            state.set_status(target, status)?;
            Ok(Step::Return(0))
        }

        Syscall::PageUnmap { env, va } => {
            let target = state.envs.resolve(caller, env, true)?;
            state.unmap_page(mem, target, user_page(va)?)?;
            Ok(Step::Return(0))
        }

        Syscall::PageAlloc { env, va, perm } => {
            let target = state.envs.resolve(caller, env, true)?;
            let va = user_page(va)?;
            let flags = user_perm(perm)?;
            state.alloc_page(mem, target, va, flags)?;
            Ok(Step::Return(0))
        }

        Syscall::PageMap {
            src_env,
            src_va,
            dst_env,
            dst_va,
            perm,
        } => {
            let src = state.envs.resolve(caller, src_env, true)?;
            let dst = state.envs.resolve(caller, dst_env, true)?;
            let src_va = user_page(src_va)?;
            let dst_va = user_page(dst_va)?;
            let flags = user_perm(perm)?;
            let pte = state
                .envs
                .lookup(src)?
                .space()?
                .lookup(src_va)
                .ok_or(KernelError::BadAddress)?;
            if flags.contains(PteFlags::WRITABLE) && !pte.writable() {
                return Err(KernelError::InvalidArgument);
            }
            state.map_page(mem, dst, dst_va, pte.frame, flags)?;
            Ok(Step::Return(0))
        }

        Syscall::DiskRead { sector, va, len } => {
            if len == 0 || len % DISK_SECTOR_SIZE != 0 || len > DISK_READ_MAX {
                return Err(KernelError::InvalidArgument);
            }
            state
                .envs
                .lookup_mut(caller)?
                .space_mut()?
                .user_mem_check(va, len as usize, true)
                .map_err(|_| KernelError::BadAddress)?;
            Ok(Step::Host(HostCall::DiskRead {
                env: caller,
                sector,
                va,
                len: len as usize,
            }))
        }

        Syscall::Migrate { node } => {
            let target = NodeId::try_from(node).map_err(|_| KernelError::InvalidArgument)?;
            let record = migrate::begin(state, mem, caller, target, Some(cpu))?;
            state.schedule(cpu);
            Ok(Step::Host(HostCall::Migrate {
                env: caller,
                target,
                record,
            }))
        }
    }
}

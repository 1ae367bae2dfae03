//! Trap dispatch
//!
//! Every kernel entry arrives here as a [`Trap`] for the environment that
//! is current on the trapping CPU. Dispatch is a state machine step:
//!
//! ```text
//!   Trap ──▶ save frame ──▶ classify ──┬─ syscall    ──▶ syscall::handle
//!                                      ├─ page fault ──▶ user upcall | destroy
//!                                      ├─ timer      ──▶ schedule
//!                                      ├─ device irq ──▶ Outcome::Device
//!                                      └─ other      ──▶ destroy
//! ```
//!
//! The result is an [`Outcome`]. Work that needs the platform (console,
//! disk, network) comes back as a [`HostCall`] for the runtime to perform
//! outside the state lock; everything else is finished here and the runtime
//! only has to [`KernelState::resume`] the CPU.
//!
//! A CPU is marked `in_kernel` from entry until resume. A second trap on a
//! CPU that is already inside the kernel is fatal.

use alloc::vec::Vec;

use pios_axiom::CommitType;

use crate::invariants::fatal;
use crate::migrate::MigrationRecord;
use crate::pmap::UserFault;
use crate::pmem::PhysicalMemory;
use crate::state::KernelState;
use crate::syscall;
use crate::types::{CpuId, EnvId, EnvStatus, NodeId, Registers, TrapFrame, PGSIZE, UXSTACKTOP};

// ============================================================================
// Vectors
// ============================================================================

pub const T_DIVIDE: u32 = 0;
pub const T_BRKPT: u32 = 3;
pub const T_GPFLT: u32 = 13;
pub const T_PGFLT: u32 = 14;
/// First hardware interrupt vector
pub const IRQ_OFFSET: u32 = 32;
/// Timer interrupt line
pub const IRQ_TIMER: u8 = 0;
pub const T_SYSCALL: u32 = 48;

/// Page-fault error code: protection violation (page was present)
pub const FEC_PR: u32 = 0x1;
/// Page-fault error code: caused by a write
pub const FEC_WR: u32 = 0x2;
/// Page-fault error code: occurred in user mode
pub const FEC_U: u32 = 0x4;

/// A kernel entry as delivered by the platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Trap {
    pub vector: u32,
    /// Faulting address (page faults only)
    pub fault_va: u64,
    pub err: u32,
    /// User registers at entry
    pub frame: TrapFrame,
    /// Raised while the CPU was executing kernel code
    pub from_kernel: bool,
}

impl Trap {
    fn new(vector: u32, frame: TrapFrame) -> Self {
        let mut frame = frame;
        frame.trapno = vector;
        Self {
            vector,
            fault_va: 0,
            err: 0,
            frame,
            from_kernel: false,
        }
    }

    pub fn syscall(frame: TrapFrame) -> Self {
        Self::new(T_SYSCALL, frame)
    }

    pub fn timer(frame: TrapFrame) -> Self {
        Self::irq(IRQ_TIMER, frame)
    }

    pub fn irq(line: u8, frame: TrapFrame) -> Self {
        Self::new(IRQ_OFFSET + line as u32, frame)
    }

    pub fn page_fault(frame: TrapFrame, fault_va: u64, err: u32) -> Self {
        let mut trap = Self::new(T_PGFLT, frame);
        trap.fault_va = fault_va;
        trap.err = err;
        trap.frame.err = err;
        trap
    }

    /// The page fault a refused user access raises
    pub fn from_user_fault(frame: TrapFrame, fault: &UserFault) -> Self {
        let mut err = FEC_U;
        if fault.write {
            err |= FEC_WR;
        }
        if fault.protection {
            err |= FEC_PR;
        }
        Self::page_fault(frame, fault.va, err)
    }

    pub fn exception(vector: u32, frame: TrapFrame) -> Self {
        Self::new(vector, frame)
    }

    pub fn in_kernel_mode(mut self) -> Self {
        self.from_kernel = true;
        self
    }
}

/// Trap classes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapKind {
    Syscall,
    PageFault,
    Timer,
    Device(u8),
    /// Any other exception
    Fault,
}

pub fn classify(vector: u32) -> TrapKind {
    match vector {
        T_SYSCALL => TrapKind::Syscall,
        T_PGFLT => TrapKind::PageFault,
        v if v == IRQ_OFFSET + IRQ_TIMER as u32 => TrapKind::Timer,
        v if (IRQ_OFFSET..IRQ_OFFSET + 16).contains(&v) => TrapKind::Device((v - IRQ_OFFSET) as u8),
        _ => TrapKind::Fault,
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Platform work requested by a syscall
#[derive(Clone, Debug, PartialEq)]
pub enum HostCall {
    /// Write bytes to the console, then complete with 0
    ConsoleWrite { env: EnvId, bytes: Vec<u8> },
    /// Read `len` bytes starting at `sector` into user memory at `va`
    DiskRead {
        env: EnvId,
        sector: u64,
        va: u64,
        len: usize,
    },
    /// Ship a migration record to `target`; the environment stays frozen
    /// until the target acknowledges
    Migrate {
        env: EnvId,
        target: NodeId,
        record: MigrationRecord,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// Finished; resume the CPU
    Resume,
    /// Perform a host call, complete it, then resume
    HostCall(HostCall),
    /// Acknowledge and service an interrupt line, then resume
    Device(u8),
}

/// Syscall audit data for the Axiom SysLog
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyscallAudit {
    pub sender: EnvId,
    pub num: u32,
    pub args: [u64; 5],
    /// None until a deferred host call completes
    pub result: Option<i64>,
}

/// Result of one dispatch
#[derive(Clone, Debug, PartialEq)]
pub struct Dispatch {
    pub outcome: Outcome,
    pub syscall: Option<SyscallAudit>,
}

impl Dispatch {
    pub(crate) fn resume() -> Self {
        Self {
            outcome: Outcome::Resume,
            syscall: None,
        }
    }

    fn device(irq: u8) -> Self {
        Self {
            outcome: Outcome::Device(irq),
            syscall: None,
        }
    }
}

/// What a CPU returns to user mode with
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resume {
    pub cpu: CpuId,
    pub env: EnvId,
    pub frame: TrapFrame,
}

// ============================================================================
// Dispatch
// ============================================================================

/// Handle one kernel entry on `cpu`.
pub fn dispatch(state: &mut KernelState, mem: &PhysicalMemory, cpu: CpuId, trap: Trap) -> Dispatch {
    let cpu_state = state.cpu_mut(cpu);
    if cpu_state.in_kernel {
        fatal(
            "trap_reentrancy",
            alloc::format!("vector {} on cpu {} while already in kernel", trap.vector, cpu),
        );
    }
    cpu_state.in_kernel = true;
    let current = cpu_state.current;

    let kind = classify(trap.vector);
    if trap.from_kernel && matches!(kind, TrapKind::PageFault | TrapKind::Fault) {
        fatal(
            "kernel_fault",
            alloc::format!(
                "vector {} (va {:#x}, err {:#x}) in kernel mode on cpu {}",
                trap.vector,
                trap.fault_va,
                trap.err,
                cpu
            ),
        );
    }

    let Some(current) = current else {
        state.schedule(cpu);
        return Dispatch::resume();
    };

    if current == state.idle_id() {
        return match kind {
            TrapKind::Device(irq) => Dispatch::device(irq),
            TrapKind::Timer | TrapKind::Syscall => {
                state.schedule(cpu);
                Dispatch::resume()
            }
            TrapKind::PageFault | TrapKind::Fault => fatal(
                "idle_fault",
                alloc::format!("idle environment took vector {} on cpu {}", trap.vector, cpu),
            ),
        };
    }

    match state.envs.lookup_mut(current) {
        Ok(env) if env.status == EnvStatus::Running && env.cpu == Some(cpu) => {
            env.tf = trap.frame;
        }
        _ => {
            // Destroyed by another CPU while it ran here
            state.schedule(cpu);
            return Dispatch::resume();
        }
    }

    match kind {
        TrapKind::Syscall => syscall::handle(state, mem, cpu, current),
        TrapKind::PageFault => {
            page_fault(state, mem, cpu, current, trap.fault_va, trap.err);
            Dispatch::resume()
        }
        TrapKind::Timer => {
            state.schedule(cpu);
            Dispatch::resume()
        }
        TrapKind::Device(irq) => Dispatch::device(irq),
        TrapKind::Fault => {
            kill(
                state,
                mem,
                cpu,
                current,
                trap.vector,
                alloc::format!("unhandled trap {}", trap.vector),
            );
            Dispatch::resume()
        }
    }
}

/// Destroy a faulting environment and move the CPU on.
pub(crate) fn kill(
    state: &mut KernelState,
    mem: &PhysicalMemory,
    cpu: CpuId,
    env: EnvId,
    vector: u32,
    description: alloc::string::String,
) {
    state.commit(CommitType::EnvFaulted {
        env: env.0,
        vector,
        description,
    });
    if let Err(e) = state.destroy_env(mem, env) {
        fatal(
            "kill_destroy",
            alloc::format!("faulting env {} on cpu {} could not be destroyed: {}", env, cpu, e),
        );
    }
    state.schedule(cpu);
}

// ============================================================================
// Host call completion
// ============================================================================

/// Finish a deferred syscall by writing its result.
///
/// The environment may have been destroyed by another CPU while the host
/// call ran; then there is nothing to do.
pub fn complete_host_call(state: &mut KernelState, env: EnvId, result: i64) {
    if let Ok(e) = state.envs.lookup_mut(env) {
        e.tf.set_result(result);
    }
}

/// Finish a disk read by copying `data` to the caller's buffer at `va`.
pub fn complete_disk_read(
    state: &mut KernelState,
    mem: &PhysicalMemory,
    env: EnvId,
    va: u64,
    data: &[u8],
) {
    let copied = state
        .envs
        .lookup_mut(env)
        .and_then(|e| e.space_mut())
        .and_then(|s| {
            s.copy_to_user(mem, va, data)
                .map_err(|_| crate::error::KernelError::BadAddress)
        });
    let result = match copied {
        Ok(()) => 0,
        Err(e) => e.code(),
    };
    complete_host_call(state, env, result);
}

// ============================================================================
// User-level page fault upcall
// ============================================================================

/// Words in a [`UTrapframe`]
pub const UTRAPFRAME_WORDS: usize = 12;

/// Bytes in a [`UTrapframe`]
pub const UTRAPFRAME_SIZE: u64 = (UTRAPFRAME_WORDS * 8) as u64;

/// Gap left below a nested frame on the exception stack
pub const SCRATCH_WORD: u64 = 8;

/// Frame pushed on the user exception stack for the fault handler.
///
/// Layout (little-endian words, lowest address first): fault_va, err,
/// rax, rbx, rcx, rdx, rsi, rdi, rbp, rip, rflags, rsp.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UTrapframe {
    pub fault_va: u64,
    pub err: u64,
    pub regs: Registers,
    pub rip: u64,
    pub rflags: u64,
    pub rsp: u64,
}

impl UTrapframe {
    pub fn to_bytes(&self) -> [u8; UTRAPFRAME_SIZE as usize] {
        let regs = self.regs.to_words();
        let words = [
            self.fault_va,
            self.err,
            regs[0],
            regs[1],
            regs[2],
            regs[3],
            regs[4],
            regs[5],
            regs[6],
            self.rip,
            self.rflags,
            self.rsp,
        ];
        let mut out = [0u8; UTRAPFRAME_SIZE as usize];
        for (chunk, word) in out.chunks_exact_mut(8).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8; UTRAPFRAME_SIZE as usize]) -> Self {
        let mut words = [0u64; UTRAPFRAME_WORDS];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut w = [0u8; 8];
            w.copy_from_slice(chunk);
            *word = u64::from_le_bytes(w);
        }
        Self {
            fault_va: words[0],
            err: words[1],
            regs: Registers::from_words([
                words[2], words[3], words[4], words[5], words[6], words[7], words[8],
            ]),
            rip: words[9],
            rflags: words[10],
            rsp: words[11],
        }
    }
}

fn page_fault(
    state: &mut KernelState,
    mem: &PhysicalMemory,
    cpu: CpuId,
    env: EnvId,
    fault_va: u64,
    err: u32,
) {
    match deliver_upcall(state, mem, env, fault_va, err) {
        Ok(()) => state.commit(CommitType::FaultUpcall {
            env: env.0,
            fault_va,
        }),
        Err(reason) => kill(
            state,
            mem,
            cpu,
            env,
            T_PGFLT,
            alloc::format!("{} (va {:#x}, err {:#x})", reason, fault_va, err),
        ),
    }
}

/// Push a UTrapframe on the exception stack and redirect to the handler.
fn deliver_upcall(
    state: &mut KernelState,
    mem: &PhysicalMemory,
    id: EnvId,
    fault_va: u64,
    err: u32,
) -> Result<(), &'static str> {
    let env = state
        .envs
        .lookup_mut(id)
        .map_err(|_| "environment vanished")?;
    let upcall = env.pgfault_upcall.ok_or("page fault with no handler")?;
    let tf = env.tf;

    let stack_bottom = UXSTACKTOP - PGSIZE;
    let nested = (stack_bottom..UXSTACKTOP).contains(&tf.rsp);
    let top = if nested {
        tf.rsp - SCRATCH_WORD
    } else {
        UXSTACKTOP
    };
    let frame_va = top
        .checked_sub(UTRAPFRAME_SIZE)
        .filter(|va| *va >= stack_bottom)
        .ok_or("exception stack overflow")?;

    let utf = UTrapframe {
        fault_va,
        err: err as u64,
        regs: tf.regs,
        rip: tf.rip,
        rflags: tf.rflags,
        rsp: tf.rsp,
    };
    env.space_mut()
        .map_err(|_| "no address space")?
        .copy_to_user(mem, frame_va, &utf.to_bytes())
        .map_err(|_| "exception stack not mapped")?;

    env.tf.rip = upcall;
    env.tf.rsp = frame_va;
    Ok(())
}

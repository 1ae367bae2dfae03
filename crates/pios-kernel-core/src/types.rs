//! Core kernel types
//!
//! Identifiers, the user address-space layout, page permission bits and the
//! saved register snapshot. Everything here is plain data.

use core::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Identifier of a kernel instance in the cluster
pub type NodeId = u16;

/// Index of a CPU on this node
pub type CpuId = usize;

// ============================================================================
// Address-space layout
// ============================================================================

/// Bytes per page
pub const PGSIZE: u64 = 4096;

/// log2(PGSIZE)
pub const PGSHIFT: u32 = 12;

/// Entries per page directory / page table
pub const NPTENTRIES: usize = 1024;

/// Shift of the page-directory index in a virtual address
pub const PDXSHIFT: u32 = 22;

/// Size of the virtual address space (two-level, 10/10/12 split)
pub const VA_LIMIT: u64 = 1 << 32;

/// Top of user-controllable memory; user syscalls may only map below this
pub const UTOP: u64 = 0xEEC0_0000;

/// Read-only kernel info page, mapped in every address space
pub const UINFO: u64 = UTOP;

/// Top of the one-page user exception stack
pub const UXSTACKTOP: u64 = UTOP;

/// Top of the normal user stack (one guard page below the exception stack)
pub const USTACKTOP: u64 = UTOP - 2 * PGSIZE;

/// Interrupt-enable bit in `rflags`
pub const FL_IF: u64 = 0x200;

/// Page-directory index of `va`
pub const fn pdx(va: u64) -> usize {
    ((va >> PDXSHIFT) & 0x3FF) as usize
}

/// Page-table index of `va`
pub const fn ptx(va: u64) -> usize {
    ((va >> PGSHIFT) & 0x3FF) as usize
}

pub const fn round_down(va: u64) -> u64 {
    va & !(PGSIZE - 1)
}

pub const fn round_up(va: u64) -> u64 {
    round_down(va + PGSIZE - 1)
}

pub const fn page_aligned(va: u64) -> bool {
    va & (PGSIZE - 1) == 0
}

// ============================================================================
// Page permissions
// ============================================================================

bitflags! {
    /// Leaf page-table entry permission bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PteFlags: u32 {
        const PRESENT = 0x001;
        const WRITABLE = 0x002;
        const USER = 0x004;
        /// Bits left to user-level software (copy-on-write markers etc.)
        const AVAIL = 0xE00;
        /// Every bit a user syscall may request
        const SYSCALL = Self::PRESENT.bits()
            | Self::WRITABLE.bits()
            | Self::USER.bits()
            | Self::AVAIL.bits();
    }
}

impl PteFlags {
    /// Validate a permission word supplied by user code.
    ///
    /// It must carry PRESENT and USER and nothing outside SYSCALL.
    pub fn from_user(perm: u64) -> Option<Self> {
        let bits = u32::try_from(perm).ok()?;
        let flags = PteFlags::from_bits(bits)?;
        let required = PteFlags::PRESENT | PteFlags::USER;
        if !flags.contains(required) || !PteFlags::SYSCALL.contains(flags) {
            return None;
        }
        Some(flags)
    }
}

// ============================================================================
// Environment identifiers
// ============================================================================

/// Bits of an `EnvId` holding the table slot
pub const ENV_SLOT_BITS: u32 = 10;

/// Bits of an `EnvId` holding the originating node
pub const ENV_NODE_BITS: u32 = 10;

/// Largest possible environment table
pub const NENV_MAX: usize = 1 << ENV_SLOT_BITS;

/// Largest node id representable in an `EnvId`
pub const NODE_MAX: NodeId = (1 << ENV_NODE_BITS) - 1;

/// Environment identifier.
///
/// Layout: `generation << 20 | node << 10 | slot`. The generation is bumped
/// every time a slot is reused, so a stale identifier never matches a newer
/// occupant; the node part keeps identifiers unique across the cluster after
/// migration. Identifier 0 is never issued (syscalls use it for "self").
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EnvId(pub u64);

impl EnvId {
    pub const SELF: EnvId = EnvId(0);

    pub const fn new(generation: u64, node: NodeId, slot: usize) -> Self {
        EnvId(
            (generation << (ENV_SLOT_BITS + ENV_NODE_BITS))
                | ((node as u64 & NODE_MAX as u64) << ENV_SLOT_BITS)
                | (slot as u64 & (NENV_MAX as u64 - 1)),
        )
    }

    /// Table slot on the node that issued this identifier
    pub const fn slot(self) -> usize {
        (self.0 & (NENV_MAX as u64 - 1)) as usize
    }

    /// Node that issued this identifier
    pub const fn node(self) -> NodeId {
        ((self.0 >> ENV_SLOT_BITS) & NODE_MAX as u64) as NodeId
    }

    pub const fn generation(self) -> u64 {
        self.0 >> (ENV_SLOT_BITS + ENV_NODE_BITS)
    }

    pub const fn is_self(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnvId({:#010x})", self.0)
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Environment status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum EnvStatus {
    /// Slot unused
    Free = 0,
    /// Ready to be dispatched
    Runnable = 1,
    /// Currently dispatched on exactly one CPU
    Running = 2,
    /// Blocked (IPC receive, migration handshake, or parent-held)
    NotRunnable = 3,
}

impl EnvStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(EnvStatus::Free),
            1 => Some(EnvStatus::Runnable),
            2 => Some(EnvStatus::Running),
            3 => Some(EnvStatus::NotRunnable),
            _ => None,
        }
    }
}

// ============================================================================
// Trap frame
// ============================================================================

/// General-purpose registers saved on kernel entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
}

impl Registers {
    pub fn to_words(&self) -> [u64; 7] {
        [
            self.rax, self.rbx, self.rcx, self.rdx, self.rsi, self.rdi, self.rbp,
        ]
    }

    pub fn from_words(w: [u64; 7]) -> Self {
        Self {
            rax: w[0],
            rbx: w[1],
            rcx: w[2],
            rdx: w[3],
            rsi: w[4],
            rdi: w[5],
            rbp: w[6],
        }
    }
}

/// Snapshot of user-visible CPU state at kernel entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrapFrame {
    pub regs: Registers,
    /// Vector that caused the entry
    pub trapno: u32,
    /// Hardware error code (page faults)
    pub err: u32,
    /// Instruction pointer to resume at
    pub rip: u64,
    pub rflags: u64,
    /// User stack pointer
    pub rsp: u64,
}

impl TrapFrame {
    /// Initial frame for a fresh environment
    pub fn user(entry: u64, stack: u64) -> Self {
        Self {
            rip: entry,
            rsp: stack,
            rflags: FL_IF,
            ..Self::default()
        }
    }

    /// Write a syscall result into the result register
    pub fn set_result(&mut self, value: i64) {
        self.regs.rax = value as u64;
    }

    pub fn result(&self) -> i64 {
        self.regs.rax as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_constants() {
        assert!(page_aligned(UTOP));
        assert!(page_aligned(USTACKTOP));
        assert!(USTACKTOP < UXSTACKTOP - PGSIZE);
        assert!(UINFO < VA_LIMIT);
        assert_eq!(pdx(0x0040_1000), 1);
        assert_eq!(ptx(0x0040_1000), 1);
        assert_eq!(round_up(1), PGSIZE);
        assert_eq!(round_down(PGSIZE + 5), PGSIZE);
    }

    #[test]
    fn test_env_id_encoding() {
        let id = EnvId::new(7, 3, 42);
        assert_eq!(id.slot(), 42);
        assert_eq!(id.node(), 3);
        assert_eq!(id.generation(), 7);
        assert!(!id.is_self());
        assert!(EnvId::SELF.is_self());
    }

    #[test]
    fn test_env_id_generations_distinct() {
        assert_ne!(EnvId::new(1, 0, 5), EnvId::new(2, 0, 5));
        assert_ne!(EnvId::new(1, 0, 5), EnvId::new(1, 1, 5));
    }

    #[test]
    fn test_pte_flags_from_user() {
        assert_eq!(
            PteFlags::from_user(0x7),
            Some(PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER)
        );
        assert!(PteFlags::from_user(0x5).is_some());
        // Missing USER
        assert!(PteFlags::from_user(0x3).is_none());
        // Unknown bit
        assert!(PteFlags::from_user(0x1005).is_none());
        assert!(PteFlags::from_user(u64::MAX).is_none());
        // AVAIL bits allowed
        assert!(PteFlags::from_user(0x805).is_some());
    }

    #[test]
    fn test_status_codes() {
        for status in [
            EnvStatus::Free,
            EnvStatus::Runnable,
            EnvStatus::Running,
            EnvStatus::NotRunnable,
        ] {
            assert_eq!(EnvStatus::from_code(status.code() as u64), Some(status));
        }
        assert_eq!(EnvStatus::from_code(9), None);
    }

    #[test]
    fn test_trap_frame_result() {
        let mut tf = TrapFrame::user(0x1000, USTACKTOP);
        assert_eq!(tf.rflags & FL_IF, FL_IF);
        tf.set_result(-7);
        assert_eq!(tf.result(), -7);
        assert_eq!(tf.regs.rax, (-7i64) as u64);
    }
}

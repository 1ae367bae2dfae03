//! Synchronous IPC
//!
//! Rendezvous only: a send succeeds when the target is blocked in `recv`,
//! otherwise it fails with `NotReceiving` and nothing is queued. A page
//! offered by the sender is shared (mapped into the receiver), not moved.
//!
//! On delivery the receiver's registers carry the message:
//!
//! | register | value |
//! |----------|-------|
//! | rax      | 0 (recv result) |
//! | rdx      | value |
//! | rcx      | sender id |
//! | rbx      | permissions of the transferred page, 0 if none |

use pios_axiom::CommitType;

use crate::error::{KernelError, KernelResult};
use crate::pmem::PhysicalMemory;
use crate::state::KernelState;
use crate::types::{page_aligned, EnvId, EnvStatus, PteFlags};

/// Deliver `value` (and optionally the page at `srcva`) to `to`.
pub fn try_send(
    state: &mut KernelState,
    mem: &PhysicalMemory,
    from: EnvId,
    to: EnvId,
    value: u64,
    srcva: Option<u64>,
    perm: u64,
) -> KernelResult<()> {
    let to = if to.is_self() { from } else { to };
    let dstva = match state.envs.lookup(to) {
        Ok(env)
            if env.ipc.recving
                && env.status == EnvStatus::NotRunnable
                && env.migration.is_none() =>
        {
            env.ipc.dstva
        }
        _ => return Err(KernelError::NotReceiving),
    };

    let mut transferred = None;
    if let Some(srcva) = srcva {
        if !page_aligned(srcva) {
            return Err(KernelError::InvalidArgument);
        }
        let flags = PteFlags::from_user(perm).ok_or(KernelError::InvalidArgument)?;
        let pte = state
            .envs
            .lookup(from)?
            .space()?
            .lookup(srcva)
            .filter(|pte| pte.user())
            .ok_or(KernelError::BadAddress)?;
        if flags.contains(PteFlags::WRITABLE) && !pte.writable() {
            return Err(KernelError::InvalidArgument);
        }
        if let Some(dstva) = dstva {
            state.map_page(mem, to, dstva, pte.frame, flags)?;
            transferred = Some(flags);
        }
    }

    let perm = transferred.map(|f| f.bits()).unwrap_or(0);
    let env = state.envs.lookup_mut(to)?;
    env.ipc.recving = false;
    env.ipc.from = Some(from);
    env.ipc.value = value;
    env.ipc.perm = perm;
    env.status = EnvStatus::Runnable;
    env.tf.regs.rax = 0;
    env.tf.regs.rdx = value;
    env.tf.regs.rcx = from.0;
    env.tf.regs.rbx = perm as u64;

    state.commit(CommitType::IpcDelivered {
        from: from.0,
        to: to.0,
        value,
        page: transferred.is_some(),
    });
    state.commit(CommitType::EnvStatusChanged {
        env: to.0,
        status: EnvStatus::Runnable.code(),
    });
    Ok(())
}

/// Block `caller` until a message arrives, accepting a page at `dstva`.
///
/// The caller must be the environment running on the trapping CPU; the
/// dispatcher reschedules afterwards.
pub fn recv(state: &mut KernelState, caller: EnvId, dstva: Option<u64>) -> KernelResult<()> {
    if let Some(va) = dstva {
        if !page_aligned(va) {
            return Err(KernelError::InvalidArgument);
        }
    }
    let env = state.envs.lookup_mut(caller)?;
    env.ipc.recving = true;
    env.ipc.dstva = dstva;
    env.ipc.perm = 0;
    state.block_current(caller, EnvStatus::NotRunnable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::build_image;
    use crate::invariants::check_all_invariants;

    const URW: PteFlags = PteFlags::PRESENT
        .union(PteFlags::USER)
        .union(PteFlags::WRITABLE);

    fn boot() -> (PhysicalMemory, KernelState, EnvId, EnvId) {
        let mem = PhysicalMemory::new(256);
        let mut state = KernelState::new(&mem, 0, 1, 8).unwrap();
        let image = build_image(0x0080_0000, 0x0080_0000, &[0x90; 32], b"", 0);
        let a = state.create_env(&mem, &image, None).unwrap();
        let b = state.create_env(&mem, &image, Some(a)).unwrap();
        (mem, state, a, b)
    }

    #[test]
    fn test_send_without_receiver_fails() {
        let (mem, mut state, a, b) = boot();
        assert_eq!(
            try_send(&mut state, &mem, a, b, 42, None, 0),
            Err(KernelError::NotReceiving)
        );
        // Unknown targets look the same to the sender
        assert_eq!(
            try_send(&mut state, &mem, a, EnvId(0xFFFF_FFFF), 1, None, 0),
            Err(KernelError::NotReceiving)
        );
    }

    #[test]
    fn test_send_delivers_value_and_sender() {
        let (mem, mut state, a, b) = boot();
        recv(&mut state, b, None).unwrap();
        assert_eq!(state.envs.lookup(b).unwrap().status, EnvStatus::NotRunnable);

        try_send(&mut state, &mem, a, b, 42, None, 0).unwrap();
        let env = state.envs.lookup(b).unwrap();
        assert_eq!(env.status, EnvStatus::Runnable);
        assert_eq!(env.ipc.value, 42);
        assert_eq!(env.ipc.from, Some(a));
        assert!(!env.ipc.recving);
        assert_eq!(env.tf.regs.rdx, 42);
        assert_eq!(env.tf.regs.rcx, a.0);
        assert_eq!(env.tf.regs.rax, 0);

        // One delivery per recv
        assert_eq!(
            try_send(&mut state, &mem, a, b, 43, None, 0),
            Err(KernelError::NotReceiving)
        );
    }

    #[test]
    fn test_page_transfer_shares_frame() {
        let (mem, mut state, a, b) = boot();
        let frame = state.alloc_page(&mem, a, 0x1000_0000, URW).unwrap();
        mem.write(frame, 0, b"shared");
        recv(&mut state, b, Some(0x2000_0000)).unwrap();

        let ro = (PteFlags::PRESENT | PteFlags::USER).bits() as u64;
        try_send(&mut state, &mem, a, b, 7, Some(0x1000_0000), ro).unwrap();

        assert_eq!(mem.refcount(frame), 2);
        let env = state.envs.lookup_mut(b).unwrap();
        assert_eq!(env.ipc.perm, ro as u32);
        let space = env.space_mut().unwrap();
        let mut buf = [0u8; 6];
        space.copy_from_user(&mem, 0x2000_0000, &mut buf).unwrap();
        assert_eq!(&buf, b"shared");
        // Read-only for the receiver
        assert!(space.copy_to_user(&mem, 0x2000_0000, b"x").is_err());
        // Sender keeps its writable mapping
        let sender = state.envs.lookup_mut(a).unwrap().space_mut().unwrap();
        assert!(sender.copy_to_user(&mem, 0x1000_0000, b"x").is_ok());
        assert!(check_all_invariants(&state, &mem).is_empty());
    }

    #[test]
    fn test_page_not_wanted_is_not_mapped() {
        let (mem, mut state, a, b) = boot();
        let frame = state.alloc_page(&mem, a, 0x1000_0000, URW).unwrap();
        recv(&mut state, b, None).unwrap();
        try_send(&mut state, &mem, a, b, 1, Some(0x1000_0000), URW.bits() as u64).unwrap();
        assert_eq!(mem.refcount(frame), 1);
        assert_eq!(state.envs.lookup(b).unwrap().ipc.perm, 0);
    }

    #[test]
    fn test_cannot_grant_write_on_read_only_page() {
        let (mem, mut state, a, b) = boot();
        state
            .alloc_page(&mem, a, 0x1000_0000, PteFlags::PRESENT | PteFlags::USER)
            .unwrap();
        recv(&mut state, b, Some(0x2000_0000)).unwrap();
        assert_eq!(
            try_send(&mut state, &mem, a, b, 1, Some(0x1000_0000), URW.bits() as u64),
            Err(KernelError::InvalidArgument)
        );
        // Receiver still waiting
        assert!(state.envs.lookup(b).unwrap().ipc.recving);
    }

    #[test]
    fn test_unmapped_source_page() {
        let (mem, mut state, a, b) = boot();
        recv(&mut state, b, Some(0x2000_0000)).unwrap();
        assert_eq!(
            try_send(&mut state, &mem, a, b, 1, Some(0x3000_0000), URW.bits() as u64),
            Err(KernelError::BadAddress)
        );
        assert_eq!(
            try_send(&mut state, &mem, a, b, 1, Some(0x3000_0010), URW.bits() as u64),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn test_recv_rejects_unaligned_dstva() {
        let (_mem, mut state, _a, b) = boot();
        assert_eq!(
            recv(&mut state, b, Some(0x2000_0004)),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(state.envs.lookup(b).unwrap().status, EnvStatus::Runnable);
    }

    #[test]
    fn test_receiver_woken_by_status_change_is_not_receiving() {
        let (mem, mut state, a, b) = boot();
        recv(&mut state, b, Some(0x2000_0000)).unwrap();
        state.set_status(b, EnvStatus::Runnable).unwrap();
        let env = state.envs.lookup(b).unwrap();
        assert!(!env.ipc.recving);
        assert_eq!(env.ipc.dstva, None);

        // b may be dispatched at any point now; a send must not touch it
        assert_eq!(
            try_send(&mut state, &mem, a, b, 42, None, 0),
            Err(KernelError::NotReceiving)
        );
        assert_ne!(state.envs.lookup(b).unwrap().tf.regs.rdx, 42);
        assert!(check_all_invariants(&state, &mem).is_empty());
    }

    #[test]
    fn test_running_env_with_stale_recv_flag_is_not_receiving() {
        let (mem, mut state, a, b) = boot();
        recv(&mut state, b, None).unwrap();
        // Flag left behind while the env is back on a CPU
        let env = state.envs.lookup_mut(b).unwrap();
        env.status = EnvStatus::Running;
        env.cpu = Some(0);
        assert_eq!(
            try_send(&mut state, &mem, a, b, 42, None, 0),
            Err(KernelError::NotReceiving)
        );
        assert_eq!(state.envs.lookup(b).unwrap().cpu, Some(0));
    }

    #[test]
    fn test_destroyed_receiver_is_not_receiving() {
        let (mem, mut state, a, b) = boot();
        recv(&mut state, b, None).unwrap();
        state.destroy_env(&mem, b).unwrap();
        assert_eq!(
            try_send(&mut state, &mem, a, b, 1, None, 0),
            Err(KernelError::NotReceiving)
        );
    }
}

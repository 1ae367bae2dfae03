//! Round-robin scheduler
//!
//! Sweeps the environment table starting at the slot after the one last
//! dispatched on this CPU, wrapping around, and picks the first Runnable
//! non-idle environment. If none is found the CPU runs the idle
//! environment, which must always be Runnable.
//!
//! The idle environment is never marked Running; it may be the current
//! environment of several CPUs at once.

use crate::env::{EnvTable, IDLE_SLOT};
use crate::invariants::fatal;
use crate::types::{CpuId, EnvId, EnvStatus};

/// Per-CPU scheduling state
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpuState {
    pub id: CpuId,
    /// Environment whose frame this CPU will resume
    pub current: Option<EnvId>,
    /// Slot of the last non-idle dispatch
    pub last_slot: usize,
    /// Set between kernel entry and resume
    pub in_kernel: bool,
    /// Number of dispatches performed
    pub dispatches: u64,
}

impl CpuState {
    pub fn new(id: CpuId) -> Self {
        Self {
            id,
            current: None,
            last_slot: IDLE_SLOT,
            in_kernel: false,
            dispatches: 0,
        }
    }
}

/// Hand the current environment back to the Runnable pool if it is still
/// Running on this CPU.
pub fn deschedule(envs: &mut EnvTable, cpu: &mut CpuState) {
    if let Some(current) = cpu.current {
        if let Ok(env) = envs.lookup_mut(current) {
            if env.status == EnvStatus::Running && env.cpu == Some(cpu.id) {
                env.status = EnvStatus::Runnable;
                env.cpu = None;
            }
        }
    }
}

/// Pick and dispatch the next environment on `cpu`.
pub fn schedule(envs: &mut EnvTable, cpu: &mut CpuState) -> EnvId {
    deschedule(envs, cpu);

    let n = envs.size();
    for step in 1..=n {
        let slot = (cpu.last_slot + step) % n;
        if slot == IDLE_SLOT {
            continue;
        }
        let env = envs.slot_mut(slot);
        if env.status == EnvStatus::Runnable {
            env.status = EnvStatus::Running;
            env.cpu = Some(cpu.id);
            env.runs += 1;
            cpu.current = Some(env.id);
            cpu.last_slot = slot;
            cpu.dispatches += 1;
            return env.id;
        }
    }

    let idle = envs.idle();
    if idle.status != EnvStatus::Runnable {
        fatal(
            "idle_runnable",
            alloc::format!("idle environment is {:?} on cpu {}", idle.status, cpu.id),
        );
    }
    let id = idle.id;
    cpu.current = Some(id);
    cpu.dispatches += 1;
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmem::{FrameNumber, PhysicalMemory};
    use alloc::vec::Vec;

    fn setup(slots: usize) -> (PhysicalMemory, FrameNumber, EnvTable) {
        let mem = PhysicalMemory::new(256);
        let shared = mem.allocate().unwrap();
        mem.pin(shared);
        let mut table = EnvTable::new(0, slots).unwrap();
        table.create_idle(&mem, shared).unwrap();
        (mem, shared, table)
    }

    #[test]
    fn test_empty_table_runs_idle() {
        let (_mem, _shared, mut table) = setup(4);
        let mut cpu = CpuState::new(0);
        let picked = schedule(&mut table, &mut cpu);
        assert_eq!(picked, table.idle_id());
        assert_eq!(table.idle().status, EnvStatus::Runnable);
    }

    #[test]
    fn test_round_robin_visits_each_once_in_slot_order() {
        let (mem, shared, mut table) = setup(8);
        let idle = table.idle_id();
        let ids: Vec<EnvId> = (0..4)
            .map(|_| table.allocate(idle, &mem, shared).unwrap())
            .collect();
        let mut cpu = CpuState::new(0);

        let first = schedule(&mut table, &mut cpu);
        assert_eq!(first, ids[0]);
        assert_eq!(table.lookup(first).unwrap().status, EnvStatus::Running);

        // yield N times from the running environment
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(schedule(&mut table, &mut cpu));
        }
        assert_eq!(seen, alloc::vec![ids[1], ids[2], ids[3], ids[0]]);
    }

    #[test]
    fn test_skips_not_runnable_and_other_cpus() {
        let (mem, shared, mut table) = setup(8);
        let idle = table.idle_id();
        let a = table.allocate(idle, &mem, shared).unwrap();
        let b = table.allocate(idle, &mem, shared).unwrap();
        let c = table.allocate(idle, &mem, shared).unwrap();
        table.lookup_mut(a).unwrap().status = EnvStatus::NotRunnable;

        let mut cpu0 = CpuState::new(0);
        let mut cpu1 = CpuState::new(1);
        assert_eq!(schedule(&mut table, &mut cpu0), b);
        assert_eq!(schedule(&mut table, &mut cpu1), c);
        // b is Running on cpu0, c on cpu1: cpu1 keeps c
        assert_eq!(schedule(&mut table, &mut cpu1), c);
        assert_eq!(table.lookup(b).unwrap().cpu, Some(0));
    }

    #[test]
    fn test_falls_back_to_idle_when_current_blocks() {
        let (mem, shared, mut table) = setup(4);
        let a = table.allocate(table.idle_id(), &mem, shared).unwrap();
        let mut cpu = CpuState::new(0);
        assert_eq!(schedule(&mut table, &mut cpu), a);

        let env = table.lookup_mut(a).unwrap();
        env.status = EnvStatus::NotRunnable;
        env.cpu = None;
        assert_eq!(schedule(&mut table, &mut cpu), table.idle_id());
    }

    #[test]
    fn test_idle_shared_between_cpus() {
        let (_mem, _shared, mut table) = setup(4);
        let mut cpu0 = CpuState::new(0);
        let mut cpu1 = CpuState::new(1);
        let idle = table.idle_id();
        assert_eq!(schedule(&mut table, &mut cpu0), idle);
        assert_eq!(schedule(&mut table, &mut cpu1), idle);
    }

    #[test]
    #[should_panic(expected = "idle_runnable")]
    fn test_idle_not_runnable_is_fatal() {
        let (_mem, _shared, mut table) = setup(4);
        table.slot_mut(IDLE_SLOT).status = EnvStatus::NotRunnable;
        let mut cpu = CpuState::new(0);
        schedule(&mut table, &mut cpu);
    }

    #[test]
    fn test_destroyed_current_is_not_requeued() {
        let (mem, shared, mut table) = setup(4);
        let a = table.allocate(table.idle_id(), &mem, shared).unwrap();
        let mut cpu = CpuState::new(0);
        schedule(&mut table, &mut cpu);
        table.destroy(a, &mem).unwrap();
        assert_eq!(schedule(&mut table, &mut cpu), table.idle_id());
    }
}

//! Kernel invariants
//!
//! Runtime-checkable properties that must hold between kernel operations.
//! Tests call [`check_all_invariants`] after every step; hot paths that
//! detect a violation on their own call [`fatal`].
//!
//! # Invariants
//!
//! 1. **Refcount accuracy**: every frame's reference count equals the number
//!    of live leaf mappings that point at it
//! 2. **Free frames unreferenced**: a free frame has count 0, is not pinned
//!    and is not used as page-table structure
//! 3. **Free environments own nothing**: a Free slot has no address space,
//!    no index entry and no CPU
//! 4. **One running environment per CPU**: each Running environment names
//!    a CPU whose current environment it is
//! 5. **Idle runnable**: the idle environment is always Runnable
//! 6. **Index consistency**: the identifier index and the slots agree

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use crate::env::IDLE_SLOT;
use crate::pmem::{FrameNumber, PhysicalMemory};
use crate::state::KernelState;
use crate::types::EnvStatus;

/// An invariant violation with details
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// Description of what went wrong
    pub description: String,
}

/// Halt on a structural invariant violation.
///
/// Continuing after one risks silent corruption of other environments.
#[cold]
#[track_caller]
pub fn fatal(invariant: &'static str, description: String) -> ! {
    panic!("kernel invariant violated [{}]: {}", invariant, description)
}

/// Check all kernel invariants.
///
/// Returns a list of violations (empty if all invariants hold).
pub fn check_all_invariants(state: &KernelState, mem: &PhysicalMemory) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    violations.extend(check_frame_accounting(state, mem));
    violations.extend(check_free_envs(state));
    violations.extend(check_running_per_cpu(state));
    violations.extend(check_idle_runnable(state));
    violations.extend(check_index_consistency(state));

    violations
}

/// Invariants 1 and 2
fn check_frame_accounting(state: &KernelState, mem: &PhysicalMemory) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let mut mapped: BTreeMap<FrameNumber, u32> = BTreeMap::new();
    let mut structural: BTreeMap<FrameNumber, usize> = BTreeMap::new();

    for env in state.envs.iter() {
        let Some(space) = env.space.as_ref() else {
            continue;
        };
        for (_, pte) in space.mappings() {
            *mapped.entry(pte.frame).or_default() += 1;
        }
        for frame in space.table_frames() {
            *structural.entry(frame).or_default() += 1;
        }
    }

    for fs in mem.frame_states() {
        let expected = mapped.get(&fs.frame).copied().unwrap_or(0);
        if fs.refcount != expected {
            violations.push(InvariantViolation {
                invariant: "refcount_accuracy",
                description: alloc::format!(
                    "frame {} has refcount {} but {} live mappings",
                    fs.frame.as_u32(),
                    fs.refcount,
                    expected
                ),
            });
        }
        let tables = structural.get(&fs.frame).copied().unwrap_or(0);
        if fs.free && (fs.refcount != 0 || fs.pinned || tables != 0) {
            violations.push(InvariantViolation {
                invariant: "free_frames_unreferenced",
                description: alloc::format!(
                    "free frame {} has refcount {}, pinned {}, used by {} tables",
                    fs.frame.as_u32(),
                    fs.refcount,
                    fs.pinned,
                    tables
                ),
            });
        }
        if tables > 1 || (tables == 1 && (!fs.pinned || expected != 0)) {
            violations.push(InvariantViolation {
                invariant: "free_frames_unreferenced",
                description: alloc::format!(
                    "page-table frame {} shared by {} spaces (pinned {}, mapped {})",
                    fs.frame.as_u32(),
                    tables,
                    fs.pinned,
                    expected
                ),
            });
        }
    }

    violations
}

/// Invariant 3
fn check_free_envs(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    for slot in 0..state.envs.size() {
        let env = state.envs.slot(slot);
        if env.status == EnvStatus::Free && (env.space.is_some() || env.cpu.is_some()) {
            violations.push(InvariantViolation {
                invariant: "free_envs_own_nothing",
                description: alloc::format!("free slot {} still owns resources", slot),
            });
        }
        if env.status != EnvStatus::Free && env.space.is_none() {
            violations.push(InvariantViolation {
                invariant: "free_envs_own_nothing",
                description: alloc::format!("live env {} has no address space", env.id),
            });
        }
    }
    violations
}

/// Invariant 4
fn check_running_per_cpu(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let mut claimed: BTreeMap<usize, usize> = BTreeMap::new();

    for env in state.envs.iter() {
        match (env.status, env.cpu) {
            (EnvStatus::Running, Some(cpu)) => {
                *claimed.entry(cpu).or_default() += 1;
                let current = state.cpus.get(cpu).and_then(|c| c.current);
                if current != Some(env.id) {
                    violations.push(InvariantViolation {
                        invariant: "one_running_per_cpu",
                        description: alloc::format!(
                            "env {} Running on cpu {} which is running {:?}",
                            env.id,
                            cpu,
                            current
                        ),
                    });
                }
            }
            (EnvStatus::Running, None) => violations.push(InvariantViolation {
                invariant: "one_running_per_cpu",
                description: alloc::format!("env {} Running on no cpu", env.id),
            }),
            (_, Some(cpu)) => violations.push(InvariantViolation {
                invariant: "one_running_per_cpu",
                description: alloc::format!(
                    "env {} is {:?} but bound to cpu {}",
                    env.id,
                    env.status,
                    cpu
                ),
            }),
            _ => {}
        }
    }

    for (cpu, count) in claimed {
        if count > 1 {
            violations.push(InvariantViolation {
                invariant: "one_running_per_cpu",
                description: alloc::format!("{} environments Running on cpu {}", count, cpu),
            });
        }
    }
    violations
}

/// Invariant 5
fn check_idle_runnable(state: &KernelState) -> Vec<InvariantViolation> {
    let idle = state.envs.slot(IDLE_SLOT);
    if idle.status == EnvStatus::Runnable {
        return Vec::new();
    }
    alloc::vec![InvariantViolation {
        invariant: "idle_runnable",
        description: alloc::format!("idle environment is {:?}", idle.status),
    }]
}

/// Invariant 6
fn check_index_consistency(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let mut indexed = 0;
    for (id, slot) in state.envs.index() {
        indexed += 1;
        let env = state.envs.slot(slot);
        if env.is_free() || env.id != id {
            violations.push(InvariantViolation {
                invariant: "index_consistency",
                description: alloc::format!(
                    "index maps {} to slot {} holding {} ({:?})",
                    id,
                    slot,
                    env.id,
                    env.status
                ),
            });
        }
    }
    let live = state.envs.iter().count();
    if live != indexed {
        violations.push(InvariantViolation {
            invariant: "index_consistency",
            description: alloc::format!("{} live slots but {} index entries", live, indexed),
        });
    }
    violations
}

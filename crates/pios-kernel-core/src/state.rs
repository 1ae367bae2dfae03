//! Kernel state - everything one node's kernel owns
//!
//! [`KernelState`] holds the environment table, per-CPU scheduling state and
//! the journal of mutations not yet handed to the Axiom commit log. It has
//! NO HAL dependency; the runtime (`pios-kernel`) wraps it in a lock and
//! drains [`KernelState::take_commits`] after every operation.
//!
//! Mutating helpers here (`map_page`, `destroy_env`, ...) are the single
//! place each kind of mutation is journaled.

use alloc::vec::Vec;

use pios_axiom::CommitType;

use crate::env::{Destroyed, EnvTable};
use crate::error::{KernelError, KernelResult};
use crate::image::load_image;
use crate::invariants::fatal;
use crate::pmap::map_fresh;
use crate::pmem::{FrameNumber, PhysicalMemory};
use crate::sched::{self, CpuState};
use crate::trap::Resume;
use crate::types::{CpuId, EnvId, EnvStatus, NodeId, PteFlags, FL_IF, NODE_MAX};

/// Byte offsets of the fields in the kernel info page
pub mod info {
    pub const NODE: usize = 0;
    pub const CPU_COUNT: usize = 8;
    pub const MAX_ENVS: usize = 16;
}

/// The kernel state of one node.
pub struct KernelState {
    /// This node's identifier
    pub node: NodeId,
    /// Environment table
    pub envs: EnvTable,
    /// Per-CPU state, indexed by CPU id
    pub cpus: Vec<CpuState>,
    /// Kernel info page mapped read-only into every space
    info_frame: FrameNumber,
    /// Mutations since the last `take_commits`
    journal: Vec<CommitType>,
}

impl KernelState {
    /// Boot: allocate the info page, build the table and the idle env.
    pub fn new(
        mem: &PhysicalMemory,
        node: NodeId,
        cpu_count: usize,
        max_envs: usize,
    ) -> KernelResult<Self> {
        if node > NODE_MAX || cpu_count == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let mut envs = EnvTable::new(node, max_envs)?;

        let info_frame = mem.allocate()?;
        mem.pin(info_frame);
        mem.write(info_frame, info::NODE, &(node as u64).to_le_bytes());
        mem.write(info_frame, info::CPU_COUNT, &(cpu_count as u64).to_le_bytes());
        mem.write(info_frame, info::MAX_ENVS, &(max_envs as u64).to_le_bytes());

        let idle = envs.create_idle(mem, info_frame)?;
        Ok(Self {
            node,
            envs,
            cpus: (0..cpu_count).map(CpuState::new).collect(),
            info_frame,
            journal: alloc::vec![CommitType::EnvCreated {
                env: idle.0,
                parent: idle.0
            }],
        })
    }

    pub fn info_frame(&self) -> FrameNumber {
        self.info_frame
    }

    pub fn idle_id(&self) -> EnvId {
        self.envs.idle_id()
    }

    pub(crate) fn commit(&mut self, commit: CommitType) {
        self.journal.push(commit);
    }

    /// Drain the mutations recorded since the last call.
    pub fn take_commits(&mut self) -> Vec<CommitType> {
        core::mem::take(&mut self.journal)
    }

    pub(crate) fn cpu_mut(&mut self, cpu: CpuId) -> &mut CpuState {
        match self.cpus.get_mut(cpu) {
            Some(c) => c,
            None => fatal("cpu_index", alloc::format!("no cpu {}", cpu)),
        }
    }

    /// Environment the CPU will resume, if it has been started
    pub fn current(&self, cpu: CpuId) -> Option<EnvId> {
        self.cpus.get(cpu).and_then(|c| c.current)
    }

    // ========================================================================
    // Environment lifecycle
    // ========================================================================

    /// Allocate an environment and journal it.
    pub fn alloc_env(&mut self, mem: &PhysicalMemory, parent: EnvId) -> KernelResult<EnvId> {
        let id = self.envs.allocate(parent, mem, self.info_frame)?;
        self.commit(CommitType::EnvCreated {
            env: id.0,
            parent: parent.0,
        });
        Ok(id)
    }

    /// Allocate an environment and load an executable image into it.
    ///
    /// `parent` defaults to the idle environment.
    pub fn create_env(
        &mut self,
        mem: &PhysicalMemory,
        image: &[u8],
        parent: Option<EnvId>,
    ) -> KernelResult<EnvId> {
        let parent = match parent {
            Some(p) => {
                self.envs.lookup(p)?;
                p
            }
            None => self.idle_id(),
        };
        let id = self.envs.allocate(parent, mem, self.info_frame)?;
        let loaded = self
            .envs
            .lookup_mut(id)
            .and_then(|env| load_image(env, mem, image));
        if let Err(e) = loaded {
            self.envs.destroy(id, mem)?;
            return Err(e);
        }
        self.commit(CommitType::EnvCreated {
            env: id.0,
            parent: parent.0,
        });
        Ok(id)
    }

    /// Duplicate an environment (eager page copy) and journal the child.
    pub fn fork_env(&mut self, mem: &PhysicalMemory, parent: EnvId) -> KernelResult<EnvId> {
        let id = self.envs.fork(parent, mem, self.info_frame)?;
        self.commit(CommitType::EnvCreated {
            env: id.0,
            parent: parent.0,
        });
        Ok(id)
    }

    /// Destroy an environment. If another CPU is running it, that CPU
    /// notices on its next kernel entry and reschedules.
    pub fn destroy_env(&mut self, mem: &PhysicalMemory, id: EnvId) -> KernelResult<Destroyed> {
        let destroyed = self.envs.destroy(id, mem)?;
        self.commit(CommitType::EnvDestroyed { env: id.0 });
        Ok(destroyed)
    }

    /// Set Runnable / NotRunnable on an environment that is not Running.
    pub fn set_status(&mut self, id: EnvId, status: EnvStatus) -> KernelResult<()> {
        if !matches!(status, EnvStatus::Runnable | EnvStatus::NotRunnable) {
            return Err(KernelError::InvalidArgument);
        }
        let env = self.envs.lookup_mut(id)?;
        if env.migration.is_some() {
            return Err(KernelError::MigrationInProgress);
        }
        if env.status == EnvStatus::Running {
            return Err(KernelError::InvalidArgument);
        }
        if status == EnvStatus::Runnable {
            // A woken receiver no longer accepts a message
            env.ipc.recving = false;
            env.ipc.dstva = None;
        }
        env.status = status;
        self.commit(CommitType::EnvStatusChanged {
            env: id.0,
            status: status.code(),
        });
        Ok(())
    }

    /// Take the environment running on `cpu` off the CPU with `status`.
    pub(crate) fn block_current(&mut self, id: EnvId, status: EnvStatus) -> KernelResult<()> {
        let env = self.envs.lookup_mut(id)?;
        env.status = status;
        env.cpu = None;
        self.commit(CommitType::EnvStatusChanged {
            env: id.0,
            status: status.code(),
        });
        Ok(())
    }

    // ========================================================================
    // Address-space edits
    // ========================================================================

    pub fn map_page(
        &mut self,
        mem: &PhysicalMemory,
        id: EnvId,
        va: u64,
        frame: FrameNumber,
        flags: PteFlags,
    ) -> KernelResult<()> {
        self.envs
            .lookup_mut(id)?
            .space_mut()?
            .map(mem, va, frame, flags)?;
        self.commit(CommitType::PageMapped {
            env: id.0,
            va,
            frame: frame.as_u32(),
            perm: (flags | PteFlags::PRESENT).bits(),
        });
        Ok(())
    }

    /// Map a fresh zeroed page at `va`.
    pub fn alloc_page(
        &mut self,
        mem: &PhysicalMemory,
        id: EnvId,
        va: u64,
        flags: PteFlags,
    ) -> KernelResult<FrameNumber> {
        let frame = map_fresh(self.envs.lookup_mut(id)?.space_mut()?, mem, va, flags)?;
        self.commit(CommitType::PageMapped {
            env: id.0,
            va,
            frame: frame.as_u32(),
            perm: (flags | PteFlags::PRESENT).bits(),
        });
        Ok(frame)
    }

    /// Unmap `va`; unmapping an absent page is not an error.
    pub fn unmap_page(&mut self, mem: &PhysicalMemory, id: EnvId, va: u64) -> KernelResult<()> {
        let removed = self.envs.lookup_mut(id)?.space_mut()?.unmap(mem, va);
        if removed.is_some() {
            self.commit(CommitType::PageUnmapped { env: id.0, va });
        }
        Ok(())
    }

    pub fn protect_page(&mut self, id: EnvId, va: u64, flags: PteFlags) -> KernelResult<()> {
        let space = self.envs.lookup_mut(id)?.space_mut()?;
        space.protect(va, flags)?;
        let frame = space.lookup(va).map(|p| p.frame.as_u32()).unwrap_or(0);
        self.commit(CommitType::PageMapped {
            env: id.0,
            va,
            frame,
            perm: (flags | PteFlags::PRESENT).bits(),
        });
        Ok(())
    }

    /// Checksum of an environment's user-readable memory
    pub fn checksum(&self, mem: &PhysicalMemory, id: EnvId) -> KernelResult<u64> {
        Ok(self.envs.lookup(id)?.space()?.checksum(mem))
    }

    // ========================================================================
    // CPU dispatch
    // ========================================================================

    /// Run the scheduler on `cpu`.
    pub fn schedule(&mut self, cpu: CpuId) -> EnvId {
        let Self { envs, cpus, .. } = self;
        match cpus.get_mut(cpu) {
            Some(c) => sched::schedule(envs, c),
            None => fatal("cpu_index", alloc::format!("no cpu {}", cpu)),
        }
    }

    /// First dispatch on a CPU.
    pub fn start_cpu(&mut self, cpu: CpuId) -> KernelResult<Resume> {
        let state = self.cpus.get(cpu).ok_or(KernelError::InvalidArgument)?;
        if state.current.is_some() || state.in_kernel {
            return Err(KernelError::InvalidArgument);
        }
        self.schedule(cpu);
        Ok(self.resume(cpu))
    }

    /// Leave the kernel on `cpu`, resuming its current environment.
    ///
    /// If the current environment disappeared (destroyed by another CPU, or
    /// frozen for migration) the scheduler picks a replacement first.
    pub fn resume(&mut self, cpu: CpuId) -> Resume {
        let idle = self.idle_id();
        let runnable = |state: &Self, id: EnvId| {
            id == idle
                || state
                    .envs
                    .lookup(id)
                    .map(|e| e.status == EnvStatus::Running && e.cpu == Some(cpu))
                    .unwrap_or(false)
        };
        let env = match self.current(cpu) {
            Some(id) if runnable(self, id) => id,
            _ => self.schedule(cpu),
        };
        let mut frame = match self.envs.lookup(env) {
            Ok(e) => e.tf,
            Err(_) => fatal(
                "resume_target",
                alloc::format!("scheduled env {} vanished on cpu {}", env, cpu),
            ),
        };
        frame.rflags |= FL_IF;
        self.cpu_mut(cpu).in_kernel = false;
        Resume { cpu, env, frame }
    }
}

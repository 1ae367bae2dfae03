//! PIOS Kernel - runtime wrapper around the kernel core
//!
//! `pios-kernel-core` decides; this crate acts. [`Kernel`] owns the HAL,
//! the physical memory arena, the locked [`KernelState`], the Axiom gateway
//! and the device registry. Each CPU calls [`Kernel::trap`] on every kernel
//! entry and gets back the frame to resume.
//!
//! # Locking
//!
//! Lock order is state, then axiom, then the allocator's internal lock.
//! Host calls (console, disk, node transport) run with no kernel lock held;
//! the CPU stays marked as inside the kernel until it resumes.
//!
//! # Diagnostics
//!
//! Human-readable lines go to `HAL::debug_write` with `[kernel]`, `[trap]`
//! and `[cluster]` prefixes. The audit trail is the Axiom SysLog and
//! CommitLog.

#![no_std]
extern crate alloc;

pub mod cluster;
pub mod config;
pub mod devices;

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use pios_axiom::{AxiomGateway, CommitType, SyscallRecord};
use pios_hal::{Device, DeviceClass, HAL};
use pios_kernel_core::migrate;
use pios_kernel_core::trap;
use pios_kernel_core::{
    check_all_invariants, CpuId, Dispatch, EnvId, EnvStatus, HostCall, InvariantViolation,
    KernelError, KernelResult, KernelState, NodeId, Outcome, PhysicalMemory, Resume,
    SyscallAudit, Trap, TrapFrame,
};
use spin::{Mutex, MutexGuard};

pub use cluster::NodeMessage;
pub use config::{ConfigError, KernelConfig};
pub use devices::{device_error, DeviceRegistry};

/// Snapshot of one environment
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnvInfo {
    pub id: EnvId,
    pub parent: EnvId,
    pub status: EnvStatus,
    pub frame: TrapFrame,
    /// Times dispatched
    pub runs: u64,
    /// Present mappings, including the kernel info page
    pub mappings: usize,
}

/// Why a kernel-mediated user memory access failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessFault {
    /// The environment does not resolve
    Env(KernelError),
    /// The access faults; deliver this trap on the environment's CPU
    PageFault(Trap),
}

/// Time slice bookkeeping for one CPU
#[derive(Clone, Copy, Debug, Default)]
struct Slice {
    env: Option<EnvId>,
    started: u64,
}

/// The kernel of one node, generic over the platform.
pub struct Kernel<H: HAL> {
    hal: H,
    config: KernelConfig,
    memory: PhysicalMemory,
    state: Mutex<KernelState>,
    axiom: Mutex<AxiomGateway>,
    devices: Mutex<DeviceRegistry>,
    slices: Mutex<Vec<Slice>>,
    boot_time: u64,
}

impl<H: HAL> Kernel<H> {
    /// Boot a node.
    pub fn new(hal: H, config: KernelConfig) -> KernelResult<Self> {
        if let Err(e) = config.validate() {
            hal.debug_write(&alloc::format!("[kernel] bad configuration: {}", e));
            return Err(KernelError::InvalidArgument);
        }
        let boot_time = hal.now_nanos();
        let memory = PhysicalMemory::new(config.physical_pages);
        let mut state = KernelState::new(
            &memory,
            config.node_id,
            config.cpu_count,
            config.max_envs,
        )?;

        // Journal timestamps count from boot
        let mut axiom = AxiomGateway::new(0);
        for commit in state.take_commits() {
            axiom.record_commit(commit, 0);
        }

        hal.debug_write(&alloc::format!(
            "[kernel] node {} booted: {} cpus, {} pages, {} env slots",
            config.node_id,
            config.cpu_count,
            config.physical_pages,
            config.max_envs
        ));

        Ok(Self {
            slices: Mutex::new(vec![Slice::default(); config.cpu_count]),
            hal,
            config,
            memory,
            state: Mutex::new(state),
            axiom: Mutex::new(axiom),
            devices: Mutex::new(DeviceRegistry::new()),
            boot_time,
        })
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn node(&self) -> NodeId {
        self.config.node_id
    }

    pub fn uptime_nanos(&self) -> u64 {
        self.hal.now_nanos().saturating_sub(self.boot_time)
    }

    /// Lock the Axiom gateway (SysLog + CommitLog) for inspection.
    pub fn axiom(&self) -> MutexGuard<'_, AxiomGateway> {
        self.axiom.lock()
    }

    // ========================================================================
    // Audit
    // ========================================================================

    /// Move the state's journal into the commit log, under the syscall
    /// that caused it if there is one.
    fn journal(&self, state: &mut KernelState, audit: Option<SyscallAudit>) {
        let commits = state.take_commits();
        for commit in &commits {
            self.describe(commit);
        }
        let now = self.uptime_nanos();
        let mut axiom = self.axiom.lock();
        match audit {
            Some(a) => {
                let call = SyscallRecord {
                    sender: a.sender.0,
                    num: a.num,
                    args: a.args,
                    result: a.result.unwrap_or(0),
                };
                axiom.syscall(call, commits, now);
            }
            None => {
                for commit in commits {
                    axiom.record_commit(commit, now);
                }
            }
        }
    }

    fn describe(&self, commit: &CommitType) {
        let line = match commit {
            CommitType::EnvFaulted {
                env,
                vector,
                description,
            } => alloc::format!(
                "[trap] env {} destroyed on vector {}: {}",
                EnvId(*env),
                vector,
                description
            ),
            CommitType::MigrationStarted { env, target } => alloc::format!(
                "[cluster] env {} frozen for migration to node {}",
                EnvId(*env),
                target
            ),
            CommitType::MigrationCompleted { env, target } => alloc::format!(
                "[cluster] env {} now lives on node {}",
                EnvId(*env),
                target
            ),
            CommitType::MigrationAborted { env, target, error } => alloc::format!(
                "[cluster] migration of env {} to node {} aborted ({})",
                EnvId(*env),
                target,
                KernelError::from_code(*error).unwrap_or(KernelError::Device)
            ),
            CommitType::EnvMigratedIn { env, origin } => alloc::format!(
                "[cluster] env {} arrived from node {}",
                EnvId(*env),
                origin
            ),
            _ => return,
        };
        self.hal.debug_write(&line);
    }

    // ========================================================================
    // Environments
    // ========================================================================

    /// Create a Runnable environment from an executable image.
    pub fn create_env(&self, image: &[u8]) -> KernelResult<EnvId> {
        let mut state = self.state.lock();
        let result = state.create_env(&self.memory, image, None);
        self.journal(&mut state, None);
        match result {
            Ok(id) => {
                self.hal
                    .debug_write(&alloc::format!("[kernel] created env {}", id));
                Ok(id)
            }
            Err(e) => {
                self.hal
                    .debug_write(&alloc::format!("[kernel] create_env failed: {}", e));
                Err(e)
            }
        }
    }

    /// Duplicate an environment with an eager copy of its user pages.
    ///
    /// The child is Runnable with a result register of 0.
    pub fn fork_env(&self, parent: EnvId) -> KernelResult<EnvId> {
        let mut state = self.state.lock();
        let result = state.fork_env(&self.memory, parent);
        self.journal(&mut state, None);
        result
    }

    /// Destroy an environment from outside (operator action).
    pub fn destroy_env(&self, id: EnvId) -> KernelResult<()> {
        let mut state = self.state.lock();
        if state.envs.lookup(id)?.migration.is_some() {
            return Err(KernelError::MigrationInProgress);
        }
        let result = state.destroy_env(&self.memory, id).map(|_| ());
        self.journal(&mut state, None);
        result
    }

    pub fn lookup(&self, id: EnvId) -> KernelResult<EnvInfo> {
        let state = self.state.lock();
        let env = state.envs.lookup(id)?;
        Ok(EnvInfo {
            id: env.id,
            parent: env.parent,
            status: env.status,
            frame: env.tf,
            runs: env.runs,
            mappings: env.space()?.mapping_count(),
        })
    }

    pub fn live_envs(&self) -> usize {
        self.state.lock().envs.live_count()
    }

    pub fn idle_env(&self) -> EnvId {
        self.state.lock().idle_id()
    }

    /// Checksum of the environment's user-readable memory
    pub fn memory_checksum(&self, id: EnvId) -> KernelResult<u64> {
        self.state.lock().checksum(&self.memory, id)
    }

    /// Store into an environment's memory with user permissions.
    pub fn user_write(&self, id: EnvId, va: u64, data: &[u8]) -> Result<(), AccessFault> {
        let mut state = self.state.lock();
        let env = state.envs.lookup_mut(id).map_err(AccessFault::Env)?;
        let frame = env.tf;
        let space = env.space_mut().map_err(AccessFault::Env)?;
        space
            .copy_to_user(&self.memory, va, data)
            .map_err(|fault| AccessFault::PageFault(Trap::from_user_fault(frame, &fault)))
    }

    /// Load from an environment's memory with user permissions.
    pub fn user_read(&self, id: EnvId, va: u64, len: usize) -> Result<Vec<u8>, AccessFault> {
        let mut state = self.state.lock();
        let env = state.envs.lookup_mut(id).map_err(AccessFault::Env)?;
        let frame = env.tf;
        let space = env.space_mut().map_err(AccessFault::Env)?;
        let mut buf = vec![0u8; len];
        space
            .copy_from_user(&self.memory, va, &mut buf)
            .map_err(|fault| AccessFault::PageFault(Trap::from_user_fault(frame, &fault)))?;
        Ok(buf)
    }

    pub fn free_pages(&self) -> usize {
        self.memory.free_count()
    }

    pub fn check_invariants(&self) -> Vec<InvariantViolation> {
        let state = self.state.lock();
        check_all_invariants(&state, &self.memory)
    }

    // ========================================================================
    // Devices
    // ========================================================================

    pub fn register_device(&self, device: Arc<dyn Device>) -> KernelResult<()> {
        let class = device.class();
        let irq = device.irq();
        self.devices.lock().register(device)?;
        self.hal.debug_write(&alloc::format!(
            "[kernel] registered {:?} device on irq {:?}",
            class,
            irq
        ));
        Ok(())
    }

    fn service_interrupt(&self, irq: u8) {
        self.hal.ack_interrupt(irq);
        let device = self.devices.lock().by_irq(irq);
        match device {
            Some(device) => device.handle_interrupt(),
            None => self
                .hal
                .debug_write(&alloc::format!("[trap] spurious interrupt on irq {}", irq)),
        }
    }

    // ========================================================================
    // CPUs
    // ========================================================================

    /// First dispatch on `cpu`.
    pub fn start_cpu(&self, cpu: CpuId) -> KernelResult<Resume> {
        let resume = self.state.lock().start_cpu(cpu)?;
        self.hal.debug_write(&alloc::format!(
            "[kernel] cpu {} started with env {}",
            cpu,
            resume.env
        ));
        self.note_dispatch(&resume);
        Ok(resume)
    }

    /// Handle a kernel entry on `cpu` and return what to resume.
    pub fn trap(&self, cpu: CpuId, entry: Trap) -> Resume {
        let Dispatch { outcome, syscall } = {
            let mut state = self.state.lock();
            let dispatch = trap::dispatch(&mut state, &self.memory, cpu, entry);
            let deferred = matches!(dispatch.outcome, Outcome::HostCall(_));
            self.journal(&mut state, if deferred { None } else { dispatch.syscall });
            dispatch
        };

        match outcome {
            Outcome::Resume => {}
            Outcome::Device(irq) => self.service_interrupt(irq),
            Outcome::HostCall(call) => {
                let result = self.host_call(call);
                let mut state = self.state.lock();
                let audit = syscall.map(|a| SyscallAudit {
                    result: Some(result),
                    ..a
                });
                self.journal(&mut state, audit);
            }
        }

        let resume = self.state.lock().resume(cpu);
        self.note_dispatch(&resume);
        resume
    }

    fn note_dispatch(&self, resume: &Resume) {
        let mut slices = self.slices.lock();
        if let Some(slice) = slices.get_mut(resume.cpu) {
            if slice.env != Some(resume.env) {
                *slice = Slice {
                    env: Some(resume.env),
                    started: self.hal.now_nanos(),
                };
            }
        }
    }

    /// Whether the environment on `cpu` has used up its time slice.
    pub fn preempt_due(&self, cpu: CpuId) -> bool {
        let slice = self.slices.lock().get(cpu).copied().unwrap_or_default();
        slice.env.is_some()
            && self.hal.now_nanos().saturating_sub(slice.started) >= self.config.time_slice_ns
    }

    /// Perform a host call with no kernel lock held; returns the syscall
    /// result for the audit trail.
    fn host_call(&self, call: HostCall) -> i64 {
        match call {
            HostCall::ConsoleWrite { env, bytes } => {
                self.hal.console_write(&bytes);
                trap::complete_host_call(&mut self.state.lock(), env, 0);
                0
            }
            HostCall::DiskRead {
                env,
                sector,
                va,
                len,
            } => {
                let disk = self.devices.lock().by_class(DeviceClass::Disk);
                let mut buf = vec![0u8; len];
                let read = match disk {
                    Some(disk) => disk.read(sector, &mut buf).map_err(device_error),
                    None => Err(KernelError::NotSupported),
                };
                let mut state = self.state.lock();
                match read {
                    Ok(_) => {
                        trap::complete_disk_read(&mut state, &self.memory, env, va, &buf);
                        state.envs.lookup(env).map(|e| e.tf.result()).unwrap_or(0)
                    }
                    Err(e) => {
                        trap::complete_host_call(&mut state, env, e.code());
                        e.code()
                    }
                }
            }
            HostCall::Migrate {
                env,
                target,
                record,
            } => match self.send(target, &NodeMessage::Migrate(record)) {
                Ok(()) => 0,
                Err(e) => {
                    let mut state = self.state.lock();
                    let _ = migrate::abort(&mut state, env, e);
                    e.code()
                }
            },
        }
    }

    // ========================================================================
    // Cluster
    // ========================================================================

    fn send(&self, node: NodeId, msg: &NodeMessage) -> KernelResult<()> {
        let bytes = msg.encode()?;
        self.hal.node_send(node, &bytes).map_err(|e| {
            self.hal.debug_write(&alloc::format!(
                "[cluster] send to node {} failed: {:?}",
                node,
                e
            ));
            device_error(e)
        })
    }

    /// Migrate an environment that is not currently running.
    ///
    /// Returns once the record is handed to the transport; the origin copy
    /// stays frozen until the target's acknowledgement is polled.
    pub fn migrate(&self, id: EnvId, target: NodeId) -> KernelResult<()> {
        let record = {
            let mut state = self.state.lock();
            let record = migrate::begin(&mut state, &self.memory, id, target, None);
            self.journal(&mut state, None);
            record?
        };
        if let Err(e) = self.send(target, &NodeMessage::Migrate(record)) {
            let mut state = self.state.lock();
            migrate::abort(&mut state, id, e)?;
            self.journal(&mut state, None);
            return Err(e);
        }
        Ok(())
    }

    /// Process every pending message from other nodes.
    ///
    /// Returns the number of messages handled.
    pub fn poll_cluster(&self) -> usize {
        let mut handled = 0;
        for (from, bytes) in self.hal.node_poll() {
            let msg = match NodeMessage::decode(&bytes) {
                Ok(msg) => msg,
                Err(_) => {
                    self.hal.debug_write(&alloc::format!(
                        "[cluster] dropped malformed message from node {}",
                        from
                    ));
                    continue;
                }
            };
            match msg {
                NodeMessage::Migrate(record) => self.accept_migration(from, &record),
                NodeMessage::MigrateAck { env, result } => {
                    self.finish_migration(from, env, result)
                }
            }
            handled += 1;
        }
        handled
    }

    fn accept_migration(&self, from: NodeId, record: &migrate::MigrationRecord) {
        let result = {
            let mut state = self.state.lock();
            let result = migrate::reconstitute(&mut state, &self.memory, record);
            self.journal(&mut state, None);
            result
        };
        let code = match result {
            Ok(_) => 0,
            Err(e) => {
                self.hal.debug_write(&alloc::format!(
                    "[cluster] rejected env {} from node {}: {}",
                    record.env,
                    from,
                    e
                ));
                e.code()
            }
        };
        let ack = NodeMessage::MigrateAck {
            env: record.env,
            result: code,
        };
        // On failure the origin copy stays frozen; ours (if any) is the
        // only runnable one.
        let _ = self.send(from, &ack);
    }

    fn finish_migration(&self, from: NodeId, env: EnvId, result: i64) {
        let mut state = self.state.lock();
        let outcome = if result == 0 {
            migrate::complete(&mut state, &self.memory, env, from)
        } else {
            let error = KernelError::from_code(result).unwrap_or(KernelError::Device);
            migrate::reject(&mut state, env, from, error)
        };
        if let Err(e) = outcome {
            self.hal.debug_write(&alloc::format!(
                "[cluster] unexpected ack for env {} from node {}: {}",
                env,
                from,
                e
            ));
        }
        self.journal(&mut state, None);
    }
}

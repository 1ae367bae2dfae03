//! Environment table
//!
//! A fixed-size table of environments owned by one kernel instance. Free
//! slots sit on a FIFO free list; live environments are found through an
//! identifier index, which also holds environments that migrated in from
//! other nodes (their identifiers do not encode a local slot).
//!
//! Slot 0 is reserved for the idle environment.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::pmap::AddressSpace;
use crate::pmem::{FrameNumber, PhysicalMemory};
use crate::types::{CpuId, EnvId, EnvStatus, NodeId, TrapFrame, NENV_MAX, USTACKTOP};

/// Slot reserved for the idle environment
pub const IDLE_SLOT: usize = 0;

/// Per-environment IPC rendezvous state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IpcState {
    /// Blocked in `recv`
    pub recving: bool,
    /// Where an incoming page should be mapped (None: no page wanted)
    pub dstva: Option<u64>,
    /// Last value received
    pub value: u64,
    /// Last sender
    pub from: Option<EnvId>,
    /// Permissions of the last transferred page (0 if none)
    pub perm: u32,
}

/// An outbound migration awaiting the target's acknowledgement
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingMigration {
    pub target: NodeId,
    /// Started by the environment's own syscall (result register is
    /// written on completion or abort)
    pub from_syscall: bool,
    /// Status restored if the migration is aborted
    pub resume: EnvStatus,
}

/// One environment.
pub struct Env {
    pub id: EnvId,
    pub parent: EnvId,
    pub status: EnvStatus,
    /// Saved user registers
    pub tf: TrapFrame,
    /// None exactly when the slot is Free
    pub space: Option<AddressSpace>,
    /// User-level page fault entry point
    pub pgfault_upcall: Option<u64>,
    pub ipc: IpcState,
    /// Times dispatched
    pub runs: u64,
    /// CPU this environment is Running on
    pub cpu: Option<CpuId>,
    /// Set while frozen for migration
    pub migration: Option<PendingMigration>,
}

impl Env {
    fn vacant() -> Self {
        Self {
            id: EnvId(0),
            parent: EnvId(0),
            status: EnvStatus::Free,
            tf: TrapFrame::default(),
            space: None,
            pgfault_upcall: None,
            ipc: IpcState::default(),
            runs: 0,
            cpu: None,
            migration: None,
        }
    }

    pub fn is_free(&self) -> bool {
        self.status == EnvStatus::Free
    }

    /// Address space of a live environment
    pub fn space(&self) -> KernelResult<&AddressSpace> {
        self.space.as_ref().ok_or(KernelError::NotFound)
    }

    pub fn space_mut(&mut self) -> KernelResult<&mut AddressSpace> {
        self.space.as_mut().ok_or(KernelError::NotFound)
    }
}

/// What `destroy` tore down
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Destroyed {
    /// CPU the environment was Running on, if any
    pub cpu: Option<CpuId>,
    /// Mappings released from its address space
    pub released: usize,
}

/// The environment table of one node.
pub struct EnvTable {
    node: NodeId,
    slots: Vec<Env>,
    generations: Vec<u64>,
    free: VecDeque<usize>,
    index: BTreeMap<EnvId, usize>,
}

impl EnvTable {
    /// Create a table with `size` slots (slot 0 reserved for idle).
    pub fn new(node: NodeId, size: usize) -> KernelResult<Self> {
        if !(2..=NENV_MAX).contains(&size) {
            return Err(KernelError::InvalidArgument);
        }
        Ok(Self {
            node,
            slots: (0..size).map(|_| Env::vacant()).collect(),
            generations: alloc::vec![0; size],
            free: (1..size).collect(),
            index: BTreeMap::new(),
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn free_slots(&self) -> usize {
        self.free.len()
    }

    pub fn live_count(&self) -> usize {
        self.index.len()
    }

    fn next_id(&mut self, slot: usize) -> EnvId {
        self.generations[slot] += 1;
        EnvId::new(self.generations[slot], self.node, slot)
    }

    fn occupy(
        &mut self,
        slot: usize,
        id: EnvId,
        parent: EnvId,
        space: AddressSpace,
        tf: TrapFrame,
    ) {
        self.slots[slot] = Env {
            id,
            parent,
            status: EnvStatus::Runnable,
            tf,
            space: Some(space),
            pgfault_upcall: None,
            ipc: IpcState::default(),
            runs: 0,
            cpu: None,
            migration: None,
        };
        self.index.insert(id, slot);
    }

    /// Set up the idle environment in its reserved slot.
    pub fn create_idle(&mut self, mem: &PhysicalMemory, shared: FrameNumber) -> KernelResult<EnvId> {
        if !self.slots[IDLE_SLOT].is_free() {
            return Err(KernelError::InvalidArgument);
        }
        let space = AddressSpace::create(mem, shared)?;
        let id = self.next_id(IDLE_SLOT);
        self.occupy(IDLE_SLOT, id, id, space, TrapFrame::user(0, 0));
        Ok(id)
    }

    pub fn idle(&self) -> &Env {
        &self.slots[IDLE_SLOT]
    }

    pub fn idle_id(&self) -> EnvId {
        self.slots[IDLE_SLOT].id
    }

    /// Allocate a Runnable environment with a fresh address space.
    pub fn allocate(
        &mut self,
        parent: EnvId,
        mem: &PhysicalMemory,
        shared: FrameNumber,
    ) -> KernelResult<EnvId> {
        let slot = *self.free.front().ok_or(KernelError::NoFreeSlot)?;
        let space = AddressSpace::create(mem, shared)?;
        self.free.pop_front();
        let id = self.next_id(slot);
        self.occupy(slot, id, parent, space, TrapFrame::user(0, USTACKTOP));
        Ok(id)
    }

    /// Install an environment with a caller-chosen identifier (migration).
    pub fn install(
        &mut self,
        id: EnvId,
        parent: EnvId,
        space: AddressSpace,
        tf: TrapFrame,
    ) -> Result<usize, (KernelError, AddressSpace)> {
        if id.is_self() || self.index.contains_key(&id) {
            return Err((KernelError::InvalidArgument, space));
        }
        let Some(slot) = self.free.pop_front() else {
            return Err((KernelError::NoFreeSlot, space));
        };
        // Keep future local identifiers for this slot distinct
        self.generations[slot] = self.generations[slot].max(id.generation());
        self.occupy(slot, id, parent, space, tf);
        Ok(slot)
    }

    /// Tear an environment down and return its slot to the free list.
    ///
    /// The idle environment cannot be destroyed.
    pub fn destroy(&mut self, id: EnvId, mem: &PhysicalMemory) -> KernelResult<Destroyed> {
        let slot = self.slot_of(id)?;
        if slot == IDLE_SLOT {
            return Err(KernelError::PermissionDenied);
        }
        let env = &mut self.slots[slot];
        let cpu = env.cpu.take();
        let released = env.space.take().map(|s| s.destroy(mem)).unwrap_or(0);
        env.status = EnvStatus::Free;
        env.ipc = IpcState::default();
        env.pgfault_upcall = None;
        env.migration = None;
        self.index.remove(&id);
        self.free.push_back(slot);
        Ok(Destroyed { cpu, released })
    }

    fn slot_of(&self, id: EnvId) -> KernelResult<usize> {
        if let Some(slot) = self.index.get(&id) {
            return Ok(*slot);
        }
        // A different live occupant of the slot this identifier encodes
        // means the identifier outlived its environment.
        if id.node() == self.node && id.slot() < self.slots.len() {
            let occupant = &self.slots[id.slot()];
            if !occupant.is_free() && occupant.id != id {
                return Err(KernelError::StaleReference);
            }
        }
        Err(KernelError::NotFound)
    }

    /// Resolve an identifier to a live environment.
    pub fn lookup(&self, id: EnvId) -> KernelResult<&Env> {
        let slot = self.slot_of(id)?;
        Ok(&self.slots[slot])
    }

    pub fn lookup_mut(&mut self, id: EnvId) -> KernelResult<&mut Env> {
        let slot = self.slot_of(id)?;
        Ok(&mut self.slots[slot])
    }

    /// Resolve a syscall argument on behalf of `caller`.
    ///
    /// Identifier 0 names the caller. With `check_perm`, the target must be
    /// the caller or one of its direct children.
    pub fn resolve(&self, caller: EnvId, id: EnvId, check_perm: bool) -> KernelResult<EnvId> {
        let target = if id.is_self() { caller } else { id };
        let env = self.lookup(target)?;
        if check_perm && target != caller && env.parent != caller {
            return Err(KernelError::PermissionDenied);
        }
        Ok(target)
    }

    /// Environment in `slot` (possibly Free)
    pub fn slot(&self, slot: usize) -> &Env {
        &self.slots[slot]
    }

    pub fn slot_mut(&mut self, slot: usize) -> &mut Env {
        &mut self.slots[slot]
    }

    /// Live environments in slot order
    pub fn iter(&self) -> impl Iterator<Item = &Env> {
        self.slots.iter().filter(|e| !e.is_free())
    }

    /// Identifier index entries
    pub fn index(&self) -> impl Iterator<Item = (EnvId, usize)> + '_ {
        self.index.iter().map(|(id, slot)| (*id, *slot))
    }

    /// Copy `parent` into a new child: duplicated pages, same registers,
    /// result register 0 in the child.
    pub fn fork(
        &mut self,
        parent: EnvId,
        mem: &PhysicalMemory,
        shared: FrameNumber,
    ) -> KernelResult<EnvId> {
        let (space, tf, upcall) = {
            let env = self.lookup(parent)?;
            (
                env.space()?.duplicate(mem, shared)?,
                env.tf,
                env.pgfault_upcall,
            )
        };
        let Some(slot) = self.free.pop_front() else {
            space.destroy(mem);
            return Err(KernelError::NoFreeSlot);
        };
        let id = self.next_id(slot);
        let mut tf = tf;
        tf.set_result(0);
        self.occupy(slot, id, parent, space, tf);
        self.slots[slot].pgfault_upcall = upcall;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmap::map_fresh;
    use crate::types::PteFlags;

    fn setup(slots: usize) -> (PhysicalMemory, FrameNumber, EnvTable) {
        let mem = PhysicalMemory::new(128);
        let shared = mem.allocate().unwrap();
        mem.pin(shared);
        let mut table = EnvTable::new(0, slots).unwrap();
        table.create_idle(&mem, shared).unwrap();
        (mem, shared, table)
    }

    #[test]
    fn test_table_size_bounds() {
        assert!(EnvTable::new(0, 1).is_err());
        assert!(EnvTable::new(0, NENV_MAX + 1).is_err());
        assert!(EnvTable::new(0, NENV_MAX).is_ok());
    }

    #[test]
    fn test_allocate_sets_runnable_and_parent() {
        let (mem, shared, mut table) = setup(4);
        let idle = table.idle_id();
        let a = table.allocate(idle, &mem, shared).unwrap();
        let env = table.lookup(a).unwrap();
        assert_eq!(env.status, EnvStatus::Runnable);
        assert_eq!(env.parent, idle);
        assert_eq!(a.slot(), 1);
        assert!(env.space.is_some());
    }

    #[test]
    fn test_allocate_exhaustion() {
        let (mem, shared, mut table) = setup(3);
        let idle = table.idle_id();
        table.allocate(idle, &mem, shared).unwrap();
        table.allocate(idle, &mem, shared).unwrap();
        assert_eq!(
            table.allocate(idle, &mem, shared),
            Err(KernelError::NoFreeSlot)
        );
    }

    #[test]
    fn test_allocate_out_of_memory_keeps_slot() {
        let mem = PhysicalMemory::new(4);
        let shared = mem.allocate().unwrap();
        mem.pin(shared);
        let mut table = EnvTable::new(0, 4).unwrap();
        table.create_idle(&mem, shared).unwrap();
        // idle used root + one table; one frame left, a new space needs two
        let free_slots = table.free_slots();
        assert_eq!(
            table.allocate(table.idle_id(), &mem, shared),
            Err(KernelError::OutOfMemory)
        );
        assert_eq!(table.free_slots(), free_slots);
    }

    #[test]
    fn test_destroy_then_stale_lookup() {
        let (mem, shared, mut table) = setup(2);
        let idle = table.idle_id();
        let a = table.allocate(idle, &mem, shared).unwrap();
        table.destroy(a, &mem).unwrap();
        assert_eq!(table.lookup(a).err(), Some(KernelError::NotFound));

        let b = table.allocate(idle, &mem, shared).unwrap();
        assert_eq!(a.slot(), b.slot());
        assert_ne!(a, b);
        assert_eq!(table.lookup(a).err(), Some(KernelError::StaleReference));
        assert!(table.lookup(b).is_ok());
    }

    #[test]
    fn test_destroy_idle_refused() {
        let (mem, _shared, mut table) = setup(2);
        let idle = table.idle_id();
        assert_eq!(
            table.destroy(idle, &mem),
            Err(KernelError::PermissionDenied)
        );
    }

    #[test]
    fn test_destroy_reports_cpu_and_frees_space() {
        let (mem, shared, mut table) = setup(4);
        let a = table.allocate(table.idle_id(), &mem, shared).unwrap();
        let free_before = mem.free_count();
        {
            let env = table.lookup_mut(a).unwrap();
            map_fresh(
                env.space_mut().unwrap(),
                &mem,
                0x1000,
                PteFlags::PRESENT | PteFlags::USER,
            )
            .unwrap();
            env.status = EnvStatus::Running;
            env.cpu = Some(1);
        }
        let d = table.destroy(a, &mem).unwrap();
        assert_eq!(d.cpu, Some(1));
        assert_eq!(d.released, 2);
        assert!(mem.free_count() > free_before);
        assert!(table.slot(a.slot()).space.is_none());
    }

    #[test]
    fn test_free_list_fifo_order() {
        let (mem, shared, mut table) = setup(4);
        let idle = table.idle_id();
        let a = table.allocate(idle, &mem, shared).unwrap();
        let b = table.allocate(idle, &mem, shared).unwrap();
        table.destroy(a, &mem).unwrap();
        let c = table.allocate(idle, &mem, shared).unwrap();
        // slot 3 was free before slot 1 came back
        assert_eq!(c.slot(), 3);
        assert_eq!(b.slot(), 2);
    }

    #[test]
    fn test_resolve_self_and_permissions() {
        let (mem, shared, mut table) = setup(4);
        let idle = table.idle_id();
        let a = table.allocate(idle, &mem, shared).unwrap();
        let child = table.allocate(a, &mem, shared).unwrap();
        let stranger = table.allocate(idle, &mem, shared).unwrap();

        assert_eq!(table.resolve(a, EnvId::SELF, true), Ok(a));
        assert_eq!(table.resolve(a, child, true), Ok(child));
        assert_eq!(
            table.resolve(a, stranger, true),
            Err(KernelError::PermissionDenied)
        );
        assert_eq!(table.resolve(a, stranger, false), Ok(stranger));
    }

    #[test]
    fn test_install_foreign_identifier() {
        let (mem, shared, mut table) = setup(4);
        let foreign = EnvId::new(9, 5, 1);
        let space = AddressSpace::create(&mem, shared).unwrap();
        let slot = table
            .install(foreign, EnvId(0), space, TrapFrame::default())
            .map_err(|(e, _)| e)
            .unwrap();
        assert_eq!(table.lookup(foreign).unwrap().id, foreign);

        let space = AddressSpace::create(&mem, shared).unwrap();
        let (err, space) = table
            .install(foreign, EnvId(0), space, TrapFrame::default())
            .unwrap_err();
        assert_eq!(err, KernelError::InvalidArgument);
        space.destroy(&mem);

        // the generation counter moved past the foreign one
        table.destroy(foreign, &mem).unwrap();
        let local = table.allocate(table.idle_id(), &mem, shared).unwrap();
        assert_eq!(slot, 1);
        assert_eq!(local.slot(), 2);
        let again = table.allocate(table.idle_id(), &mem, shared).unwrap();
        assert_eq!(again.slot(), 3);
        let reused = table.allocate(table.idle_id(), &mem, shared).unwrap();
        assert_eq!(reused.slot(), 1);
        assert_eq!(reused.generation(), 10);
    }

    #[test]
    fn test_fork_and_destroy_round_trip() {
        let (mem, shared, mut table) = setup(4);
        let a = table.allocate(table.idle_id(), &mem, shared).unwrap();
        {
            let env = table.lookup_mut(a).unwrap();
            env.tf.set_result(77);
            let space = env.space_mut().unwrap();
            map_fresh(space, &mem, 0x1000, PteFlags::PRESENT | PteFlags::USER | PteFlags::WRITABLE)
                .unwrap();
            space.copy_to_user(&mem, 0x1000, b"data").unwrap();
        }
        let free_before = mem.free_count();
        let slots_before = table.free_slots();

        let child = table.fork(a, &mem, shared).unwrap();
        let c = table.lookup(child).unwrap();
        assert_eq!(c.tf.result(), 0);
        assert_eq!(c.parent, a);
        assert_eq!(
            c.space().unwrap().checksum(&mem),
            table.lookup(a).unwrap().space().unwrap().checksum(&mem)
        );

        table.destroy(child, &mem).unwrap();
        assert_eq!(mem.free_count(), free_before);
        assert_eq!(table.free_slots(), slots_before);
    }
}

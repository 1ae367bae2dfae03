//! Mock HAL implementation for testing PIOS
//!
//! This provides a mock implementation of the HAL trait that can be used
//! for testing the kernel without requiring hardware:
//! - [`MockHal`]: simulated clock, captured debug/console output, interrupt
//!   acknowledgement log, optional attachment to a cluster network
//! - [`MockNetwork`]: in-memory inter-node transport shared by several HALs
//! - [`MockDisk`]: RAM-backed disk device

#![no_std]
extern crate alloc;

use alloc::collections::{BTreeMap, BTreeSet, VecDeque};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use pios_hal::{Device, DeviceClass, HalError, NodeId, HAL, SECTOR_SIZE};
use spin::Mutex;

/// Mock HAL for testing
///
/// Provides simulated time, output capture and message passing for testing
/// kernel logic without a real platform.
pub struct MockHal {
    /// Simulated time in nanoseconds
    time: AtomicU64,
    /// Captured debug messages
    debug_log: Mutex<Vec<String>>,
    /// Captured console output
    console: Mutex<Vec<u8>>,
    /// Interrupt lines acknowledged, in order
    acked: Mutex<Vec<u8>>,
    /// Cluster attachment (network, this node)
    network: Option<(MockNetwork, NodeId)>,
}

impl MockHal {
    /// Create a new mock HAL
    pub fn new() -> Self {
        Self {
            time: AtomicU64::new(0),
            debug_log: Mutex::new(Vec::new()),
            console: Mutex::new(Vec::new()),
            acked: Mutex::new(Vec::new()),
            network: None,
        }
    }

    /// Create a mock HAL with a specific starting time
    pub fn with_time(nanos: u64) -> Self {
        let hal = Self::new();
        hal.set_time(nanos);
        hal
    }

    /// Create a mock HAL attached to `network` as `node`
    pub fn on_network(network: &MockNetwork, node: NodeId) -> Self {
        network.attach(node);
        Self {
            network: Some((network.clone(), node)),
            ..Self::new()
        }
    }

    /// Advance the simulated time by the given duration
    pub fn advance_time(&self, nanos: u64) {
        self.time.fetch_add(nanos, Ordering::SeqCst);
    }

    /// Set the simulated time to a specific value
    pub fn set_time(&self, nanos: u64) {
        self.time.store(nanos, Ordering::SeqCst);
    }

    /// Get all captured debug messages
    pub fn get_debug_log(&self) -> Vec<String> {
        self.debug_log.lock().clone()
    }

    /// Clear the debug log
    pub fn clear_debug_log(&self) {
        self.debug_log.lock().clear();
    }

    /// Check if a specific message was logged
    pub fn has_log_containing(&self, substr: &str) -> bool {
        self.debug_log.lock().iter().any(|msg| msg.contains(substr))
    }

    /// Everything environments have written to the console so far
    pub fn console_output(&self) -> Vec<u8> {
        self.console.lock().clone()
    }

    /// Console output as a (lossy) string
    pub fn console_string(&self) -> String {
        String::from_utf8_lossy(&self.console.lock()).into_owned()
    }

    /// Interrupt lines acknowledged so far
    pub fn acked_interrupts(&self) -> Vec<u8> {
        self.acked.lock().clone()
    }
}

impl Default for MockHal {
    fn default() -> Self {
        Self::new()
    }
}

impl HAL for MockHal {
    fn now_nanos(&self) -> u64 {
        self.time.load(Ordering::SeqCst)
    }

    fn debug_write(&self, msg: &str) {
        self.debug_log.lock().push(String::from(msg));
    }

    fn console_write(&self, bytes: &[u8]) {
        self.console.lock().extend_from_slice(bytes);
    }

    fn ack_interrupt(&self, irq: u8) {
        self.acked.lock().push(irq);
    }

    fn node_send(&self, node: NodeId, msg: &[u8]) -> Result<(), HalError> {
        match &self.network {
            Some((network, me)) => network.deliver(*me, node, msg),
            None => Err(HalError::NotSupported),
        }
    }

    fn node_poll(&self) -> Vec<(NodeId, Vec<u8>)> {
        match &self.network {
            Some((network, me)) => network.drain(*me),
            None => Vec::new(),
        }
    }
}

// ============================================================================
// Cluster network
// ============================================================================

#[derive(Default)]
struct NetworkState {
    /// Per-node inbox of (sender, payload)
    inboxes: BTreeMap<NodeId, VecDeque<(NodeId, Vec<u8>)>>,
    /// Nodes currently cut off from the network
    partitioned: BTreeSet<NodeId>,
    /// Total messages delivered
    delivered: u64,
}

/// In-memory transport connecting several mock HALs.
///
/// Cloning yields another handle to the same network.
#[derive(Clone, Default)]
pub struct MockNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MockNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node inbox
    pub fn attach(&self, node: NodeId) {
        self.state.lock().inboxes.entry(node).or_default();
    }

    /// Cut `node` off: sends to or from it fail with `NodeUnreachable`
    pub fn partition(&self, node: NodeId) {
        self.state.lock().partitioned.insert(node);
    }

    /// Reconnect a partitioned node
    pub fn heal(&self, node: NodeId) {
        self.state.lock().partitioned.remove(&node);
    }

    /// Messages waiting in `node`'s inbox
    pub fn pending(&self, node: NodeId) -> usize {
        self.state
            .lock()
            .inboxes
            .get(&node)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// Total messages delivered since creation
    pub fn delivered(&self) -> u64 {
        self.state.lock().delivered
    }

    fn deliver(&self, from: NodeId, to: NodeId, msg: &[u8]) -> Result<(), HalError> {
        let mut state = self.state.lock();
        if state.partitioned.contains(&from) || state.partitioned.contains(&to) {
            return Err(HalError::NodeUnreachable);
        }
        let inbox = state.inboxes.get_mut(&to).ok_or(HalError::NodeUnreachable)?;
        inbox.push_back((from, msg.to_vec()));
        state.delivered += 1;
        Ok(())
    }

    fn drain(&self, node: NodeId) -> Vec<(NodeId, Vec<u8>)> {
        let mut state = self.state.lock();
        match state.inboxes.get_mut(&node) {
            Some(inbox) => inbox.drain(..).collect(),
            None => Vec::new(),
        }
    }
}

// ============================================================================
// Disk
// ============================================================================

/// RAM-backed disk addressed in 512-byte sectors.
pub struct MockDisk {
    irq: u8,
    sectors: Mutex<Vec<u8>>,
    interrupts: AtomicU64,
}

impl MockDisk {
    /// Create a zero-filled disk with `sector_count` sectors raising `irq`
    pub fn new(irq: u8, sector_count: usize) -> Self {
        Self {
            irq,
            sectors: Mutex::new(vec![0u8; sector_count * SECTOR_SIZE]),
            interrupts: AtomicU64::new(0),
        }
    }

    /// Create a disk holding `image` (padded to whole sectors)
    pub fn with_image(irq: u8, image: &[u8]) -> Self {
        let count = image.len().div_ceil(SECTOR_SIZE).max(1);
        let disk = Self::new(irq, count);
        disk.sectors.lock()[..image.len()].copy_from_slice(image);
        disk
    }

    /// Number of interrupts serviced
    pub fn interrupts_handled(&self) -> u64 {
        self.interrupts.load(Ordering::SeqCst)
    }
}

impl Device for MockDisk {
    fn class(&self) -> DeviceClass {
        DeviceClass::Disk
    }

    fn irq(&self) -> Option<u8> {
        Some(self.irq)
    }

    fn handle_interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, HalError> {
        let sectors = self.sectors.lock();
        let start = (offset as usize)
            .checked_mul(SECTOR_SIZE)
            .ok_or(HalError::InvalidArgument)?;
        let end = start.checked_add(buf.len()).ok_or(HalError::InvalidArgument)?;
        if end > sectors.len() {
            return Err(HalError::IoError);
        }
        buf.copy_from_slice(&sectors[start..end]);
        Ok(buf.len())
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<usize, HalError> {
        let mut sectors = self.sectors.lock();
        let start = (offset as usize)
            .checked_mul(SECTOR_SIZE)
            .ok_or(HalError::InvalidArgument)?;
        let end = start.checked_add(data.len()).ok_or(HalError::InvalidArgument)?;
        if end > sectors.len() {
            return Err(HalError::IoError);
        }
        sectors[start..end].copy_from_slice(data);
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_hal_time() {
        let hal = MockHal::new();
        assert_eq!(hal.now_nanos(), 0);

        hal.advance_time(1_000_000_000); // 1 second
        assert_eq!(hal.now_nanos(), 1_000_000_000);

        hal.advance_time(500_000_000);
        assert_eq!(hal.now_nanos(), 1_500_000_000);
    }

    #[test]
    fn test_mock_hal_debug_log() {
        let hal = MockHal::new();

        hal.debug_write("Hello");
        hal.debug_write("World");

        let log = hal.get_debug_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0], "Hello");
        assert!(hal.has_log_containing("Wor"));
        assert!(!hal.has_log_containing("Foo"));

        hal.clear_debug_log();
        assert!(hal.get_debug_log().is_empty());
    }

    #[test]
    fn test_mock_hal_console_capture() {
        let hal = MockHal::new();
        hal.console_write(b"hello ");
        hal.console_write(b"world");
        assert_eq!(hal.console_string(), "hello world");
    }

    #[test]
    fn test_mock_hal_ack_log() {
        let hal = MockHal::new();
        hal.ack_interrupt(0);
        hal.ack_interrupt(14);
        assert_eq!(hal.acked_interrupts(), vec![0, 14]);
    }

    #[test]
    fn test_network_roundtrip_between_nodes() {
        let net = MockNetwork::new();
        let a = MockHal::on_network(&net, 1);
        let b = MockHal::on_network(&net, 2);

        a.node_send(2, b"ping").unwrap();
        assert_eq!(net.pending(2), 1);

        let msgs = b.node_poll();
        assert_eq!(msgs, vec![(1, b"ping".to_vec())]);
        assert!(b.node_poll().is_empty());
        assert_eq!(net.delivered(), 1);
    }

    #[test]
    fn test_network_unknown_node_unreachable() {
        let net = MockNetwork::new();
        let a = MockHal::on_network(&net, 1);
        assert_eq!(a.node_send(9, b"x"), Err(HalError::NodeUnreachable));
    }

    #[test]
    fn test_network_partition_and_heal() {
        let net = MockNetwork::new();
        let a = MockHal::on_network(&net, 1);
        let _b = MockHal::on_network(&net, 2);

        net.partition(2);
        assert_eq!(a.node_send(2, b"x"), Err(HalError::NodeUnreachable));

        net.heal(2);
        assert!(a.node_send(2, b"x").is_ok());
    }

    #[test]
    fn test_hal_without_network() {
        let hal = MockHal::new();
        assert_eq!(hal.node_send(1, b"x"), Err(HalError::NotSupported));
        assert!(hal.node_poll().is_empty());
    }

    #[test]
    fn test_disk_read_write() {
        let disk = MockDisk::new(14, 4);
        let data = [0xABu8; SECTOR_SIZE];
        assert_eq!(disk.write(2, &data).unwrap(), SECTOR_SIZE);

        let mut buf = [0u8; SECTOR_SIZE];
        disk.read(2, &mut buf).unwrap();
        assert_eq!(buf, data);

        assert_eq!(disk.read(4, &mut buf), Err(HalError::IoError));
    }

    #[test]
    fn test_disk_with_image_and_interrupts() {
        let disk = MockDisk::with_image(14, b"boot sector");
        let mut buf = [0u8; 11];
        disk.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"boot sector");

        assert_eq!(disk.irq(), Some(14));
        disk.handle_interrupt();
        disk.handle_interrupt();
        assert_eq!(disk.interrupts_handled(), 2);
    }
}

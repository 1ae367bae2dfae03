//! Hardware Abstraction Layer trait for PIOS
//!
//! This crate defines the narrow platform interface the kernel runs on. The
//! kernel never touches device registers directly: time, console output,
//! interrupt acknowledgement and the node-to-node transport all go through
//! [`HAL`], and device drivers plug in through [`Device`].
//!
//! # Platform Implementations
//!
//! - **Mock**: `pios-hal-mock`, used by every test suite
//! - **QEMU / bare metal**: interrupt controller and UART behind the same trait

#![no_std]

extern crate alloc;

use alloc::vec::Vec;

/// Identifier of a kernel instance in the cluster.
pub type NodeId = u16;

/// Hardware Abstraction Layer trait
///
/// Implementations provide platform-specific functionality for:
/// - Time measurement
/// - Debug and console output
/// - Interrupt controller acknowledgement
/// - The inter-node transport used by migration
pub trait HAL: Send + Sync + 'static {
    // === Time ===

    /// Get current time in nanoseconds (monotonic)
    fn now_nanos(&self) -> u64;

    // === Debug / console ===

    /// Write a kernel diagnostic line to the platform's debug log
    fn debug_write(&self, msg: &str);

    /// Write bytes produced by an environment to the console
    fn console_write(&self, bytes: &[u8]);

    // === Interrupts ===

    /// Acknowledge an interrupt line at the interrupt controller
    ///
    /// Called by the dispatcher before the registered device handler runs.
    fn ack_interrupt(&self, irq: u8);

    // === Inter-node transport ===

    /// Send an opaque message to another kernel instance
    ///
    /// # Returns
    /// * `Ok(())` - Message handed to the transport
    /// * `Err(HalError::NodeUnreachable)` - No route to `node`
    fn node_send(&self, node: NodeId, msg: &[u8]) -> Result<(), HalError> {
        let _ = (node, msg);
        Err(HalError::NotSupported)
    }

    /// Poll for messages from other kernel instances (non-blocking)
    ///
    /// Returns a list of (sender node, message bytes) pairs
    fn node_poll(&self) -> Vec<(NodeId, Vec<u8>)> {
        Vec::new()
    }
}

/// Class of a device, used to route device-backed syscalls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceClass {
    /// Block storage, addressed in sectors
    Disk,
    /// Network interface
    Network,
    /// Programmable timer
    Timer,
    /// Console / UART
    Console,
}

/// Size of a disk sector in bytes
pub const SECTOR_SIZE: usize = 512;

/// Capability interface every device driver exposes to the kernel.
///
/// The kernel neither parses device protocols nor owns device state; it only
/// routes interrupts to [`Device::handle_interrupt`] and forwards reads and
/// writes requested by higher layers.
pub trait Device: Send + Sync {
    /// Device class
    fn class(&self) -> DeviceClass;

    /// Interrupt line this device raises, if any
    fn irq(&self) -> Option<u8>;

    /// Service an interrupt. The line has already been acknowledged.
    fn handle_interrupt(&self);

    /// Read from the device starting at `offset` (sectors for disks)
    ///
    /// Returns the number of bytes read.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, HalError>;

    /// Write to the device starting at `offset`
    ///
    /// Returns the number of bytes written.
    fn write(&self, offset: u64, data: &[u8]) -> Result<usize, HalError>;
}

/// HAL errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HalError {
    /// Operation not supported on this platform
    NotSupported,
    /// I/O error
    IoError,
    /// Invalid argument (bad offset, misaligned length)
    InvalidArgument,
    /// Target node is not reachable
    NodeUnreachable,
    /// Device is busy
    Busy,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHal;

    impl HAL for NullHal {
        fn now_nanos(&self) -> u64 {
            0
        }
        fn debug_write(&self, _msg: &str) {}
        fn console_write(&self, _bytes: &[u8]) {}
        fn ack_interrupt(&self, _irq: u8) {}
    }

    #[test]
    fn test_default_transport_not_supported() {
        let hal = NullHal;
        assert_eq!(hal.node_send(1, b"x"), Err(HalError::NotSupported));
        assert!(hal.node_poll().is_empty());
    }

    #[test]
    fn test_device_class_ordering() {
        assert!(DeviceClass::Disk < DeviceClass::Console);
        assert_ne!(DeviceClass::Disk, DeviceClass::Network);
    }
}

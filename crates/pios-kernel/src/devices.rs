//! Device registry
//!
//! Drivers are external collaborators. The kernel only keeps a handle per
//! device, routes interrupt lines to `Device::handle_interrupt` and looks
//! devices up by class for device-backed syscalls.

use alloc::sync::Arc;
use alloc::vec::Vec;

use pios_hal::{Device, DeviceClass, HalError};
use pios_kernel_core::{KernelError, KernelResult};

/// Map a platform error onto the syscall error space
pub fn device_error(e: HalError) -> KernelError {
    match e {
        HalError::NotSupported => KernelError::NotSupported,
        _ => KernelError::Device,
    }
}

#[derive(Default)]
pub struct DeviceRegistry {
    devices: Vec<Arc<dyn Device>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device. Two devices may not share an interrupt line.
    pub fn register(&mut self, device: Arc<dyn Device>) -> KernelResult<()> {
        if let Some(irq) = device.irq() {
            if self.by_irq(irq).is_some() {
                return Err(KernelError::InvalidArgument);
            }
        }
        self.devices.push(device);
        Ok(())
    }

    /// Device raising `irq`
    pub fn by_irq(&self, irq: u8) -> Option<Arc<dyn Device>> {
        self.devices
            .iter()
            .find(|d| d.irq() == Some(irq))
            .cloned()
    }

    /// First registered device of `class`
    pub fn by_class(&self, class: DeviceClass) -> Option<Arc<dyn Device>> {
        self.devices.iter().find(|d| d.class() == class).cloned()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

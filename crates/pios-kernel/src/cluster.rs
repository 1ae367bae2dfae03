//! Node-to-node protocol
//!
//! Messages travel over `HAL::node_send` / `HAL::node_poll` as JSON. The
//! transport is responsible for delivery; a message that fails to decode is
//! dropped by the receiver.

use alloc::vec::Vec;

use pios_kernel_core::{EnvId, KernelError, KernelResult, MigrationRecord};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeMessage {
    /// Origin to target: rebuild this environment
    Migrate(MigrationRecord),
    /// Target to origin: 0 on success, otherwise a negative error code
    MigrateAck { env: EnvId, result: i64 },
}

impl NodeMessage {
    pub fn encode(&self) -> KernelResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|_| KernelError::InvalidArgument)
    }

    pub fn decode(bytes: &[u8]) -> KernelResult<Self> {
        serde_json::from_slice(bytes).map_err(|_| KernelError::InvalidArgument)
    }
}

//! Session VM management
//!
//! This module provides the isolated workspace each session runs in:
//! - VM value types and on-disk metadata (`models`)
//! - configuration with environment overrides (`config`)
//! - local directory and docker container backends (`backend`)
//! - session-to-VM binding (`manager`)

pub mod backend;
pub mod config;
pub mod manager;
pub mod models;

pub use backend::{DockerVmBackend, LocalVmBackend, VmBackend, VmStore};
pub use config::{BackendChoice, VmConfig};
pub use manager::{get_vm_manager, reset_vm_manager, sanitize, vm_id_for, VmManager, VmSpecOverrides};
pub use models::{
    NetOutbound, VirtualMachine, VirtualMachineState, VmBackendKind, VmNetworkPolicy, VmResources, VmSpec,
};

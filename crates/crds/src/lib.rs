//! KubeVirt resource definitions
//!
//! Typed views of the KubeVirt objects the VM controller creates, watches
//! and snapshots. The CRDs themselves are installed and owned by KubeVirt; these types only
//! cover the fields the controller reads or writes.

pub mod labels;
pub mod virtual_machine;
pub mod virtual_machine_instance;
pub mod virtual_machine_snapshot;

pub use labels::*;
pub use virtual_machine::*;
pub use virtual_machine_instance::*;
pub use virtual_machine_snapshot::*;

//! Ringleader cloud provider abstraction
//!
//! This crate defines the provider interface the provisioning logic is
//! written against, so the orchestrator never talks to a concrete cloud
//! SDK directly.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                 Ringleader CLI                   │
//! │               (ringleader create)                │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │             ringleader-provision                 │
//! │   allocator / topology / firewall / launcher     │
//! │              orchestrator + rollback             │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │              ringleader-cloud                    │
//! │          trait NodeProvider { ... }              │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//!          ┌────────▼────────┐
//!          │  aws provider   │
//!          │ (EC2/CloudWatch)│
//!          └─────────────────┘
//! ```

pub mod error;
pub mod model;
pub mod provider;

// Re-exports
pub use error::{CloudError, Result};
pub use model::{
    AllocatedAddress, AttachedVolume, BlockDevice, ImageBlockDevice, IngressRule, Instance,
    InstanceState, LaunchSpec, MachineImage, NodeAddress, Subnet, VolumeSpec,
};
pub use provider::NodeProvider;

//! # Kubejoin Common
//!
//! Shared types, constants, and the error taxonomy used across kubejoin components.
//!
//! ## Modules
//! - `types` - Core data structures (BootstrapToken, TrustBundle, ClusterMember, JoinPlan)
//! - `error` - Join error taxonomy
//! - `constants` - Ports, intervals, and certificate base names

pub mod constants;
pub mod error;
pub mod types;

pub use error::JoinError;
pub use types::*;

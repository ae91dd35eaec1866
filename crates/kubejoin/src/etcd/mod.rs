//! Storage cluster membership join.
//!
//! Implements:
//! - Membership listing with a convergence wait, and self registration
//! - Join planning (new cluster vs existing cluster, initial-cluster string)
//! - The launch command for the local member

pub mod command;
pub mod membership;
pub mod planner;

pub use command::{EtcdCommand, MemberSettings};
pub use membership::{
    EtcdConnector, MembershipClient, MembershipConnector, MembershipSnapshot, is_self_present,
    list_converged_members,
};
pub use planner::JoinPlanner;

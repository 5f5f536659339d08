//! Workload apply CLI.
//!
//! Applies declarative workload resources to a supply-chain cluster: input
//! assembly, source resolution, three-way reconciliation, diff and consent,
//! submission and the post-apply wait.

pub mod commands;
pub mod diff;
pub mod input;
pub mod k8s;
pub mod lsp;
pub mod source;
pub mod workload;

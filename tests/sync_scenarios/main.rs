//! Multi-replica sync scenarios
//!
//! Replicas keep their own local gateway and exchange CARs and metas
//! through a shared remote memory gateway.

#[path = "../common/mod.rs"]
mod common;

mod convergence;
mod interceptors;
mod offline;

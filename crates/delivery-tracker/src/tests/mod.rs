//! Scenario tests for the delivery tracker.
//!
//! - `harness.rs`     - Recording scheduler and publisher, stub pipeline, flaky store
//! - `recovery.rs`    - Loading, forgetting and re-hydrating partitions
//! - `persistence.rs` - Persistence cycles, conflicts and the failure budget
//! - `processing.rs`  - Handler, processor and replay paths
//! - `acks.rs`        - Acknowledgement handling
//! - `cache.rs`       - Cache behaviour against a failing store
//! - `rebalance.rs`   - Starting offsets and assignment changes

mod cache;
pub(crate) mod harness;
mod processing;

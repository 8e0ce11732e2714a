//! Workspace facade crate.
//!
//! Re-exports the individual workspace crates so the WorkLog application can
//! depend on `worklog-workspace` alone instead of wiring each crate by hand.

pub use bridge_traits as bridge;
pub use core_data as data;
pub use core_runtime as runtime;

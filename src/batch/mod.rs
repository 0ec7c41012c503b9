//! Normalizing caller input into jobs and grouping them by execution target.

pub mod group;
pub mod input;

pub use group::{group, Group, GroupKey};
pub use input::{normalize, Batch, BatchBuilder, JobInput};

//! Core data structures shared by the capture and analysis paths.

pub mod frame_tree;
pub mod interval_tree;
pub mod registry;

pub use frame_tree::{FrameTree, NodeIndex};
pub use interval_tree::{Interval, IntervalTree, Removal, RemovedInterval};
pub use registry::Registry;

//! Process-wide tracking machinery: the singleton gate, the recursion
//! guard, and the background memory sampler.

pub mod guard;
pub mod rss;
pub mod tracker;

pub use guard::RecursionGuard;
pub use tracker::Tracker;

//! Tracker configuration.

use std::time::Duration;

use crate::format::FileFormat;

/// Configuration for a tracking session.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Capture the native (C/C++) stack alongside the managed stack.
    pub native_traces: bool,

    /// Re-create the tracker in child processes after `fork`.
    pub follow_fork: bool,

    /// Also hook the runtime's small-object allocator domain.
    pub trace_runtime_allocators: bool,

    /// Emit object birth/death records alongside allocations.
    pub track_object_lifetimes: bool,

    /// How often the background sampler appends a resident-set-size record.
    pub memory_interval: Duration,

    /// On-disk layout of the capture (full stream or pre-aggregated).
    pub file_format: FileFormat,

    /// Command line recorded in the capture header.
    pub command_line: String,

    /// Rewrite allocator relocations in every loaded image so foreign
    /// code is intercepted. Disabled by embedders that feed the tracker
    /// events themselves (and by the test suites).
    pub patch_symbols: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            native_traces: false,
            follow_fork: false,
            trace_runtime_allocators: false,
            track_object_lifetimes: false,
            memory_interval: Duration::from_millis(10),
            file_format: FileFormat::AllAllocations,
            command_line: std::env::args().collect::<Vec<_>>().join(" "),
            patch_symbols: true,
        }
    }
}

impl TrackerConfig {
    /// Builder pattern: enable native stack capture.
    pub fn with_native_traces(mut self, enable: bool) -> Self {
        self.native_traces = enable;
        self
    }

    /// Builder pattern: follow forked children.
    pub fn with_follow_fork(mut self, enable: bool) -> Self {
        self.follow_fork = enable;
        self
    }

    /// Builder pattern: hook the runtime allocator domain.
    pub fn with_runtime_allocators(mut self, enable: bool) -> Self {
        self.trace_runtime_allocators = enable;
        self
    }

    /// Builder pattern: emit object lifetime records.
    pub fn with_object_lifetimes(mut self, enable: bool) -> Self {
        self.track_object_lifetimes = enable;
        self
    }

    /// Builder pattern: set the RSS sampling interval.
    pub fn with_memory_interval(mut self, interval: Duration) -> Self {
        self.memory_interval = interval;
        self
    }

    /// Builder pattern: set the capture file format.
    pub fn with_file_format(mut self, format: FileFormat) -> Self {
        self.file_format = format;
        self
    }

    /// Builder pattern: override the recorded command line.
    pub fn with_command_line(mut self, command_line: impl Into<String>) -> Self {
        self.command_line = command_line.into();
        self
    }

    /// Builder pattern: control relocation patching.
    pub fn with_symbol_patching(mut self, enable: bool) -> Self {
        self.patch_symbols = enable;
        self
    }
}

//! Resident-set-size sampling.
//!
//! A background thread appends a memory record every `memory_interval` so
//! reports can plot RSS against the allocation stream. The thread keeps
//! the recursion guard permanently raised: its own allocations are
//! invisible to the interceptors.

use std::sync::Weak;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::debug;

use crate::core::guard::RecursionGuard;
use crate::core::tracker::Tracker;

/// Resident set size of this process in bytes; 0 when it cannot be read.
#[cfg(target_os = "linux")]
pub fn read_resident_set_size() -> usize {
    // /proc/self/statm: total resident shared text lib data dirty, in pages.
    let statm = match std::fs::read_to_string("/proc/self/statm") {
        Ok(contents) => contents,
        Err(_) => return 0,
    };
    let resident_pages: usize = statm
        .split_whitespace()
        .nth(1)
        .and_then(|field| field.parse().ok())
        .unwrap_or(0);
    resident_pages * page_size()
}

/// Resident set size of this process in bytes; 0 when it cannot be read.
#[cfg(target_os = "macos")]
pub fn read_resident_set_size() -> usize {
    let pid = unsafe { libc::getpid() };
    let mut info: libc::proc_taskinfo = unsafe { std::mem::zeroed() };
    let size = std::mem::size_of::<libc::proc_taskinfo>() as libc::c_int;
    let written = unsafe {
        libc::proc_pidinfo(
            pid,
            libc::PROC_PIDTASKINFO,
            0,
            &mut info as *mut _ as *mut libc::c_void,
            size,
        )
    };
    if written != size {
        return 0;
    }
    info.pti_resident_size as usize
}

#[cfg(target_os = "linux")]
fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Handle to the running sampler thread.
pub struct MemorySampler {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl MemorySampler {
    /// Spawn the sampler. It exits when signalled, when the tracker is
    /// gone, or when an RSS sample reads as zero (which also deactivates
    /// tracking).
    pub fn start(tracker: Weak<Tracker>, interval: Duration) -> MemorySampler {
        let (stop, wakeup) = bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("heaptrail-rss".into())
            .spawn(move || {
                RecursionGuard::set_active();
                loop {
                    match wakeup.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                    }
                    let Some(tracker) = tracker.upgrade() else {
                        return;
                    };
                    if !tracker.sample_memory() {
                        return;
                    }
                }
            })
            .expect("failed to spawn the RSS sampler thread");
        MemorySampler {
            stop,
            handle: Some(handle),
        }
    }

    /// Signal the thread and join it.
    pub fn stop(mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                debug!("RSS sampler thread panicked during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rss_is_nonzero_for_a_live_process() {
        assert!(read_resident_set_size() > 0);
    }
}

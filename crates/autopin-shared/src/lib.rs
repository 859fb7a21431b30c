pub mod artifacts;
pub mod perf_event;
pub mod pinning;
pub mod process_tree;

/// Process identifier as reported by the kernel.
pub type Pid = libc::pid_t;
/// Thread identifier. Shares the pid namespace, the main thread's tid equals its pid.
pub type Tid = libc::pid_t;

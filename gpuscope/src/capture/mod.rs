//! Capture frontend: eBPF program loading/attachment and the kernel
//! ring-buffer drain that feeds the in-process channel.

pub mod drain;
pub mod ebpf_setup;

pub use drain::{run_drain, Assembler, CaptureStats};
pub use ebpf_setup::{attach_probes, init_ebpf_logger, install_filter, load_ebpf_program, ProbeTargets};

//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "gpuscope",
    about = "Trace LLM runtime activity with eBPF and publish it on a pub/sub bus",
    after_help = "\
EXAMPLES:
    sudo gpuscope --comm ollama --ggml-base-lib /usr/lib/ollama/libggml-base.so
    sudo gpuscope --pid 1234 --cudart-lib /opt/cuda/targets/x86_64-linux/lib/libcudart.so
    sudo gpuscope --endpoint tcp://127.0.0.1:5555"
)]
pub struct Args {
    /// Only capture events from this process id (0 = all processes)
    #[arg(short, long, default_value = "0")]
    pub pid: u32,

    /// Only capture events from commands starting with this name
    #[arg(short, long)]
    pub comm: Option<String>,

    /// Publish endpoint for the two-frame event stream
    #[arg(short, long, default_value = "ipc:///tmp/gpuscope.sock")]
    pub endpoint: String,

    /// Compiled eBPF object (cargo xtask build-ebpf)
    #[arg(long, default_value = "target/bpfel-unknown-none/release/gpuscope")]
    pub bpf_object: PathBuf,

    /// Path to libggml-base.so (enables malloc/free probes)
    #[arg(long)]
    pub ggml_base_lib: Option<PathBuf>,

    /// Path to the libggml-cpu variant (enables graph-compute probes)
    #[arg(long)]
    pub ggml_cpu_lib: Option<PathBuf>,

    /// Path to libggml-cuda.so (enables matmul timing probes)
    #[arg(long)]
    pub ggml_cuda_lib: Option<PathBuf>,

    /// Path to libcudart.so (enables CUDA runtime probes)
    #[arg(long)]
    pub cudart_lib: Option<PathBuf>,

    /// Path to the ollama binary (enables llamaLog capture)
    #[arg(long)]
    pub ollama_bin: Option<PathBuf>,

    /// In-process channel capacity in bytes
    #[arg(long, default_value = "1048576")]
    pub ring_bytes: usize,

    /// Maximum in-flight entry/exit correlations
    #[arg(long, default_value = "10240")]
    pub correlator_capacity: usize,

    /// Consumer poll timeout in milliseconds (bounds shutdown latency)
    #[arg(long, default_value = "100")]
    pub poll_timeout_ms: u64,

    /// Stop after N seconds (0 = run until Ctrl-C)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

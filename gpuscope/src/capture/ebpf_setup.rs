//! # eBPF Program Loading and Attachment
//!
//! Glue around the external attach machinery: loads the cross-compiled eBPF
//! object, installs the capture filter, and attaches each probe to its
//! target symbol or tracepoint. Which uprobe groups are attached depends on
//! which target libraries were configured; a host without CUDA simply
//! never asks for the CUDA probes.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use aya::maps::HashMap;
use aya::programs::{FEntry, TracePoint, UProbe};
use aya::{Btf, Ebpf};
use aya_log::EbpfLogger;
use gpuscope_common::FilterConfig;
use log::{info, warn};

/// Mangled symbols of the timed CUDA kernels inside libggml-cuda.
const MUL_MAT_VEC_Q_SYM: &str =
    "_Z26ggml_cuda_op_mul_mat_vec_qR25ggml_backend_cuda_contextPK11ggml_tensorS3_PS1_PKcPKfS6_PfllllP11CUstream_st";
const MUL_MAT_Q_SYM: &str =
    "_Z22ggml_cuda_op_mul_mat_qR25ggml_backend_cuda_contextPK11ggml_tensorS3_PS1_PKcPKfS6_PfllllP11CUstream_st";

/// Instrumentation targets resolved from the command line. Every group is
/// optional.
#[derive(Debug, Default)]
pub struct ProbeTargets {
    /// libggml-base: `ggml_aligned_malloc` / `ggml_aligned_free`.
    pub ggml_base_lib: Option<PathBuf>,
    /// libggml-cpu: `ggml_graph_compute`.
    pub ggml_cpu_lib: Option<PathBuf>,
    /// libggml-cuda: the timed matmul kernels.
    pub ggml_cuda_lib: Option<PathBuf>,
    /// libcudart: the CUDA runtime API.
    pub cudart_lib: Option<PathBuf>,
    /// The ollama binary: `llamaLog`.
    pub ollama_bin: Option<PathBuf>,
}

/// Load the cross-compiled eBPF object.
///
/// The object is produced by `cargo xtask build-ebpf` and loaded from disk
/// at startup, so the agent binary itself builds and links without the
/// nightly BPF toolchain.
pub fn load_ebpf_program(path: &Path) -> Result<Ebpf> {
    let bpf = Ebpf::load_file(path)
        .with_context(|| format!("failed to load eBPF object {} (build it with `cargo xtask build-ebpf`)", path.display()))?;
    Ok(bpf)
}

/// Initialize eBPF logger
pub fn init_ebpf_logger(bpf: &mut Ebpf) {
    if let Err(e) = EbpfLogger::init(bpf) {
        warn!("Failed to initialize eBPF logger: {e}");
    }
}

/// Install the immutable capture filter into the `FILTER` map. Must happen
/// before any probe is attached.
pub fn install_filter(bpf: &mut Ebpf, filter: FilterConfig) -> Result<()> {
    let mut map: HashMap<_, u32, FilterConfig> =
        HashMap::try_from(bpf.map_mut("FILTER").context("FILTER map not found")?)?;
    map.insert(0, filter, 0)?;
    Ok(())
}

fn attach_uprobe(bpf: &mut Ebpf, name: &str, symbol: &str, target: &Path) -> Result<()> {
    let program: &mut UProbe = bpf
        .program_mut(name)
        .with_context(|| format!("program {name} not found"))?
        .try_into()?;
    program.load()?;
    program
        .attach(Some(symbol), 0, target, None)
        .with_context(|| format!("failed to attach {name} to {symbol} in {}", target.display()))?;
    info!("attached uprobe {name} -> {symbol}");
    Ok(())
}

fn attach_tracepoint(bpf: &mut Ebpf, name: &str, category: &str, event: &str) -> Result<()> {
    let program: &mut TracePoint = bpf
        .program_mut(name)
        .with_context(|| format!("program {name} not found"))?
        .try_into()?;
    program.load()?;
    program
        .attach(category, event)
        .with_context(|| format!("failed to attach tracepoint {category}/{event}"))?;
    info!("attached tracepoint {category}/{event}");
    Ok(())
}

/// Attach every configured probe group. Returns the number of programs
/// attached; a configured group that cannot attach is fatal, matching the
/// startup error policy.
pub fn attach_probes(bpf: &mut Ebpf, targets: &ProbeTargets) -> Result<usize> {
    let mut attached = 0;

    // Kernel-side probes are always on.
    attach_tracepoint(bpf, "sched_switch", "sched", "sched_switch")?;
    attached += 1;
    attach_tracepoint(bpf, "sys_enter_execve", "syscalls", "sys_enter_execve")?;
    attached += 1;

    // File-open capture needs BTF for the fentry attachment; degrade
    // gracefully on kernels without it.
    match attach_openat(bpf) {
        Ok(()) => attached += 1,
        Err(e) => warn!("file-open capture disabled: {e}"),
    }

    if let Some(lib) = &targets.ggml_base_lib {
        attach_uprobe(bpf, "ggml_malloc_enter", "ggml_aligned_malloc", lib)?;
        attach_uprobe(bpf, "ggml_malloc_exit", "ggml_aligned_malloc", lib)?;
        attach_uprobe(bpf, "ggml_free_enter", "ggml_aligned_free", lib)?;
        attached += 3;
    }
    if let Some(lib) = &targets.ggml_cpu_lib {
        attach_uprobe(bpf, "graph_compute_enter", "ggml_graph_compute", lib)?;
        attach_uprobe(bpf, "graph_compute_exit", "ggml_graph_compute", lib)?;
        attached += 2;
    }
    if let Some(lib) = &targets.ggml_cuda_lib {
        attach_uprobe(bpf, "mul_mat_vec_q_enter", MUL_MAT_VEC_Q_SYM, lib)?;
        attach_uprobe(bpf, "mul_mat_vec_q_exit", MUL_MAT_VEC_Q_SYM, lib)?;
        attach_uprobe(bpf, "mul_mat_q_enter", MUL_MAT_Q_SYM, lib)?;
        attach_uprobe(bpf, "mul_mat_q_exit", MUL_MAT_Q_SYM, lib)?;
        attached += 4;
    }
    if let Some(lib) = &targets.cudart_lib {
        attach_uprobe(bpf, "cuda_malloc_enter", "cudaMalloc", lib)?;
        attach_uprobe(bpf, "cuda_malloc_exit", "cudaMalloc", lib)?;
        attach_uprobe(bpf, "cuda_free_enter", "cudaFree", lib)?;
        attach_uprobe(bpf, "cuda_launch_kernel", "cudaLaunchKernel", lib)?;
        attach_uprobe(bpf, "cuda_memcpy", "cudaMemcpy", lib)?;
        attach_uprobe(bpf, "cuda_sync_enter", "cudaDeviceSynchronize", lib)?;
        attach_uprobe(bpf, "cuda_sync_exit", "cudaDeviceSynchronize", lib)?;
        attached += 7;
    }
    if let Some(bin) = &targets.ollama_bin {
        attach_uprobe(bpf, "llama_log", "llamaLog", bin)?;
        attached += 1;
    }

    Ok(attached)
}

fn attach_openat(bpf: &mut Ebpf) -> Result<()> {
    let btf = Btf::from_sys_fs().context("kernel BTF unavailable")?;
    let program: &mut FEntry = bpf
        .program_mut("openat2_entry")
        .context("openat2_entry program not found")?
        .try_into()?;
    program.load("do_sys_openat2", &btf)?;
    program.attach()?;
    info!("attached fentry do_sys_openat2");
    Ok(())
}

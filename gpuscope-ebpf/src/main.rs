//! # eBPF Kernel-Side Capture
//!
//! The probe programs that run inside the kernel: uprobes on the ggml /
//! CUDA / ollama symbols, tracepoints for scheduler switches and execs, and
//! an fentry hook for file opens.
//!
//! Every program follows the same bounded shape: evaluate the capture
//! filter, reserve a fixed-size record in the `EVENTS` ring buffer, fill
//! it, submit. A failed reservation means the buffer is full and the event
//! is silently dropped; a failed user-memory read discards the reservation
//! so the consumer never sees a half-written record. Paired calls emit
//! small ENTRY/EXIT records; the userspace assembler joins them, keeping
//! the in-kernel state to the single `cudaMalloc` out-parameter map.
//!
//! ## Build
//!
//! ```bash
//! cargo xtask build-ebpf --release
//! ```

#![no_std]
#![no_main]
#![allow(unused_unsafe)]

use aya_ebpf::{
    helpers::{
        bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_get_smp_processor_id,
        bpf_ktime_get_ns, bpf_probe_read_user, bpf_probe_read_user_str_bytes,
    },
    macros::{fentry, map, tracepoint, uprobe, uretprobe},
    maps::{HashMap, RingBuf},
    programs::{FEntryContext, ProbeContext, RetProbeContext, TracePointContext},
    EbpfContext,
};
use aya_log_ebpf::debug;
use gpuscope_common::{
    CudaFreeRecord, EntryRecord, ExecRecord, ExitRecord, FilterConfig, LaunchRecord, LogRecord,
    MemRecord, MemcpyRecord, OpenRecord, RecordHeader, SchedRecord, SchedSwitchArgs,
    EXEC_MAX_ARGS, MEMCPY_DEFAULT, MEMCPY_HOST_TO_HOST, MEMCPY_KIND_UNKNOWN, MEM_FREE,
    REC_CUDA_FREE, REC_ENTRY, REC_EXEC, REC_EXIT, REC_LAUNCH, REC_LOG, REC_MEM, REC_MEMCPY,
    REC_OPEN, REC_SCHED, SCHED_SWITCH_IN, SCHED_SWITCH_OUT, SRC_CUDA_MALLOC, SRC_CUDA_SYNC,
    SRC_GGML_MALLOC, SRC_GRAPH_COMPUTE, SRC_MUL_MAT_Q, SRC_MUL_MAT_VEC_Q, TASK_COMM_LEN,
};

// ============================================================================
// Maps
// ============================================================================

/// Event stream to userspace.
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(1024 * 1024, 0);

/// Capture filter, written once by userspace before attachment (key 0).
#[map]
static FILTER: HashMap<u32, FilterConfig> = HashMap::with_max_entries(1, 0);

/// `cudaMalloc` argument glue: the caller's `void **devPtr`, needed again
/// at return time to read back the allocated pointer.
#[map]
static CUDA_MALLOC_ARGS: HashMap<u32, u64> = HashMap::with_max_entries(10240, 0);

/// Offset of `order` inside `struct ggml_cgraph` (after three ints plus
/// padding, four table pointers and the visited hash set).
const GGML_CGRAPH_ORDER_OFFSET: usize = 72;

// ============================================================================
// Helpers
// ============================================================================

fn current_pid() -> u32 {
    (unsafe { bpf_get_current_pid_tgid() } >> 32) as u32
}

/// Identity of the current task if it passes the capture filter.
fn current_if_allowed() -> Option<(u32, [u8; TASK_COMM_LEN])> {
    let pid = current_pid();
    let comm = bpf_get_current_comm().unwrap_or([0u8; TASK_COMM_LEN]);
    if filter_allows(pid, &comm) {
        Some((pid, comm))
    } else {
        None
    }
}

fn filter_allows(pid: u32, comm: &[u8; TASK_COMM_LEN]) -> bool {
    match unsafe { FILTER.get(&0) } {
        Some(f) => f.allows(pid, comm),
        None => true,
    }
}

/// Reserve-write-submit for the small fixed records built on the stack.
fn output<T>(rec: T) -> u32 {
    match EVENTS.reserve::<T>(0) {
        Some(mut slot) => {
            slot.write(rec);
            slot.submit(0);
            0
        }
        None => 0, // buffer full: drop
    }
}

fn emit_entry(pid: u32, comm: [u8; TASK_COMM_LEN], source: u32, args: [u64; 2]) -> u32 {
    output(EntryRecord {
        hdr: RecordHeader::new(REC_ENTRY, pid, comm),
        source,
        _pad: 0,
        ts_ns: unsafe { bpf_ktime_get_ns() },
        args,
    })
}

fn emit_exit(pid: u32, comm: [u8; TASK_COMM_LEN], source: u32, ret: u64, aux: u64) -> u32 {
    output(ExitRecord {
        hdr: RecordHeader::new(REC_EXIT, pid, comm),
        source,
        _pad: 0,
        ts_ns: unsafe { bpf_ktime_get_ns() },
        ret,
        aux,
    })
}

/// Exit side of a pure duration pair: same filter as the entry, so a
/// filtered entry never produces an orphan exit.
fn duration_exit(source: u32) -> u32 {
    let Some((pid, comm)) = current_if_allowed() else { return 0 };
    emit_exit(pid, comm, source, 0, 0)
}

// ============================================================================
// ggml allocator (libggml-base)
// ============================================================================

// void *ggml_aligned_malloc(size_t size)
#[uprobe]
pub fn ggml_malloc_enter(ctx: ProbeContext) -> u32 {
    let Some((pid, comm)) = current_if_allowed() else { return 0 };
    let Some(size) = ctx.arg::<u64>(0) else { return 0 };
    emit_entry(pid, comm, SRC_GGML_MALLOC, [size, 0])
}

#[uretprobe]
pub fn ggml_malloc_exit(ctx: RetProbeContext) -> u32 {
    let Some((pid, comm)) = current_if_allowed() else { return 0 };
    let ret = ctx.ret::<u64>().unwrap_or(0);
    emit_exit(pid, comm, SRC_GGML_MALLOC, ret, 0)
}

// void ggml_aligned_free(void *ptr, size_t size)
#[uprobe]
pub fn ggml_free_enter(ctx: ProbeContext) -> u32 {
    let Some((pid, comm)) = current_if_allowed() else { return 0 };
    let ptr = ctx.arg::<u64>(0).unwrap_or(0);
    let size = ctx.arg::<u64>(1).unwrap_or(0);
    output(MemRecord {
        hdr: RecordHeader::new(REC_MEM, pid, comm),
        op: MEM_FREE,
        _pad: 0,
        size,
        ptr,
    })
}

// ============================================================================
// ggml graph compute (libggml-cpu)
// ============================================================================

// enum ggml_status ggml_graph_compute(struct ggml_cgraph *cgraph, struct ggml_cplan *cplan)
#[uprobe]
pub fn graph_compute_enter(ctx: ProbeContext) -> u32 {
    let Some((pid, comm)) = current_if_allowed() else { return 0 };
    let Some(graph) = ctx.arg::<u64>(0) else { return 0 };
    if graph == 0 {
        return 0;
    }
    // Graph metadata lives at the head of the struct; order sits past the
    // node tables.
    let size = unsafe { bpf_probe_read_user(graph as *const i32) }.unwrap_or(0);
    let n_nodes = unsafe { bpf_probe_read_user((graph + 4) as *const i32) }.unwrap_or(0);
    let n_leafs = unsafe { bpf_probe_read_user((graph + 8) as *const i32) }.unwrap_or(0);
    let order =
        unsafe { bpf_probe_read_user((graph as usize + GGML_CGRAPH_ORDER_OFFSET) as *const u32) }
            .unwrap_or(0);
    let args = [
        ((size as u32 as u64) << 32) | n_nodes as u32 as u64,
        ((n_leafs as u32 as u64) << 32) | u64::from(order),
    ];
    emit_entry(pid, comm, SRC_GRAPH_COMPUTE, args)
}

#[uretprobe]
pub fn graph_compute_exit(_ctx: RetProbeContext) -> u32 {
    duration_exit(SRC_GRAPH_COMPUTE)
}

// ============================================================================
// CUDA matmul kernels (libggml-cuda)
// ============================================================================

#[uprobe]
pub fn mul_mat_vec_q_enter(_ctx: ProbeContext) -> u32 {
    let Some((pid, comm)) = current_if_allowed() else { return 0 };
    emit_entry(pid, comm, SRC_MUL_MAT_VEC_Q, [0, 0])
}

#[uretprobe]
pub fn mul_mat_vec_q_exit(_ctx: RetProbeContext) -> u32 {
    duration_exit(SRC_MUL_MAT_VEC_Q)
}

#[uprobe]
pub fn mul_mat_q_enter(_ctx: ProbeContext) -> u32 {
    let Some((pid, comm)) = current_if_allowed() else { return 0 };
    emit_entry(pid, comm, SRC_MUL_MAT_Q, [0, 0])
}

#[uretprobe]
pub fn mul_mat_q_exit(_ctx: RetProbeContext) -> u32 {
    duration_exit(SRC_MUL_MAT_Q)
}

// ============================================================================
// CUDA runtime API (libcudart)
// ============================================================================

// cudaError_t cudaMalloc(void **devPtr, size_t size)
#[uprobe]
pub fn cuda_malloc_enter(ctx: ProbeContext) -> u32 {
    let Some((pid, comm)) = current_if_allowed() else { return 0 };
    let dev_ptr_addr = ctx.arg::<u64>(0).unwrap_or(0);
    let Some(size) = ctx.arg::<u64>(1) else { return 0 };
    if dev_ptr_addr != 0 {
        let _ = unsafe { CUDA_MALLOC_ARGS.insert(&pid, &dev_ptr_addr, 0) };
    }
    emit_entry(pid, comm, SRC_CUDA_MALLOC, [size, 0])
}

#[uretprobe]
pub fn cuda_malloc_exit(ctx: RetProbeContext) -> u32 {
    let Some((pid, comm)) = current_if_allowed() else { return 0 };
    let retval = ctx.ret::<u64>().unwrap_or(u64::MAX);

    // Read the allocated pointer back through the caller's out-parameter;
    // only meaningful when the call succeeded.
    let mut allocated: u64 = 0;
    if let Some(addr) = unsafe { CUDA_MALLOC_ARGS.get(&pid) } {
        let addr = *addr;
        let _ = unsafe { CUDA_MALLOC_ARGS.remove(&pid) };
        if retval == 0 {
            allocated = unsafe { bpf_probe_read_user(addr as *const u64) }.unwrap_or(0);
        }
    }
    emit_exit(pid, comm, SRC_CUDA_MALLOC, retval, allocated)
}

// cudaError_t cudaFree(void *devPtr)
#[uprobe]
pub fn cuda_free_enter(ctx: ProbeContext) -> u32 {
    let Some((pid, comm)) = current_if_allowed() else { return 0 };
    let ptr = ctx.arg::<u64>(0).unwrap_or(0);
    output(CudaFreeRecord { hdr: RecordHeader::new(REC_CUDA_FREE, pid, comm), ptr })
}

// cudaError_t cudaLaunchKernel(const void *func, ...)
#[uprobe]
pub fn cuda_launch_kernel(ctx: ProbeContext) -> u32 {
    let Some((pid, comm)) = current_if_allowed() else { return 0 };
    let func_ptr = ctx.arg::<u64>(0).unwrap_or(0);
    output(LaunchRecord { hdr: RecordHeader::new(REC_LAUNCH, pid, comm), func_ptr })
}

// cudaError_t cudaMemcpy(void *dst, const void *src, size_t count, enum cudaMemcpyKind kind)
#[uprobe]
pub fn cuda_memcpy(ctx: ProbeContext) -> u32 {
    let Some((pid, comm)) = current_if_allowed() else { return 0 };
    let dst = ctx.arg::<u64>(0).unwrap_or(0);
    let src = ctx.arg::<u64>(1).unwrap_or(0);
    let size = ctx.arg::<u64>(2).unwrap_or(0);
    let mut kind = ctx.arg::<u64>(3).unwrap_or(u64::MAX) as i32;
    if !(MEMCPY_HOST_TO_HOST..=MEMCPY_DEFAULT).contains(&kind) {
        kind = MEMCPY_KIND_UNKNOWN;
    }
    output(MemcpyRecord {
        hdr: RecordHeader::new(REC_MEMCPY, pid, comm),
        src,
        dst,
        size,
        kind,
        _pad: 0,
    })
}

// cudaError_t cudaDeviceSynchronize(void)
#[uprobe]
pub fn cuda_sync_enter(_ctx: ProbeContext) -> u32 {
    let Some((pid, comm)) = current_if_allowed() else { return 0 };
    emit_entry(pid, comm, SRC_CUDA_SYNC, [0, 0])
}

#[uretprobe]
pub fn cuda_sync_exit(_ctx: RetProbeContext) -> u32 {
    duration_exit(SRC_CUDA_SYNC)
}

// ============================================================================
// ollama runtime log
// ============================================================================

// extern void llamaLog(int level, char *text, void *user_data)
#[uprobe]
pub fn llama_log(ctx: ProbeContext) -> u32 {
    let Some((pid, comm)) = current_if_allowed() else { return 0 };
    let Some(text_ptr) = ctx.arg::<u64>(1) else { return 0 };
    let Some(mut slot) = EVENTS.reserve::<LogRecord>(0) else { return 0 };
    let rec = slot.as_mut_ptr();
    unsafe {
        core::ptr::write_bytes(rec.cast::<u8>(), 0, core::mem::size_of::<LogRecord>());
        (*rec).hdr = RecordHeader::new(REC_LOG, pid, comm);
        if bpf_probe_read_user_str_bytes(text_ptr as *const u8, &mut (*rec).text).is_err() {
            slot.discard(0);
            return 0;
        }
    }
    slot.submit(0);
    0
}

// ============================================================================
// Scheduler switches
// ============================================================================

fn is_kernel_thread(pid: i32, comm: &[u8; TASK_COMM_LEN]) -> bool {
    if pid <= 2 {
        return true;
    }
    // kworker/N, ksoftirqd/N, kswapd, and friends
    if comm[0] == b'k' && comm[1].is_ascii_digit() {
        return true;
    }
    matches!(
        (comm[0], comm[1], comm[2], comm[3]),
        (b'k', b's', b'o', b'f')
            | (b'k', b'w', b'o', b'r')
            | (b'k', b's', b'w', b'a')
            | (b'w', b'a', b't', b'c')
            | (b'm', b'i', b'g', b'r')
    )
}

fn sched_allowed(pid: i32, comm: &[u8; TASK_COMM_LEN]) -> bool {
    if is_kernel_thread(pid, comm) {
        return false;
    }
    pid > 0 && filter_allows(pid as u32, comm)
}

#[tracepoint]
pub fn sched_switch(ctx: TracePointContext) -> u32 {
    let args = unsafe { &*ctx.as_ptr().cast::<SchedSwitchArgs>() };
    let cpu = unsafe { bpf_get_smp_processor_id() } as i32;

    if sched_allowed(args.prev_pid, &args.prev_comm) {
        output(SchedRecord {
            hdr: RecordHeader::new(REC_SCHED, args.prev_pid as u32, args.prev_comm),
            op: SCHED_SWITCH_OUT,
            cpu,
        });
    }
    if sched_allowed(args.next_pid, &args.next_comm) {
        output(SchedRecord {
            hdr: RecordHeader::new(REC_SCHED, args.next_pid as u32, args.next_comm),
            op: SCHED_SWITCH_IN,
            cpu,
        });
    }
    0
}

// ============================================================================
// Process exec
// ============================================================================

/// `syscalls/sys_enter_execve` argument offsets: the common trace header and
/// syscall number occupy the first 16 bytes, then the six argument words.
const EXECVE_FILENAME_OFFSET: usize = 16;
const EXECVE_ARGV_OFFSET: usize = 24;

#[tracepoint]
pub fn sys_enter_execve(ctx: TracePointContext) -> u32 {
    let Some((pid, comm)) = current_if_allowed() else { return 0 };
    let Ok(filename_ptr) = (unsafe { ctx.read_at::<u64>(EXECVE_FILENAME_OFFSET) }) else {
        return 0;
    };
    let Some(mut slot) = EVENTS.reserve::<ExecRecord>(0) else { return 0 };
    let rec = slot.as_mut_ptr();
    unsafe {
        core::ptr::write_bytes(rec.cast::<u8>(), 0, core::mem::size_of::<ExecRecord>());
        (*rec).hdr = RecordHeader::new(REC_EXEC, pid, comm);
        // ppid is enriched from /proc by the userspace assembler.
        (*rec).ppid = 0;

        if bpf_probe_read_user_str_bytes(filename_ptr as *const u8, &mut (*rec).filename)
            .is_err()
        {
            debug!(&ctx, "execve filename read failed, discarding record");
            slot.discard(0);
            return 0;
        }

        if let Ok(argv) = ctx.read_at::<u64>(EXECVE_ARGV_OFFSET) {
            for i in 0..EXEC_MAX_ARGS {
                let arg_ptr = match bpf_probe_read_user((argv as *const u64).add(i)) {
                    Ok(p) if p != 0 => p,
                    _ => break,
                };
                if let Some(dst) = (*rec).args.get_mut(i * 16..(i + 1) * 16) {
                    let _ = bpf_probe_read_user_str_bytes(arg_ptr as *const u8, dst);
                }
            }
        }
    }
    slot.submit(0);
    0
}

// ============================================================================
// File opens
// ============================================================================

// long do_sys_openat2(int dfd, const char __user *filename, struct open_how *how)
#[fentry(function = "do_sys_openat2")]
pub fn openat2_entry(ctx: FEntryContext) -> u32 {
    let Some((pid, comm)) = current_if_allowed() else { return 0 };
    let filename_ptr: u64 = unsafe { ctx.arg(1) };
    let Some(mut slot) = EVENTS.reserve::<OpenRecord>(0) else { return 0 };
    let rec = slot.as_mut_ptr();
    unsafe {
        core::ptr::write_bytes(rec.cast::<u8>(), 0, core::mem::size_of::<OpenRecord>());
        (*rec).hdr = RecordHeader::new(REC_OPEN, pid, comm);
        if bpf_probe_read_user_str_bytes(filename_ptr as *const u8, &mut (*rec).filename).is_err()
        {
            slot.discard(0);
            return 0;
        }
    }
    slot.submit(0);
    0
}

#[link_section = "license"]
#[used]
pub static LICENSE: [u8; 13] = *b"Dual BSD/GPL\0";

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}

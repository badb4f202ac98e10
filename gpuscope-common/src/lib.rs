//! # Shared Record Schemas (eBPF ↔ Userspace)
//!
//! Fixed-layout records passed from the kernel-side probes to userspace
//! through the event ring buffer, plus the capture filter evaluated inside
//! each probe. All record types use `#[repr(C)]` so the layout is identical
//! on both sides of the kernel/userspace boundary, and every record has a
//! statically known size; the producer never writes past it.
//!
//! Two record categories exist:
//!
//! - **Correlation records** ([`EntryRecord`], [`ExitRecord`]) describe one
//!   half of a paired function call (entry or return). They only travel from
//!   the probes to the userspace assembler, which pairs them and emits a
//!   completed record.
//! - **Completed records** (everything else) are self-contained and flow all
//!   the way to the publisher.
//!
//! Pointers captured from the traced process are carried as opaque `u64`
//! values and are never dereferenced outside the probe that read them.

#![cfg_attr(not(test), no_std)]

// ============================================================================
// Capacity Constants
// ============================================================================

/// Length of the kernel's fixed task command-name buffer (`TASK_COMM_LEN`).
pub const TASK_COMM_LEN: usize = 16;

/// Maximum captured length of an exec'd binary path.
pub const EXEC_FILENAME_LEN: usize = 64;

/// Number of exec argv entries captured, 16 bytes each.
pub const EXEC_MAX_ARGS: usize = 8;

/// Total capacity of the flattened exec argv buffer.
pub const EXEC_ARGS_LEN: usize = EXEC_MAX_ARGS * 16;

/// Maximum captured length of one runtime log line.
pub const LOG_TEXT_LEN: usize = 256;

/// Maximum captured length of an opened file path.
pub const OPEN_FILENAME_LEN: usize = 256;

/// Size of the largest record that can cross the ring buffer. Used to size
/// reservations and to reject impossible requests early.
pub const MAX_RECORD_LEN: usize = 280; // LogRecord / OpenRecord

// ============================================================================
// Record Kinds
// ============================================================================

/// Entry half of a correlated call (assembler-internal).
pub const REC_ENTRY: u32 = 0;
/// Exit half of a correlated call (assembler-internal).
pub const REC_EXIT: u32 = 1;
/// ggml allocator malloc/free.
pub const REC_MEM: u32 = 2;
/// Timed function call (duration source → label happens at decode).
pub const REC_DURATION: u32 = 3;
/// ggml graph compute (graph metadata + cost).
pub const REC_GRAPH: u32 = 4;
/// cudaMalloc result.
pub const REC_CUDA_MALLOC: u32 = 5;
/// cudaFree call.
pub const REC_CUDA_FREE: u32 = 6;
/// cudaMemcpy call.
pub const REC_MEMCPY: u32 = 7;
/// cudaLaunchKernel call.
pub const REC_LAUNCH: u32 = 8;
/// Scheduler switch-in/switch-out.
pub const REC_SCHED: u32 = 9;
/// Process exec.
pub const REC_EXEC: u32 = 10;
/// Runtime log line (llamaLog).
pub const REC_LOG: u32 = 11;
/// File open.
pub const REC_OPEN: u32 = 12;

/// Expected byte size of a record of the given kind, or `None` for an
/// unknown kind. The decoder and the assembler both validate against this
/// before touching the payload.
#[must_use]
pub const fn record_len(kind: u32) -> Option<usize> {
    match kind {
        REC_ENTRY => Some(core::mem::size_of::<EntryRecord>()),
        REC_EXIT => Some(core::mem::size_of::<ExitRecord>()),
        REC_MEM => Some(core::mem::size_of::<MemRecord>()),
        REC_DURATION => Some(core::mem::size_of::<DurationRecord>()),
        REC_GRAPH => Some(core::mem::size_of::<GraphRecord>()),
        REC_CUDA_MALLOC => Some(core::mem::size_of::<CudaMallocRecord>()),
        REC_CUDA_FREE => Some(core::mem::size_of::<CudaFreeRecord>()),
        REC_MEMCPY => Some(core::mem::size_of::<MemcpyRecord>()),
        REC_LAUNCH => Some(core::mem::size_of::<LaunchRecord>()),
        REC_SCHED => Some(core::mem::size_of::<SchedRecord>()),
        REC_EXEC => Some(core::mem::size_of::<ExecRecord>()),
        REC_LOG => Some(core::mem::size_of::<LogRecord>()),
        REC_OPEN => Some(core::mem::size_of::<OpenRecord>()),
        _ => None,
    }
}

// ============================================================================
// Correlation Sources
// ============================================================================

/// `ggml_aligned_malloc`: entry carries the requested size, exit the
/// returned pointer.
pub const SRC_GGML_MALLOC: u32 = 0;
/// `cudaMalloc`: entry carries the requested size, exit the return code and
/// the resolved device pointer.
pub const SRC_CUDA_MALLOC: u32 = 1;
/// `cudaDeviceSynchronize`: pure duration pair.
pub const SRC_CUDA_SYNC: u32 = 2;
/// `ggml_cuda_op_mul_mat_vec_q`: pure duration pair.
pub const SRC_MUL_MAT_VEC_Q: u32 = 3;
/// `ggml_cuda_op_mul_mat_q`: pure duration pair.
pub const SRC_MUL_MAT_Q: u32 = 4;
/// `ggml_graph_compute`: entry carries graph metadata, exit closes the
/// timing window.
pub const SRC_GRAPH_COMPUTE: u32 = 5;

// ============================================================================
// Field Discriminants
// ============================================================================

/// Memory operation: allocation.
pub const MEM_MALLOC: u32 = 0;
/// Memory operation: free.
pub const MEM_FREE: u32 = 1;

/// Scheduler event: task switched onto a CPU.
pub const SCHED_SWITCH_IN: u32 = 0;
/// Scheduler event: task switched off a CPU.
pub const SCHED_SWITCH_OUT: u32 = 1;

/// `cudaMemcpy` transfer kinds (mirrors `cudaMemcpyKind`); a value outside
/// the enum range is recorded as `MEMCPY_KIND_UNKNOWN`.
pub const MEMCPY_HOST_TO_HOST: i32 = 0;
pub const MEMCPY_HOST_TO_DEVICE: i32 = 1;
pub const MEMCPY_DEVICE_TO_HOST: i32 = 2;
pub const MEMCPY_DEVICE_TO_DEVICE: i32 = 3;
pub const MEMCPY_DEFAULT: i32 = 4;
pub const MEMCPY_KIND_UNKNOWN: i32 = -1;

// ============================================================================
// Records
// ============================================================================

/// Common prefix of every record: the kind tag plus the identity of the
/// process observed by the probe. `comm` is NUL-padded and may be truncated.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RecordHeader {
    pub kind: u32,
    pub pid: u32,
    pub comm: [u8; TASK_COMM_LEN],
}

impl RecordHeader {
    #[must_use]
    pub const fn new(kind: u32, pid: u32, comm: [u8; TASK_COMM_LEN]) -> Self {
        Self { kind, pid, comm }
    }
}

/// Entry half of a correlated call. `args` is interpreted per `source`:
/// requested size for the malloc sources, packed graph metadata for
/// `SRC_GRAPH_COMPUTE`, unused for pure duration pairs.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct EntryRecord {
    pub hdr: RecordHeader,
    pub source: u32,
    pub _pad: u32,
    pub ts_ns: u64,
    pub args: [u64; 2],
}

/// Exit half of a correlated call. `ret` is the raw return value; `aux`
/// carries source-specific extra data (the resolved device pointer for
/// `SRC_CUDA_MALLOC`).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ExitRecord {
    pub hdr: RecordHeader,
    pub source: u32,
    pub _pad: u32,
    pub ts_ns: u64,
    pub ret: u64,
    pub aux: u64,
}

/// ggml allocator event, assembled from an entry/exit pair (malloc) or
/// emitted directly (free).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct MemRecord {
    pub hdr: RecordHeader,
    pub op: u32,
    pub _pad: u32,
    pub size: u64,
    pub ptr: u64,
}

/// Timed function call. The integer source is mapped to a function-name
/// label at decode time.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DurationRecord {
    pub hdr: RecordHeader,
    pub source: u32,
    pub _pad: u32,
    pub duration_ns: u64,
}

/// `ggml_graph_compute` event: graph shape captured at entry, wall time of
/// the whole computation.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct GraphRecord {
    pub hdr: RecordHeader,
    pub graph_size: i32,
    pub graph_nodes: i32,
    pub graph_leafs: i32,
    pub graph_order: u32,
    pub cost_ns: u64,
}

/// `cudaMalloc` result. `ptr` is the device pointer read back through the
/// caller's out-parameter, 0 when the call failed or the read did not
/// resolve.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CudaMallocRecord {
    pub hdr: RecordHeader,
    pub retval: i32,
    pub _pad: u32,
    pub size: u64,
    pub ptr: u64,
}

/// `cudaFree` call.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CudaFreeRecord {
    pub hdr: RecordHeader,
    pub ptr: u64,
}

/// `cudaMemcpy` call.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct MemcpyRecord {
    pub hdr: RecordHeader,
    pub src: u64,
    pub dst: u64,
    pub size: u64,
    pub kind: i32,
    pub _pad: u32,
}

/// `cudaLaunchKernel` call. `func_ptr` is the device-side function address,
/// opaque to the consumer.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct LaunchRecord {
    pub hdr: RecordHeader,
    pub func_ptr: u64,
}

/// One side of a `sched_switch`: `op` says whether `hdr.pid` was switched in
/// or out on `cpu`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SchedRecord {
    pub hdr: RecordHeader,
    pub op: u32,
    pub cpu: i32,
}

/// Process exec. `ppid` is filled by the userspace assembler (enrichment,
/// not correctness-critical); `args` holds up to [`EXEC_MAX_ARGS`] argv
/// entries of 16 bytes each, NUL-padded.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ExecRecord {
    pub hdr: RecordHeader,
    pub ppid: i32,
    pub _pad: u32,
    pub filename: [u8; EXEC_FILENAME_LEN],
    pub args: [u8; EXEC_ARGS_LEN],
}

/// Runtime log line captured from the traced process.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct LogRecord {
    pub hdr: RecordHeader,
    pub text: [u8; LOG_TEXT_LEN],
}

/// File open observed in the kernel.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct OpenRecord {
    pub hdr: RecordHeader,
    pub filename: [u8; OPEN_FILENAME_LEN],
}

// ============================================================================
// Raw byte views
// ============================================================================

/// View of a record as the exact bytes that cross the ring buffer.
///
/// # Safety
///
/// Only implement for `#[repr(C)]` types whose padding is made explicit
/// through `_pad` fields, so every byte of the struct must be initialized
/// memory so the byte view never exposes uninitialized data.
#[allow(unsafe_code)]
pub unsafe trait RawRecord: Copy {
    fn as_bytes(&self) -> &[u8] {
        // SAFETY: guaranteed by the trait contract: the type is repr(C)
        // with explicit padding, so all size_of::<Self>() bytes are
        // initialized.
        #[allow(unsafe_code)]
        unsafe {
            core::slice::from_raw_parts(
                core::ptr::from_ref(self).cast::<u8>(),
                core::mem::size_of::<Self>(),
            )
        }
    }
}

#[allow(unsafe_code)]
mod raw_impls {
    use super::{
        CudaFreeRecord, CudaMallocRecord, DurationRecord, EntryRecord, ExecRecord, ExitRecord,
        GraphRecord, LaunchRecord, LogRecord, MemRecord, MemcpyRecord, OpenRecord, RawRecord,
        SchedRecord,
    };

    unsafe impl RawRecord for EntryRecord {}
    unsafe impl RawRecord for ExitRecord {}
    unsafe impl RawRecord for MemRecord {}
    unsafe impl RawRecord for DurationRecord {}
    unsafe impl RawRecord for GraphRecord {}
    unsafe impl RawRecord for CudaMallocRecord {}
    unsafe impl RawRecord for CudaFreeRecord {}
    unsafe impl RawRecord for MemcpyRecord {}
    unsafe impl RawRecord for LaunchRecord {}
    unsafe impl RawRecord for SchedRecord {}
    unsafe impl RawRecord for ExecRecord {}
    unsafe impl RawRecord for LogRecord {}
    unsafe impl RawRecord for OpenRecord {}
}

// ============================================================================
// Capture Filter
// ============================================================================

/// Immutable capture filter, written once into the `FILTER` map at startup
/// and evaluated inside every probe before a reservation is attempted.
///
/// Both fields are optional: `pid == 0` matches every process, an empty
/// `comm` matches every command name. When both are set they compose with
/// logical AND.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct FilterConfig {
    pub pid: u32,
    pub comm: [u8; TASK_COMM_LEN],
}

impl FilterConfig {
    #[must_use]
    pub fn new(pid: u32, comm_filter: Option<&str>) -> Self {
        let mut comm = [0u8; TASK_COMM_LEN];
        if let Some(s) = comm_filter {
            let bytes = s.as_bytes();
            let n = bytes.len().min(TASK_COMM_LEN - 1);
            comm[..n].copy_from_slice(&bytes[..n]);
        }
        Self { pid, comm }
    }

    /// Prefix match of `comm` against the configured filter. Bounded scan of
    /// at most [`TASK_COMM_LEN`] bytes, suitable for the probe context.
    #[must_use]
    pub fn comm_allowed(&self, comm: &[u8; TASK_COMM_LEN]) -> bool {
        let mut i = 0;
        while i < TASK_COMM_LEN && self.comm[i] != 0 {
            if comm[i] != self.comm[i] {
                return false;
            }
            i += 1;
        }
        true
    }

    /// The capture predicate: pure, no side effects.
    #[must_use]
    pub fn allows(&self, pid: u32, comm: &[u8; TASK_COMM_LEN]) -> bool {
        if self.pid != 0 && pid != self.pid {
            return false;
        }
        if self.comm[0] != 0 && !self.comm_allowed(comm) {
            return false;
        }
        true
    }
}

// ============================================================================
// Tracepoint ABI
// ============================================================================

/// Tracepoint arguments for `sched/sched_switch`, as laid out by
/// `/sys/kernel/debug/tracing/events/sched/sched_switch/format`.
#[repr(C)]
pub struct SchedSwitchArgs {
    /// Kernel tracepoint common fields.
    pub _common: u64,
    pub prev_comm: [u8; TASK_COMM_LEN],
    pub prev_pid: i32,
    pub prev_prio: i32,
    pub prev_state: i64,
    pub next_comm: [u8; TASK_COMM_LEN],
    pub next_pid: i32,
    pub next_prio: i32,
}

// ============================================================================
// Helpers
// ============================================================================

/// Slice `buf` up to (excluding) the first NUL, the way the fixed-size comm
/// and path buffers are meant to be read.
#[must_use]
pub fn trim_nul(buf: &[u8]) -> &[u8] {
    match buf.iter().position(|&b| b == 0) {
        Some(n) => &buf[..n],
        None => buf,
    }
}

/// Pack two 32-bit fields into one correlation argument slot.
#[must_use]
pub const fn pack_pair(hi: u32, lo: u32) -> u64 {
    ((hi as u64) << 32) | lo as u64
}

/// Inverse of [`pack_pair`].
#[must_use]
pub const fn unpack_pair(v: u64) -> (u32, u32) {
    ((v >> 32) as u32, v as u32)
}

#[cfg(feature = "user")]
mod pod_impls {
    use super::FilterConfig;
    use aya::Pod;

    // Required so the filter can be installed as a BPF map value; FilterConfig
    // is repr(C) with no padding.
    #[allow(unsafe_code)]
    unsafe impl Pod for FilterConfig {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    fn comm(s: &str) -> [u8; TASK_COMM_LEN] {
        let mut buf = [0u8; TASK_COMM_LEN];
        buf[..s.len()].copy_from_slice(s.as_bytes());
        buf
    }

    #[test]
    fn record_sizes_are_stable() {
        // The wire contract: these sizes are what the decoder validates
        // against and must not drift.
        assert_eq!(size_of::<RecordHeader>(), 24);
        assert_eq!(size_of::<EntryRecord>(), 56);
        assert_eq!(size_of::<ExitRecord>(), 64);
        assert_eq!(size_of::<MemRecord>(), 48);
        assert_eq!(size_of::<DurationRecord>(), 40);
        assert_eq!(size_of::<GraphRecord>(), 48);
        assert_eq!(size_of::<CudaMallocRecord>(), 48);
        assert_eq!(size_of::<CudaFreeRecord>(), 32);
        assert_eq!(size_of::<MemcpyRecord>(), 56);
        assert_eq!(size_of::<LaunchRecord>(), 32);
        assert_eq!(size_of::<SchedRecord>(), 32);
        assert_eq!(size_of::<ExecRecord>(), 224);
        assert_eq!(size_of::<LogRecord>(), 280);
        assert_eq!(size_of::<OpenRecord>(), 280);
    }

    #[test]
    fn record_len_matches_struct_sizes() {
        assert_eq!(record_len(REC_MEM), Some(48));
        assert_eq!(record_len(REC_LOG), Some(280));
        assert_eq!(record_len(9999), None);
        for kind in REC_ENTRY..=REC_OPEN {
            assert!(record_len(kind).unwrap() <= MAX_RECORD_LEN);
        }
    }

    #[test]
    fn filter_match_all_by_default() {
        let f = FilterConfig::default();
        assert!(f.allows(1, &comm("anything")));
        assert!(f.allows(u32::MAX, &comm("")));
    }

    #[test]
    fn filter_pid_exact_match() {
        let f = FilterConfig::new(42, None);
        assert!(f.allows(42, &comm("ollama")));
        assert!(!f.allows(43, &comm("ollama")));
    }

    #[test]
    fn filter_comm_prefix_match() {
        let f = FilterConfig::new(0, Some("ollama"));
        assert!(f.allows(1, &comm("ollama")));
        // The scan stops at the filter's NUL: longer comms pass too.
        assert!(f.allows(1, &comm("ollama-runner")));
        assert!(!f.allows(1, &comm("python3")));
    }

    #[test]
    fn filter_pid_and_comm_compose_with_and() {
        let f = FilterConfig::new(42, Some("ollama"));
        assert!(f.allows(42, &comm("ollama")));
        assert!(!f.allows(42, &comm("python3")));
        assert!(!f.allows(7, &comm("ollama")));
    }

    #[test]
    fn filter_comm_is_truncated_not_overrun() {
        let f = FilterConfig::new(0, Some("a-very-long-command-name"));
        assert_eq!(f.comm[TASK_COMM_LEN - 1], 0);
    }

    #[test]
    fn trim_nul_stops_at_first_nul() {
        assert_eq!(trim_nul(b"proc\0\0\0"), b"proc");
        assert_eq!(trim_nul(b"full-length"), b"full-length");
        assert_eq!(trim_nul(b"\0"), b"");
    }

    #[test]
    fn pair_packing_round_trips() {
        let v = pack_pair(0xDEAD_BEEF, 42);
        assert_eq!(unpack_pair(v), (0xDEAD_BEEF, 42));
    }

    #[test]
    fn raw_record_bytes_round_trip_header() {
        let rec = SchedRecord {
            hdr: RecordHeader::new(REC_SCHED, 7, comm("proc")),
            op: SCHED_SWITCH_IN,
            cpu: 3,
        };
        let bytes = rec.as_bytes();
        assert_eq!(bytes.len(), size_of::<SchedRecord>());
        assert_eq!(&bytes[0..4], &REC_SCHED.to_ne_bytes());
        assert_eq!(&bytes[4..8], &7u32.to_ne_bytes());
    }
}

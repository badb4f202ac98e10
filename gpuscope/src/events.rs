//! # Event Decoding
//!
//! Maps a raw byte record coming out of the channel to a typed [`Event`].
//! The decoder validates the byte length against the expected size for the
//! record's kind before touching the payload, so transport corruption or
//! version skew turns into a logged warning upstream instead of a crash. It
//! performs no filtering (that already happened at capture).
//!
//! Events are stamped with a wall-clock timestamp here, matching where the
//! original user-space consumers applied it.

use std::mem::size_of;

use gpuscope_common::{
    record_len, trim_nul, unpack_pair, CudaFreeRecord, CudaMallocRecord, DurationRecord,
    ExecRecord, GraphRecord, LaunchRecord, LogRecord, MemRecord, MemcpyRecord, OpenRecord,
    RecordHeader, SchedRecord, EXEC_MAX_ARGS, MEMCPY_DEFAULT, MEMCPY_DEVICE_TO_DEVICE,
    MEMCPY_DEVICE_TO_HOST, MEMCPY_HOST_TO_DEVICE, MEMCPY_HOST_TO_HOST, REC_CUDA_FREE,
    REC_CUDA_MALLOC, REC_DURATION, REC_ENTRY, REC_EXEC, REC_EXIT, REC_GRAPH, REC_LAUNCH, REC_LOG,
    REC_MEM, REC_MEMCPY, REC_OPEN, REC_SCHED, SRC_CUDA_SYNC, SRC_GRAPH_COMPUTE, SRC_MUL_MAT_Q,
    SRC_MUL_MAT_VEC_Q,
};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record shorter than its header: {0} bytes")]
    Truncated(usize),
    #[error("size mismatch for record kind {kind}: expected {expected} bytes, got {actual}")]
    SizeMismatch { kind: u32, expected: usize, actual: usize },
    #[error("correlation record (kind {0}) reached the consumer")]
    Unpublishable(u32),
    #[error("unknown record kind {0}")]
    UnknownKind(u32),
}

/// One decoded event, tagged by probe family. Field order mirrors the wire
/// contract in [`crate::publish`].
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Mem(MemEvent),
    Duration(DurationEvent),
    Graph(GraphEvent),
    CudaMalloc(CudaMallocEvent),
    CudaFree(CudaFreeEvent),
    Memcpy(MemcpyEvent),
    Launch(LaunchEvent),
    Sched(SchedEvent),
    Exec(ExecEvent),
    Log(LogEvent),
    Open(OpenEvent),
}

impl Event {
    /// The observed process id, whatever the family.
    #[must_use]
    pub fn pid(&self) -> i32 {
        match self {
            Event::Mem(ev) => ev.pid,
            Event::Duration(ev) => ev.pid,
            Event::Graph(ev) => ev.pid,
            Event::CudaMalloc(ev) => ev.pid,
            Event::CudaFree(ev) => ev.pid,
            Event::Memcpy(ev) => ev.pid,
            Event::Launch(ev) => ev.pid,
            Event::Sched(ev) => ev.pid,
            Event::Exec(ev) => ev.pid,
            Event::Log(ev) => ev.pid,
            Event::Open(ev) => ev.pid,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemEvent {
    pub ts_ns: i64,
    pub pid: i32,
    pub comm: String,
    /// 0 = malloc, 1 = free.
    pub op: i32,
    pub size: u64,
    pub ptr: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DurationEvent {
    pub ts_ns: i64,
    pub pid: i32,
    pub comm: String,
    pub source: u32,
    pub duration_ns: i64,
}

impl DurationEvent {
    /// Pure lookup from the integer duration source to the published
    /// function-name label.
    #[must_use]
    pub fn func_name(&self) -> &'static str {
        duration_label(self.source)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphEvent {
    pub ts_ns: i64,
    pub pid: i32,
    pub comm: String,
    pub graph_size: i32,
    pub graph_nodes: i32,
    pub graph_leafs: i32,
    pub graph_order: i32,
    pub cost_ns: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CudaMallocEvent {
    pub ts_ns: i64,
    pub pid: i32,
    pub comm: String,
    pub ptr: u64,
    pub size: u64,
    pub retval: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CudaFreeEvent {
    pub ts_ns: i64,
    pub pid: i32,
    pub comm: String,
    pub ptr: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemcpyEvent {
    pub ts_ns: i64,
    pub pid: i32,
    pub comm: String,
    pub src: u64,
    pub dst: u64,
    pub size: u64,
    pub kind: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchEvent {
    pub ts_ns: i64,
    pub pid: i32,
    pub comm: String,
    pub func_ptr: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedEvent {
    pub ts_ns: i64,
    pub pid: i32,
    pub comm: String,
    pub cpu: i32,
    /// 0 = switch in, 1 = switch out.
    pub op: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecEvent {
    pub ts_ns: i64,
    pub pid: i32,
    pub ppid: i32,
    pub filename: String,
    pub args: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub ts_ns: i64,
    pub pid: i32,
    pub comm: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenEvent {
    pub ts_ns: i64,
    pub pid: i32,
    pub comm: String,
    pub filename: String,
}

/// CLOCK_REALTIME in nanoseconds, the timestamp base of every published
/// event.
#[allow(unsafe_code)]
#[must_use]
pub fn wall_clock_ns() -> i64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: clock_gettime writes into the provided timespec.
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) } != 0 {
        return 0;
    }
    ts.tv_sec * 1_000_000_000 + ts.tv_nsec
}

#[must_use]
pub fn duration_label(source: u32) -> &'static str {
    match source {
        SRC_CUDA_SYNC => "cudaDeviceSynchronize",
        SRC_MUL_MAT_VEC_Q => "ggml_cuda_op_mul_mat_vec_q",
        SRC_MUL_MAT_Q => "ggml_cuda_op_mul_mat_q",
        SRC_GRAPH_COMPUTE => "ggml_graph_compute",
        _ => "unknown",
    }
}

#[must_use]
pub fn memcpy_kind_label(kind: i32) -> &'static str {
    match kind {
        MEMCPY_HOST_TO_HOST => "host_to_host",
        MEMCPY_HOST_TO_DEVICE => "host_to_device",
        MEMCPY_DEVICE_TO_HOST => "device_to_host",
        MEMCPY_DEVICE_TO_DEVICE => "device_to_device",
        MEMCPY_DEFAULT => "default",
        _ => "unknown",
    }
}

fn comm_string(comm: &[u8]) -> String {
    String::from_utf8_lossy(trim_nul(comm)).into_owned()
}

/// Exec argv is captured as fixed 16-byte chunks; join the non-empty ones
/// the way `/proc/<pid>/cmdline` joins NUL-separated arguments.
fn args_string(raw: &[u8]) -> String {
    let mut out = String::new();
    for i in 0..EXEC_MAX_ARGS {
        let chunk = trim_nul(&raw[i * 16..(i + 1) * 16]);
        if chunk.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&String::from_utf8_lossy(chunk));
    }
    out
}

#[allow(unsafe_code)]
fn read_record<T: Copy>(bytes: &[u8], kind: u32) -> Result<T, DecodeError> {
    let expected = size_of::<T>();
    if bytes.len() != expected {
        return Err(DecodeError::SizeMismatch { kind, expected, actual: bytes.len() });
    }
    // SAFETY: length was checked against size_of::<T>() and T is one of the
    // repr(C) record types shared with the probes.
    Ok(unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<T>()) })
}

#[allow(clippy::cast_possible_wrap)]
fn pid_of(hdr: &RecordHeader) -> i32 {
    hdr.pid as i32
}

/// Decode one raw record into a typed event. Unknown kinds, correlation
/// records and size mismatches are errors the caller logs and drops.
#[allow(clippy::cast_possible_wrap)]
pub fn decode(bytes: &[u8]) -> Result<Event, DecodeError> {
    if bytes.len() < size_of::<RecordHeader>() {
        return Err(DecodeError::Truncated(bytes.len()));
    }
    // SAFETY: every record begins with a RecordHeader and the length was
    // just checked to cover one.
    #[allow(unsafe_code)]
    let hdr = unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<RecordHeader>()) };
    // Belt and braces: the full-record check below subsumes this, but a
    // corrupt kind must not reach the per-kind casts.
    if record_len(hdr.kind).is_none() {
        return Err(DecodeError::UnknownKind(hdr.kind));
    }

    let ts_ns = wall_clock_ns();
    match hdr.kind {
        REC_ENTRY | REC_EXIT => Err(DecodeError::Unpublishable(hdr.kind)),
        REC_MEM => {
            let rec: MemRecord = read_record(bytes, hdr.kind)?;
            Ok(Event::Mem(MemEvent {
                ts_ns,
                pid: pid_of(&rec.hdr),
                comm: comm_string(&rec.hdr.comm),
                op: rec.op as i32,
                size: rec.size,
                ptr: rec.ptr,
            }))
        }
        REC_DURATION => {
            let rec: DurationRecord = read_record(bytes, hdr.kind)?;
            Ok(Event::Duration(DurationEvent {
                ts_ns,
                pid: pid_of(&rec.hdr),
                comm: comm_string(&rec.hdr.comm),
                source: rec.source,
                duration_ns: rec.duration_ns as i64,
            }))
        }
        REC_GRAPH => {
            let rec: GraphRecord = read_record(bytes, hdr.kind)?;
            Ok(Event::Graph(GraphEvent {
                ts_ns,
                pid: pid_of(&rec.hdr),
                comm: comm_string(&rec.hdr.comm),
                graph_size: rec.graph_size,
                graph_nodes: rec.graph_nodes,
                graph_leafs: rec.graph_leafs,
                graph_order: rec.graph_order as i32,
                cost_ns: rec.cost_ns as i64,
            }))
        }
        REC_CUDA_MALLOC => {
            let rec: CudaMallocRecord = read_record(bytes, hdr.kind)?;
            Ok(Event::CudaMalloc(CudaMallocEvent {
                ts_ns,
                pid: pid_of(&rec.hdr),
                comm: comm_string(&rec.hdr.comm),
                ptr: rec.ptr,
                size: rec.size,
                retval: rec.retval,
            }))
        }
        REC_CUDA_FREE => {
            let rec: CudaFreeRecord = read_record(bytes, hdr.kind)?;
            Ok(Event::CudaFree(CudaFreeEvent {
                ts_ns,
                pid: pid_of(&rec.hdr),
                comm: comm_string(&rec.hdr.comm),
                ptr: rec.ptr,
            }))
        }
        REC_MEMCPY => {
            let rec: MemcpyRecord = read_record(bytes, hdr.kind)?;
            Ok(Event::Memcpy(MemcpyEvent {
                ts_ns,
                pid: pid_of(&rec.hdr),
                comm: comm_string(&rec.hdr.comm),
                src: rec.src,
                dst: rec.dst,
                size: rec.size,
                kind: rec.kind,
            }))
        }
        REC_LAUNCH => {
            let rec: LaunchRecord = read_record(bytes, hdr.kind)?;
            Ok(Event::Launch(LaunchEvent {
                ts_ns,
                pid: pid_of(&rec.hdr),
                comm: comm_string(&rec.hdr.comm),
                func_ptr: rec.func_ptr,
            }))
        }
        REC_SCHED => {
            let rec: SchedRecord = read_record(bytes, hdr.kind)?;
            Ok(Event::Sched(SchedEvent {
                ts_ns,
                pid: pid_of(&rec.hdr),
                comm: comm_string(&rec.hdr.comm),
                cpu: rec.cpu,
                op: rec.op as i32,
            }))
        }
        REC_EXEC => {
            let rec: ExecRecord = read_record(bytes, hdr.kind)?;
            Ok(Event::Exec(ExecEvent {
                ts_ns,
                pid: pid_of(&rec.hdr),
                ppid: rec.ppid,
                filename: String::from_utf8_lossy(trim_nul(&rec.filename)).into_owned(),
                args: args_string(&rec.args),
            }))
        }
        REC_LOG => {
            let rec: LogRecord = read_record(bytes, hdr.kind)?;
            Ok(Event::Log(LogEvent {
                ts_ns,
                pid: pid_of(&rec.hdr),
                comm: comm_string(&rec.hdr.comm),
                text: String::from_utf8_lossy(trim_nul(&rec.text)).into_owned(),
            }))
        }
        REC_OPEN => {
            let rec: OpenRecord = read_record(bytes, hdr.kind)?;
            Ok(Event::Open(OpenEvent {
                ts_ns,
                pid: pid_of(&rec.hdr),
                comm: comm_string(&rec.hdr.comm),
                filename: String::from_utf8_lossy(trim_nul(&rec.filename)).into_owned(),
            }))
        }
        kind => Err(DecodeError::UnknownKind(kind)),
    }
}

/// Unpack the graph metadata the entry probe squeezed into the correlation
/// arguments.
#[allow(clippy::cast_possible_wrap)]
#[must_use]
pub fn unpack_graph_args(args: [u64; 2]) -> (i32, i32, i32, u32) {
    let (size, nodes) = unpack_pair(args[0]);
    let (leafs, order) = unpack_pair(args[1]);
    (size as i32, nodes as i32, leafs as i32, order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuscope_common::{
        pack_pair, RawRecord, MEM_MALLOC, REC_ENTRY, SCHED_SWITCH_OUT, TASK_COMM_LEN,
    };

    fn comm(s: &str) -> [u8; TASK_COMM_LEN] {
        let mut buf = [0u8; TASK_COMM_LEN];
        buf[..s.len()].copy_from_slice(s.as_bytes());
        buf
    }

    #[test]
    fn decodes_a_mem_record() {
        let rec = MemRecord {
            hdr: RecordHeader::new(REC_MEM, 100, comm("proc")),
            op: MEM_MALLOC,
            _pad: 0,
            size: 4096,
            ptr: 0xdead_0000,
        };
        let Event::Mem(ev) = decode(rec.as_bytes()).unwrap() else {
            panic!("wrong family");
        };
        assert_eq!(ev.pid, 100);
        assert_eq!(ev.comm, "proc");
        assert_eq!(ev.op, 0);
        assert_eq!(ev.size, 4096);
        assert_eq!(ev.ptr, 0xdead_0000);
        assert!(ev.ts_ns > 0);
    }

    #[test]
    fn decodes_a_sched_record() {
        let rec = SchedRecord {
            hdr: RecordHeader::new(REC_SCHED, 42, comm("ollama")),
            op: SCHED_SWITCH_OUT,
            cpu: 5,
        };
        let Event::Sched(ev) = decode(rec.as_bytes()).unwrap() else {
            panic!("wrong family");
        };
        assert_eq!((ev.pid, ev.cpu, ev.op), (42, 5, 1));
    }

    #[test]
    fn decodes_exec_args_into_a_joined_string() {
        let mut rec = ExecRecord {
            hdr: RecordHeader::new(REC_EXEC, 9, comm("bash")),
            ppid: 1,
            _pad: 0,
            filename: [0; 64],
            args: [0; 128],
        };
        rec.filename[..12].copy_from_slice(b"/usr/bin/cat");
        rec.args[..3].copy_from_slice(b"cat");
        rec.args[16..26].copy_from_slice(b"/etc/hosts");
        let Event::Exec(ev) = decode(rec.as_bytes()).unwrap() else {
            panic!("wrong family");
        };
        assert_eq!(ev.filename, "/usr/bin/cat");
        assert_eq!(ev.args, "cat /etc/hosts");
        assert_eq!(ev.ppid, 1);
    }

    #[test]
    fn rejects_a_size_mismatch() {
        let rec = MemRecord {
            hdr: RecordHeader::new(REC_MEM, 1, comm("x")),
            op: MEM_MALLOC,
            _pad: 0,
            size: 1,
            ptr: 1,
        };
        let mut bytes = rec.as_bytes().to_vec();
        bytes.pop();
        assert_eq!(
            decode(&bytes),
            Err(DecodeError::SizeMismatch { kind: REC_MEM, expected: 48, actual: 47 })
        );
    }

    #[test]
    fn rejects_unknown_kinds_and_short_records() {
        let mut bytes = vec![0u8; 48];
        bytes[..4].copy_from_slice(&777u32.to_ne_bytes());
        assert_eq!(decode(&bytes), Err(DecodeError::UnknownKind(777)));
        assert_eq!(decode(&[0u8; 3]), Err(DecodeError::Truncated(3)));
    }

    #[test]
    fn correlation_records_are_not_publishable() {
        let mut bytes = vec![0u8; 56];
        bytes[..4].copy_from_slice(&REC_ENTRY.to_ne_bytes());
        assert_eq!(decode(&bytes), Err(DecodeError::Unpublishable(REC_ENTRY)));
    }

    #[test]
    fn duration_sources_map_to_labels() {
        assert_eq!(duration_label(SRC_CUDA_SYNC), "cudaDeviceSynchronize");
        assert_eq!(duration_label(SRC_MUL_MAT_Q), "ggml_cuda_op_mul_mat_q");
        assert_eq!(duration_label(999), "unknown");
        assert_eq!(memcpy_kind_label(1), "host_to_device");
        assert_eq!(memcpy_kind_label(-1), "unknown");
    }

    #[test]
    fn graph_args_round_trip() {
        let args = [pack_pair(2048, 640), pack_pair(320, 1)];
        assert_eq!(unpack_graph_args(args), (2048, 640, 320, 1));
    }
}

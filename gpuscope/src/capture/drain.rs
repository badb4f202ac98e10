//! # Kernel Ring-Buffer Drain & Event Assembly
//!
//! The drain task is the producer side of the in-process channel: it reads
//! raw records out of the kernel ring buffer as fast as they arrive, pairs
//! entry/exit halves through the correlator, and forwards completed records
//! into the channel. It must never block: when the channel is full the
//! record is dropped and counted, exactly like the kernel side drops when
//! its ring buffer is full.

use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use aya::maps::{MapData, RingBuf};
use log::{debug, warn};
use tokio::io::unix::AsyncFd;

use gpuscope_common::{
    record_len, CudaMallocRecord, DurationRecord, EntryRecord, ExecRecord, ExitRecord,
    GraphRecord, MemRecord, RawRecord, RecordHeader, REC_CUDA_MALLOC, REC_DURATION, REC_ENTRY,
    REC_EXEC, REC_EXIT, REC_GRAPH, REC_MEM, MEM_MALLOC, SRC_CUDA_MALLOC, SRC_CUDA_SYNC,
    SRC_GGML_MALLOC, SRC_GRAPH_COMPUTE, SRC_MUL_MAT_Q, SRC_MUL_MAT_VEC_Q,
};

use crate::correlator::{Correlator, Entry};
use crate::events::unpack_graph_args;
use crate::process_lookup;
use crate::ring::RingBuffer;
use crate::shutdown::Shutdown;

/// Capture-side diagnostic counters; shared with the summary printed at
/// exit.
#[derive(Debug, Default)]
pub struct CaptureStats {
    /// Records that failed basic validation (unknown kind, bad size).
    pub malformed: AtomicU64,
    /// Exit halves without a matching entry (accepted lossy case).
    pub unmatched_exits: AtomicU64,
    /// Completed records produced from entry/exit pairs.
    pub assembled: AtomicU64,
    /// Records handed to the channel (assembled and passthrough).
    pub forwarded: AtomicU64,
}

/// Routes raw kernel records: correlation halves through the correlator,
/// everything else straight into the channel.
pub struct Assembler {
    ring: Arc<RingBuffer>,
    correlator: Arc<Correlator>,
    stats: Arc<CaptureStats>,
}

#[allow(unsafe_code)]
fn read_record<T: Copy>(bytes: &[u8]) -> T {
    debug_assert_eq!(bytes.len(), size_of::<T>());
    // SAFETY: the caller validated the length against the record kind and T
    // is one of the repr(C) record types shared with the probes.
    unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<T>()) }
}

impl Assembler {
    #[must_use]
    pub fn new(
        ring: Arc<RingBuffer>,
        correlator: Arc<Correlator>,
        stats: Arc<CaptureStats>,
    ) -> Self {
        Self { ring, correlator, stats }
    }

    /// Ingest one raw record from the kernel ring buffer.
    pub fn ingest(&mut self, bytes: &[u8]) {
        if bytes.len() < size_of::<RecordHeader>() {
            self.stats.malformed.fetch_add(1, Ordering::Relaxed);
            warn!("malformed kernel record: {} bytes", bytes.len());
            return;
        }
        let kind = u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        match record_len(kind) {
            Some(expected) if expected == bytes.len() => {}
            Some(expected) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!("kernel record kind {kind}: expected {expected} bytes, got {}", bytes.len());
                return;
            }
            None => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!("kernel record with unknown kind {kind}");
                return;
            }
        }

        match kind {
            REC_ENTRY => {
                let rec: EntryRecord = read_record(bytes);
                self.correlator.record_entry(
                    rec.hdr.pid,
                    Entry { source: rec.source, ts_ns: rec.ts_ns, args: rec.args },
                );
            }
            REC_EXIT => self.assemble(&read_record::<ExitRecord>(bytes)),
            REC_EXEC => {
                // Enrichment: the probe cannot walk to the parent task, so
                // the parent pid comes from /proc while the process is still
                // fresh.
                let mut rec: ExecRecord = read_record(bytes);
                #[allow(clippy::cast_possible_wrap)]
                if rec.ppid == 0 {
                    rec.ppid = process_lookup::ppid(rec.hdr.pid as i32).unwrap_or(0);
                }
                self.forward(rec.as_bytes());
            }
            _ => self.forward(bytes),
        }
    }

    /// Pair an exit with its recorded entry and emit the completed record.
    /// A miss (no entry, stale source) emits nothing.
    fn assemble(&mut self, exit: &ExitRecord) {
        let Some(entry) = self.correlator.take_exit(exit.hdr.pid) else {
            self.stats.unmatched_exits.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if entry.source != exit.source {
            // Entry from a different instrumented call clobbered ours;
            // neither half can be trusted.
            self.stats.unmatched_exits.fetch_add(1, Ordering::Relaxed);
            debug!(
                "discarding stale correlation for pid {}: entry source {} vs exit source {}",
                exit.hdr.pid, entry.source, exit.source
            );
            return;
        }

        let duration_ns = exit.ts_ns.saturating_sub(entry.ts_ns);
        match exit.source {
            SRC_GGML_MALLOC => {
                if exit.ret == 0 {
                    // Failed allocation, not recorded.
                    return;
                }
                let rec = MemRecord {
                    hdr: RecordHeader::new(REC_MEM, exit.hdr.pid, exit.hdr.comm),
                    op: MEM_MALLOC,
                    _pad: 0,
                    size: entry.args[0],
                    ptr: exit.ret,
                };
                self.stats.assembled.fetch_add(1, Ordering::Relaxed);
                self.forward(rec.as_bytes());
            }
            SRC_CUDA_MALLOC => {
                #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
                let rec = CudaMallocRecord {
                    hdr: RecordHeader::new(REC_CUDA_MALLOC, exit.hdr.pid, exit.hdr.comm),
                    retval: exit.ret as i32,
                    _pad: 0,
                    size: entry.args[0],
                    ptr: exit.aux,
                };
                self.stats.assembled.fetch_add(1, Ordering::Relaxed);
                self.forward(rec.as_bytes());
            }
            SRC_CUDA_SYNC | SRC_MUL_MAT_VEC_Q | SRC_MUL_MAT_Q => {
                let rec = DurationRecord {
                    hdr: RecordHeader::new(REC_DURATION, exit.hdr.pid, exit.hdr.comm),
                    source: exit.source,
                    _pad: 0,
                    duration_ns,
                };
                self.stats.assembled.fetch_add(1, Ordering::Relaxed);
                self.forward(rec.as_bytes());
            }
            SRC_GRAPH_COMPUTE => {
                let (graph_size, graph_nodes, graph_leafs, graph_order) =
                    unpack_graph_args(entry.args);
                let rec = GraphRecord {
                    hdr: RecordHeader::new(REC_GRAPH, exit.hdr.pid, exit.hdr.comm),
                    graph_size,
                    graph_nodes,
                    graph_leafs,
                    graph_order,
                    cost_ns: duration_ns,
                };
                self.stats.assembled.fetch_add(1, Ordering::Relaxed);
                self.forward(rec.as_bytes());
            }
            other => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!("exit record with unknown correlation source {other}");
            }
        }
    }

    /// Hand one completed record to the channel. Never blocks: a full
    /// channel counts the drop on the ring itself.
    fn forward(&mut self, bytes: &[u8]) {
        if let Some(mut slot) = self.ring.reserve(bytes.len()) {
            slot.bytes_mut().copy_from_slice(bytes);
            slot.commit();
            self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Drain the kernel ring buffer until shutdown. Readiness-driven via the
/// map fd; every batch is consumed to exhaustion so the kernel side never
/// backs up on us.
pub async fn run_drain(
    ringbuf: RingBuf<MapData>,
    mut assembler: Assembler,
    shutdown: Shutdown,
) -> Result<()> {
    let mut poll = AsyncFd::new(ringbuf)?;
    loop {
        tokio::select! {
            guard = poll.readable_mut() => {
                let mut guard = guard?;
                while let Some(item) = guard.get_inner_mut().next() {
                    assembler.ingest(&item);
                }
                guard.clear_ready();
            }
            () = shutdown.triggered() => break,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{self, Event};
    use crate::ring::{Control, RingConsumer};
    use gpuscope_common::{pack_pair, SchedRecord, REC_SCHED, SCHED_SWITCH_IN, TASK_COMM_LEN};

    fn comm(s: &str) -> [u8; TASK_COMM_LEN] {
        let mut buf = [0u8; TASK_COMM_LEN];
        buf[..s.len()].copy_from_slice(s.as_bytes());
        buf
    }

    fn entry(pid: u32, source: u32, ts_ns: u64, args: [u64; 2]) -> EntryRecord {
        EntryRecord {
            hdr: RecordHeader::new(REC_ENTRY, pid, comm("proc")),
            source,
            _pad: 0,
            ts_ns,
            args,
        }
    }

    fn exit(pid: u32, source: u32, ts_ns: u64, ret: u64, aux: u64) -> ExitRecord {
        ExitRecord {
            hdr: RecordHeader::new(REC_EXIT, pid, comm("proc")),
            source,
            _pad: 0,
            ts_ns,
            ret,
            aux,
        }
    }

    fn harness() -> (Assembler, RingConsumer, Arc<CaptureStats>) {
        let (ring, consumer) = RingBuffer::with_capacity(4096);
        let correlator = Arc::new(Correlator::with_capacity(128));
        let stats = Arc::new(CaptureStats::default());
        (Assembler::new(ring, correlator, Arc::clone(&stats)), consumer, stats)
    }

    fn decoded(consumer: &mut RingConsumer) -> Vec<Event> {
        let mut out = Vec::new();
        consumer.drain_now(&mut |bytes: &[u8]| {
            out.push(events::decode(bytes).unwrap());
            Control::Continue
        });
        out
    }

    #[test]
    fn malloc_entry_exit_assembles_a_mem_event() {
        let (mut asm, mut consumer, stats) = harness();
        asm.ingest(entry(100, SRC_GGML_MALLOC, 1_000, [4096, 0]).as_bytes());
        asm.ingest(exit(100, SRC_GGML_MALLOC, 2_000, 0xdead_0000, 0).as_bytes());

        let events = decoded(&mut consumer);
        assert_eq!(events.len(), 1);
        let Event::Mem(ev) = &events[0] else { panic!("wrong family") };
        assert_eq!(ev.pid, 100);
        assert_eq!(ev.op, 0);
        assert_eq!(ev.size, 4096);
        assert_eq!(ev.ptr, 0xdead_0000);
        assert_eq!(stats.assembled.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn failed_malloc_is_not_recorded() {
        let (mut asm, mut consumer, _stats) = harness();
        asm.ingest(entry(100, SRC_GGML_MALLOC, 1_000, [4096, 0]).as_bytes());
        asm.ingest(exit(100, SRC_GGML_MALLOC, 2_000, 0, 0).as_bytes());
        assert!(decoded(&mut consumer).is_empty());
        // The entry was consumed: a second exit also misses.
        asm.ingest(exit(100, SRC_GGML_MALLOC, 3_000, 0xbeef, 0).as_bytes());
        assert!(decoded(&mut consumer).is_empty());
    }

    #[test]
    fn exit_without_entry_emits_nothing() {
        let (mut asm, mut consumer, stats) = harness();
        asm.ingest(exit(7, SRC_CUDA_SYNC, 500, 0, 0).as_bytes());
        assert!(decoded(&mut consumer).is_empty());
        assert_eq!(stats.unmatched_exits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn sync_pair_becomes_a_duration_event() {
        let (mut asm, mut consumer, _stats) = harness();
        asm.ingest(entry(42, SRC_CUDA_SYNC, 10_000, [0, 0]).as_bytes());
        asm.ingest(exit(42, SRC_CUDA_SYNC, 22_000, 0, 0).as_bytes());

        let events = decoded(&mut consumer);
        let Event::Duration(ev) = &events[0] else { panic!("wrong family") };
        assert_eq!(ev.duration_ns, 12_000);
        assert_eq!(ev.func_name(), "cudaDeviceSynchronize");
    }

    #[test]
    fn cuda_malloc_pair_keeps_retval_and_resolved_ptr() {
        let (mut asm, mut consumer, _stats) = harness();
        asm.ingest(entry(42, SRC_CUDA_MALLOC, 1, [1 << 20, 0]).as_bytes());
        asm.ingest(exit(42, SRC_CUDA_MALLOC, 2, 0, 0x7f00_0000).as_bytes());

        let events = decoded(&mut consumer);
        let Event::CudaMalloc(ev) = &events[0] else { panic!("wrong family") };
        assert_eq!(ev.retval, 0);
        assert_eq!(ev.size, 1 << 20);
        assert_eq!(ev.ptr, 0x7f00_0000);
    }

    #[test]
    fn graph_pair_unpacks_entry_metadata() {
        let (mut asm, mut consumer, _stats) = harness();
        let args = [pack_pair(2048, 640), pack_pair(320, 1)];
        asm.ingest(entry(9, SRC_GRAPH_COMPUTE, 5_000, args).as_bytes());
        asm.ingest(exit(9, SRC_GRAPH_COMPUTE, 9_500, 0, 0).as_bytes());

        let events = decoded(&mut consumer);
        let Event::Graph(ev) = &events[0] else { panic!("wrong family") };
        assert_eq!(
            (ev.graph_size, ev.graph_nodes, ev.graph_leafs, ev.graph_order),
            (2048, 640, 320, 1)
        );
        assert_eq!(ev.cost_ns, 4_500);
    }

    #[test]
    fn mismatched_sources_discard_both_halves() {
        let (mut asm, mut consumer, stats) = harness();
        asm.ingest(entry(5, SRC_GGML_MALLOC, 1, [64, 0]).as_bytes());
        asm.ingest(exit(5, SRC_CUDA_SYNC, 2, 0, 0).as_bytes());
        assert!(decoded(&mut consumer).is_empty());
        assert_eq!(stats.unmatched_exits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn passthrough_records_are_forwarded_verbatim() {
        let (mut asm, mut consumer, stats) = harness();
        let rec = SchedRecord {
            hdr: RecordHeader::new(REC_SCHED, 3, comm("proc")),
            op: SCHED_SWITCH_IN,
            cpu: 1,
        };
        asm.ingest(rec.as_bytes());
        let events = decoded(&mut consumer);
        let Event::Sched(ev) = &events[0] else { panic!("wrong family") };
        assert_eq!((ev.pid, ev.cpu, ev.op), (3, 1, 0));
        assert_eq!(stats.forwarded.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn malformed_records_are_counted_and_dropped() {
        let (mut asm, mut consumer, stats) = harness();
        asm.ingest(&[0u8; 4]); // shorter than a header
        let mut bytes = vec![0u8; 48];
        bytes[..4].copy_from_slice(&999u32.to_ne_bytes());
        asm.ingest(&bytes); // unknown kind
        let mut truncated = SchedRecord {
            hdr: RecordHeader::new(REC_SCHED, 3, comm("proc")),
            op: SCHED_SWITCH_IN,
            cpu: 1,
        }
        .as_bytes()
        .to_vec();
        truncated.pop();
        asm.ingest(&truncated); // bad size
        assert!(decoded(&mut consumer).is_empty());
        assert_eq!(stats.malformed.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn exec_records_get_a_parent_pid() {
        let (mut asm, mut consumer, _stats) = harness();
        let pid = std::process::id();
        let mut rec = ExecRecord {
            hdr: RecordHeader::new(REC_EXEC, pid, comm("cargo")),
            ppid: 0,
            _pad: 0,
            filename: [0; 64],
            args: [0; 128],
        };
        rec.filename[..8].copy_from_slice(b"/bin/cat");
        asm.ingest(rec.as_bytes());

        let events = decoded(&mut consumer);
        let Event::Exec(ev) = &events[0] else { panic!("wrong family") };
        assert!(ev.ppid > 0);
        assert_eq!(ev.filename, "/bin/cat");
    }
}

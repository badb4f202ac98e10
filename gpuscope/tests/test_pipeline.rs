//! End-to-end pipeline tests without a kernel: raw records go through the
//! assembler (correlator pairing), the bounded channel, the decoder, and
//! the publisher's wire encoding.

use std::sync::Arc;

use gpuscope::capture::{Assembler, CaptureStats};
use gpuscope::correlator::Correlator;
use gpuscope::events::{self, Event};
use gpuscope::publish::encode_payload;
use gpuscope::ring::{Control, RingBuffer, RingConsumer};
use gpuscope_common::{
    EntryRecord, ExitRecord, RawRecord, RecordHeader, SchedRecord, LogRecord, REC_ENTRY,
    REC_EXIT, REC_LOG, REC_SCHED, SCHED_SWITCH_IN, SRC_GGML_MALLOC, TASK_COMM_LEN,
};

fn comm(s: &str) -> [u8; TASK_COMM_LEN] {
    let mut buf = [0u8; TASK_COMM_LEN];
    buf[..s.len()].copy_from_slice(s.as_bytes());
    buf
}

fn harness(ring_bytes: usize) -> (Assembler, RingConsumer) {
    let (ring, consumer) = RingBuffer::with_capacity(ring_bytes);
    let correlator = Arc::new(Correlator::with_capacity(256));
    let stats = Arc::new(CaptureStats::default());
    (Assembler::new(ring, correlator, stats), consumer)
}

fn decode_all(consumer: &mut RingConsumer) -> Vec<Event> {
    let mut out = Vec::new();
    consumer.drain_now(&mut |bytes: &[u8]| {
        out.push(events::decode(bytes).expect("pipeline delivered an undecodable record"));
        Control::Continue
    });
    out
}

fn read_string(rd: &mut &[u8]) -> String {
    let len = rmp::decode::read_str_len(rd).unwrap() as usize;
    let (s, rest) = rd.split_at(len);
    let out = String::from_utf8(s.to_vec()).unwrap();
    *rd = rest;
    out
}

/// The malloc pairing scenario: an entry carrying the requested size plus
/// an exit carrying the returned pointer publish as
/// `[ts, 100, "proc", 0, 4096, 0xdead0000]`.
#[test]
fn malloc_pairing_produces_the_documented_payload() {
    let (mut asm, mut consumer) = harness(4096);

    asm.ingest(
        EntryRecord {
            hdr: RecordHeader::new(REC_ENTRY, 100, comm("proc")),
            source: SRC_GGML_MALLOC,
            _pad: 0,
            ts_ns: 1_000,
            args: [4096, 0],
        }
        .as_bytes(),
    );
    asm.ingest(
        ExitRecord {
            hdr: RecordHeader::new(REC_EXIT, 100, comm("proc")),
            source: SRC_GGML_MALLOC,
            _pad: 0,
            ts_ns: 2_000,
            ret: 0xdead_0000,
            aux: 0,
        }
        .as_bytes(),
    );

    let events = decode_all(&mut consumer);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].topic(), "ggml_base");

    let mut payload = Vec::new();
    encode_payload(&events[0], &mut payload).unwrap();

    let mut rd = &payload[..];
    assert_eq!(rmp::decode::read_array_len(&mut rd).unwrap(), 6);
    let ts: i64 = rmp::decode::read_int(&mut rd).unwrap();
    assert!(ts > 0);
    assert_eq!(rmp::decode::read_int::<i64, _>(&mut rd).unwrap(), 100);
    assert_eq!(read_string(&mut rd), "proc");
    assert_eq!(rmp::decode::read_int::<i64, _>(&mut rd).unwrap(), 0);
    assert_eq!(rmp::decode::read_int::<u64, _>(&mut rd).unwrap(), 4096);
    assert_eq!(rmp::decode::read_int::<u64, _>(&mut rd).unwrap(), 0xdead_0000);
    assert!(rd.is_empty());
}

/// Saturating the channel loses events but never corrupts the survivors.
#[test]
fn saturation_drops_whole_records_only() {
    let (mut asm, mut consumer) = harness(256);

    for cpu in 0..100 {
        asm.ingest(
            SchedRecord {
                hdr: RecordHeader::new(REC_SCHED, 7, comm("proc")),
                op: SCHED_SWITCH_IN,
                cpu,
            }
            .as_bytes(),
        );
    }

    let events = decode_all(&mut consumer);
    assert!(!events.is_empty());
    assert!(events.len() < 100);
    // Survivors are intact and still in commit order.
    let mut last_cpu = -1;
    for ev in events {
        let Event::Sched(ev) = ev else { panic!("wrong family") };
        assert_eq!(ev.pid, 7);
        assert_eq!(ev.comm, "proc");
        assert!(ev.cpu > last_cpu);
        last_cpu = ev.cpu;
    }
}

/// Mixed families keep their commit order through the channel.
#[test]
fn families_interleave_in_commit_order() {
    let (mut asm, mut consumer) = harness(64 * 1024);

    for i in 0..10u32 {
        asm.ingest(
            SchedRecord {
                hdr: RecordHeader::new(REC_SCHED, i, comm("proc")),
                op: SCHED_SWITCH_IN,
                cpu: 0,
            }
            .as_bytes(),
        );
        let mut log = LogRecord {
            hdr: RecordHeader::new(REC_LOG, i, comm("ollama")),
            text: [0; 256],
        };
        log.text[..5].copy_from_slice(b"hello");
        asm.ingest(log.as_bytes());
    }

    let events = decode_all(&mut consumer);
    assert_eq!(events.len(), 20);
    for (i, pair) in events.chunks(2).enumerate() {
        let Event::Sched(s) = &pair[0] else { panic!("expected sched first") };
        let Event::Log(l) = &pair[1] else { panic!("expected log second") };
        assert_eq!(s.pid as usize, i);
        assert_eq!(l.pid as usize, i);
        assert_eq!(l.text, "hello");
    }
}

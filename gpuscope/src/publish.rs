//! # Publisher
//!
//! Re-encodes typed events into compact MessagePack positional arrays and
//! sends them as two-frame messages (encoded topic, payload) on a PUB
//! socket. Downstream consumers decode positionally: element order and
//! count per family are part of the wire contract and must not change
//! without a schema version bump.
//!
//! The publisher owns one reusable payload buffer (cleared, not
//! reallocated, between sends) and a pre-encoded topic frame per family, so
//! the steady-state send path performs no encoding allocations. Sends are
//! best-effort, at-most-once: a failure is logged by the caller and the
//! event is dropped, never retried.

use std::collections::HashMap;

use anyhow::{Context, Result};
use bytes::Bytes;
use rmp::encode::{self, ValueWriteError};
use thiserror::Error;
use zeromq::{Socket, SocketSend, ZmqMessage};

use crate::events::Event;

pub const TOPIC_GGML_BASE: &str = "ggml_base";
pub const TOPIC_GGML_CUDA: &str = "ggml_cuda";
pub const TOPIC_GGML_GRAPH: &str = "ggml_graph_compute";
pub const TOPIC_CUDA_MALLOC: &str = "cudaMalloc";
pub const TOPIC_CUDA_FREE: &str = "cudaFree";
pub const TOPIC_CUDA_MEMCPY: &str = "cudaMemcpy";
pub const TOPIC_CUDA_LAUNCH: &str = "cudaLaunchKernel";
pub const TOPIC_SCHED: &str = "sched";
pub const TOPIC_EXECV: &str = "execv";
pub const TOPIC_LLAMA_LOG: &str = "llamaLog";
pub const TOPIC_VFS_OPEN: &str = "vfs_open";

const ALL_TOPICS: &[&str] = &[
    TOPIC_GGML_BASE,
    TOPIC_GGML_CUDA,
    TOPIC_GGML_GRAPH,
    TOPIC_CUDA_MALLOC,
    TOPIC_CUDA_FREE,
    TOPIC_CUDA_MEMCPY,
    TOPIC_CUDA_LAUNCH,
    TOPIC_SCHED,
    TOPIC_EXECV,
    TOPIC_LLAMA_LOG,
    TOPIC_VFS_OPEN,
];

impl Event {
    /// The pub/sub topic identifying this event's family.
    #[must_use]
    pub fn topic(&self) -> &'static str {
        match self {
            Event::Mem(_) => TOPIC_GGML_BASE,
            Event::Duration(_) => TOPIC_GGML_CUDA,
            Event::Graph(_) => TOPIC_GGML_GRAPH,
            Event::CudaMalloc(_) => TOPIC_CUDA_MALLOC,
            Event::CudaFree(_) => TOPIC_CUDA_FREE,
            Event::Memcpy(_) => TOPIC_CUDA_MEMCPY,
            Event::Launch(_) => TOPIC_CUDA_LAUNCH,
            Event::Sched(_) => TOPIC_SCHED,
            Event::Exec(_) => TOPIC_EXECV,
            Event::Log(_) => TOPIC_LLAMA_LOG,
            Event::Open(_) => TOPIC_VFS_OPEN,
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("payload encoding failed: {0}")]
    Encode(#[from] ValueWriteError),
    #[error("socket send failed: {0}")]
    Send(#[from] zeromq::ZmqError),
}

/// Encode `event` as its family's positional array into `buf` (which is
/// appended to, not cleared; the publisher clears it between sends).
pub fn encode_payload(event: &Event, buf: &mut Vec<u8>) -> Result<(), ValueWriteError> {
    match event {
        Event::Mem(ev) => {
            // [timestamp_ns, pid, comm, type, size, ptr]
            encode::write_array_len(buf, 6)?;
            encode::write_sint(buf, ev.ts_ns)?;
            encode::write_sint(buf, i64::from(ev.pid))?;
            encode::write_str(buf, &ev.comm)?;
            encode::write_sint(buf, i64::from(ev.op))?;
            encode::write_uint(buf, ev.size)?;
            encode::write_uint(buf, ev.ptr)?;
        }
        Event::Duration(ev) => {
            // [timestamp_ns, pid, comm, func_name, duration_ns]
            encode::write_array_len(buf, 5)?;
            encode::write_sint(buf, ev.ts_ns)?;
            encode::write_sint(buf, i64::from(ev.pid))?;
            encode::write_str(buf, &ev.comm)?;
            encode::write_str(buf, ev.func_name())?;
            encode::write_sint(buf, ev.duration_ns)?;
        }
        Event::Graph(ev) => {
            // [timestamp_ns, pid, comm, size, nodes, leafs, order, cost_ns]
            encode::write_array_len(buf, 8)?;
            encode::write_sint(buf, ev.ts_ns)?;
            encode::write_sint(buf, i64::from(ev.pid))?;
            encode::write_str(buf, &ev.comm)?;
            encode::write_sint(buf, i64::from(ev.graph_size))?;
            encode::write_sint(buf, i64::from(ev.graph_nodes))?;
            encode::write_sint(buf, i64::from(ev.graph_leafs))?;
            encode::write_sint(buf, i64::from(ev.graph_order))?;
            encode::write_sint(buf, ev.cost_ns)?;
        }
        Event::CudaMalloc(ev) => {
            // [timestamp_ns, pid, comm, ptr, size, retval]
            encode::write_array_len(buf, 6)?;
            encode::write_sint(buf, ev.ts_ns)?;
            encode::write_sint(buf, i64::from(ev.pid))?;
            encode::write_str(buf, &ev.comm)?;
            encode::write_uint(buf, ev.ptr)?;
            encode::write_uint(buf, ev.size)?;
            encode::write_sint(buf, i64::from(ev.retval))?;
        }
        Event::CudaFree(ev) => {
            // [timestamp_ns, pid, comm, ptr]
            encode::write_array_len(buf, 4)?;
            encode::write_sint(buf, ev.ts_ns)?;
            encode::write_sint(buf, i64::from(ev.pid))?;
            encode::write_str(buf, &ev.comm)?;
            encode::write_uint(buf, ev.ptr)?;
        }
        Event::Memcpy(ev) => {
            // [timestamp_ns, pid, comm, src, dst, size, kind]
            encode::write_array_len(buf, 7)?;
            encode::write_sint(buf, ev.ts_ns)?;
            encode::write_sint(buf, i64::from(ev.pid))?;
            encode::write_str(buf, &ev.comm)?;
            encode::write_uint(buf, ev.src)?;
            encode::write_uint(buf, ev.dst)?;
            encode::write_uint(buf, ev.size)?;
            encode::write_sint(buf, i64::from(ev.kind))?;
        }
        Event::Launch(ev) => {
            // [timestamp_ns, pid, comm, func_ptr]
            encode::write_array_len(buf, 4)?;
            encode::write_sint(buf, ev.ts_ns)?;
            encode::write_sint(buf, i64::from(ev.pid))?;
            encode::write_str(buf, &ev.comm)?;
            encode::write_uint(buf, ev.func_ptr)?;
        }
        Event::Sched(ev) => {
            // [timestamp_ns, pid, comm, cpu, type]
            encode::write_array_len(buf, 5)?;
            encode::write_sint(buf, ev.ts_ns)?;
            encode::write_sint(buf, i64::from(ev.pid))?;
            encode::write_str(buf, &ev.comm)?;
            encode::write_sint(buf, i64::from(ev.cpu))?;
            encode::write_sint(buf, i64::from(ev.op))?;
        }
        Event::Exec(ev) => {
            // [timestamp_ns, pid, ppid, filename, args]
            encode::write_array_len(buf, 5)?;
            encode::write_sint(buf, ev.ts_ns)?;
            encode::write_sint(buf, i64::from(ev.pid))?;
            encode::write_sint(buf, i64::from(ev.ppid))?;
            encode::write_str(buf, &ev.filename)?;
            encode::write_str(buf, &ev.args)?;
        }
        Event::Log(ev) => {
            // [timestamp_ns, pid, comm, text]
            encode::write_array_len(buf, 4)?;
            encode::write_sint(buf, ev.ts_ns)?;
            encode::write_sint(buf, i64::from(ev.pid))?;
            encode::write_str(buf, &ev.comm)?;
            encode::write_str(buf, &ev.text)?;
        }
        Event::Open(ev) => {
            // [timestamp_ns, pid, comm, filename]
            encode::write_array_len(buf, 4)?;
            encode::write_sint(buf, ev.ts_ns)?;
            encode::write_sint(buf, i64::from(ev.pid))?;
            encode::write_str(buf, &ev.comm)?;
            encode::write_str(buf, &ev.filename)?;
        }
    }
    Ok(())
}

fn encode_topic(topic: &str) -> Result<Bytes, ValueWriteError> {
    let mut buf = Vec::with_capacity(topic.len() + 2);
    encode::write_str(&mut buf, topic)?;
    Ok(Bytes::from(buf))
}

/// PUB-socket publisher with reusable encode buffers.
pub struct Publisher {
    socket: zeromq::PubSocket,
    endpoint: String,
    payload_buf: Vec<u8>,
    topic_frames: HashMap<&'static str, Bytes>,
}

impl Publisher {
    /// Bind the PUB socket. Failure here is fatal at startup.
    pub async fn bind(endpoint: &str) -> Result<Self> {
        let mut socket = zeromq::PubSocket::new();
        let resolved = socket
            .bind(endpoint)
            .await
            .with_context(|| format!("failed to bind publish socket to {endpoint}"))?;

        // ipc endpoints are only reachable by other users if the socket file
        // is opened up, same as the original agent did.
        if let Some(path) = endpoint.strip_prefix("ipc://") {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) =
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))
            {
                log::warn!("failed to relax permissions on {path}: {e}");
            }
        }

        let mut topic_frames = HashMap::new();
        for topic in ALL_TOPICS {
            topic_frames.insert(*topic, encode_topic(topic).context("topic encoding failed")?);
        }

        Ok(Self {
            socket,
            endpoint: resolved.to_string(),
            payload_buf: Vec::with_capacity(512),
            topic_frames,
        })
    }

    /// The bound endpoint with any wildcard port resolved.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send one event as (topic frame, payload frame). At-most-once: errors
    /// are returned for the caller to log, the event is gone either way.
    pub async fn publish(&mut self, event: &Event) -> Result<(), PublishError> {
        self.payload_buf.clear();
        encode_payload(event, &mut self.payload_buf)?;

        let topic = event.topic();
        let frame = match self.topic_frames.get(topic) {
            Some(frame) => frame.clone(),
            None => {
                let frame = encode_topic(topic)?;
                self.topic_frames.insert(topic, frame.clone());
                frame
            }
        };

        let mut msg = ZmqMessage::from(frame);
        msg.push_back(Bytes::copy_from_slice(&self.payload_buf));
        self.socket.send(msg).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{
        CudaMallocEvent, DurationEvent, ExecEvent, LogEvent, MemEvent, OpenEvent, SchedEvent,
    };
    use gpuscope_common::SRC_CUDA_SYNC;

    fn read_i64(rd: &mut &[u8]) -> i64 {
        rmp::decode::read_int(rd).unwrap()
    }

    fn read_u64(rd: &mut &[u8]) -> u64 {
        rmp::decode::read_int(rd).unwrap()
    }

    fn read_string(rd: &mut &[u8]) -> String {
        let len = rmp::decode::read_str_len(rd).unwrap() as usize;
        let (s, rest) = rd.split_at(len);
        let out = String::from_utf8(s.to_vec()).unwrap();
        *rd = rest;
        out
    }

    #[test]
    fn mem_payload_round_trips_positionally() {
        let ev = Event::Mem(MemEvent {
            ts_ns: 1_234_567,
            pid: 100,
            comm: "proc".into(),
            op: 0,
            size: 4096,
            ptr: 0xdead_0000,
        });
        let mut buf = Vec::new();
        encode_payload(&ev, &mut buf).unwrap();

        let mut rd = &buf[..];
        assert_eq!(rmp::decode::read_array_len(&mut rd).unwrap(), 6);
        assert_eq!(read_i64(&mut rd), 1_234_567);
        assert_eq!(read_i64(&mut rd), 100);
        assert_eq!(read_string(&mut rd), "proc");
        assert_eq!(read_i64(&mut rd), 0);
        assert_eq!(read_u64(&mut rd), 4096);
        assert_eq!(read_u64(&mut rd), 0xdead_0000);
        assert!(rd.is_empty());
    }

    #[test]
    fn duration_payload_carries_the_label() {
        let ev = Event::Duration(DurationEvent {
            ts_ns: 7,
            pid: 8,
            comm: "ollama".into(),
            source: SRC_CUDA_SYNC,
            duration_ns: 12_000,
        });
        let mut buf = Vec::new();
        encode_payload(&ev, &mut buf).unwrap();

        let mut rd = &buf[..];
        assert_eq!(rmp::decode::read_array_len(&mut rd).unwrap(), 5);
        assert_eq!(read_i64(&mut rd), 7);
        assert_eq!(read_i64(&mut rd), 8);
        assert_eq!(read_string(&mut rd), "ollama");
        assert_eq!(read_string(&mut rd), "cudaDeviceSynchronize");
        assert_eq!(read_i64(&mut rd), 12_000);
        assert!(rd.is_empty());
    }

    #[test]
    fn exec_payload_has_no_comm_field() {
        let ev = Event::Exec(ExecEvent {
            ts_ns: 1,
            pid: 2,
            ppid: 3,
            filename: "/bin/cat".into(),
            args: "cat /etc/hosts".into(),
        });
        let mut buf = Vec::new();
        encode_payload(&ev, &mut buf).unwrap();

        let mut rd = &buf[..];
        assert_eq!(rmp::decode::read_array_len(&mut rd).unwrap(), 5);
        assert_eq!(read_i64(&mut rd), 1);
        assert_eq!(read_i64(&mut rd), 2);
        assert_eq!(read_i64(&mut rd), 3);
        assert_eq!(read_string(&mut rd), "/bin/cat");
        assert_eq!(read_string(&mut rd), "cat /etc/hosts");
        assert!(rd.is_empty());
    }

    #[test]
    fn four_element_families_round_trip() {
        for (ev, want_last) in [
            (
                Event::Log(LogEvent { ts_ns: 1, pid: 2, comm: "c".into(), text: "hi".into() }),
                "hi",
            ),
            (
                Event::Open(OpenEvent {
                    ts_ns: 1,
                    pid: 2,
                    comm: "c".into(),
                    filename: "/etc/hosts".into(),
                }),
                "/etc/hosts",
            ),
        ] {
            let mut buf = Vec::new();
            encode_payload(&ev, &mut buf).unwrap();
            let mut rd = &buf[..];
            assert_eq!(rmp::decode::read_array_len(&mut rd).unwrap(), 4);
            assert_eq!(read_i64(&mut rd), 1);
            assert_eq!(read_i64(&mut rd), 2);
            assert_eq!(read_string(&mut rd), "c");
            assert_eq!(read_string(&mut rd), want_last);
            assert!(rd.is_empty());
        }
    }

    #[test]
    fn sched_and_cuda_malloc_orders_are_fixed() {
        let ev = Event::Sched(SchedEvent {
            ts_ns: 9,
            pid: 10,
            comm: "proc".into(),
            cpu: 3,
            op: 1,
        });
        let mut buf = Vec::new();
        encode_payload(&ev, &mut buf).unwrap();
        let mut rd = &buf[..];
        assert_eq!(rmp::decode::read_array_len(&mut rd).unwrap(), 5);
        read_i64(&mut rd);
        read_i64(&mut rd);
        read_string(&mut rd);
        assert_eq!(read_i64(&mut rd), 3); // cpu before type
        assert_eq!(read_i64(&mut rd), 1);

        let ev = Event::CudaMalloc(CudaMallocEvent {
            ts_ns: 9,
            pid: 10,
            comm: "proc".into(),
            ptr: 0xbeef,
            size: 64,
            retval: 0,
        });
        let mut buf = Vec::new();
        encode_payload(&ev, &mut buf).unwrap();
        let mut rd = &buf[..];
        assert_eq!(rmp::decode::read_array_len(&mut rd).unwrap(), 6);
        read_i64(&mut rd);
        read_i64(&mut rd);
        read_string(&mut rd);
        assert_eq!(read_u64(&mut rd), 0xbeef); // ptr before size
        assert_eq!(read_u64(&mut rd), 64);
        assert_eq!(read_i64(&mut rd), 0);
    }

    #[test]
    fn topic_frame_is_a_msgpack_string() {
        let frame = encode_topic(TOPIC_GGML_BASE).unwrap();
        let mut rd = &frame[..];
        assert_eq!(read_string(&mut rd), "ggml_base");
        assert!(rd.is_empty());
    }

    #[test]
    fn every_family_maps_to_a_precomputed_topic() {
        let ev = Event::Log(LogEvent { ts_ns: 0, pid: 0, comm: String::new(), text: String::new() });
        assert_eq!(ev.topic(), "llamaLog");
        assert!(ALL_TOPICS.contains(&ev.topic()));
    }
}

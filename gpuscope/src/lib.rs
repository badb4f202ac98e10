//! # gpuscope - eBPF Event Capture and Delivery Pipeline
//!
//! gpuscope instruments LLM runtimes (ollama / ggml / CUDA) and the kernel
//! scheduler with eBPF probes, captures fixed-layout event records, and
//! republishes them as compact MessagePack arrays on a ZeroMQ PUB socket
//! for downstream analysis.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                 Instrumented Runtime / Kernel              │
//! │   uprobes (ggml, CUDA, llamaLog) · tracepoints · fentry    │
//! └────────────────────────────┬───────────────────────────────┘
//!                              │ kernel ring buffer
//!                              ▼
//! ┌────────────────────────────────────────────────────────────┐
//! │                    gpuscope (this crate)                   │
//! │                                                            │
//! │  drain ──▶ correlator ──▶ lossy bounded channel            │
//! │  (pairs entry/exit)       (reserve/commit/discard)         │
//! │                              │ poll(timeout)               │
//! │                              ▼                             │
//! │                 decode ──▶ publish (topic, payload)        │
//! └────────────────────────────┬───────────────────────────────┘
//!                              │ PUB socket (two frames)
//!                              ▼
//!                     external subscribers
//! ```
//!
//! ## Module Structure
//!
//! - [`capture`]: eBPF load/attach glue and the kernel ring-buffer drain
//!   that assembles entry/exit pairs into completed records
//! - [`correlator`]: fixed-capacity table pairing call entries with exits
//! - [`ring`]: the lossy bounded channel between capture and the consumer
//! - [`consumer`]: the single poll loop (decode → publish, bounded waits,
//!   cooperative cancellation)
//! - [`events`]: typed event families and the size-checked decoder
//! - [`publish`]: positional MessagePack encoding and the PUB socket
//! - [`process_lookup`]: best-effort `/proc` enrichment
//! - [`shutdown`]: the cooperative termination signal
//! - [`cli`]: command-line argument parsing
//!
//! ## Delivery Semantics
//!
//! Lossy by design, end to end: a full buffer or table drops the event and
//! increments a counter, and publishing is at-most-once with no retry. The
//! one guarantee is ordering: records are decoded and published in commit
//! order, and no partial or discarded record is ever observed.

pub mod capture;
pub mod cli;
pub mod consumer;
pub mod correlator;
pub mod events;
pub mod process_lookup;
pub mod publish;
pub mod ring;
pub mod shutdown;

//! # gpuscope - Main Entry Point
//!
//! Wires the pipeline together: bind the publish socket, build the channel
//! and correlator, load and attach the eBPF probes, then run the drain task
//! and the consumer loop until Ctrl-C (or the duration limit) trips the
//! shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use aya::maps::RingBuf;
use clap::Parser;
use log::{info, warn};

use gpuscope::capture::{self, Assembler, CaptureStats, ProbeTargets};
use gpuscope::cli::Args;
use gpuscope::consumer::Consumer;
use gpuscope::correlator::Correlator;
use gpuscope::publish::Publisher;
use gpuscope::ring::RingBuffer;
use gpuscope::shutdown::Shutdown;
use gpuscope_common::{FilterConfig, TASK_COMM_LEN};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_NOPERM: i32 = 77;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_code_for(&e)
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = err.to_string().to_lowercase();
    if msg.contains("permission denied") || msg.contains("operation not permitted") {
        EXIT_NOPERM
    } else {
        EXIT_ERROR
    }
}

/// Loading BPF programs locks their pages into memory; older kernels need
/// the limit raised before loading.
#[allow(unsafe_code)]
fn bump_memlock_rlimit() {
    let rlimit = libc::rlimit { rlim_cur: libc::RLIM_INFINITY, rlim_max: libc::RLIM_INFINITY };
    // SAFETY: plain setrlimit syscall with a valid struct.
    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlimit) } != 0 {
        warn!("failed to raise RLIMIT_MEMLOCK; BPF map creation may fail");
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();

    if let Some(comm) = &args.comm {
        if comm.len() >= TASK_COMM_LEN {
            bail!("--comm is limited to {} bytes", TASK_COMM_LEN - 1);
        }
    }
    let filter = FilterConfig::new(args.pid, args.comm.as_deref());

    if !args.quiet {
        println!("gpuscope v{}", env!("CARGO_PKG_VERSION"));
        println!("endpoint: {}", args.endpoint);
        if args.pid != 0 {
            println!("pid filter: {}", args.pid);
        }
        if let Some(comm) = &args.comm {
            println!("comm filter: {comm}");
        }
    }

    // ── Initializing: transport first; a bind failure is fatal before any
    // probe touches the target process.
    let mut publisher = Publisher::bind(&args.endpoint).await?;
    let (ring, ring_consumer) = RingBuffer::with_capacity(args.ring_bytes);
    let correlator = Arc::new(Correlator::with_capacity(args.correlator_capacity));
    let stats = Arc::new(CaptureStats::default());
    let shutdown = Shutdown::new();

    let mut consumer = Consumer::new(
        ring_consumer,
        shutdown.clone(),
        Duration::from_millis(args.poll_timeout_ms),
    );

    // ── Load and attach the probes.
    bump_memlock_rlimit();
    let mut bpf = capture::load_ebpf_program(&args.bpf_object)?;
    capture::init_ebpf_logger(&mut bpf);
    capture::install_filter(&mut bpf, filter)?;

    let targets = ProbeTargets {
        ggml_base_lib: args.ggml_base_lib,
        ggml_cpu_lib: args.ggml_cpu_lib,
        ggml_cuda_lib: args.ggml_cuda_lib,
        cudart_lib: args.cudart_lib,
        ollama_bin: args.ollama_bin,
    };
    let attached = capture::attach_probes(&mut bpf, &targets)?;
    consumer.mark_attached();
    if !args.quiet {
        println!("probes attached: {attached}");
    }

    // ── Drain task: kernel ring buffer → correlator → channel.
    let events_map = RingBuf::try_from(bpf.take_map("EVENTS").context("EVENTS map not found")?)?;
    let assembler = Assembler::new(Arc::clone(&ring), Arc::clone(&correlator), Arc::clone(&stats));
    let drain = tokio::spawn(capture::run_drain(events_map, assembler, shutdown.clone()));

    // ── Shutdown triggers: Ctrl-C, optional duration limit.
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received Ctrl-C, shutting down");
            }
            shutdown.trigger();
        });
    }
    if args.duration > 0 {
        let shutdown = shutdown.clone();
        let secs = args.duration;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            info!("duration limit reached, shutting down");
            shutdown.trigger();
        });
    }

    // ── Polling until the shutdown signal trips.
    let summary = consumer.run(&mut publisher).await;

    if let Err(e) = drain.await.context("drain task panicked")? {
        warn!("drain task ended with error: {e:#}");
    }

    // The probes detach when `bpf` drops; sockets and buffers die with the
    // publisher. Report what happened either way.
    let report = format!(
        "processed {} events ({} published, {} publish errors, {} decode errors); \
         dropped {} at the channel, {} correlator rejections, {} unmatched exits, {} malformed",
        summary.processed,
        summary.published,
        summary.publish_errors,
        summary.decode_errors,
        ring.dropped(),
        correlator.rejected(),
        stats.unmatched_exits.load(std::sync::atomic::Ordering::Relaxed),
        stats.malformed.load(std::sync::atomic::Ordering::Relaxed),
    );
    if args.quiet {
        info!("{report}");
    } else {
        println!("{report}");
    }

    Ok(())
}

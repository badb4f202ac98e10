//! # Consumer Poll Loop
//!
//! The single consumer of the channel: a cooperative loop of
//! bounded-timeout polls. Each iteration decodes the committed records into
//! a reused batch and publishes them in commit order; the shutdown signal is
//! observed at least once per poll interval, so termination latency is
//! bounded by one timeout. Per-event failures (decode, publish) are logged
//! and absorbed; only the shutdown signal ends the loop.

use std::time::Duration;

use log::{debug, info, warn};

use crate::events::{self, Event};
use crate::process_lookup;
use crate::publish::Publisher;
use crate::ring::{Control, Poll, RingConsumer};
use crate::shutdown::Shutdown;

/// Pipeline lifecycle. The consumer drives Polling → Draining → Terminated;
/// the agent setup path owns the first two states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Attached,
    Polling,
    Draining,
    Terminated,
}

/// Counters reported when the loop ends.
#[derive(Debug, Default, Clone, Copy)]
pub struct Summary {
    pub processed: u64,
    pub published: u64,
    pub publish_errors: u64,
    pub decode_errors: u64,
}

pub struct Consumer {
    ring: RingConsumer,
    shutdown: Shutdown,
    poll_timeout: Duration,
    phase: Phase,
}

fn collect_into<'a>(
    batch: &'a mut Vec<Event>,
    errors: &'a mut u64,
) -> impl FnMut(&[u8]) -> Control + 'a {
    move |bytes| {
        match events::decode(bytes) {
            Ok(event) => batch.push(event),
            Err(e) => {
                warn!("dropping record: {e}");
                *errors += 1;
            }
        }
        Control::Continue
    }
}

impl Consumer {
    #[must_use]
    pub fn new(ring: RingConsumer, shutdown: Shutdown, poll_timeout: Duration) -> Self {
        Self { ring, shutdown, poll_timeout, phase: Phase::Initializing }
    }

    /// Record that the probes are in place; the next transition is into the
    /// poll loop.
    pub fn mark_attached(&mut self) {
        self.transition(Phase::Attached);
    }

    fn transition(&mut self, next: Phase) {
        info!("pipeline: {:?} -> {next:?}", self.phase);
        self.phase = next;
    }

    /// Run until the shutdown signal trips, then drain once and terminate.
    /// Always returns the final counters; resources die with `self`.
    pub async fn run(mut self, publisher: &mut Publisher) -> Summary {
        let mut summary = Summary::default();
        let mut batch: Vec<Event> = Vec::new();

        self.transition(Phase::Polling);
        loop {
            let mut decode_errors = 0u64;
            let outcome = self
                .ring
                .poll(
                    self.poll_timeout,
                    &self.shutdown,
                    &mut collect_into(&mut batch, &mut decode_errors),
                )
                .await;
            summary.decode_errors += decode_errors;

            match outcome {
                Poll::Processed(n) => {
                    summary.processed += n as u64;
                    flush(&mut batch, publisher, &mut summary).await;
                }
                Poll::TimedOut => {}
                Poll::Interrupted => break,
            }
        }

        // One final non-blocking pass flushes whatever was committed before
        // the shutdown tripped.
        self.transition(Phase::Draining);
        let mut decode_errors = 0u64;
        let n = self.ring.drain_now(&mut collect_into(&mut batch, &mut decode_errors));
        summary.processed += n as u64;
        summary.decode_errors += decode_errors;
        flush(&mut batch, publisher, &mut summary).await;

        self.transition(Phase::Terminated);
        summary
    }
}

async fn flush(batch: &mut Vec<Event>, publisher: &mut Publisher, summary: &mut Summary) {
    for event in batch.drain(..) {
        if log::log_enabled!(log::Level::Debug) {
            let cmdline = process_lookup::cmdline(event.pid()).unwrap_or_default();
            debug!("[{}] pid={} cmdline='{cmdline}' {event:?}", event.topic(), event.pid());
        }
        match publisher.publish(&event).await {
            Ok(()) => summary.published += 1,
            Err(e) => {
                warn!("publish failed on topic {}: {e}", event.topic());
                summary.publish_errors += 1;
            }
        }
    }
}

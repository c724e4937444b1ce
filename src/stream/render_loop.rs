//! The cooperative per-generation streaming loop.
//!
//! Each tick renders one slice of the sample budget on the blocking pool,
//! then sends the frame and the cumulative sample count. The loop yields
//! at every tick boundary and exits as soon as its generation is stale.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::protocol::{FrameSink, ServerMessage};
use super::schedule::{SampleSchedule, TickPlan};
use super::session::GenerationToken;
use crate::render::{FrameEncoder, RenderInvoker, RenderParameters};
use crate::util::{Error, Result};

/// Tunables shared by every loop of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopOptions {
    /// Upper bound on samples per pixel rendered in one tick.
    pub samples_per_tick: u32,
    /// Minimum spacing between ticks.
    pub tick_interval: Duration,
    pub jpeg_quality: u8,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            samples_per_tick: 64,
            tick_interval: Duration::from_millis(1),
            jpeg_quality: 90,
        }
    }
}

/// How a render loop ended.
#[derive(Debug)]
pub enum LoopOutcome {
    /// The sample target was reached.
    Completed { samples: u32, ticks: u32 },
    /// Superseded by a newer generation or by session close.
    Cancelled { ticks: u32 },
    /// A render or transport error ended the loop.
    Failed(Error),
}

impl LoopOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

pub(crate) struct LoopContext<S> {
    pub token: GenerationToken,
    pub cancel: CancellationToken,
    pub invoker: Arc<AsyncMutex<RenderInvoker>>,
    pub sink: Arc<AsyncMutex<S>>,
    pub options: LoopOptions,
}

#[tracing::instrument(name = "render_loop", skip_all, fields(generation = ctx.token.id()))]
pub(crate) async fn run_stream<S: FrameSink + 'static>(ctx: LoopContext<S>) -> LoopOutcome {
    let LoopContext { token, cancel, invoker, sink, options } = ctx;

    let Ok(initial) = token.snapshot() else {
        return LoopOutcome::Cancelled { ticks: 0 };
    };
    token.mark_rendering();

    let mut schedule = SampleSchedule::new(options.samples_per_tick, initial.target_spp());
    let encoder = FrameEncoder::new(options.jpeg_quality);
    let mut ticker = time::interval(options.tick_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ticks = 0u32;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return LoopOutcome::Cancelled { ticks },
            _ = ticker.tick() => {}
        }

        let Some(plan) = schedule.next_tick() else {
            break;
        };
        let Ok(params) = token.snapshot() else {
            return LoopOutcome::Cancelled { ticks };
        };

        let frame = match render_tick(&token, &invoker, plan, params, encoder).await {
            Ok(frame) => frame,
            Err(e) if !e.is_fatal_to_loop() => return LoopOutcome::Cancelled { ticks },
            Err(e) => {
                tracing::error!(error = %e, sample = plan.sample_index, "render tick failed");
                token.finish();
                return LoopOutcome::Failed(e);
            }
        };

        if cancel.is_cancelled() {
            return LoopOutcome::Cancelled { ticks };
        }
        match transmit(&token, &sink, frame, plan.cumulative).await {
            Ok(()) => {}
            Err(e) if !e.is_fatal_to_loop() => {
                tracing::trace!(error = %e, "dropped frame of superseded generation");
                return LoopOutcome::Cancelled { ticks };
            }
            Err(e) => {
                tracing::warn!(error = %e, "frame transmission failed");
                token.finish();
                return LoopOutcome::Failed(e);
            }
        }
        ticks += 1;

        if plan.is_final {
            break;
        }
    }

    token.finish();
    tracing::info!(samples = schedule.completed(), ticks, "sample target reached");
    LoopOutcome::Completed { samples: schedule.completed(), ticks }
}

/// Render one tick on the blocking pool and return the encoded frame.
///
/// The owned invoker guard moves into the blocking task, so a superseded
/// loop's in-flight iteration finishes before the next loop can start one.
async fn render_tick(
    token: &GenerationToken,
    invoker: &Arc<AsyncMutex<RenderInvoker>>,
    plan: TickPlan,
    params: RenderParameters,
    encoder: FrameEncoder,
) -> Result<Vec<u8>> {
    let mut guard = Arc::clone(invoker).lock_owned().await;
    token.check()?;

    tokio::task::spawn_blocking(move || {
        guard.prepare(params.width, params.height)?;
        guard.render(plan.sample_index, plan.sample_budget, &params)?;
        guard.encoded_frame(&encoder)
    })
    .await
    .map_err(|e| Error::other(format!("render task failed: {e}")))?
}

/// Send the frame and then the sample count, holding the sink for both so
/// the pair is never interleaved with another loop's output.
async fn transmit<S: FrameSink>(
    token: &GenerationToken,
    sink: &AsyncMutex<S>,
    frame: Vec<u8>,
    samples: u32,
) -> Result<()> {
    let mut sink = sink.lock().await;
    token.check()?;
    sink.send_binary(ServerMessage::Frame(frame).encode()).await?;
    sink.send_binary(ServerMessage::SampleCount(samples).encode()).await
}

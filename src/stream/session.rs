//! Per-connection session: parameter merging, generations and loop handoff.
//!
//! Every accepted parameter update starts a new generation. The previous
//! render loop is cancelled and retired, and a fresh loop bound to the new
//! generation is spawned. Loops re-check their generation before each
//! transmission, so a superseded loop never reaches the client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::protocol::FrameSink;
use super::render_loop::{run_stream, LoopContext, LoopOptions, LoopOutcome};
use crate::render::{ParameterUpdate, RenderInvoker, RenderParameters};
use crate::util::{Error, Result};

/// Where the session is in its parameter/render cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No loop running for the live generation.
    Idle,
    /// Parameters merged, loop not yet started.
    Configuring,
    /// A loop is producing frames for the live generation.
    Rendering,
}

struct Live {
    params: RenderParameters,
    state: SessionState,
}

/// State shared between a session and the loops it spawned.
///
/// The generation counter is bumped under the same lock that guards the
/// parameters, so a snapshot always pairs parameters with their generation.
pub struct SessionShared {
    live: Mutex<Live>,
    generation: AtomicU64,
    default_size: (u32, u32),
}

impl SessionShared {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            live: Mutex::new(Live {
                params: RenderParameters::new(width, height),
                state: SessionState::Idle,
            }),
            generation: AtomicU64::new(0),
            default_size: (width, height),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SessionState {
        self.live.lock().state
    }

    /// Copy of the merged parameters.
    pub fn parameters(&self) -> RenderParameters {
        self.live.lock().params
    }

    /// Parameters for `generation`, or `None` once it has been superseded.
    pub fn snapshot(&self, generation: u64) -> Option<RenderParameters> {
        let live = self.live.lock();
        (self.generation() == generation).then_some(live.params)
    }

    fn apply(&self, update: &ParameterUpdate) -> u64 {
        let mut live = self.live.lock();
        live.params.merge(update);
        live.state = SessionState::Configuring;
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn reset(&self) -> u64 {
        let mut live = self.live.lock();
        let (w, h) = self.default_size;
        live.params = RenderParameters::new(w, h);
        live.state = SessionState::Idle;
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn transition(&self, generation: u64, state: SessionState) {
        let mut live = self.live.lock();
        if self.generation() == generation {
            live.state = state;
        }
    }
}

/// Generation captured by a render loop when it starts.
#[derive(Clone)]
pub struct GenerationToken {
    id: u64,
    shared: Arc<SessionShared>,
}

impl GenerationToken {
    pub fn new(id: u64, shared: Arc<SessionShared>) -> Self {
        Self { id, shared }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_current(&self) -> bool {
        self.shared.generation() == self.id
    }

    pub fn check(&self) -> Result<()> {
        let live = self.shared.generation();
        if live == self.id {
            Ok(())
        } else {
            Err(Error::StaleGeneration { captured: self.id, live })
        }
    }

    /// Parameters of this generation.
    pub fn snapshot(&self) -> Result<RenderParameters> {
        self.shared.snapshot(self.id).ok_or_else(|| Error::StaleGeneration {
            captured: self.id,
            live: self.shared.generation(),
        })
    }

    pub(crate) fn mark_rendering(&self) {
        self.shared.transition(self.id, SessionState::Rendering);
    }

    pub(crate) fn finish(&self) {
        self.shared.transition(self.id, SessionState::Idle);
    }
}

struct ActiveLoop {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<LoopOutcome>,
}

/// One client connection's render session.
///
/// Owns the sink half of the connection and shares the render invoker with
/// whichever loop is current. Must be driven from inside a tokio runtime.
pub struct Session<S: FrameSink + 'static> {
    shared: Arc<SessionShared>,
    invoker: Arc<AsyncMutex<RenderInvoker>>,
    sink: Arc<AsyncMutex<S>>,
    options: LoopOptions,
    active: Option<ActiveLoop>,
    retired: Vec<JoinHandle<LoopOutcome>>,
}

impl<S: FrameSink + 'static> Session<S> {
    pub fn new(
        invoker: Arc<AsyncMutex<RenderInvoker>>,
        sink: S,
        options: LoopOptions,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            shared: Arc::new(SessionShared::new(width, height)),
            invoker,
            sink: Arc::new(AsyncMutex::new(sink)),
            options,
            active: None,
            retired: Vec::new(),
        }
    }

    pub fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation()
    }

    pub fn parameters(&self) -> RenderParameters {
        self.shared.parameters()
    }

    /// Decode one client message and apply it.
    ///
    /// Malformed messages leave parameters, generation and the running loop
    /// untouched.
    pub fn handle_message(&mut self, text: &str) -> Result<u64> {
        let update = ParameterUpdate::from_json(text)?;
        Ok(self.apply_update(&update))
    }

    /// Merge `update`, supersede the running loop and start a new one.
    /// Returns the new generation.
    pub fn apply_update(&mut self, update: &ParameterUpdate) -> u64 {
        self.retired.retain(|h| !h.is_finished());
        let generation = self.shared.apply(update);
        if update.resizes() {
            let params = self.shared.parameters();
            tracing::debug!(generation, width = params.width, height = params.height, "frame size changed");
        }
        self.cancel_active();

        let cancel = CancellationToken::new();
        let ctx = LoopContext {
            token: GenerationToken::new(generation, Arc::clone(&self.shared)),
            cancel: cancel.clone(),
            invoker: Arc::clone(&self.invoker),
            sink: Arc::clone(&self.sink),
            options: self.options,
        };
        let handle = tokio::spawn(run_stream(ctx));
        self.active = Some(ActiveLoop { generation, cancel, handle });
        tracing::debug!(generation, "render loop started");
        generation
    }

    fn cancel_active(&mut self) {
        if let Some(active) = self.active.take() {
            tracing::trace!(generation = active.generation, "cancelling render loop");
            active.cancel.cancel();
            self.retired.push(active.handle);
        }
    }

    /// Loops that have not yet returned, current one included.
    pub fn live_loops(&self) -> usize {
        let active = self.active.iter().filter(|a| !a.handle.is_finished()).count();
        active + self.retired.iter().filter(|h| !h.is_finished()).count()
    }

    /// Wait for the current loop to end on its own.
    pub async fn join_active(&mut self) -> Option<LoopOutcome> {
        let active = self.active.take()?;
        Some(join(active.handle).await)
    }

    /// Wait for every superseded loop and collect how each ended.
    pub async fn drain_retired(&mut self) -> Vec<LoopOutcome> {
        let mut outcomes = Vec::with_capacity(self.retired.len());
        for handle in self.retired.drain(..) {
            outcomes.push(join(handle).await);
        }
        outcomes
    }

    /// End the session: discard parameters, stop every loop and free the
    /// render resources. Returns once no loop can touch the invoker.
    pub async fn close(&mut self) {
        let generation = self.shared.reset();
        self.cancel_active();
        let stopped = self.drain_retired().await;
        self.invoker.lock().await.release();
        tracing::debug!(generation, loops = stopped.len(), "session closed");
    }
}

impl<S: FrameSink + 'static> Drop for Session<S> {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            active.cancel.cancel();
        }
    }
}

async fn join(handle: JoinHandle<LoopOutcome>) -> LoopOutcome {
    handle
        .await
        .unwrap_or_else(|e| LoopOutcome::Failed(Error::other(format!("render loop aborted: {e}"))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_bumps_on_apply() {
        let shared = Arc::new(SessionShared::new(16, 8));
        assert_eq!(shared.generation(), 0);
        let update = ParameterUpdate { phi: Some(2.0), ..Default::default() };
        let g1 = shared.apply(&update);
        let g2 = shared.apply(&ParameterUpdate::default());
        assert_eq!((g1, g2), (1, 2));
        assert_eq!(shared.parameters().phi, 2.0);
        assert_eq!(shared.state(), SessionState::Configuring);
    }

    #[test]
    fn test_stale_token() {
        let shared = Arc::new(SessionShared::new(16, 8));
        let g = shared.apply(&ParameterUpdate::default());
        let token = GenerationToken::new(g, Arc::clone(&shared));
        assert!(token.is_current());
        assert!(token.snapshot().is_ok());

        shared.apply(&ParameterUpdate::default());
        assert!(!token.is_current());
        assert!(matches!(
            token.check(),
            Err(Error::StaleGeneration { captured: 1, live: 2 })
        ));
        assert!(token.snapshot().is_err());
    }

    #[test]
    fn test_stale_token_cannot_change_state() {
        let shared = Arc::new(SessionShared::new(16, 8));
        let old = GenerationToken::new(shared.apply(&ParameterUpdate::default()), Arc::clone(&shared));
        let new = GenerationToken::new(shared.apply(&ParameterUpdate::default()), Arc::clone(&shared));
        new.mark_rendering();
        old.finish();
        assert_eq!(shared.state(), SessionState::Rendering);
        new.finish();
        assert_eq!(shared.state(), SessionState::Idle);
    }

    #[test]
    fn test_reset_discards_parameters() {
        let shared = SessionShared::new(16, 8);
        shared.apply(&ParameterUpdate { theta: Some(1.0), width: Some(4), ..Default::default() });
        shared.reset();
        assert_eq!(shared.parameters(), RenderParameters::new(16, 8));
        assert_eq!(shared.state(), SessionState::Idle);
    }
}

//! Streaming side: sessions, render loops and the WebSocket server.
//!
//! ```text
//! client JSON ─→ Session::handle_message ─→ merge + new generation
//!                                            └─ cancel old loop, spawn run_stream
//! run_stream tick ─→ RenderInvoker (blocking pool) ─→ "0000"+JPEG, "0001"+count
//! ```

pub mod protocol;
pub mod render_loop;
pub mod schedule;
pub mod server;
pub mod session;

pub use protocol::{FrameSink, ServerMessage, TAG_FRAME, TAG_SAMPLE_COUNT};
pub use render_loop::{LoopOptions, LoopOutcome};
pub use schedule::{SampleSchedule, TickPlan};
pub use server::Server;
pub use session::{GenerationToken, Session, SessionShared, SessionState};

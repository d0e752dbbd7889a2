//! Hook bus and runtime event emitter.
//!
//! The hook bus dispatches control-plane events to registered handlers.
//! Events come in two flavors: **interceptor** events, whose handlers run
//! in priority order and may modify or block the propagating data, and
//! **observer** events, whose handlers are fire-and-forget. Handler lists
//! are immutable snapshots, so registration during an emit never disturbs
//! the in-flight chain.
//!
//! The [`emitter`] module is a separate, simpler fan-out: a typed broadcast
//! of runtime events (node connected, message routed, usage reported) that
//! subsystems publish and the daemon subscribes to.

pub mod bus;
pub mod emitter;
pub mod error;
pub mod event;
pub mod handler;

pub use bus::{EmitOutcome, HookBus, HookBusConfig, HookDisposer};
pub use emitter::{EventEmitter, EventReceiver, RuntimeEvent};
pub use error::{HookError, HookResult};
pub use event::{EventKind, HookEvent};
pub use handler::{FnHandler, Handler, HookOptions, HookOutcome, MatchPredicate};

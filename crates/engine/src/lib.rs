//! # Rill Engine
//!
//! The stage-graph client: an invocation describes a graph of dependent
//! computation stages, a remote completer service persists and schedules
//! it, and results are reconciled back into the calling invocation.
//!
//! ## Key pieces
//!
//! - **[`flow`]**: the [`Flow`] handle and its combinators
//!   (`supply`, `then_apply`, `all_of`, ...): each call is one completer
//!   request returning a typed [`Stage`] handle
//! - **[`codec`]**: continuations as `{handler_id, state}` descriptors
//!   resolved through a [`HandlerRegistry`], plus the datum⇄value codec
//! - **[`dispatch`]**: the [`ContinuationInvoker`] answering completer
//!   callbacks that re-enter the container
//!
//! ## Execution model
//!
//! The client runs no thread pool for stage work. Continuations execute in
//! containers the completer dispatches to; within one invocation, graph
//! construction is sequential and waiting is an async poll, so a callback
//! delivering another stage's result can always be processed while a
//! `get` is outstanding.
//!
//! ```ignore
//! let mut registry = HandlerRegistry::new();
//! registry.supplier("seed", |n: i64| Ok(n))?;
//! registry.function("inc", |_: (), x: i64| Ok(x + 1))?;
//!
//! let flow = Flow::create(completer, blobs, "my-fn").await?;
//! let seed = flow.supply::<i64>(Continuation::new("seed", &1)?).await?;
//! let next = flow.then_apply::<i64, i64>(&seed, Continuation::stateless("inc")).await?;
//! assert_eq!(flow.get(&next).await?, 2);
//! ```

pub mod codec;
pub mod dispatch;
pub mod flow;

pub use codec::{Continuation, DuplicateHandler, HandlerOutput, HandlerRegistry, StageArg, StageHandler};
pub use dispatch::ContinuationInvoker;
pub use flow::{Flow, Stage};

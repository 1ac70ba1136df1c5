//! In-process test doubles for the Rill stage-graph client.
//!
//! [`InMemCompleter`] implements the same [`CompleterClient`] seam the
//! remote HTTP client does, entirely in memory: stages resolve through
//! watch channels, continuations are executed by whatever
//! [`ContinuationDispatcher`] the test wires in, and external completion
//! enforces the first-writer-wins rule. [`InMemBlobStore`] backs it with an
//! append-only byte store. Neither type touches the network.
//!
//! [`CompleterClient`]: rill_client::completer::CompleterClient

pub mod blobs;
pub mod completer;
pub mod functions;

pub use blobs::InMemBlobStore;
pub use completer::{ContinuationDispatcher, InMemCompleter};
pub use functions::{FunctionBackend, StubFunctionBackend};

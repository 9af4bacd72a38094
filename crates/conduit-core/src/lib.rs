//! # Conduit Core
//!
//! Transport-independent building blocks for the Conduit message transport.
//!
//! This crate provides:
//! - Variable-length frame encoding and decoding over byte streams
//! - Connection lifecycle states and listener notification
//! - Async handle composition (deferred binding, aggregation)
//! - Concurrent endpoint to connection registry
//! - Error types and handling
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Connectors (conduit-transport)              │
//! │   (TCP client/server, TLS, UDP node, builder)                   │
//! ├────────────────┬────────────────┬───────────────┬───────────────┤
//! │  FrameCodec    │ ConnectionState│  AsyncHandle  │  Registry     │
//! │  (wire format) │ (lifecycle)    │  (completion) │  (routing)    │
//! └────────────────┴────────────────┴───────────────┴───────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod composite;
pub mod deferred;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod handle;
pub mod registry;
pub mod state;

pub use composite::CompositeHandle;
pub use deferred::DeferredHandle;
pub use endpoint::{Endpoint, ParseEndpointError, RawMessage};
pub use error::{Error, FrameError, HandleError, RegistryError, Result};
pub use frame::{DECODE_RESERVE_LIMIT, FrameCodec, Framing, MAX_FRAME_LENGTH};
pub use handle::{AsyncHandle, CompleteOnDrop, CompletionHandle, Outcome, SharedHandle};
pub use registry::ConnectionRegistry;
pub use state::{CallbackSlot, ConnectionInfo, ConnectionState, ConnectionStateListener, StateCell};

/// Default maximum frame payload accepted by connectors (16 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#![doc(html_root_url = "https://docs.rs/wirelink/latest")]
//! Public API for the `wirelink` library.
//!
//! This crate provides the building blocks for asynchronous, message-oriented
//! TCP servers and reconnecting clients: a pluggable framing codec, a
//! type-tag router, per-connection read/write/dispatch loops, a keyed worker
//! pool for ordered handler execution and a hashed timing wheel for
//! per-connection timers.

pub mod byte_order;
pub mod client;
pub mod codec;
pub mod connection;
pub mod hooks;
pub mod message;
pub mod metrics;
pub mod panic;
pub mod registry;
pub mod router;
pub mod server;
pub mod timer;
pub mod worker;

pub use client::{Client, ClientBuilder, ClientError};
pub use codec::{Codec, CodecError, MAX_PAYLOAD_LENGTH, TypeLengthValueCodec};
pub use connection::{Connection, ConnectionConfig, ConnectionError, WriteError};
pub use hooks::{ConnectionHandler, ConnectionHooks};
pub use message::{Message, WireMessage};
pub use metrics::{CONNECTIONS_ACTIVE, Direction, ERRORS_TOTAL, FRAMES_PROCESSED};
pub use registry::{ConnectionId, ConnectionRegistry, IdGenerator};
pub use router::{Router, RouterError};
pub use server::{BackoffConfig, Server, ServerBuilder, ServerError};
pub use timer::{TimerId, TimingWheel, WheelConfig};
pub use worker::{PoolError, WorkerPool};

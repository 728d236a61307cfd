//! Event Persister Service
//!
//! Consumes order and match events from the broker and persists them to the
//! time-series store:
//! - One consumer runner per stream (orders, matches)
//! - JSON decoding with field validation; malformed records are skipped
//! - Batched writes flushed on size or age, retried with backoff
//! - Offsets committed only after the covering batch is durable
//! - Coordinated start/stop with a bounded drain on shutdown
//!
//! Delivery is at-least-once. Writes are idempotent by `event_id`, so a
//! redelivered record overwrites its own row instead of duplicating it.
//!
//! # Architecture
//!
//! ```text
//!   orders topic          matches topic
//!        │                      │
//!   ┌────▼─────┐          ┌─────▼────┐
//!   │ Runner   │          │ Runner   │  ← poll, decode, track offsets
//!   └────┬─────┘          └─────┬────┘
//!        │                      │
//!   ┌────▼─────┐          ┌─────▼────┐
//!   │SinkWriter│          │SinkWriter│  ← batch, flush with retry
//!   └────┬─────┘          └─────┬────┘
//!        │                      │
//!   ┌────▼──────────────────────▼────┐
//!   │        Time-series store        │
//!   └─────────────────────────────────┘
//!
//!   LifecycleController starts and stops both runners
//! ```

pub mod broker;
pub mod codec;
pub mod config;
pub mod events;
pub mod lifecycle;
pub mod memory;
pub mod metrics;
pub mod offsets;
pub mod runner;
pub mod sink;

pub use broker::{BrokerClient, BrokerError, PollEvent};
pub use config::PersisterConfig;
pub use events::{DomainEvent, RawRecord, StreamKind};
pub use lifecycle::{Consumer, LifecycleController};
pub use runner::{ConsumerRunner, RunnerError, RunnerState};
pub use sink::{StorageClient, StorageError};

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";

//! # Flow Canvas Core
//!
//! Interaction and consistency engine for node/edge diagram editors.
//! Compiles to WASM for browser hosts.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                CanvasEngine                 │
//! ├─────────────────────────────────────────────┤
//! │  Dispatch Bus    │  State Store             │
//! │  - Priorities    │  - Namespaces            │
//! │  - Filters       │  - Subscriptions         │
//! │  - History       │  - Snapshots, sync       │
//! ├─────────────────────────────────────────────┤
//! │  Overlap Manager │  Graph contract          │
//! │  - Cross-branch  │  - CanvasGraph trait     │
//! │  - Same-port     │  - MemoryGraph           │
//! └─────────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bus;
pub mod clock;
pub mod engine;
pub mod error;
pub mod event;
pub mod graph;
pub mod id;
pub mod namespace;
pub mod overlap;
pub mod persistence;
pub mod routing;
pub mod state;
pub mod sync;

#[cfg(feature = "wasm")]
pub mod wasm;

pub use bus::{
    BusConfig, BusStatus, DispatchBus, EmitOutcome, EventContext, EventRecord, HandlerOptions,
    HandlerResult, Priority, Propagation,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{CanvasEngine, EngineConfig, EngineStatus};
pub use error::{CanvasError, CanvasResult, ErrorInfo};
pub use event::GraphEvent;
pub use graph::{
    CanvasGraph, Edge, EdgeId, EdgeLabel, EdgeRouting, Endpoint, LayoutDirection, MemoryGraph,
    Node, NodeId, Point, PortId,
};
pub use id::{EventId, FilterId, HandlerId, SnapshotId, SubscriptionId};
pub use namespace::{EntryListCodec, JsonCodec, Namespace, NamespaceCodec};
pub use overlap::{OffsetKind, OffsetRecord, OverlapConfig, OverlapManager, OverlapStatus};
pub use persistence::{FilePersistence, MemoryPersistence, PersistenceBackend};
pub use routing::RoutingParams;
pub use state::{
    ChangeSource, SetOptions, Snapshot, StateChange, StateStore, StoreBuilder, StoreConfig,
    StoreStatus, SubscribeOptions,
};
pub use sync::{SyncFailure, SyncRecord, SyncSink};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

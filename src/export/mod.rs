//! Streaming export pipeline
//!
//! Records are pulled from a cursor, serialized to JSON Lines and written
//! into a bounded pipe feeding one bulk upload, while records that reference
//! a binary object fan out into relays bounded by a task limiter:
//!
//! ```text
//! cursor ──> serializer ──> pipe ──> bulk upload
//!    │
//!    └──> limiter ──> relay (locate, sniff, upload) ──> events
//! ```
//!
//! Every step reports through a single event channel.

pub mod coordinator;
pub mod event;
pub mod limiter;
pub mod pipe;
pub mod progress;
pub mod relay;
pub mod request;
pub mod serializer;
pub mod sniffer;

pub use coordinator::{
    BinaryFailure, ExportCoordinator, ExportOutcome, ExportResources, ExportSettings,
    PreparedExport,
};
pub use event::{EventReceiver, EventSender, TransferEvent, event_channel};
pub use limiter::TaskLimiter;
pub use progress::{ProgressTracker, TrackerSummary};
pub use relay::{BinaryRelay, RelayOutcome};
pub use request::{BinaryLinkage, BinaryTask, ExportRequest, LookupKey, LookupTarget, Source};
pub use serializer::RecordSerializer;
pub use sniffer::{MediaType, SignatureTable, sniff};

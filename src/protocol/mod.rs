//! Protocol module - session messages, packing, and byte framing.
//!
//! - [`messages`]: one enum variant per phase, validation, checkpoints
//! - [`arena`]: byte fields of batched items packed into one buffer
//! - [`tuple`]: order-preserving codec of packed keys and values
//! - [`builder`]: writers enforcing phase order and batching items
//! - wire format and frame buffer for byte-stream transports

pub mod arena;
pub mod builder;
pub mod messages;
pub mod tuple;

mod frame;
mod frame_buffer;
mod wire_format;

pub use arena::{Arena, Slice};
pub use builder::{BatchLimits, RequestWriter, ResponseWriter};
pub use frame::{build_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use messages::{
    Acknowledged, Binding, ConnectorState, FieldSelection, Flushed, LoadBatch, LoadItem,
    LoadedBatch, LoadedItem, MaterializationSpec, Message, Open, Opened, Phase, RangeSpec,
    Request, Response, Resume, StartCommit, StartedCommit, StoreBatch, StoreItem,
    EXPLICIT_ZERO_CHECKPOINT,
};
pub use tuple::{pack, pack_into, unpack, Element, TupleError};
pub use wire_format::{flags, Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};

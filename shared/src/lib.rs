//! Code shared between the authoritative server and the thin client:
//! 2D math, the text-JSON wire codec with its separator framing, protocol
//! command names, and the world constants both sides must agree on.

pub mod codec;
pub mod math;
pub mod protocol;

pub use codec::{FrameAssembler, ProtocolError};
pub use math::{chunk_of, ChunkCoord, Vec2};

/// Gravitational acceleration applied to rigidbodies, world units per second
/// squared. Negative y is down.
pub const GRAVITY: f32 = -9.80665;

/// Edge length of a spatial chunk in world units. Must stay a power of two so
/// chunk arithmetic is exact for integer offsets.
pub const CHUNK_SIZE: f32 = 8.0;

/// Tolerance used for contact latching and overlap queries.
pub const KINDA_SMALL_NUMBER: f32 = 1.0e-4;

/// Default maximum size of an outgoing datagram in UTF-8 bytes, separators
/// included.
pub const DEFAULT_PACKET_SIZE: usize = 4096;

/// Default interest radius around a player, in chunks.
pub const DEFAULT_UPDATE_DISTANCE: i32 = 2;

//! Thin replication client: dials the server, mirrors the replicated world,
//! and forwards raw input.

pub mod game;
pub mod network;

pub use game::{ClientWorld, MirrorActor};
pub use network::Connection;

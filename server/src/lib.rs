//! Authoritative world server: owns the simulation, accepts clients over a
//! reliable stream plus a datagram fast path, and replicates each player's
//! chunk neighborhood.

pub mod actor;
pub mod auth;
pub mod chunk;
pub mod engine;
pub mod input;
pub mod level;
pub mod net;
pub mod physics;
pub mod replication;
pub mod session;

pub use actor::{Actor, ActorKind, Body, Locomotion};
pub use engine::{Engine, EngineConfig};
pub use level::Level;

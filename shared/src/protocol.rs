//! Protocol vocabulary: command names and session outcome codes.
//!
//! Both endpoints tolerate unknown commands by logging and discarding, so
//! nothing here is versioned; the strings are the stable contract.

// Authentication (reliable, client -> server).
pub const CMD_REGISTER: &str = "register";
pub const CMD_LOGIN: &str = "login";

// Reply to either authentication command (reliable, server -> client).
pub const CMD_REGISTER_OUTCOME: &str = "register_outcome";

// Datagram-address binding (unreliable, client -> server).
pub const CMD_REGISTER_UDP: &str = "register_udp";

// Session commands (reliable, client -> server).
pub const CMD_JOIN_LEVEL: &str = "join_level";
pub const CMD_UPDATE_DISTANCE: &str = "update_distance";

// Simulation input (unreliable, client -> server).
pub const CMD_KEY_DOWN: &str = "key_down";
pub const CMD_KEY_UP: &str = "key_up";
pub const CMD_WORLD_MOUSE_POS: &str = "world_mouse_pos";

// Replication (server -> client).
pub const CMD_REGISTER_ACTOR: &str = "register_actor";
pub const CMD_UPDATE_ACTOR: &str = "update_actor";
pub const CMD_DESTROY_ACTOR: &str = "destroy_actor";
pub const CMD_BACKGROUND: &str = "background";
pub const CMD_PLAY_SOUND: &str = "play_sound";
pub const CMD_CONNECTED_ELSEWHERE: &str = "connected_from_another_location";

/// Client-visible session id codes. Positive values are authenticated user
/// ids; everything at or below zero is a lifecycle state.
pub mod outcome {
    /// Stream connected, not yet authenticated.
    pub const UNAUTHENTICATED: i64 = 0;
    /// Registration failed: the username exists.
    pub const USER_EXISTS: i64 = -2;
    /// Login failed: credentials did not match.
    pub const INVALID_CREDENTIALS: i64 = -3;
    /// The server or peer closed the connection.
    pub const FORCE_CLOSED: i64 = -10;
}

/// Key codes used by the default server-side bindings. Clients send whatever
/// their input layer produces; these match ASCII uppercase letters.
pub mod keys {
    pub const KEY_SPACE: i64 = 32;
    pub const KEY_A: i64 = 65;
    pub const KEY_D: i64 = 68;
    pub const KEY_W: i64 = 87;
}

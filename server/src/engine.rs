//! The game loop: drains network events, advances every level, and plans
//! per-client replication, all on one task per engine.

use crate::auth::{AuthError, MemoryUserStore, UserStore};
use crate::input::InputDispatcher;
use crate::level::{self, Level};
use crate::net::{NetEvent, Transport};
use crate::replication::{self, TickMaps};
use crate::session::{Session, SessionManager};
use log::{debug, info, warn};
use serde_json::{json, Value};
use shared::codec::encode_payload;
use shared::protocol::{
    outcome, CMD_BACKGROUND, CMD_CONNECTED_ELSEWHERE, CMD_JOIN_LEVEL, CMD_KEY_DOWN, CMD_KEY_UP,
    CMD_LOGIN, CMD_PLAY_SOUND, CMD_REGISTER, CMD_REGISTER_OUTCOME, CMD_UPDATE_DISTANCE,
    CMD_WORLD_MOUSE_POS,
};
use shared::{chunk_of, ChunkCoord, Vec2, DEFAULT_PACKET_SIZE, DEFAULT_UPDATE_DISTANCE};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};

/// Events drained from the network per tick before simulation resumes.
const INBOUND_DRAIN_LIMIT: usize = 512;

/// Ticks between diagnostic log lines.
const DIAGNOSTIC_INTERVAL: u64 = 300;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub host: String,
    /// UDP port; TCP listens one above.
    pub port: u16,
    pub max_connections: usize,
    /// Target simulation rate.
    pub max_tps: u32,
    /// Floor on the simulation rate: a longer wall-clock gap is clamped to
    /// one tick of `1 / min_tps` seconds.
    pub min_tps: u32,
    pub packet_size: usize,
    pub update_distance: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_connections: 64,
            max_tps: 60,
            min_tps: 10,
            packet_size: DEFAULT_PACKET_SIZE,
            update_distance: DEFAULT_UPDATE_DISTANCE,
        }
    }
}

/// The authoritative server. Owns every level, session, and the transport.
pub struct Engine {
    config: EngineConfig,
    levels: HashMap<String, Level>,
    backgrounds: HashMap<String, String>,
    sessions: SessionManager,
    users: Box<dyn UserStore>,
    dispatcher: InputDispatcher,
    transport: Transport,
    events: mpsc::UnboundedReceiver<NetEvent>,
    tick: u64,
    shutdown: Arc<AtomicBool>,
}

impl Engine {
    /// Binds the transport and prepares an empty world.
    pub async fn start(config: EngineConfig) -> Result<Engine, Box<dyn std::error::Error>> {
        let (transport, events) =
            Transport::start(&config.host, config.port, config.max_connections).await?;
        Ok(Engine {
            config,
            levels: HashMap::new(),
            backgrounds: HashMap::new(),
            sessions: SessionManager::new(),
            users: Box::new(MemoryUserStore::new()),
            dispatcher: InputDispatcher::with_default_bindings(),
            transport,
            events,
            tick: 0,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag another task can raise to stop the loop after the current tick.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn set_user_store(&mut self, users: Box<dyn UserStore>) {
        self.users = users;
    }

    pub fn set_dispatcher(&mut self, dispatcher: InputDispatcher) {
        self.dispatcher = dispatcher;
    }

    /// Creates or replaces a level. Levels are also created on demand the
    /// first time a client joins one.
    pub fn insert_level(&mut self, level: Level) {
        self.levels.insert(level.name().to_string(), level);
    }

    pub fn level(&self, name: &str) -> Option<&Level> {
        self.levels.get(name)
    }

    pub fn level_mut(&mut self, name: &str) -> Option<&mut Level> {
        self.levels.get_mut(name)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Runs the fixed-rate loop forever. The first tick only stamps the
    /// clock so dt never spans engine startup.
    pub async fn run(&mut self) {
        let mut ticker = interval(Duration::from_secs_f64(1.0 / self.config.max_tps as f64));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let max_dt = 1.0 / self.config.min_tps as f32;

        info!(
            "engine running at {} tps (dt clamp {:.3}s)",
            self.config.max_tps, max_dt
        );

        let mut last = Instant::now();
        ticker.tick().await;
        while !self.shutdown.load(Ordering::Relaxed) {
            ticker.tick().await;
            let now = Instant::now();
            let dt = (now - last).as_secs_f32().min(max_dt);
            last = now;
            self.tick_once(dt).await;
        }
        info!("engine stopping after tick {}", self.tick);
    }

    /// One full tick: inbound commands, simulation, replication.
    pub async fn tick_once(&mut self, dt: f32) {
        self.tick += 1;
        self.drain_inbound().await;
        self.simulate_and_replicate(dt).await;

        // Sessions idling outside any level still shed their per-tick key
        // edges, or stale triggers would fire on their first joined tick.
        for session in self.sessions.iter_mut() {
            if session.level.is_none() {
                session.end_tick_inputs();
            }
        }

        if self.tick % DIAGNOSTIC_INTERVAL == 0 {
            let actors: usize = self.levels.values().map(Level::actor_count).sum();
            debug!(
                "tick {}: {} sessions, {} levels, {} actors",
                self.tick,
                self.sessions.len(),
                self.levels.len(),
                actors
            );
        }
    }

    async fn drain_inbound(&mut self) {
        for _ in 0..INBOUND_DRAIN_LIMIT {
            let event = match self.events.try_recv() {
                Ok(event) => event,
                Err(_) => break,
            };
            match event {
                NetEvent::StreamConnected { conn } => {
                    debug!("conn {}: connected", conn);
                }
                NetEvent::StreamClosed { conn } => self.handle_close(conn).await,
                NetEvent::Reliable { conn, command, data } => {
                    self.handle_reliable(conn, &command, data).await;
                }
                NetEvent::Datagram { user_id, command, data } => {
                    if let Some(conn) = self.sessions.conn_for_user(user_id) {
                        self.handle_input(conn, &command, data);
                    }
                }
                NetEvent::UdpBindRequest { addr, claimed_id } => {
                    // Only users with a live session may bind a datagram
                    // address, and only one address per user.
                    if self.sessions.conn_for_user(claimed_id).is_some() {
                        self.transport.bind_udp(claimed_id, addr).await;
                    } else {
                        warn!("udp bind from {} for unknown user {}", addr, claimed_id);
                    }
                }
            }
        }
    }

    async fn handle_close(&mut self, conn: u64) {
        let Some(session) = self.sessions.remove_conn(conn) else {
            return;
        };
        info!("conn {}: closed (user {})", conn, session.user_id);
        self.transport.unbind_udp(session.user_id).await;
        if let Some(level_name) = &session.level {
            if let Some(level) = self.levels.get_mut(level_name) {
                level.destroy_actor(&session.player_actor());
            }
        }
        self.transport.close_conn(conn).await;
    }

    async fn handle_reliable(&mut self, conn: u64, command: &str, data: Value) {
        match command {
            CMD_REGISTER | CMD_LOGIN => self.handle_auth(conn, command, data).await,
            CMD_JOIN_LEVEL => {
                let Some(name) = data.as_str().map(str::to_string) else {
                    warn!("conn {}: join_level with non-string level", conn);
                    return;
                };
                self.handle_join_level(conn, &name).await;
            }
            CMD_UPDATE_DISTANCE => {
                let Some(distance) = data.as_i64() else {
                    warn!("conn {}: update_distance with non-integer data", conn);
                    return;
                };
                if let Some(session) = self.sessions.get_mut(conn) {
                    session.interest.update_distance = distance.max(0) as i32;
                }
            }
            // Input may also arrive on the stream before the datagram
            // address is bound.
            CMD_KEY_DOWN | CMD_KEY_UP | CMD_WORLD_MOUSE_POS => {
                self.handle_input(conn, command, data);
            }
            other => {
                warn!("conn {}: unknown command {:?}, dropping", conn, other);
            }
        }
    }

    async fn handle_auth(&mut self, conn: u64, command: &str, data: Value) {
        let credentials: Option<(String, String)> = match &data {
            Value::Array(items) if items.len() == 2 => {
                match (items[0].as_str(), items[1].as_str()) {
                    (Some(u), Some(p)) => Some((u.to_string(), p.to_string())),
                    _ => None,
                }
            }
            _ => None,
        };
        let Some((username, password)) = credentials else {
            warn!("conn {}: malformed credentials for {}", conn, command);
            return;
        };

        let result = if command == CMD_REGISTER {
            self.users.create_user(&username, &password)
        } else {
            self.users.verify(&username, &password)
        };

        let user_id = match result {
            Ok(id) => id,
            Err(AuthError::Conflict) => {
                self.send_records(conn, &[encode_payload(CMD_REGISTER_OUTCOME, &json!(outcome::USER_EXISTS))])
                    .await;
                return;
            }
            Err(AuthError::Invalid) => {
                self.send_records(conn, &[encode_payload(CMD_REGISTER_OUTCOME, &json!(outcome::INVALID_CREDENTIALS))])
                    .await;
                return;
            }
        };

        let session = Session::new(conn, user_id, username, self.config.update_distance);
        for displaced in self.sessions.install(session) {
            self.transport.unbind_udp(displaced.user_id).await;
            if displaced.conn != conn {
                info!(
                    "user {}: conn {} supersedes conn {}",
                    user_id, conn, displaced.conn
                );
                self.send_records(
                    displaced.conn,
                    &[encode_payload(CMD_CONNECTED_ELSEWHERE, &json!(user_id))],
                )
                .await;
                self.transport.close_conn(displaced.conn).await;
            } else {
                info!(
                    "conn {}: re-authenticated, dropping user {}",
                    conn, displaced.user_id
                );
            }
            if let Some(level_name) = &displaced.level {
                if let Some(level) = self.levels.get_mut(level_name) {
                    level.destroy_actor(&displaced.player_actor());
                }
            }
        }
        info!("conn {}: authenticated as user {}", conn, user_id);
        self.send_records(conn, &[encode_payload(CMD_REGISTER_OUTCOME, &json!(user_id))])
            .await;
    }

    async fn handle_join_level(&mut self, conn: u64, level_name: &str) {
        let Some(session) = self.sessions.get_mut(conn) else {
            warn!("conn {}: join_level before authentication", conn);
            return;
        };
        let player = session.player_actor();
        let previous = session.level.replace(level_name.to_string());
        session.interest.reset();
        let user_id = session.user_id;

        if let Some(old_name) = previous {
            if old_name != level_name {
                if let Some(old_level) = self.levels.get_mut(&old_name) {
                    old_level.destroy_actor(&player);
                }
            }
        }

        let level = self
            .levels
            .entry(level_name.to_string())
            .or_insert_with(|| level::create_default(level_name));
        let spawn = crate::actor::Actor::character(&player, Vec2::ZERO, Vec2::new(0.5, 1.0));
        match level.register_actor(spawn) {
            Ok(()) => info!("user {}: joined level {:?}", user_id, level_name),
            // Rejoining the same level keeps the existing character.
            Err(e) => debug!("user {}: {}", user_id, e),
        }

        if let Some(background) = self.backgrounds.get(level_name) {
            let record = encode_payload(CMD_BACKGROUND, &json!(background));
            self.send_records(conn, &[record]).await;
        }
    }

    fn handle_input(&mut self, conn: u64, command: &str, data: Value) {
        let Some(session) = self.sessions.get_mut(conn) else {
            return;
        };
        match command {
            CMD_KEY_DOWN => {
                if let Some(key) = data.as_i64() {
                    session.key_down(key);
                }
            }
            CMD_KEY_UP => {
                if let Some(key) = data.as_i64() {
                    session.key_up(key);
                }
            }
            CMD_WORLD_MOUSE_POS => match serde_json::from_value::<Vec2>(data) {
                Ok(pos) => session.mouse_world = pos,
                Err(e) => debug!("conn {}: bad mouse position: {}", conn, e),
            },
            _ => {}
        }
    }

    async fn simulate_and_replicate(&mut self, dt: f32) {
        let level_names: Vec<String> = self.levels.keys().cloned().collect();
        for level_name in level_names {
            let Some(level) = self.levels.get_mut(&level_name) else {
                continue;
            };
            let destroyed = level.drain_destroyed();
            let _ = level.tick(dt);

            // Input lands after physics so contact latches from this tick
            // gate jumps.
            let conns: Vec<u64> = self
                .sessions
                .iter()
                .filter(|s| s.level.as_deref() == Some(level_name.as_str()))
                .map(|s| s.conn)
                .collect();
            for conn in &conns {
                let Some(session) = self.sessions.get_mut(*conn) else {
                    continue;
                };
                let player = session.player_actor();
                let (triggered, pressed, released) = (
                    session.triggered().clone(),
                    session.pressed().clone(),
                    session.released().clone(),
                );
                if let Some(level) = self.levels.get_mut(&level_name) {
                    self.dispatcher
                        .dispatch(level, &player, &triggered, &pressed, &released, dt);
                }
            }

            let mut windows: Vec<(ChunkCoord, ChunkCoord)> = Vec::new();
            for session in self.sessions.iter() {
                if session.level.as_deref() != Some(level_name.as_str()) {
                    continue;
                }
                let player = session.player_actor();
                let actor = self
                    .levels
                    .get(&level_name)
                    .and_then(|level| level.actor(&player));
                if let Some(actor) = actor {
                    let (cx, cy) = chunk_of(actor.position());
                    let d = session.interest.update_distance.max(0);
                    windows.push(((cx - d, cy - d), (cx + d, cy + d)));
                }
            }
            let Some(level) = self.levels.get_mut(&level_name) else {
                continue;
            };
            let maps = TickMaps {
                fresh: level.drain_new(),
                destroyed,
                updates: level.collect_updates(&windows),
            };

            for conn in conns {
                let Some(session) = self.sessions.get_mut(conn) else {
                    continue;
                };
                let player = session.player_actor();
                let Some(level) = self.levels.get(&level_name) else {
                    break;
                };
                let Some(actor) = level.actor(&player) else {
                    session.end_tick_inputs();
                    continue;
                };
                let traffic =
                    replication::plan(&mut session.interest, actor.position(), level, &maps);
                let (conn, user_id) = (session.conn, session.user_id);
                session.end_tick_inputs();

                self.transport.send_reliable(conn, &traffic.reliable).await;
                self.transport
                    .send_unreliable(user_id, &traffic.unreliable, self.config.packet_size)
                    .await;
            }
        }
    }

    /// Plays a sound on every client currently in the level. `position` is
    /// optional; omitted means non-positional.
    pub async fn play_sound(
        &self,
        level_name: &str,
        sound: &str,
        position: Option<Vec2>,
        distance: f32,
        volume: f32,
    ) {
        let record = encode_payload(CMD_PLAY_SOUND, &json!([sound, position, distance, volume]));
        for session in self.sessions.iter() {
            if session.level.as_deref() == Some(level_name) {
                self.transport
                    .send_reliable(session.conn, std::slice::from_ref(&record))
                    .await;
            }
        }
    }

    /// Sets the level's backdrop and pushes it to everyone already there.
    /// Late joiners receive it with their join.
    pub async fn set_background(&mut self, level_name: &str, background: &str) {
        self.backgrounds
            .insert(level_name.to_string(), background.to_string());
        let record = encode_payload(CMD_BACKGROUND, &json!(background));
        for session in self.sessions.iter() {
            if session.level.as_deref() == Some(level_name) {
                self.transport
                    .send_reliable(session.conn, std::slice::from_ref(&record))
                    .await;
            }
        }
    }

    async fn send_records(&self, conn: u64, records: &[String]) {
        self.transport.send_reliable(conn, records).await;
    }

    pub async fn stop(self) {
        self.transport.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::protocol::keys;

    fn test_config(port: u16) -> EngineConfig {
        EngineConfig {
            port,
            ..EngineConfig::default()
        }
    }

    // The whole engine moves into a spawned task and holds borrows across
    // await points, so it must be both Send and Sync.
    #[test]
    fn engine_crosses_thread_boundaries() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Engine>();
    }

    #[tokio::test]
    async fn idle_sessions_shed_key_edges_each_tick() {
        let mut engine = Engine::start(test_config(47365)).await.unwrap();
        engine.sessions.install(Session::new(1, 7, "ada".into(), 2));

        // A key press lands before the player has joined any level.
        engine.handle_input(1, CMD_KEY_DOWN, json!(keys::KEY_SPACE));
        assert!(engine.sessions.get(1).unwrap().triggered().contains(&keys::KEY_SPACE));

        engine.tick_once(0.016).await;
        let session = engine.sessions.get(1).unwrap();
        assert!(session.triggered().is_empty());
        // Held keys persist; only the edges clear.
        assert!(session.pressed().contains(&keys::KEY_SPACE));

        engine.stop().await;
    }

    #[tokio::test]
    async fn reauth_on_one_conn_frees_the_old_user() {
        let mut engine = Engine::start(test_config(47367)).await.unwrap();

        engine
            .handle_auth(1, CMD_REGISTER, json!(["ada", "pw"]))
            .await;
        engine
            .handle_auth(1, CMD_REGISTER, json!(["bob", "pw"]))
            .await;

        let session = engine.sessions.get(1).unwrap();
        assert_eq!(session.username, "bob");
        // The first identity no longer resolves to a connection, so a
        // datagram bind claiming it is refused.
        assert_eq!(engine.sessions.conn_for_user(1), None);
        assert_eq!(engine.sessions.conn_for_user(session.user_id), Some(1));

        engine.stop().await;
    }
}

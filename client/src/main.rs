use clap::Parser;
use client::{ClientWorld, Connection};
use log::info;
use serde_json::json;
use shared::protocol::{CMD_JOIN_LEVEL, CMD_UPDATE_DISTANCE};
use std::time::Duration;
use tokio::time::interval;

#[derive(Parser)]
#[command(about = "Headless world client")]
struct Args {
    /// Server address
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server UDP port; the stream dials one above
    #[arg(long, default_value_t = 8080)]
    port: u16,

    #[arg(long)]
    username: String,

    #[arg(long)]
    password: String,

    /// Register a new account instead of logging in
    #[arg(long, default_value_t = false)]
    register: bool,

    /// Level to join once authenticated
    #[arg(long, default_value = "Overworld")]
    level: String,

    /// Interest radius in chunks
    #[arg(long, default_value_t = 2)]
    update_distance: i64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let mut connection = Connection::connect(&args.host, args.port).await?;
    if args.register {
        connection.register(&args.username, &args.password);
    } else {
        connection.login(&args.username, &args.password);
    }

    let mut world = ClientWorld::new();
    let mut joined = false;
    let mut ticker = interval(Duration::from_millis(16));
    let mut last_count = usize::MAX;

    loop {
        ticker.tick().await;
        for (command, data) in connection.poll().await {
            world.apply(&command, &data);
        }
        if connection.is_closed() {
            info!("session over");
            break;
        }
        if connection.is_authenticated() && !joined {
            connection.send_reliable(CMD_UPDATE_DISTANCE, &json!(args.update_distance));
            connection.send_reliable(CMD_JOIN_LEVEL, &json!(args.level));
            joined = true;
        }
        for sound in world.drain_sounds() {
            info!("sound: {}", sound);
        }
        if world.actor_count() != last_count {
            last_count = world.actor_count();
            info!("mirroring {} actors", last_count);
        }
    }

    connection.close();
    Ok(())
}

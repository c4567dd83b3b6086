use clap::Parser;
use server::{Engine, EngineConfig};

#[derive(Parser)]
#[command(about = "Authoritative world server")]
struct Args {
    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// UDP port; the reliable listener binds one above
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Maximum concurrent client connections
    #[arg(long, default_value_t = 64)]
    max_connections: usize,

    /// Simulation ticks per second
    #[arg(long, default_value_t = 60)]
    max_tps: u32,

    /// Clamp dt as if the rate never drops below this
    #[arg(long, default_value_t = 10)]
    min_tps: u32,

    /// Datagram budget in bytes
    #[arg(long, default_value_t = 4096)]
    packet_size: usize,

    /// Default interest radius in chunks
    #[arg(long, default_value_t = 2)]
    update_distance: i32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let config = EngineConfig {
        host: args.host,
        port: args.port,
        max_connections: args.max_connections,
        max_tps: args.max_tps,
        min_tps: args.min_tps,
        packet_size: args.packet_size,
        update_distance: args.update_distance,
    };

    let mut engine = Engine::start(config).await?;
    engine.run().await;
    Ok(())
}

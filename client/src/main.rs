use clap::Parser;
use log::{error, info, warn};
use rand::Rng;
use std::time::Duration;
use sync_client::config::ClientConfig;
use sync_client::network::Client;
use sync_client::transmitter::SendOutcome;
use sync_shared::{
    Event, Vec2, BROADCAST_PORT, COMMAND_BASE_PORT, DEFAULT_TICK_INTERVAL_MS,
    MAX_EVENTS_PER_COMMAND, REGISTRATION_PORT, WORLD_HEIGHT, WORLD_WIDTH,
};
use tokio::time::{interval, MissedTickBehavior};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server host to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1")]
    server: String,

    #[arg(short = 'r', long, default_value_t = REGISTRATION_PORT)]
    registration_port: u16,

    #[arg(short = 'b', long, default_value_t = BROADCAST_PORT)]
    broadcast_port: u16,

    #[arg(short = 'c', long, default_value_t = COMMAND_BASE_PORT)]
    command_base_port: u16,

    /// Local tick interval in milliseconds
    #[arg(short = 't', long, default_value_t = DEFAULT_TICK_INTERVAL_MS)]
    tick_ms: u64,

    /// Bot walking speed in units per second
    #[arg(long, default_value = "250")]
    speed: f32,

    /// Chance per tick of pressing a key
    #[arg(long, default_value = "0.02")]
    key_chance: f64,
}

/// Random walk inside the playfield
struct Wanderer {
    position: Vec2,
    heading: f32,
    speed: f32,
}

impl Wanderer {
    fn new(rng: &mut impl Rng, speed: f32) -> Self {
        Self {
            position: Vec2::new(
                rng.gen_range(0.0..WORLD_WIDTH),
                rng.gen_range(0.0..WORLD_HEIGHT),
            ),
            heading: rng.gen_range(0.0..std::f32::consts::TAU),
            speed,
        }
    }

    fn step(&mut self, rng: &mut impl Rng, dt: f32) {
        self.heading += rng.gen_range(-0.4..0.4);
        let x = self.position.x + self.heading.cos() * self.speed * dt;
        let y = self.position.y + self.heading.sin() * self.speed * dt;

        // Turn around at the edges
        if !(0.0..=WORLD_WIDTH).contains(&x) || !(0.0..=WORLD_HEIGHT).contains(&y) {
            self.heading += std::f32::consts::PI;
        }
        self.position = Vec2::new(x.clamp(0.0, WORLD_WIDTH), y.clamp(0.0, WORLD_HEIGHT));
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = ClientConfig {
        server_host: args.server.clone(),
        registration_port: args.registration_port,
        broadcast_port: args.broadcast_port,
        command_base_port: args.command_base_port,
        ..ClientConfig::default()
    };

    info!("Starting headless client...");
    let mut client = Client::connect(config).await?;
    let mirror = client.spawn_poller();

    let tick_interval = Duration::from_millis(args.tick_ms.max(1));
    let mut ticker = interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut rng = rand::thread_rng();
    let mut bot = Wanderer::new(&mut rng, args.speed);
    let mut pending_events: Vec<Event> = Vec::new();
    let mut tick: u32 = 0;
    let report_every = (5000 / args.tick_ms.max(1)).max(1) as u32;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C, disconnecting...");
                break;
            }
        }

        tick = tick.wrapping_add(1);
        bot.step(&mut rng, tick_interval.as_secs_f32());

        let can_queue = pending_events.len() < MAX_EVENTS_PER_COMMAND;
        if can_queue && rng.gen_bool(args.key_chance.clamp(0.0, 1.0)) {
            pending_events.push(
                Event::new("InputPressed")
                    .with_param("playerId", client.id() as i32)
                    .with_param("key", rng.gen_range(0..4i32)),
            );
        }

        let mut cmd = client.command(tick, 0, bot.position.x, bot.position.y);
        cmd.events = pending_events.clone();

        match client.send_command(&cmd).await {
            Ok(SendOutcome::Sent) => pending_events.clear(),
            Ok(SendOutcome::Skipped) => {}
            Err(e) => {
                error!("Lost the server: {}", e);
                break;
            }
        }

        if tick % report_every == 0 {
            let mirror = mirror.lock().await;
            let stats = client.stats();
            info!(
                "Tick {}: at ({:.0}, {:.0}), {} other player(s), {} object(s), server tick {:?}, sent {} skipped {}",
                tick,
                bot.position.x,
                bot.position.y,
                mirror.players().len(),
                mirror.objects().len(),
                mirror.last_tick(),
                stats.sent,
                stats.skipped
            );
        }
    }

    if let Err(e) = client.disconnect().await {
        warn!("Disconnect was not acknowledged: {}", e);
    }

    Ok(())
}

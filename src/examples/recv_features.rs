use clap::Parser;
use feature_stream::{ListenerConfig, SessionConfig, SessionController, SessionState, Snapshot};
use std::time::Duration;

/// Listen for a feature producer and print live statistics
#[derive(Parser, Debug)]
#[command(name = "recv_features")]
struct Args {
    #[arg(long, default_value = "localhost")]
    host: String,

    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Largest accepted frame in bytes
    #[arg(long, default_value_t = feature_stream::DEFAULT_MAX_FRAME_SIZE)]
    max_frame_size: usize,

    /// Exit after this many seconds (0 = run until killed)
    #[arg(long, default_value_t = 0)]
    seconds: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = SessionConfig::default().with_listener(
        ListenerConfig::default()
            .with_host(args.host)
            .with_port(args.port)
            .with_max_frame_size(args.max_frame_size),
    );

    let mut session = SessionController::new(config);
    session.connect()?;
    if let Some(addr) = session.local_addr() {
        println!("🌀 Feature receiver");
        println!("📡 Listening on {}...", addr);
        println!(
            "📏 Max frame {} bytes, rate every {:?}\n",
            session.config().listener.max_frame_size,
            session.config().tick_interval
        );
    }

    let mut elapsed = 0u64;
    loop {
        std::thread::sleep(Duration::from_secs(1));
        elapsed += 1;
        print_snapshot(&session.snapshot());

        if args.seconds != 0 && elapsed >= args.seconds {
            break;
        }
    }

    session.disconnect();
    Ok(())
}

fn print_snapshot(snapshot: &Snapshot) {
    let state = match snapshot.state {
        SessionState::Disconnected => "disconnected",
        SessionState::Listening => "listening",
        SessionState::Connected => "connected",
    };

    match &snapshot.frame {
        Some(frame) => println!(
            "[{}] {:.1} fps | cls {} | patches {}x{} | min {:.4} max {:.4} mean {:.4} std {:.4} | total {}",
            state,
            snapshot.fps,
            frame.global_vector.len(),
            frame.patch_count(),
            frame.patch_dim(),
            snapshot.stats.min,
            snapshot.stats.max,
            snapshot.stats.mean,
            snapshot.stats.std,
            snapshot.frames_received,
        ),
        None => println!("[{}] waiting for frames", state),
    }
}

use clap::Parser;
use feature_stream::{EncodeOptions, FeatureFrame};
use rand::Rng;
use std::io::Write;
use std::net::TcpStream;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Stream synthetic feature frames to a listening receiver
#[derive(Parser, Debug)]
#[command(name = "send_features")]
struct Args {
    /// Receiver address
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: String,

    /// Global embedding dimensionality
    #[arg(long, default_value_t = 384)]
    dim: usize,

    /// Number of patch vectors per frame
    #[arg(long, default_value_t = 256)]
    patches: usize,

    /// Frames per second
    #[arg(long, default_value_t = 15.0)]
    rate: f64,

    /// Stop after this many frames (0 = run forever)
    #[arg(long, default_value_t = 0)]
    count: u64,

    /// Compress bodies with zstd at this level
    #[arg(long)]
    zstd: Option<i32>,

    /// Send JSON bodies instead of packed floats
    #[arg(long)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.rate > 0.0, "--rate must be positive");

    let mut stream = TcpStream::connect(&args.addr)?;
    stream.set_nodelay(true)?;
    tracing::info!(addr = %args.addr, dim = args.dim, patches = args.patches, "connected");

    let opts = EncodeOptions {
        zstd_level: args.zstd,
        json: args.json,
    };
    let period = Duration::from_secs_f64(1.0 / args.rate);
    let mut rng = rand::thread_rng();
    let mut sent = 0u64;
    let mut bytes_sent = 0usize;
    let started = Instant::now();

    while args.count == 0 || sent < args.count {
        let tick = Instant::now();

        let global: Vec<f32> = (0..args.dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let grid: Vec<Vec<f32>> = (0..args.patches)
            .map(|_| (0..args.dim).map(|_| rng.gen_range(-1.0..1.0)).collect())
            .collect();
        let timestamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs_f64();
        let frame = FeatureFrame::new(global, grid, timestamp)?;

        let bytes = frame.encode_with(&opts)?;
        stream.write_all(&bytes)?;
        sent += 1;
        bytes_sent += bytes.len();

        if sent % 50 == 0 {
            let secs = started.elapsed().as_secs_f64();
            println!(
                "📤 {} frames, {:.1} fps, {:.1} KiB/frame",
                sent,
                sent as f64 / secs,
                bytes_sent as f64 / sent as f64 / 1024.0
            );
        }

        if let Some(rest) = period.checked_sub(tick.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    println!("✅ Sent {} frames ({} bytes)", sent, bytes_sent);
    Ok(())
}

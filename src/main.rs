use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::Parser;
use log::warn;

use erosion_race::{ErosionParameters, RaceConfig, SimulationController, StreamPowerEngine};

#[derive(Parser, Debug)]
#[command(name = "erosion_race")]
#[command(about = "Race particles down an eroding landscape into column buckets")]
struct Args {
    /// JSON config file (partial files are filled with defaults); options below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Grid rows (particles race toward the last row)
    #[arg(short = 'R', long)]
    rows: Option<usize>,

    /// Grid columns
    #[arg(short = 'C', long)]
    cols: Option<usize>,

    /// Number of particles
    #[arg(short = 'n', long)]
    particles: Option<usize>,

    /// Number of buckets at the base level
    #[arg(short, long)]
    buckets: Option<usize>,

    /// Fraction of particles moved each step, in (0, 1]
    #[arg(long)]
    speed_factor: Option<f64>,

    /// Random seed (uses random seed if not specified)
    #[arg(short, long)]
    seed: Option<u64>,

    /// River incision coefficient
    #[arg(long, default_value = "1e-4")]
    kf: f64,

    /// Hillslope diffusivity
    #[arg(long, default_value = "0.01")]
    kd: f64,

    /// River transport coefficient
    #[arg(long, default_value = "1.0")]
    g: f64,

    /// Flow partition exponent
    #[arg(long, default_value = "1.0")]
    p: f64,

    /// Plateau uplift rate
    #[arg(long, default_value = "0.0")]
    uplift: f64,

    /// Stop after this many steps even if particles are still travelling
    #[arg(long)]
    max_steps: Option<u64>,

    /// Print progress every N steps
    #[arg(long, default_value = "50")]
    report_every: u64,

    /// Write the final snapshot as JSON
    #[arg(long)]
    export_snapshot: Option<PathBuf>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => RaceConfig::from_json_file(path)?,
        None => RaceConfig::default(),
    };
    if let Some(rows) = args.rows {
        config.rows = rows;
    }
    if let Some(cols) = args.cols {
        config.cols = cols;
    }
    if let Some(n) = args.particles {
        config.n_particles = n;
    }
    if let Some(n) = args.buckets {
        config.n_buckets = n;
    }
    if let Some(speed) = args.speed_factor {
        config.speed_factor = speed;
    }
    let seed = args.seed.or(config.seed).unwrap_or_else(rand::random);
    config.seed = Some(seed);
    config.validate()?;

    let params = ErosionParameters {
        kf: args.kf,
        kd: args.kd,
        g: args.g,
        p: args.p,
        uplift_rate: args.uplift,
        ..Default::default()
    };
    warn_outside_board_ranges(&params);
    if !(RaceConfig::PARTICLES_MIN..=RaceConfig::PARTICLES_MAX).contains(&config.n_particles) {
        warn!(
            "{} particles is outside the usual range [{}, {}]",
            config.n_particles,
            RaceConfig::PARTICLES_MIN,
            RaceConfig::PARTICLES_MAX
        );
    }

    println!("Racing with seed: {}", seed);
    println!(
        "Grid {}x{}, {} particles, {} buckets, speed factor {}",
        config.rows, config.cols, config.n_particles, config.n_buckets, config.speed_factor
    );

    let mut controller = SimulationController::new(StreamPowerEngine::new(), config.clone())?;
    controller.set_parameters(params)?;
    controller.start()?;

    let report_every = args.report_every.max(1);
    let mut last_report = 0;
    loop {
        if controller.poll()?.is_some() {
            break;
        }
        let snapshot = controller.snapshot();
        if snapshot.step >= last_report + report_every {
            println!(
                "  step {:>6}: {:>6}/{} arrived",
                snapshot.step,
                snapshot.arrived(),
                snapshot.n_particles()
            );
            last_report = snapshot.step;
        }
        if let Some(max) = args.max_steps {
            if snapshot.step >= max {
                println!("Reached {} steps, stopping early", max);
                break;
            }
        }
        thread::sleep(Duration::from_millis(10));
    }

    let final_snapshot = controller.snapshot();
    if let Some(path) = &args.export_snapshot {
        std::fs::write(path, serde_json::to_string_pretty(&*final_snapshot)?)?;
        println!("Saved snapshot: {}", path.display());
    }

    let outcome = controller.stop()?;
    let n = config.n_particles.max(1);
    println!("Buckets after {} steps:", outcome.steps);
    for (i, &count) in outcome.counts.iter().enumerate() {
        let bar = "#".repeat(count * 40 / n);
        println!("  {:02} {:>6} {}", i + 1, count, bar);
    }
    match outcome.winner {
        Some(winner) => println!("Bucket {:02} wins!", winner + 1),
        None => println!("No winner: {} particles still travelling", n - outcome.counts.iter().sum::<usize>()),
    }
    Ok(())
}

fn warn_outside_board_ranges(params: &ErosionParameters) {
    let checks = [
        ("kf", params.kf, ErosionParameters::KF_MIN, ErosionParameters::KF_MAX),
        ("g", params.g, ErosionParameters::G_MIN, ErosionParameters::G_MAX),
        ("kd", params.kd, ErosionParameters::KD_MIN, ErosionParameters::KD_MAX),
        ("p", params.p, ErosionParameters::P_MIN, ErosionParameters::P_MAX),
    ];
    for (name, value, min, max) in checks {
        if value < min || value > max {
            warn!("{} = {} is outside the usual range [{}, {}]", name, value, min, max);
        }
    }
}

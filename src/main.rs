use clap::{Parser, Subcommand};
use on_air::asset;
use on_air::audio::{AudioBackend, DryRunBackend, PlayerPool};
use on_air::audio_runtime::RodioBackend;
use on_air::break_scheduler::BreakScheduler;
use on_air::channel::EventChannel;
use on_air::config::ShowConfig;
use on_air::error::Result;
use on_air::events::{BreakWindowOpened, ShowEnded};
use on_air::stage::Stage;
use on_air::station::{CallerBoard, Ledger, ListenerGauge, MoodMeter};
use on_air::timeline::{Rundown, ShowSummary, Timeline};
use on_air::unit::{AdCatalog, DialogueLine, ExecutionUnit, UnitMetadata};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_CONFIG: &str = "on-air.json";

const CALLERS: &[&str] = &[
    "Dale from Boise",
    "Marla from Pahrump",
    "Gus, long time listener",
    "Trish on a car phone",
    "Anonymous in Elko",
    "Ray from the night shift",
];

#[derive(Parser)]
#[command(name = "on-air", about = "Call-in show broadcast timeline")]
struct Cli {
    /// Show configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the break schedule for a show
    Schedule {
        #[command(flatten)]
        show: ShowArgs,
        /// Lowest listener count for the revenue estimate
        #[arg(long, default_value_t = 100)]
        min_listeners: u32,
        /// Highest listener count for the revenue estimate
        #[arg(long, default_value_t = 1200)]
        max_listeners: u32,
    },
    /// Run a demo show end to end
    Run {
        #[command(flatten)]
        show: ShowArgs,
        /// Starting listener count
        #[arg(short, long, default_value_t = 400)]
        listeners: u32,
        /// Queue every break as soon as its window opens
        #[arg(long)]
        auto_queue: bool,
        /// Play through the sound card instead of a silent dry run
        #[arg(long)]
        audio: bool,
    },
    /// Print the length of audio files
    Probe {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Show configuration
    Config {
        #[command(subcommand)]
        action: ConfigCmd,
    },
}

#[derive(clap::Args)]
struct ShowArgs {
    /// Show length in seconds (overrides config)
    #[arg(short, long)]
    duration: Option<f64>,
    /// Breaks per show (overrides config)
    #[arg(short, long)]
    breaks: Option<usize>,
    /// Ad slots per break (overrides config)
    #[arg(short, long)]
    slots: Option<usize>,
    /// Directory of ad spots and jingles (overrides config)
    #[arg(long)]
    ads_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum ConfigCmd {
    /// Show the effective configuration
    Show,
    /// Write the default configuration to the config path
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Schedule {
            show,
            min_listeners,
            max_listeners,
        } => {
            let cfg = effective_config(&cli.config, &show);
            if let Err(e) = print_schedule(&cfg, min_listeners, max_listeners) {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }

        Commands::Run {
            show,
            listeners,
            auto_queue,
            audio,
        } => {
            let cfg = effective_config(&cli.config, &show);
            let runtime = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("Error: cannot start runtime: {}", e);
                    std::process::exit(1);
                }
            };
            match runtime.block_on(run_show(cfg, listeners, auto_queue, audio)) {
                Ok(summary) => match serde_json::to_string_pretty(&summary) {
                    Ok(json) => println!("{}", json),
                    Err(e) => eprintln!("Error: {}", e),
                },
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Probe { files } => {
            let mut failed = false;
            for file in &files {
                match asset::probe(file) {
                    Ok(length) => {
                        println!("{}  {}", asset::duration_display(length), file.display())
                    }
                    Err(e) => {
                        failed = true;
                        eprintln!("{}: {}", file.display(), e);
                    }
                }
            }
            if failed {
                std::process::exit(1);
            }
        }

        Commands::Config { action } => match action {
            ConfigCmd::Show => {
                let cfg = ShowConfig::load_or_default(&cli.config);
                match serde_json::to_string_pretty(&cfg) {
                    Ok(json) => println!("{}", json),
                    Err(e) => {
                        eprintln!("Error: {}", e);
                        std::process::exit(1);
                    }
                }
            }
            ConfigCmd::Init { force } => {
                if cli.config.exists() && !force {
                    eprintln!(
                        "Error: '{}' already exists. Use --force to overwrite.",
                        cli.config.display()
                    );
                    std::process::exit(1);
                }
                if let Err(e) = ShowConfig::default().save(&cli.config) {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
                println!("Wrote default configuration to {}", cli.config.display());
            }
        },
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Config file, then command-line overrides, then validation.
fn effective_config(path: &Path, show: &ShowArgs) -> ShowConfig {
    let mut cfg = ShowConfig::load_or_default(path);
    if let Some(d) = show.duration {
        cfg.show_duration_secs = d;
    }
    if let Some(b) = show.breaks {
        cfg.breaks_per_show = b;
    }
    if let Some(s) = show.slots {
        cfg.slots_per_break = s;
    }
    if let Some(dir) = &show.ads_dir {
        cfg.ad_audio_dir = Some(dir.clone());
    }
    if let Err(e) = cfg.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    cfg
}

fn print_schedule(cfg: &ShowConfig, min_listeners: u32, max_listeners: u32) -> Result<()> {
    let schedule = cfg.schedule()?;
    let timing = cfg.break_timing()?;
    println!(
        "Show: {}  ({} breaks, {} slots each)",
        asset::duration_display(cfg.show_duration()),
        schedule.len(),
        cfg.slots_per_break
    );
    println!("  #  window  starts  length");
    for b in schedule.breaks() {
        let window = b.scheduled_time().saturating_sub(timing.window());
        println!(
            "  {}  {:>6}  {:>6}  {:>6}",
            b.index() + 1,
            asset::duration_display(window),
            asset::duration_display(b.scheduled_time()),
            asset::duration_display(b.total_duration(&timing)),
        );
    }
    let (low, high) = schedule.estimate_revenue_range(min_listeners, max_listeners);
    println!(
        "Ad time: {}  Revenue: ${:.2} - ${:.2} ({}-{} listeners)",
        asset::duration_display(schedule.total_ad_time(&timing)),
        low,
        high,
        min_listeners,
        max_listeners
    );
    Ok(())
}

async fn run_show(
    cfg: ShowConfig,
    listeners: u32,
    auto_queue: bool,
    audio: bool,
) -> Result<ShowSummary> {
    let backend: Arc<dyn AudioBackend> = if audio {
        Arc::new(RodioBackend::spawn()?)
    } else {
        Arc::new(DryRunBackend::new())
    };
    let ads = match &cfg.ad_audio_dir {
        Some(dir) => AdCatalog::scan(dir)?,
        None => AdCatalog::default(),
    };

    let events = Arc::new(EventChannel::new());
    let callers = Arc::new(CallerBoard::new());
    for name in CALLERS {
        callers.hold(name);
    }
    let gauge = Arc::new(ListenerGauge::new(listeners));
    let ledger = Arc::new(Ledger::new());
    let mood = Arc::new(MoodMeter::new(50.0));

    let stage = Stage::new(
        events.clone(),
        PlayerPool::new(backend, cfg.player_pool_size),
        callers.clone(),
        gauge.clone(),
        ledger.clone(),
        ads,
        cfg.unit_timing(),
    );
    let scheduler = BreakScheduler::new(
        cfg.schedule()?,
        cfg.break_timing()?,
        cfg.break_rules(),
        events.clone(),
        gauge,
        mood.clone(),
        ledger.clone(),
    );

    let _queuer = auto_queue.then(|| {
        let scheduler = scheduler.clone();
        events.subscribe_scoped(move |e: &BreakWindowOpened| {
            if scheduler.queue_break() {
                tracing::info!(index = e.index, "break queued");
            }
        })
    });
    let _ending = events.subscribe_scoped(|e: &ShowEnded| {
        tracing::info!("off the air ({})", e.reason);
    });

    let timeline = Timeline::new(stage, scheduler, cfg.show_duration());
    let mut rundown = demo_rundown(&cfg, CALLERS.len());
    let summary = timeline.run(&mut rundown).await;

    tracing::info!(
        mood = mood.value(),
        ledger = ledger.total(),
        callers_left = callers.len(),
        "final standings"
    );
    Ok(summary)
}

/// Opener, then one segment per caller, then a closer.
fn demo_rundown(cfg: &ShowConfig, segments: usize) -> Rundown {
    let timing = cfg.unit_timing();
    let mut rundown = Rundown::new();
    rundown.push(ExecutionUnit::transition(
        "opener",
        "Good evening, you're on the air",
        None,
        Duration::from_secs(8),
    ));

    for n in 1..=segments {
        rundown.push(ExecutionUnit::put_on_air(format!("caller{}_up", n)));
        let lines = (0..6)
            .map(|i| {
                let speaker = if i % 2 == 0 { "host" } else { "caller" };
                DialogueLine::new(speaker, format!("segment {} line {}", n, i + 1), timing.line)
            })
            .collect();
        rundown.push(
            ExecutionUnit::conversation(format!("caller{}", n), lines).with_metadata(
                UnitMetadata {
                    caller_id: Some(n as u32),
                    ..UnitMetadata::default()
                },
            ),
        );
        if n % 3 == 0 {
            rundown.push(ExecutionUnit::penalty_delay(
                format!("caller{}_bleep", n),
                None,
                timing.penalty,
            ));
        }
        rundown.push(ExecutionUnit::wait_for_break(
            format!("caller{}_hold", n),
            timing.wait_for_break.min(Duration::from_secs(5)),
        ));
        rundown.push(ExecutionUnit::transition(
            format!("caller{}_out", n),
            "Let's go back to the phones",
            None,
            Duration::from_secs(3),
        ));
    }

    rundown.push(ExecutionUnit::transition(
        "closer",
        "That's the show",
        None,
        Duration::from_secs(10),
    ));
    rundown
}

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use park_layout::doctor as layout_doctor;
use park_layout::{LayoutCatalog, LayoutFile, ReferenceMap, Region, RegionStore};
use park_session::controller::ConfigDetectorFactory;
use park_session::sink::{format_line, EventSink, Fanout, FileLog, JsonLinesStats, MemoryLog, StatsSink, TracingSink};
use park_session::source::{DefaultSourceFactory, SourceConfig};
use park_session::state::SessionDefaults;
use park_session::stats::{spawn_stats_worker, StatsConfig};
use park_session::{ControllerConfig, SessionController};
use park_vision::image_ops::{self, OpsKind};
use park_vision::occupancy::OccupancyConfig;
use park_vision::tracker::TrackerConfig;
use park_vision::{DetectionMode, FrameProcessor, MlConfig};

#[derive(Debug, Parser)]
#[command(name = "parkwatch", version, about = "ParkWatch - parking occupancy and vehicle counting")]
struct Cli {
    /// TOML config; every section is optional.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Doctor,
    Run(RunArgs),
    Layout { #[command(subcommand)] cmd: LayoutCmd },
    Vision { #[command(subcommand)] cmd: VisionCmd },
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    /// Video file, image directory, or camera index (`0`).
    #[arg(long, default_value = "carPark.mp4")]
    source: String,
    /// `parking` or `vehicle`.
    #[arg(long)]
    mode: Option<DetectionMode>,
    /// Fuse ML detections (falls back to classical if the detector cannot start).
    #[arg(long)]
    ml: bool,
    #[arg(long)]
    confidence: Option<f32>,
    #[arg(long)]
    threshold: Option<u32>,
    #[arg(long)]
    frame_skip: Option<u32>,
    /// Stop after this many seconds.
    #[arg(long)]
    max_seconds: Option<u64>,
    #[arg(long, default_value_t = 5)]
    status_every: u64,
    /// Write the last annotated frame here on exit.
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum LayoutCmd {
    /// Print the regions of one reference layout, or a summary of all.
    Inspect { reference: Option<String> },
    /// Mark a parking space.
    Add {
        reference: String,
        x: i32,
        y: i32,
        #[arg(long, default_value_t = 107)]
        width: i32,
        #[arg(long, default_value_t = 48)]
        height: i32,
        #[arg(long)]
        id: Option<u32>,
    },
    /// Unmark a parking space.
    Remove { reference: String, id: u32 },
}

#[derive(Debug, Subcommand)]
enum VisionCmd { Inspect }

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct Config {
    session: SessionDefaults,
    processing: ProcessingCfg,
    occupancy: OccupancyConfig,
    tracker: TrackerConfig,
    ml: MlConfig,
    layouts: LayoutsCfg,
    source: SourceConfig,
    stats: StatsConfig,
    log: LogCfg,
}

#[derive(Debug, serde::Deserialize)]
#[serde(default)]
struct ProcessingCfg {
    ops: OpsKind,
    max_fps: Option<f32>,
    annotate: bool,
}

impl Default for ProcessingCfg {
    fn default() -> Self {
        Self { ops: OpsKind::Auto, max_fps: None, annotate: false }
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(default)]
struct LayoutsCfg {
    dir: String,
    default_reference: Option<String>,
    /// Video source -> reference image, on top of the builtin table.
    sources: BTreeMap<String, String>,
    /// Reference image -> [width, height].
    dimensions: BTreeMap<String, [u32; 2]>,
}

impl Default for LayoutsCfg {
    fn default() -> Self {
        Self { dir: "config".into(), default_reference: None, sources: BTreeMap::new(), dimensions: BTreeMap::new() }
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(default)]
struct LogCfg {
    path: String,
    memory_lines: usize,
}

impl Default for LogCfg {
    fn default() -> Self {
        Self { path: "logs/parkwatch.log".into(), memory_lines: 200 }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let Some(path) = path else { return Ok(Config::default()); };
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    toml::from_str(&s).context("parse config toml")
}

fn layout_catalog(cfg: &Config) -> LayoutCatalog {
    let l = &cfg.layouts;
    let references = ReferenceMap::with_overrides(&l.sources, &l.dimensions, l.default_reference.as_deref());
    LayoutCatalog::new(&l.dir, references)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(cli.config.as_deref())?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg)?,
        Command::Run(args) => run(&cfg, args).await?,
        Command::Layout { cmd } => layout_cmd(&cfg, cmd)?,
        Command::Vision { cmd } => vision_cmd(&cfg, cmd)?,
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    let catalog = layout_catalog(cfg);
    let mut spaces = 0;
    for reference in catalog.references().references() {
        match catalog.read(&reference)? {
            Some(file) => {
                for w in layout_doctor::check_layout(&file, catalog.references())? {
                    warn!("doctor: {}: {}", reference, w);
                }
                spaces += file.regions.len();
            }
            None => info!("doctor: no layout yet for {}", reference),
        }
    }
    info!("doctor: {} parking spaces across layouts in {}", spaces, catalog.dir().display());

    let s = &cfg.session;
    anyhow::ensure!(s.frame_skip >= 1, "session.frame_skip must be >= 1");
    anyhow::ensure!((0.0..=1.0).contains(&s.ml_confidence), "session.ml_confidence must be within 0..1");
    anyhow::ensure!(s.counting.offset >= 0, "session.counting.offset must be >= 0");
    anyhow::ensure!(cfg.occupancy.block_size >= 3, "occupancy.block_size must be >= 3");
    anyhow::ensure!(cfg.stats.interval_secs > 0, "stats.interval_secs must be > 0");
    anyhow::ensure!(
        (0.0..=1.0).contains(&cfg.tracker.learning_rate),
        "tracker.learning_rate must be within 0..1"
    );

    let ffmpeg = std::process::Command::new(&cfg.source.ffmpeg_bin)
        .arg("-version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();
    match ffmpeg {
        Ok(st) if st.success() => info!("doctor: {} available", cfg.source.ffmpeg_bin),
        _ => warn!("doctor: {} not runnable; only image directories can be played", cfg.source.ffmpeg_bin),
    }

    let model = if cfg.ml.use_coral { &cfg.ml.model_path_edgetpu } else { &cfg.ml.model_path };
    if Path::new(model).exists() {
        info!("doctor: ML model {} present", model);
    } else {
        warn!("doctor: ML model {} missing; ML detection will stay off", model);
    }
    if !cfg!(feature = "ml-tflite") {
        warn!("doctor: built without --features ml-tflite; ML detection unavailable");
    }

    let ops = image_ops::select(cfg.processing.ops);
    info!("doctor: image ops {}", ops.name());

    info!("doctor: OK");
    Ok(())
}

fn event_sinks(cfg: &Config) -> Result<(Arc<dyn EventSink>, Arc<MemoryLog>)> {
    let memory = Arc::new(MemoryLog::new(cfg.log.memory_lines));
    let file = FileLog::open(&cfg.log.path).with_context(|| format!("open event log {}", cfg.log.path))?;
    let sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(TracingSink), Arc::new(file), memory.clone()];
    Ok((Arc::new(Fanout(sinks)), memory))
}

fn build_controller(cfg: &Config, events: Arc<dyn EventSink>, annotate: bool) -> SessionController {
    let ops = image_ops::select(cfg.processing.ops);
    let processor = FrameProcessor::new(ops, cfg.occupancy.clone(), cfg.tracker.clone());
    SessionController::new(
        processor,
        layout_catalog(cfg),
        Arc::new(DefaultSourceFactory::new(cfg.source.clone())),
        Arc::new(ConfigDetectorFactory(cfg.ml.clone())),
        events,
        &cfg.session,
        ControllerConfig { max_fps: cfg.processing.max_fps, annotate: annotate || cfg.processing.annotate },
    )
}

async fn run(cfg: &Config, args: RunArgs) -> Result<()> {
    info!("run: starting");

    let (events, memory) = event_sinks(cfg)?;
    let mut ctl = build_controller(cfg, events, args.snapshot.is_some());

    if let Some(mode) = args.mode {
        ctl.set_mode(mode);
    }
    if let Some(c) = args.confidence {
        ctl.set_ml_confidence(c);
    }
    if let Some(t) = args.threshold {
        ctl.set_parking_threshold(t);
    }
    if let Some(k) = args.frame_skip {
        ctl.set_frame_skip(k);
    }
    if args.ml && !ctl.set_ml_detection(true) {
        warn!("run: continuing with classical detection only");
    }

    ctl.start(&args.source).with_context(|| format!("start session on {}", args.source))?;

    let stats_sink: Arc<dyn StatsSink> =
        Arc::new(JsonLinesStats::open(&cfg.stats.path).with_context(|| format!("open stats log {}", cfg.stats.path))?);
    let stats_task = spawn_stats_worker(ctl.state_handle(), stats_sink.clone(), Duration::from_secs(cfg.stats.interval_secs));

    let mut status = tokio::time::interval(Duration::from_secs(args.status_every.max(1)));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let deadline = async {
        match args.max_seconds {
            Some(s) => tokio::time::sleep(Duration::from_secs(s)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("run: interrupted");
                break;
            }
            _ = &mut deadline => {
                info!("run: time limit reached");
                break;
            }
            _ = status.tick() => {
                if !ctl.is_running() {
                    info!("run: session ended");
                    break;
                }
                info!("status: {}", ctl.status_text().replace('\n', ", "));
            }
        }
    }

    stats_task.abort();
    stats_sink.record_snapshot(&ctl.stats_snapshot());
    ctl.shutdown();

    if let Some(path) = &args.snapshot {
        match ctl.latest_frame() {
            Some(frame) => {
                frame.save(path).with_context(|| format!("write snapshot {}", path.display()))?;
                info!("run: snapshot written to {}", path.display());
            }
            None => warn!("run: no frame processed, snapshot skipped"),
        }
    }

    println!("{}", ctl.status_text());
    for e in memory.entries() {
        let at = time::OffsetDateTime::from_unix_timestamp_nanos(i128::from(e.ts_unix_ms) * 1_000_000)
            .unwrap_or(time::OffsetDateTime::UNIX_EPOCH);
        println!("  {}", format_line(at, &e.message));
    }
    Ok(())
}

fn layout_cmd(cfg: &Config, cmd: LayoutCmd) -> Result<()> {
    let catalog = layout_catalog(cfg);
    match cmd {
        LayoutCmd::Inspect { reference: None } => {
            for reference in catalog.references().references() {
                let store = catalog.load(&reference)?;
                let (w, h) = catalog.references().dimensions(&reference);
                println!("{reference}: {} spaces ({w}x{h})", store.len());
            }
        }
        LayoutCmd::Inspect { reference: Some(reference) } => {
            let file = catalog.read(&reference)?.unwrap_or_else(|| LayoutFile::empty(reference.clone()));
            println!("{} -> {}", reference, catalog.path_for(&reference).display());
            for r in &file.regions {
                println!("  #{:<3} x={} y={} {}x{}", r.id, r.x, r.y, r.width, r.height);
            }
            for w in layout_doctor::check_layout(&file, catalog.references())? {
                println!("  warning: {w}");
            }
        }
        LayoutCmd::Add { reference, x, y, width, height, id } => {
            let mut file = catalog.read(&reference)?.unwrap_or_else(|| {
                let (w, h) = catalog.references().dimensions(&reference);
                LayoutFile { width: Some(w), height: Some(h), ..LayoutFile::empty(reference.clone()) }
            });
            let id = match id {
                Some(id) => id,
                None => RegionStore::new(reference.clone(), file.regions.clone())?.next_id(),
            };
            file.regions.push(Region::new(id, x, y, width, height));
            let path = catalog.save(&file)?;
            println!("added space #{id} to {}", path.display());
        }
        LayoutCmd::Remove { reference, id } => {
            let mut file = catalog.read(&reference)?.with_context(|| format!("no layout for {reference}"))?;
            let before = file.regions.len();
            file.regions.retain(|r| r.id != id);
            anyhow::ensure!(file.regions.len() < before, "{reference} has no space #{id}");
            let path = catalog.save(&file)?;
            println!("removed space #{id} from {}", path.display());
        }
    }
    Ok(())
}

fn vision_cmd(cfg: &Config, cmd: VisionCmd) -> Result<()> {
    match cmd {
        VisionCmd::Inspect => {
            #[cfg(feature = "ml-tflite")]
            {
                let mut backend = park_vision::tflite::TfliteBackend::new(cfg.ml.clone())?;
                print!("{}", backend.inspect()?);
                Ok(())
            }
            #[cfg(not(feature = "ml-tflite"))]
            {
                let _ = cfg;
                anyhow::bail!("ML backend not available; build with --features ml-tflite");
            }
        }
    }
}

use std::path::{Path, PathBuf};
use std::sync::Arc;
use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, ValueEnum};
use log::{debug, info, warn};
use pipeline::{
    collaborators::Publishers,
    encoder::FfmpegEncoder,
    processor::{EntryMode, JobOutcome, JobProcessor, ProcessorSettings},
    project::{detect_project, load_ide_props, numbered_output, Generator, Project},
    recorder::NodeRecorder,
    render::{ConsoleProgress, CourseOverview},
    store::{DirJobStore, JobStore},
    watcher::JobWatcher,
    Orientation, PipelineConfig, Resolution,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Render the project given with --project and exit
    Cli,
    /// Watch the job store and process records as they arrive
    Serve,
}

/// Turns code lesson manifests into rendered videos
#[derive(Parser, Debug)]
#[command(name = "codevideo", author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, value_enum, default_value_t = Mode::Cli)]
    mode: Mode,

    /// Project data (actions, lesson or course) in JSON format
    #[arg(short, long)]
    project: Option<String>,

    /// Output file path
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Video orientation (landscape or portrait)
    #[arg(short = 'n', long)]
    orientation: Option<Orientation>,

    /// Video resolution (1080p or 4K)
    #[arg(short, long)]
    resolution: Option<Resolution>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Open the generated video when complete
    #[arg(long)]
    open: bool,

    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// IDE presentation properties (JSON) forwarded to the recorder
    #[arg(long)]
    ide_config: Option<PathBuf>,

    /// Run the recorder with its debug output enabled
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env must be loaded before configuration reads the environment
    let dotenv = dotenvy::dotenv();

    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    match dotenv {
        Ok(path) => debug!("Loaded environment from {}", path.display()),
        Err(e) => debug!("No .env file loaded: {}", e),
    }

    let mut cfg = PipelineConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(resolution) = args.resolution {
        cfg.resolution = resolution;
    }
    if let Some(orientation) = args.orientation {
        cfg.orientation = orientation;
    }
    cfg.debug |= args.debug;

    info!("/> CodeVideo v{}", env!("CARGO_PKG_VERSION"));
    debug!("Configuration: {:?}", cfg);

    let work = async {
        match args.mode {
            Mode::Serve => serve(&cfg).await,
            Mode::Cli => run_cli(&cfg, &args).await,
        }
    };

    tokio::select! {
        result = work => result,
        _ = tokio::signal::ctrl_c() => {
            println!("\nCancelling operations...");
            tokio::time::sleep(cfg.shutdown_grace()).await;
            Ok(())
        }
    }
}

fn build_processor(cfg: &PipelineConfig, store: Arc<DirJobStore>) -> JobProcessor {
    JobProcessor::new(
        store,
        Arc::new(NodeRecorder::from_config(cfg)),
        Arc::new(FfmpegEncoder::from_config(cfg)),
        ProcessorSettings::from_config(cfg),
    )
}

async fn serve(cfg: &PipelineConfig) -> Result<()> {
    let store = Arc::new(DirJobStore::new(&cfg.store_root));
    store
        .ensure_dirs()
        .with_context(|| format!("Failed to create job store under {}", cfg.store_root.display()))?;

    info!("Job store: {}", cfg.store_root.display());
    info!("Max concurrent jobs: {}", cfg.max_concurrent_jobs);
    warn!("No upload, notification or billing service is configured; published jobs will be routed to error");

    let processor = build_processor(cfg, store.clone()).with_publishers(Publishers::unconfigured());
    let watcher = JobWatcher::new(store, Arc::new(processor), cfg);
    watcher.run().await.context("Watching for job records failed")
}

async fn run_cli(cfg: &PipelineConfig, args: &Args) -> Result<()> {
    let Some(project_json) = args.project.as_deref() else {
        Args::command().print_help()?;
        return Ok(());
    };

    let ide_props = match args.ide_config.as_deref() {
        Some(path) => {
            let props = load_ide_props(path).context("IDE config validation failed")?;
            info!("Loaded IDE config from: {}", path.display());
            Some(props)
        }
        None => None,
    };

    debug!("Analyzing project JSON: {}", project_json);
    let project = detect_project(project_json).context("Failed to detect project type")?;
    println!("Detected project type: {}", project.kind());
    println!("/> CodeVideo generation in progress...");

    let console = Arc::new(ConsoleProgress);
    let mut generator = Generator::new(cfg.environment.clone()).with_progress(console.clone());
    if let Some(props) = ide_props {
        generator = generator.with_ide_props(props);
    }
    let jobs = generator.generate(&project).await.context("Failed to generate job records")?;

    let store = Arc::new(DirJobStore::new(&cfg.store_root));
    store
        .ensure_dirs()
        .with_context(|| format!("Failed to create job store under {}", cfg.store_root.display()))?;
    let processor = build_processor(cfg, store.clone()).with_progress(console.clone());

    let mut overview = match &project {
        Project::Course(course) => Some(CourseOverview::new(course.lessons.iter().enumerate().map(|(i, lesson)| {
            if lesson.title.is_empty() {
                format!("Lesson {}", i + 1)
            } else {
                lesson.title.clone()
            }
        }))),
        _ => None,
    };
    let is_course = overview.is_some();

    let mut produced = Vec::new();
    let mut failures = 0;
    for (i, job) in jobs.iter().enumerate() {
        if let Some(overview) = overview.as_mut() {
            overview.redraw();
        }

        let destination = args
            .output
            .as_ref()
            .map(|out| if is_course { numbered_output(out, i + 1) } else { out.clone() });
        let path = store
            .write(job)
            .with_context(|| format!("Failed to save job record {}", job.id))?;

        let outcome = processor.process(&path, &EntryMode::Foreground { destination }).await;
        // the processor's progress line plus whatever is reported below
        let printed = 1 + report_outcome(outcome, cfg, &mut produced, &mut failures);
        if let Some(overview) = overview.as_mut() {
            overview.printed(printed);
            overview.set(i, 100.0);
        }
    }

    if let Some(overview) = overview.as_mut() {
        overview.redraw();
        for video in &produced {
            println!("✅ {}", video.display());
        }
    }

    if args.open {
        match produced.last() {
            Some(video) => open_file(video)?,
            None => warn!("Nothing to open"),
        }
    }

    if failures > 0 {
        bail!("{} of {} video(s) failed", failures, jobs.len());
    }
    Ok(())
}

/// Print one job's result, returning how many lines it took
fn report_outcome(outcome: JobOutcome, cfg: &PipelineConfig, produced: &mut Vec<PathBuf>, failures: &mut usize) -> usize {
    match outcome {
        JobOutcome::Succeeded { output: Some(output), .. } => {
            println!();
            println!("✅ CodeVideo successfully generated and saved to {}", output.display());
            println!();
            produced.push(output);
            3
        }
        JobOutcome::Succeeded { id, output: None } => {
            println!("⚠️  Job {} finished but the video could not be copied to {}", id, cfg.output_dir.display());
            1
        }
        JobOutcome::Failed { id, stage, message } => {
            eprintln!("❌ Job {} failed during {}: {}", id, stage, message);
            *failures += 1;
            1
        }
        JobOutcome::Abandoned { path, reason } => {
            eprintln!("❌ Could not process {}: {}", path.display(), reason);
            *failures += 1;
            1
        }
    }
}

/// Hand the file to the platform's default viewer without waiting for it
fn open_file(path: &Path) -> Result<()> {
    let mut cmd = if cfg!(target_os = "macos") {
        tokio::process::Command::new("open")
    } else if cfg!(target_os = "windows") {
        let mut cmd = tokio::process::Command::new("cmd");
        cmd.args(["/c", "start"]);
        cmd
    } else {
        tokio::process::Command::new("xdg-open")
    };
    cmd.arg(path)
        .spawn()
        .with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(())
}

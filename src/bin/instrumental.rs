use std::{fs, path::PathBuf, process};

use clap::{Parser, Subcommand};
use instrumental_core::{
    model::registry::registry, prepare_model, resolve_shared, set_download_progress_callback,
    set_split_progress_callback, PipelineOptions, Resolver, Separator, SplitProgress, ToolchainConfig,
    WavFormat,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "instrumental")]
#[command(about = "Remove the vocals from a song with a stem separation model", long_about = None)]
#[command(version)]
struct Cli {
    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the instrumental mix of an audio file
    Separate {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long, default_value = "instrumental.wav")]
        output: PathBuf,

        /// Also write the isolated vocals here
        #[arg(long)]
        vocals: Option<PathBuf>,

        #[arg(long)]
        overlap: Option<f32>,

        #[arg(long)]
        shifts: Option<usize>,

        #[arg(long)]
        seed: Option<u64>,

        #[arg(long, value_parser = parse_format)]
        format: Option<WavFormat>,

        #[arg(short, long)]
        model: Option<String>,

        #[arg(long)]
        manifest_url: Option<String>,

        /// Use a local model file instead of downloading one
        #[arg(long)]
        model_path: Option<PathBuf>,

        /// JSON file with pipeline options; flags override it
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Locate or install ffmpeg/ffprobe and print their paths
    Toolchain,

    /// Download and verify a model
    Prepare {
        #[arg(short, long, default_value = "htdemucs_ort_v1")]
        model: String,

        #[arg(long)]
        manifest_url: Option<String>,
    },

    /// List available models
    List,
}

fn parse_format(s: &str) -> Result<WavFormat, String> {
    match s.to_ascii_lowercase().as_str() {
        "pcm16" => Ok(WavFormat::Pcm16),
        "float32" => Ok(WavFormat::Float32),
        other => Err(format!("unknown format `{other}` (pcm16 or float32)")),
    }
}

fn init_logging(quiet: bool, verbose: bool) {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{level},reqwest=warn,ort=warn")));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.quiet, cli.verbose);

    let result = match cli.command {
        Commands::Separate {
            input,
            output,
            vocals,
            overlap,
            shifts,
            seed,
            format,
            model,
            manifest_url,
            model_path,
            config,
        } => {
            let overrides = Overrides {
                overlap,
                shifts,
                seed,
                format,
                model,
                manifest_url,
                model_path,
            };
            handle_separate(input, output, vocals, config, overrides, cli.quiet)
        }
        Commands::Toolchain => handle_toolchain(),
        Commands::Prepare {
            model,
            manifest_url,
        } => handle_prepare(model, manifest_url, cli.quiet),
        Commands::List => handle_list(),
    };

    match result {
        Ok(()) => process::exit(0),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

struct Overrides {
    overlap: Option<f32>,
    shifts: Option<usize>,
    seed: Option<u64>,
    format: Option<WavFormat>,
    model: Option<String>,
    manifest_url: Option<String>,
    model_path: Option<PathBuf>,
}

impl Overrides {
    fn apply(self, opts: &mut PipelineOptions) {
        if let Some(v) = self.overlap {
            opts.overlap = v;
        }
        if let Some(v) = self.shifts {
            opts.shifts = v;
        }
        if let Some(v) = self.seed {
            opts.seed = v;
        }
        if let Some(v) = self.format {
            opts.output_format = v;
        }
        if let Some(v) = self.model {
            opts.model_name = v;
        }
        if self.manifest_url.is_some() {
            opts.manifest_url_override = self.manifest_url;
        }
        if self.model_path.is_some() {
            opts.model_path = self.model_path;
        }
    }
}

fn handle_separate(
    input: PathBuf,
    output: PathBuf,
    vocals: Option<PathBuf>,
    config: Option<PathBuf>,
    overrides: Overrides,
    quiet: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if !input.exists() {
        return Err(format!("Input file not found: {}", input.display()).into());
    }

    let mut opts = match &config {
        Some(path) => PipelineOptions::from_json_file(path)?,
        None => PipelineOptions::default(),
    };
    overrides.apply(&mut opts);
    opts.keep_vocals = vocals.is_some();

    if !quiet {
        setup_progress_callbacks();
    }

    let separator = Separator::from_options(opts)?;
    let out = separator.remove_vocals_path(&input)?;

    fs::write(&output, out.instrumental.as_bytes())?;
    if let (Some(path), Some(v)) = (&vocals, &out.vocals) {
        fs::write(path, v.as_bytes())?;
    }

    if quiet {
        println!("{}", output.display());
        if let Some(path) = &vocals {
            println!("{}", path.display());
        }
    } else {
        eprintln!();
        eprintln!(
            "Instrumental ({:.1}s, {} Hz, {} ch): {}",
            out.duration_secs,
            out.instrumental.sample_rate(),
            out.instrumental.channels(),
            output.display()
        );
        if let Some(path) = &vocals {
            eprintln!("Vocals: {}", path.display());
        }
    }
    Ok(())
}

fn handle_toolchain() -> Result<(), Box<dyn std::error::Error>> {
    let resolver = Resolver::new(ToolchainConfig::default());
    let handle = resolve_shared(&resolver)?;
    println!("decoder: {}", handle.decoder().display());
    println!("prober:  {}", handle.prober().display());
    println!("source:  {:?}", handle.source());
    Ok(())
}

fn handle_prepare(
    model: String,
    manifest_url: Option<String>,
    quiet: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if !quiet {
        set_download_progress_callback(print_download_progress);
    }

    let handle = prepare_model(&model, manifest_url.as_deref(), None)?;
    println!("{}", handle.local_path.display());
    Ok(())
}

fn handle_list() -> Result<(), Box<dyn std::error::Error>> {
    let reg = registry()?;
    for m in &reg.models {
        let marker = if m.name == reg.default { " (default)" } else { "" };
        println!("{}{}", m.name, marker);
    }
    Ok(())
}

fn print_download_progress(downloaded: u64, total: u64) {
    if total > 0 {
        let percent = (downloaded as f64 / total as f64 * 100.0).round() as u64;
        eprint!(
            "\rDownloading model: {:>3}% ({:.2} MB / {:.2} MB)",
            percent,
            downloaded as f64 / 1_000_000.0,
            total as f64 / 1_000_000.0
        );
        if downloaded >= total {
            eprintln!();
        }
    } else {
        eprint!("\rDownloading model: {:.2} MB", downloaded as f64 / 1_000_000.0);
    }
}

fn setup_progress_callbacks() {
    set_download_progress_callback(print_download_progress);

    set_split_progress_callback(|progress| match progress {
        SplitProgress::Stage(stage) => {
            let stage_name = match stage {
                "resolve_toolchain" => "Locating ffmpeg",
                "ingest" => "Decoding input",
                "separate" => "Separating stems",
                "mix" => "Mixing instrumental",
                "package" => "Encoding WAV",
                _ => stage,
            };
            eprintln!("{}", stage_name);
        }
        SplitProgress::Chunks {
            done,
            total,
            percent,
        } => {
            eprint!("\rProcessing: {}/{} chunks ({:.0}%)", done, total, percent);
            if done >= total {
                eprintln!();
            }
        }
        SplitProgress::Finished => {}
    });
}

use clap::{Parser, Subcommand};
use entwine::builder;
use entwine::builder::merger;
use entwine::config::{self, BuildConfig, Threads};
use entwine::endpoint::Endpoints;
use entwine::manifest::Source;
use entwine::pipeline;
use entwine::tile::DataType;
use std::io;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(
    name = "entwine",
    version,
    about = "Build spatially-indexed octrees over large point clouds"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Index input files into an EPT dataset
    Build {
        /// Input files or directories
        #[arg(long, short, num_args = 1.., required = true)]
        input: Vec<String>,
        /// Output directory
        #[arg(long, short, required = true)]
        output: String,
        /// Scratch directory for temporary data
        #[arg(long)]
        tmp: Option<PathBuf>,
        /// Thread count: total, or "work,clip"
        #[arg(long, short)]
        threads: Option<String>,
        /// Insert at most this many files this run
        #[arg(long)]
        limit: Option<u64>,
        /// Overwrite an existing build instead of continuing it
        #[arg(long, short)]
        force: bool,
        /// Fully scan inputs during analysis
        #[arg(long)]
        deep: bool,
        /// Never take point counts from file headers
        #[arg(long = "no-trust-headers")]
        no_trust_headers: bool,
        /// Store coordinates absolutely (always the case; accepted for
        /// compatibility)
        #[arg(long)]
        absolute: bool,
        /// Output spatial reference for the dataset metadata
        #[arg(long, short)]
        reprojection: Option<String>,
        /// Progress interval in seconds (0 disables)
        #[arg(long)]
        progress: Option<u64>,
        /// Build one disjoint partition, e.g. "1/4"
        #[arg(long, short)]
        subset: Option<String>,
        /// Tile format: binary or zstandard
        #[arg(long)]
        data_type: Option<String>,
        /// Voxel grid size per node side (power of two)
        #[arg(long)]
        span: Option<u64>,
    },
    /// Merge subset builds into one dataset
    Merge {
        /// Output directory holding the subset builds
        #[arg(long, short, required = true)]
        output: String,
        /// Thread count
        #[arg(long, short)]
        threads: Option<String>,
        /// Overwrite a completed dataset at the output
        #[arg(long, short)]
        force: bool,
    },
    /// Analyze inputs and report their aggregate info
    Info {
        /// Input files or directories
        #[arg(long, short, num_args = 1.., required = true)]
        input: Vec<String>,
        /// Fully scan inputs
        #[arg(long)]
        deep: bool,
        /// Thread count
        #[arg(long, short)]
        threads: Option<String>,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("{e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> io::Result<()> {
    match cli.command {
        Command::Build {
            input,
            output,
            tmp,
            threads,
            limit,
            force,
            deep,
            no_trust_headers,
            absolute,
            reprojection,
            progress,
            subset,
            data_type,
            span,
        } => {
            let mut config = BuildConfig {
                input,
                output,
                tmp: tmp.map(|p| p.to_string_lossy().into_owned()),
                threads: parse_threads(threads)?,
                limit: limit.unwrap_or(0),
                force,
                deep,
                trust_headers: !no_trust_headers,
                absolute,
                reprojection,
                ..BuildConfig::default()
            };
            if let Some(progress) = progress {
                config.progress_interval = progress;
            }
            if let Some(subset) = subset {
                config.subset = Some(config::parse_subset(&subset).map_err(invalid)?);
            }
            if let Some(data_type) = data_type {
                config.data_type = parse_data_type(&data_type)?;
            }
            if let Some(span) = span {
                config.span = span;
            }

            let threads = config.threads;
            let limit = config.limit;
            let progress_interval = config.progress_interval;
            let mut builder = builder::create(config)?;
            let points = builder.run(threads, limit, progress_interval)?;
            println!("indexed {points} points");
            Ok(())
        }
        Command::Merge {
            output,
            threads,
            force,
        } => {
            let endpoints = Endpoints::new(output, None);
            merger::merge(endpoints, parse_threads(threads)?, force, true)
        }
        Command::Info {
            input,
            deep,
            threads,
        } => {
            let inputs = pipeline::resolve(&input)?;
            let threads = parse_threads(threads)?;
            let sources = pipeline::analyze(&inputs, threads.total(), deep, false);
            print_info(&sources);
            Ok(())
        }
    }
}

fn parse_threads(threads: Option<String>) -> io::Result<Threads> {
    match threads {
        Some(s) => Threads::parse(&s).map_err(invalid),
        None => Ok(Threads::default()),
    }
}

fn parse_data_type(s: &str) -> io::Result<DataType> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("unknown data type '{s}'")))
}

fn invalid(e: impl std::error::Error + Send + Sync + 'static) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, e)
}

fn print_info(sources: &[Source]) {
    let mut points = 0u64;
    let mut errors = 0usize;
    for source in sources {
        println!("{}:", source.path);
        println!("\tpoints: {}", source.info.points);
        if let Some(bounds) = source.info.bounds {
            println!(
                "\tbounds: [{}, {}, {}] - [{}, {}, {}]",
                bounds.min().x,
                bounds.min().y,
                bounds.min().z,
                bounds.max().x,
                bounds.max().y,
                bounds.max().z
            );
        }
        for error in &source.info.errors {
            println!("\terror: {error}");
        }
        points += source.info.points;
        errors += source.info.errors.len();
    }
    println!("files: {}", sources.len());
    println!("points: {points}");
    if errors > 0 {
        println!("errors: {errors}");
    }
}

//! CLI for the rrdb round-robin database engine.
//!
//! Provides commands for creating, updating, querying, and dumping rrdb
//! databases.

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use rrdb::schema::now_seconds;
use rrdb::{
    ArcDef, BackendFactory, ConsolidationFn, DsDef, DsType, Expression, FetchData,
    FileBackendFactory, LockMode, MmapBackendFactory, RrdDb, RrdDef, RrdDump,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// rrdb: fixed-size round-robin time-series database CLI.
#[derive(Parser)]
#[command(name = "rrdb", version, about)]
struct Cli {
    #[command(flatten)]
    backend: BackendArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every command that touches a database.
#[derive(Args)]
struct BackendArgs {
    /// Storage backend.
    #[arg(long, global = true, default_value = "file")]
    backend: BackendKind,

    /// Cross-process lock mode for writers.
    #[arg(long, global = true, default_value = "none")]
    lock_mode: LockModeArg,

    /// Open existing databases read-only.
    #[arg(long, global = true)]
    read_only: bool,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Create a new database.
    ///
    /// Datasources and archives come from `--definition` (JSON) or from
    /// `DS:name:TYPE:heartbeat:min:max` and `RRA:CF:xff:steps:rows` arguments.
    Create {
        /// Path of the database to create.
        path: PathBuf,

        /// JSON definition file.
        #[arg(long)]
        definition: Option<PathBuf>,

        /// Base step in seconds.
        #[arg(long, default_value = "300")]
        step: u64,

        /// Start time (seconds, `now`, or relative like `-1h`).
        #[arg(long)]
        start: Option<String>,

        /// Datasource and archive arguments.
        layout: Vec<String>,
    },

    /// Store samples given as `time:value[:value...]` (`N` = now, `U` = unknown).
    Update {
        /// Path of the database.
        path: PathBuf,

        /// One or more update strings.
        #[arg(required = true)]
        updates: Vec<String>,
    },

    /// Fetch consolidated data.
    Fetch {
        /// Path of the database.
        path: PathBuf,

        /// Consolidation function (AVERAGE, MIN, MAX, LAST).
        consolidation_fn: ConsolidationFn,

        /// Window start (seconds, `now`, or relative like `-1d`).
        #[arg(long, default_value = "-1d")]
        start: String,

        /// Window end (seconds, `now`, or relative like `-1h`).
        #[arg(long, default_value = "now")]
        end: String,

        /// Desired seconds per row.
        #[arg(long, default_value = "1")]
        resolution: u64,

        /// Only these datasources, in this order.
        #[arg(long = "ds")]
        filter: Vec<String>,

        /// Print one aggregate per datasource instead of rows.
        #[arg(long)]
        aggregate: Option<ConsolidationFn>,

        /// Expression applied to every value before aggregating, e.g. `value,8,*`.
        #[arg(long, requires = "aggregate")]
        transform: Option<String>,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Print the last update time.
    Last {
        /// Path of the database.
        path: PathBuf,
    },

    /// Display the definition and state of a database.
    Info {
        /// Path of the database.
        path: PathBuf,
    },

    /// Print a human-readable dump.
    Dump {
        /// Path of the database.
        path: PathBuf,
    },

    /// Write a JSON dump.
    Export {
        /// Path of the database.
        path: PathBuf,

        /// Output file; stdout when omitted.
        output: Option<PathBuf>,
    },

    /// Build a new database from a JSON dump.
    Import {
        /// JSON dump produced by `export`.
        dump: PathBuf,

        /// Path of the database to create.
        path: PathBuf,
    },
}

/// Storage backend selection.
#[derive(Clone, Copy, ValueEnum)]
enum BackendKind {
    /// Positional reads and writes on a plain file.
    File,
    /// Memory-mapped file.
    Mmap,
}

/// Lock mode selection.
#[derive(Clone, Copy, ValueEnum)]
enum LockModeArg {
    /// No cross-process locking.
    None,
    /// Wait until the lock is free.
    Wait,
    /// Fail if another process holds the lock.
    Fail,
}

impl From<LockModeArg> for LockMode {
    fn from(arg: LockModeArg) -> Self {
        match arg {
            LockModeArg::None => Self::NoLocks,
            LockModeArg::Wait => Self::WaitIfLocked,
            LockModeArg::Fail => Self::ExceptionIfLocked,
        }
    }
}

/// Output format for fetch results.
#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON document.
    Json,
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

impl BackendArgs {
    fn factory(&self) -> Box<dyn BackendFactory> {
        match self.backend {
            BackendKind::File => Box::new(FileBackendFactory::new()),
            BackendKind::Mmap => Box::new(MmapBackendFactory::new()),
        }
    }

    fn open(&self, path: &Path, read_only: bool) -> CliResult<RrdDb> {
        let factory = self.factory();
        let db = RrdDb::open_with_lock_mode(
            path,
            read_only || self.read_only,
            factory.as_ref(),
            self.lock_mode.into(),
        )?;
        Ok(db)
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let backend = &cli.backend;

    let result = match cli.command {
        Commands::Create {
            path,
            definition,
            step,
            start,
            layout,
        } => cmd_create(backend, path, definition.as_deref(), step, start.as_deref(), &layout),
        Commands::Update { path, updates } => cmd_update(backend, &path, &updates),
        Commands::Fetch {
            path,
            consolidation_fn,
            start,
            end,
            resolution,
            filter,
            aggregate,
            transform,
            format,
        } => cmd_fetch(
            backend,
            &path,
            &FetchArgs {
                consolidation_fn,
                start,
                end,
                resolution,
                filter,
                aggregate,
                transform,
                format,
            },
        ),
        Commands::Last { path } => cmd_last(backend, &path),
        Commands::Info { path } => cmd_info(backend, &path),
        Commands::Dump { path } => cmd_dump(backend, &path),
        Commands::Export { path, output } => cmd_export(backend, &path, output.as_deref()),
        Commands::Import { dump, path } => cmd_import(backend, &dump, path),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Implements `rrdb create`.
fn cmd_create(
    backend: &BackendArgs,
    path: PathBuf,
    definition: Option<&Path>,
    step: u64,
    start: Option<&str>,
    layout: &[String],
) -> CliResult<()> {
    let mut def = match definition {
        Some(file) => {
            let mut def = RrdDef::from_json_file(file)?;
            def.path = path;
            def
        }
        None => RrdDef::starting_now(path, step),
    };
    if let Some(start) = start {
        def.start_time = parse_time(start, now_seconds())?;
    }
    for arg in layout {
        apply_layout_arg(&mut def, arg)?;
    }

    let factory = backend.factory();
    let db = RrdDb::create_with_lock_mode(&def, factory.as_ref(), backend.lock_mode.into())?;
    println!(
        "Created {} ({} bytes, {} datasources, {} archives)",
        def.path.display(),
        def.estimated_size(),
        db.ds_count(),
        db.arc_count()
    );
    db.close()?;
    Ok(())
}

/// Adds one `DS:` or `RRA:` argument to `def`.
fn apply_layout_arg(def: &mut RrdDef, arg: &str) -> CliResult<()> {
    let fields: Vec<&str> = arg.split(':').collect();
    match fields.as_slice() {
        ["DS", name, ds_type, heartbeat, min, max] => {
            def.add_datasource(DsDef::new(
                *name,
                ds_type.parse::<DsType>()?,
                heartbeat.parse()?,
                parse_bound(min)?,
                parse_bound(max)?,
            ));
        }
        ["RRA", cf, xff, steps, rows] => {
            def.add_archive(ArcDef::new(
                cf.parse::<ConsolidationFn>()?,
                xff.parse()?,
                steps.parse()?,
                rows.parse()?,
            ));
        }
        _ => {
            return Err(format!(
                "invalid layout argument '{arg}': expected DS:name:TYPE:heartbeat:min:max or RRA:CF:xff:steps:rows"
            )
            .into());
        }
    }
    Ok(())
}

/// `U` means unbounded.
fn parse_bound(s: &str) -> CliResult<f64> {
    if s == "U" {
        Ok(f64::NAN)
    } else {
        Ok(s.parse()?)
    }
}

/// Implements `rrdb update`.
fn cmd_update(backend: &BackendArgs, path: &Path, updates: &[String]) -> CliResult<()> {
    let db = backend.open(path, false)?;
    let mut sample = db.create_sample(0);
    for update in updates {
        sample.set_and_update(update)?;
    }
    debug!(path = %path.display(), count = updates.len(), "applied updates");
    db.close()?;
    Ok(())
}

/// Parsed `fetch` options.
struct FetchArgs {
    consolidation_fn: ConsolidationFn,
    start: String,
    end: String,
    resolution: u64,
    filter: Vec<String>,
    aggregate: Option<ConsolidationFn>,
    transform: Option<String>,
    format: OutputFormat,
}

/// Implements `rrdb fetch`.
fn cmd_fetch(backend: &BackendArgs, path: &Path, args: &FetchArgs) -> CliResult<()> {
    let now = now_seconds();
    let end = parse_time(&args.end, now)?;
    let start = parse_time(&args.start, end)?;

    let db = backend.open(path, false)?;
    let mut request = db
        .create_fetch_request(args.consolidation_fn, start, end)?
        .with_resolution(args.resolution);
    if !args.filter.is_empty() {
        request = request.with_filter(args.filter.iter().cloned());
    }
    let data = request.fetch_data()?;

    match args.aggregate {
        Some(cf) => print_aggregates(&data, cf, args.transform.as_deref(), args.format)?,
        None => print_rows(&data, args.format)?,
    }
    db.close()?;
    Ok(())
}

fn print_rows(data: &FetchData, format: OutputFormat) -> CliResult<()> {
    match format {
        OutputFormat::Csv => {
            println!(
                "# consolidation_fn={}, step={}, rows={}",
                data.consolidation_fn(),
                data.step(),
                data.row_count()
            );
            println!("timestamp,{}", data.ds_names().join(","));
            for point in data.rows() {
                let values: Vec<String> = point.values.iter().map(f64::to_string).collect();
                println!("{},{}", point.timestamp, values.join(","));
            }
        }
        OutputFormat::Json => println!("{}", data.to_json()?),
    }
    Ok(())
}

fn print_aggregates(
    data: &FetchData,
    cf: ConsolidationFn,
    transform: Option<&str>,
    format: OutputFormat,
) -> CliResult<()> {
    let Some(source) = transform else {
        match format {
            OutputFormat::Csv => {
                for name in data.ds_names() {
                    println!("{name},{}", data.aggregate(name, cf)?);
                }
            }
            OutputFormat::Json => println!("{}", data.aggregates_json(cf)?),
        }
        return Ok(());
    };

    let expression = Expression::compile(source)?;
    let mut values = serde_json::Map::new();
    for name in data.ds_names() {
        let value = data.aggregate_with(name, cf, &expression)?;
        match format {
            OutputFormat::Csv => println!("{name},{value}"),
            OutputFormat::Json => {
                values.insert(name.clone(), serde_json::json!(if value.is_nan() { None } else { Some(value) }));
            }
        }
    }
    if let OutputFormat::Json = format {
        println!("{}", serde_json::to_string_pretty(&values)?);
    }
    Ok(())
}

/// Implements `rrdb last`.
fn cmd_last(backend: &BackendArgs, path: &Path) -> CliResult<()> {
    let db = backend.open(path, true)?;
    println!("{}", db.last_update_time());
    db.close()?;
    Ok(())
}

/// Implements `rrdb info`.
fn cmd_info(backend: &BackendArgs, path: &Path) -> CliResult<()> {
    let db = backend.open(path, true)?;
    let header = db.header();
    print!("{db}");
    println!("size = {} bytes", db.definition().estimated_size());

    let last = header.last_update;
    for index in 0..db.arc_count() {
        if let Some(arc) = db.archive(index) {
            let arc_step = arc.arc_step(header.step);
            println!(
                "rra[{index}]: covers {} .. {} ({})",
                arc.start_time(last, header.step),
                arc.end_time(last, header.step) + arc_step,
                format_duration_secs(arc_step * u64::from(arc.rows()))
            );
        }
    }
    db.close()?;
    Ok(())
}

/// Implements `rrdb dump`.
fn cmd_dump(backend: &BackendArgs, path: &Path) -> CliResult<()> {
    let db = backend.open(path, true)?;
    print!("{}", db.dump()?);
    db.close()?;
    Ok(())
}

/// Implements `rrdb export`.
fn cmd_export(backend: &BackendArgs, path: &Path, output: Option<&Path>) -> CliResult<()> {
    let db = backend.open(path, true)?;
    match output {
        Some(output) => db.export_json_to(output)?,
        None => println!("{}", db.export_json()?),
    }
    db.close()?;
    Ok(())
}

/// Implements `rrdb import`.
fn cmd_import(backend: &BackendArgs, dump: &Path, path: PathBuf) -> CliResult<()> {
    let dump = RrdDump::from_json_file(dump)?;
    let factory = backend.factory();
    let db = RrdDb::import(path, &dump, factory.as_ref())?;
    println!("Imported {} (last update {})", db.path().display(), db.last_update_time());
    db.close()?;
    Ok(())
}

/// Parses an absolute timestamp, `now`, or an offset like `-1h` from `reference`.
fn parse_time(s: &str, reference: u64) -> CliResult<u64> {
    let s = s.trim();
    if s == "now" {
        return Ok(now_seconds());
    }
    if let Some(offset) = s.strip_prefix('-') {
        return Ok(reference.saturating_sub(parse_duration(offset)?));
    }
    Ok(s.parse()?)
}

/// Parses a human-readable duration string (e.g., "1h", "30m", "7d") to seconds.
fn parse_duration(s: &str) -> CliResult<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Empty duration string".into());
    }

    let (num_str, unit) = s.split_at(s.len() - 1);
    let num: u64 = num_str.parse()?;

    let secs = match unit {
        "s" => num,
        "m" => num * 60,
        "h" => num * 3600,
        "d" => num * 86400,
        "w" => num * 604_800,
        _ => return Err(format!("Unknown duration unit: '{unit}'. Use s, m, h, d, or w.").into()),
    };

    Ok(secs)
}

/// Formats seconds as a human-readable duration.
fn format_duration_secs(secs: u64) -> String {
    if secs >= 86400 && secs.is_multiple_of(86400) {
        format!("{}d", secs / 86400)
    } else if secs >= 3600 && secs.is_multiple_of(3600) {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs.is_multiple_of(60) {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

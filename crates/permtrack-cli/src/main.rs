use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use chrono::Local;
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::LevelFilter;
use permtrack::document::{Metadata, StagedDocument};
use permtrack::scraper::{FetchOptions, WebScraper, save_html_backup};
use permtrack::{
    DEFAULT_DATABASE, DEFAULT_URL, Extractor, ExtractorConfig, HistoricalImport, Store,
    load_documents, read_workbook, transform_documents,
};

#[derive(Parser)]
#[command(name = "permtrack")]
#[command(about = "A PERM processing-timeline scraper and loader", long_about = None)]
struct Cli {
    #[arg(
        short = 'l',
        long = "log-level",
        value_enum,
        default_value = "info",
        global = true,
        help = "Set the logging level"
    )]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape the timeline page, or a saved copy of it, and store the extracted data
    Scrape {
        #[command(flatten)]
        input: ScrapeInput,

        #[arg(
            long,
            help = "Save to the database even when reading from a file"
        )]
        force_save: bool,

        #[command(flatten)]
        options: ScrapeOptions,
    },
    /// Load staged JSON documents into the database
    Transform {
        #[arg(
            long,
            env = "PERM_DOCUMENTS",
            help = "JSON document, JSON array, JSON lines file or directory of .json files"
        )]
        input: PathBuf,

        #[arg(long, help = "Process every document instead of only the latest")]
        all: bool,

        #[arg(long, env = "PERM_DATABASE", default_value = DEFAULT_DATABASE)]
        database: PathBuf,
    },
    /// Import historical case decisions from a spreadsheet
    Import {
        #[arg(
            long,
            help = "Workbook with CASE_STATUS, RECEIVED_DATE and DECISION_DATE columns"
        )]
        file: PathBuf,

        #[arg(long, help = "Show what would be imported without saving")]
        dry_run: bool,

        #[arg(long, env = "PERM_DATABASE", default_value = DEFAULT_DATABASE)]
        database: PathBuf,
    },
    /// Scrape the configured URL on a fixed interval until interrupted
    Schedule {
        #[arg(long, env = "PERM_URL", default_value = DEFAULT_URL, help = "Page to fetch")]
        url: String,

        #[arg(
            long,
            env = "SCHEDULER_INTERVAL_HOURS",
            default_value_t = 24,
            value_parser = clap::value_parser!(u64).range(1..),
            help = "Hours between runs"
        )]
        interval_hours: u64,

        #[command(flatten)]
        options: ScrapeOptions,
    },
}

impl Commands {
    fn debug(&self) -> bool {
        match self {
            Commands::Scrape { options, .. } | Commands::Schedule { options, .. } => options.debug,
            Commands::Transform { .. } | Commands::Import { .. } => false,
        }
    }
}

#[derive(Args, Debug, Clone)]
#[group(required = true, multiple = false)]
struct ScrapeInput {
    #[arg(long, help = "Read the page from a local HTML file")]
    file: Option<PathBuf>,

    #[arg(long, help = "Page to fetch, e.g. https://permtimeline.com")]
    url: Option<String>,
}

impl ScrapeInput {
    fn source(&self) -> Option<Source<'_>> {
        match (&self.file, &self.url) {
            (Some(path), _) => Some(Source::File(path)),
            (None, Some(url)) => Some(Source::Url(url)),
            (None, None) => None,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct ScrapeOptions {
    #[arg(
        short = 'o',
        long,
        env = "PERM_OUTPUT_FILE",
        help = "Write the extracted document to this JSON file"
    )]
    output: Option<PathBuf>,

    #[arg(long, help = "Pretty-print JSON output")]
    pretty: bool,

    #[arg(long, help = "Verbose logging and raw-text diagnostics on parse failures")]
    debug: bool,

    #[arg(long, help = "Never write to the database")]
    dry_run: bool,

    #[arg(long, default_value_t = 3, help = "Attempts for transport failures")]
    retry: u32,

    #[arg(long, default_value_t = 2.0, help = "Base delay between attempts, in seconds")]
    delay: f64,

    #[arg(long, default_value_t = 30, help = "Request timeout, in seconds")]
    timeout: u64,

    #[arg(long, help = "Override the User-Agent header")]
    user_agent: Option<String>,

    #[arg(long, help = "Keep a timestamped copy of the fetched HTML")]
    save_backup: bool,

    #[arg(long, env = "PERM_BACKUP_DIR", default_value = ".")]
    backup_dir: PathBuf,

    #[arg(
        long,
        help = "Capture raw markup around recent day labels when the daily series is missing"
    )]
    extract_raw: bool,

    #[arg(long, env = "PERM_DATABASE", default_value = DEFAULT_DATABASE)]
    database: PathBuf,
}

impl ScrapeOptions {
    fn fetch_options(&self) -> Result<FetchOptions, String> {
        let retry_delay = Duration::try_from_secs_f64(self.delay)
            .map_err(|e| format!("Invalid --delay {}: {}", self.delay, e))?;
        let defaults = FetchOptions::default();

        Ok(FetchOptions {
            timeout: Duration::from_secs(self.timeout),
            retry_count: self.retry,
            retry_delay,
            user_agent: self.user_agent.clone().unwrap_or(defaults.user_agent),
            ..defaults
        })
    }
}

enum Source<'a> {
    File(&'a Path),
    Url(&'a str),
}

async fn run_scrape(
    source: Source<'_>,
    options: &ScrapeOptions,
    force_save: bool,
) -> Result<(), String> {
    let extractor = Extractor::new(ExtractorConfig::default().with_debug(options.debug))
        .map_err(|e| format!("Error building extractor: {e}"))?;
    let run_date = Local::now().date_naive();

    let (html, metadata, persist_by_default) = match source {
        Source::File(path) => {
            log::info!("Reading HTML from {}", path.display());
            let html = fs::read_to_string(path)
                .map_err(|e| format!("Error reading {}: {}", path.display(), e))?;
            (html, Metadata::for_file(path), false)
        }
        Source::Url(url) => {
            let scraper = WebScraper::new(options.fetch_options()?, extractor.clone())
                .map_err(|e| format!("Error creating scraper: {e}"))?;
            let html = scraper
                .fetch(url)
                .await
                .map_err(|e| format!("Error fetching {url}: {e}"))?;

            if options.save_backup
                && let Err(e) = save_html_backup(&html, &options.backup_dir)
            {
                log::warn!("Failed to save HTML backup: {}", e);
            }
            (html, Metadata::for_url(url), true)
        }
    };

    let mut result = extractor.extract_on(&html, run_date);
    for diagnostic in &result.diagnostics {
        log::debug!("[{}] {}", diagnostic.stage, diagnostic.snippet);
    }
    if options.extract_raw && result.daily.is_none() {
        result.raw_daily_chunk = extractor.raw_daily_chunk(&html, run_date);
    }
    if result.is_empty() {
        log::warn!("No data extracted from the page");
    }

    let document = StagedDocument::from_extraction(&result, metadata);
    match &options.output {
        Some(path) => document
            .write(path, options.pretty)
            .map_err(|e| format!("Error writing output: {e}"))?,
        None => print_json(&document, options.pretty),
    }

    let snapshot = result.to_snapshot();
    if let Some(snapshot) = &snapshot {
        log::info!("\n{}", snapshot);
    }

    let persist = !options.dry_run && (persist_by_default || force_save);
    if !persist {
        log::info!("Skipping database save");
        return Ok(());
    }

    let Some(snapshot) = snapshot else {
        log::info!("Nothing to save");
        return Ok(());
    };
    let mut store =
        Store::open(&options.database).map_err(|e| format!("Error opening database: {e}"))?;
    store
        .save(&snapshot)
        .map_err(|e| format!("Error saving to database: {e}"))?;
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T, pretty: bool) {
    let json = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    match json {
        Ok(json) => println!("{}", json),
        Err(e) => {
            log::error!("Error serializing to JSON: {}", e);
            process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    let dotenv = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut level: LevelFilter = cli.log_level.clone().into();
    if cli.command.debug() && level < LevelFilter::Debug {
        level = LevelFilter::Debug;
    }
    env_logger::Builder::new().filter_level(level).init();

    if let Ok(path) = dotenv {
        log::debug!("Loaded environment from {}", path.display());
    }

    match cli.command {
        Commands::Scrape {
            input,
            force_save,
            options,
        } => {
            let Some(source) = input.source() else {
                log::error!("One of --file or --url is required");
                process::exit(1);
            };

            run_scrape(source, &options, force_save)
                .await
                .unwrap_or_else(|e| {
                    log::error!("{}", e);
                    process::exit(1);
                });
        }

        Commands::Transform {
            input,
            all,
            database,
        } => {
            let documents = load_documents(&input).unwrap_or_else(|e| {
                log::error!("Error loading documents: {}", e);
                process::exit(1);
            });
            if documents.is_empty() {
                log::warn!("No documents found in {}", input.display());
                return;
            }

            let mut store = Store::open(&database).unwrap_or_else(|e| {
                log::error!("Error opening database: {}", e);
                process::exit(1);
            });

            let report = transform_documents(
                &mut store,
                &documents,
                all,
                Local::now().date_naive(),
            )
            .unwrap_or_else(|e| {
                log::error!("Error transforming documents: {}", e);
                process::exit(1);
            });
            println!(
                "Processed {} document(s), skipped {} already processed",
                report.processed, report.skipped
            );
        }

        Commands::Import {
            file,
            dry_run,
            database,
        } => {
            let cases = read_workbook(&file).unwrap_or_else(|e| {
                log::error!("Error loading workbook: {}", e);
                process::exit(1);
            });
            let import = HistoricalImport::from_cases(&cases).unwrap_or_else(|e| {
                log::error!("Error processing {}: {}", file.display(), e);
                process::exit(1);
            });
            log::info!("\n{}", import);

            if dry_run {
                log::info!("Dry run, nothing saved");
                return;
            }

            let mut store = Store::open(&database).unwrap_or_else(|e| {
                log::error!("Error opening database: {}", e);
                process::exit(1);
            });
            if let Err(e) = store.save(&import.to_snapshot(Local::now().date_naive())) {
                log::error!("Error saving historical data: {}", e);
                process::exit(1);
            }
        }

        Commands::Schedule {
            url,
            interval_hours,
            options,
        } => {
            let interval = Duration::from_secs(interval_hours * 3600);
            log::info!("Scraping {} every {} hour(s)", url, interval_hours);

            loop {
                match run_scrape(Source::Url(&url), &options, false).await {
                    Ok(()) => log::info!("Scheduled run completed"),
                    Err(e) => log::error!("Scheduled run failed: {}", e),
                }

                log::info!("Next run in {} hour(s)", interval_hours);
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = tokio::signal::ctrl_c() => {
                        log::info!("Interrupted, stopping scheduler");
                        break;
                    }
                }
            }
        }
    }
}

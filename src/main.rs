//! CLI entry point for the trip confidence tool.
//!
//! Provides subcommands for judging trips at a single instant, replaying a
//! logged history tick by tick, and following live collector logs.

use anyhow::{Result, bail};
use chrono::{DateTime, Duration, Utc};
use clap::{Args, Parser, Subcommand};
use serde::de::DeserializeOwned;
use std::ffi::OsStr;
use std::path::Path;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};
use trip_confidence::{
    config::{ConfidenceConfig, RouteConfig},
    engine::{Engine, TickContext},
    fetch::{BasicClient, load_source},
    ingest::{CollectorLine, StreamBatch},
    model::PollEvent,
    output::{ConfidenceRecord, append_records, print_pretty, write_json_lines, write_json_pretty},
    parser::parse_lines_after,
    schedule::Schedule,
    summary::SummaryBuilder,
};

#[derive(Parser)]
#[command(name = "trip_confidence")]
#[command(about = "Judges how far to trust upcoming transit departures", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Where polls, the schedule and the configuration come from.
#[derive(Args, Clone, Debug)]
struct InputArgs {
    /// Prediction stream (JSON lines; path, URL, or .gz)
    #[arg(long)]
    predictions: Option<String>,

    /// Vehicle position stream
    #[arg(long)]
    vehicles: Option<String>,

    /// Poll error stream
    #[arg(long)]
    errors: Option<String>,

    /// Combined collector log, instead of the three streams
    #[arg(long, conflicts_with_all = ["predictions", "vehicles", "errors"])]
    collector_log: Option<String>,

    /// Schedule CSV with `trip_id,scheduled_departure`
    #[arg(short, long)]
    schedule: Option<String>,

    /// JSON config file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Judge every trip once, as of a single instant
    Evaluate {
        #[command(flatten)]
        input: InputArgs,

        /// Evaluation instant (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,

        /// CSV file to append records to
        #[arg(short, long)]
        output: Option<String>,

        /// Print one pretty JSON array instead of JSON lines
        #[arg(long, default_value_t = false)]
        pretty: bool,
    },
    /// Step a simulated clock through logged history and summarise
    Replay {
        #[command(flatten)]
        input: InputArgs,

        /// Seconds between simulated ticks
        #[arg(short = 't', long, default_value_t = 60)]
        tick_secs: i64,

        /// First tick; defaults to the oldest poll
        #[arg(long)]
        from: Option<DateTime<Utc>>,

        /// Last tick; defaults to the newest poll
        #[arg(long)]
        to: Option<DateTime<Utc>>,

        /// CSV file to append every tick's records to
        #[arg(short, long)]
        output: Option<String>,

        /// Print the summary as JSON on stdout
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Follow append-only logs and judge trips every polling interval
    Watch {
        #[command(flatten)]
        input: InputArgs,

        /// Seconds between ticks; defaults to the configured poll interval
        #[arg(short = 'r', long)]
        interval: Option<u64>,

        /// Number of ticks to run (0 = infinite)
        #[arg(short = 'n', long, default_value_t = 0)]
        num_ticks: usize,

        /// CSV file to append records to
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/trip_confidence.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("trip_confidence.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Evaluate {
            input,
            at,
            output,
            pretty,
        } => evaluate(&input, at.unwrap_or_else(Utc::now), output.as_deref(), pretty).await,
        Commands::Replay {
            input,
            tick_secs,
            from,
            to,
            output,
            json,
        } => replay(&input, tick_secs, from, to, output.as_deref(), json).await,
        Commands::Watch {
            input,
            interval,
            num_ticks,
            output,
        } => watch(&input, interval, num_ticks, output.as_deref()).await,
    };

    if let Err(e) = &result {
        error!(error = %e, "Run failed");
    }
    result
}

/// How many complete lines of each stream earlier reads consumed.
#[derive(Debug, Default, Clone)]
struct Offsets {
    predictions: usize,
    vehicles: usize,
    errors: usize,
    collector: usize,
}

/// Everything a run needs besides the polls themselves.
struct Setup {
    client: BasicClient,
    engine: Engine,
    schedule: Schedule,
}

async fn setup(input: &InputArgs) -> Result<Setup> {
    if input.collector_log.is_none()
        && input.predictions.is_none()
        && input.vehicles.is_none()
        && input.errors.is_none()
    {
        bail!("no input given: pass --collector-log or at least one of --predictions/--vehicles/--errors");
    }

    let config = match &input.config {
        Some(path) => ConfidenceConfig::load(path)?,
        None => {
            info!("No config file given, using untuned defaults");
            ConfidenceConfig::default()
        }
    };
    let engine = Engine::new(config)?;
    let client = BasicClient::new()?;

    let schedule = match &input.schedule {
        Some(source) => Schedule::from_csv(&load_source(&client, source).await?)?,
        None => {
            warn!("No schedule given; escalation falls back to predicted departures");
            Schedule::default()
        }
    };
    info!(
        route = %engine.config().route.route_id,
        direction = engine.config().route.direction_id,
        scheduled_trips = schedule.len(),
        rules = engine.config().rules.len(),
        "Setup complete"
    );

    Ok(Setup {
        client,
        engine,
        schedule,
    })
}

/// Reads the lines of `source` not yet consumed and advances `offset`.
async fn read_stream<T: DeserializeOwned>(
    client: &BasicClient,
    source: Option<&str>,
    offset: &mut usize,
) -> Result<Vec<T>> {
    let Some(source) = source else {
        return Ok(Vec::new());
    };
    let bytes = load_source(client, source).await?;

    let mut parsed = parse_lines_after::<T>(&bytes, *offset)?;
    if parsed.complete_lines < *offset {
        warn!(source, offset = *offset, "Log shrank, reading it again from the start");
        parsed = parse_lines_after::<T>(&bytes, 0)?;
    }
    if parsed.skipped > 0 {
        warn!(source, skipped = parsed.skipped, "Malformed lines skipped");
    }
    debug!(source, records = parsed.records.len(), "Stream read");

    *offset = parsed.complete_lines;
    Ok(parsed.records)
}

/// Reads new polls from whichever layout the input names, oldest first.
async fn read_events(
    client: &BasicClient,
    input: &InputArgs,
    route: &RouteConfig,
    offsets: &mut Offsets,
) -> Result<Vec<PollEvent>> {
    // committed only once every stream was read
    let mut read = offsets.clone();
    let mut events = if let Some(log) = &input.collector_log {
        read_stream::<CollectorLine>(client, Some(log.as_str()), &mut read.collector)
            .await?
            .into_iter()
            .map(|line| line.into_event(route))
            .collect()
    } else {
        let batch = StreamBatch {
            predictions: read_stream(client, input.predictions.as_deref(), &mut read.predictions)
                .await?,
            vehicles: read_stream(client, input.vehicles.as_deref(), &mut read.vehicles).await?,
            errors: read_stream(client, input.errors.as_deref(), &mut read.errors).await?,
        };
        if batch.is_empty() {
            debug!("No new stream records");
            Vec::new()
        } else {
            batch.into_events(route)
        }
    };
    events.sort_by_key(|e| e.poll_timestamp);
    *offsets = read;
    Ok(events)
}

fn emit(records: &[ConfidenceRecord], output: Option<&str>, pretty: bool) -> Result<()> {
    print_pretty(records);
    let stdout = std::io::stdout().lock();
    if pretty {
        write_json_pretty(stdout, records)?;
    } else {
        write_json_lines(stdout, records)?;
    }
    if let Some(path) = output {
        append_records(path, records)?;
    }
    Ok(())
}

#[tracing::instrument(skip(input, output))]
async fn evaluate(
    input: &InputArgs,
    at: DateTime<Utc>,
    output: Option<&str>,
    pretty: bool,
) -> Result<()> {
    let setup = setup(input).await?;
    let route = setup.engine.config().route.clone();
    let events = read_events(&setup.client, input, &route, &mut Offsets::default()).await?;

    let mut ctx = TickContext::new(setup.schedule);
    let report = setup.engine.tick(&mut ctx, &events, at)?;
    emit(&report.evaluation.records, output, pretty)
}

#[tracing::instrument(skip(input, output))]
async fn replay(
    input: &InputArgs,
    tick_secs: i64,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    output: Option<&str>,
    json: bool,
) -> Result<()> {
    if tick_secs <= 0 {
        bail!("--tick-secs must be positive");
    }
    let setup = setup(input).await?;
    let route = setup.engine.config().route.clone();
    let events = read_events(&setup.client, input, &route, &mut Offsets::default()).await?;

    let (Some(first), Some(last)) = (events.first(), events.last()) else {
        warn!("No polls to replay");
        return Ok(());
    };
    let start = from.unwrap_or(first.poll_timestamp);
    let end = to.unwrap_or(last.poll_timestamp);
    info!(start = %start, end = %end, polls = events.len(), "Starting replay");

    let mut ctx = TickContext::new(setup.schedule);
    let mut summary = SummaryBuilder::new();
    let mut next = 0;
    let mut now = start;

    while now <= end {
        let due = events[next..].partition_point(|e| e.poll_timestamp <= now);
        let report = setup
            .engine
            .tick(&mut ctx, &events[next..next + due], now)?;
        next += due;

        summary.add_tick(now, &report.evaluation.records);
        if let Some(path) = output {
            append_records(path, &report.evaluation.records)?;
        }
        now += Duration::seconds(tick_secs);
    }

    let summary = summary.finish();
    summary.log();
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    Ok(())
}

#[tracing::instrument(skip(input, output))]
async fn watch(
    input: &InputArgs,
    interval: Option<u64>,
    num_ticks: usize,
    output: Option<&str>,
) -> Result<()> {
    let setup = setup(input).await?;
    let route = setup.engine.config().route.clone();
    let interval = interval.unwrap_or(route.poll_interval_secs);

    if num_ticks == 0 {
        info!(interval, "Watching infinitely. Press Ctrl+C to stop.");
    } else {
        info!(num_ticks, interval, "Starting watch");
    }

    let mut ctx = TickContext::new(setup.schedule);
    let mut offsets = Offsets::default();
    let mut pending: Vec<PollEvent> = Vec::new();
    let mut tick_count = 0;

    loop {
        if num_ticks > 0 && tick_count >= num_ticks {
            break;
        }
        tick_count += 1;

        match read_events(&setup.client, input, &route, &mut offsets).await {
            Ok(events) => pending.extend(events),
            // the next tick re-reads from the same offsets
            Err(e) => error!(error = %e, "Failed to read logs"),
        }

        let now = Utc::now();
        let report = setup.engine.tick(&mut ctx, &pending, now)?;
        pending.retain(|e| e.poll_timestamp > now);
        emit(&report.evaluation.records, output, false)?;

        if num_ticks == 0 || tick_count < num_ticks {
            debug!(interval, "Waiting before next tick");
            tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;
        }
    }

    info!(ticks = tick_count, "Watch finished");
    Ok(())
}

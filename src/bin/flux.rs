//! Flux CLI - Command-line interface for Mobility Flux
//!
//! Commands:
//! - transform: Fuse a file of raw events into snapshots (batch mode)
//! - run: Fuse a stream of raw events from stdin (streaming mode)
//! - validate: Report raw events the normalizer would reject
//! - doctor: Diagnose configuration and environment
//! - schema: Print input and output schema information

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mobility_flux::normalizer::Normalizer;
use mobility_flux::schema::{RawEvent, RawEventAdapter, SCHEMA_VERSION};
use mobility_flux::{
    FluxEngine, FluxProcessor, FusionConfig, FusionError, LatePolicy, NdjsonConsumer,
    SnapshotEncoder, FLUX_VERSION, PRODUCER_NAME, SNAPSHOT_SCHEMA_VERSION,
};

/// Flux - Streaming multi-modal fusion engine for urban mobility
#[derive(Parser)]
#[command(name = "flux")]
#[command(version = FLUX_VERSION)]
#[command(about = "Fuse GPS, CDR and probe signals into entity trajectories", long_about = None)]
struct Cli {
    /// Configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fuse raw events from a file (batch mode)
    Transform {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Output file path (use - for stdout)
        #[arg(short, long)]
        output: PathBuf,

        /// Input format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,

        /// Output format
        #[arg(long, default_value = "ndjson")]
        output_format: OutputFormat,

        #[command(flatten)]
        window: WindowArgs,
    },

    /// Fuse raw events streamed on stdin (streaming mode)
    Run {
        #[command(flatten)]
        window: WindowArgs,

        /// Print final metrics to stderr as JSON
        #[arg(long)]
        metrics: bool,
    },

    /// Validate raw events against the normalizer
    Validate {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Input format
        #[arg(long, default_value = "ndjson")]
        input_format: InputFormat,

        /// Output validation report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Diagnose configuration and environment
    Doctor {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print schema information
    Schema {
        /// Schema to print (input or output)
        #[arg(value_enum)]
        schema_type: SchemaType,

        /// Output as JSON schema
        #[arg(long)]
        json_schema: bool,
    },
}

/// Overrides for the most commonly tuned window settings
#[derive(Args, Clone)]
struct WindowArgs {
    /// Window size in seconds
    #[arg(long)]
    window_secs: Option<i64>,

    /// Allowed lateness in seconds
    #[arg(long)]
    lateness_secs: Option<i64>,

    /// Late evidence policy (drop or reopen)
    #[arg(long)]
    late_policy: Option<LatePolicy>,
}

#[derive(Clone, ValueEnum)]
enum InputFormat {
    /// Newline-delimited JSON (one event per line)
    Ndjson,
    /// JSON array of events
    Json,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Newline-delimited JSON (one snapshot envelope per line)
    Ndjson,
    /// JSON array of snapshot envelopes
    Json,
    /// Pretty-printed JSON
    JsonPretty,
}

#[derive(Clone, ValueEnum)]
enum SchemaType {
    /// Input schema (mobility.raw_event.v1)
    Input,
    /// Output schema (mobility.fused_snapshot.v1)
    Output,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn run(cli: Cli) -> Result<(), FluxCliError> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Transform {
            input,
            output,
            input_format,
            output_format,
            window,
        } => {
            let config = load_config(config_path, &window)?;
            cmd_transform(&input, &output, input_format, output_format, config)
        }

        Commands::Run { window, metrics } => {
            let config = load_config(config_path, &window)?;
            cmd_run(config, metrics)
        }

        Commands::Validate {
            input,
            input_format,
            json,
        } => {
            let config = load_config(config_path, &WindowArgs::none())?;
            cmd_validate(&input, input_format, json, config)
        }

        Commands::Doctor { json } => cmd_doctor(config_path, json),

        Commands::Schema {
            schema_type,
            json_schema,
        } => cmd_schema(schema_type, json_schema),
    }
}

impl WindowArgs {
    fn none() -> Self {
        Self {
            window_secs: None,
            lateness_secs: None,
            late_policy: None,
        }
    }

    fn apply(&self, config: &mut FusionConfig) {
        if let Some(secs) = self.window_secs {
            config.window.window_size_secs = secs;
        }
        if let Some(secs) = self.lateness_secs {
            config.window.allowed_lateness_secs = secs;
        }
        if let Some(policy) = self.late_policy {
            config.window.late_policy = policy;
        }
    }
}

fn load_config(path: Option<&Path>, window: &WindowArgs) -> Result<FusionConfig, FluxCliError> {
    let mut config = match path {
        Some(path) => {
            let json = fs::read_to_string(path)?;
            serde_json::from_str::<FusionConfig>(&json)?
        }
        None => FusionConfig::default(),
    };
    window.apply(&mut config);
    config.validate()?;
    Ok(config)
}

fn read_input(input: &Path) -> Result<String, FluxCliError> {
    if input.to_string_lossy() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    } else {
        Ok(fs::read_to_string(input)?)
    }
}

fn parse_events(data: &str, format: &InputFormat) -> Result<Vec<RawEvent>, FluxCliError> {
    Ok(match format {
        InputFormat::Ndjson => RawEventAdapter::parse_ndjson(data)?,
        InputFormat::Json => RawEventAdapter::parse_array(data)?,
    })
}

fn cmd_transform(
    input: &Path,
    output: &Path,
    input_format: InputFormat,
    output_format: OutputFormat,
    config: FusionConfig,
) -> Result<(), FluxCliError> {
    let events = parse_events(&read_input(input)?, &input_format)?;
    if events.is_empty() {
        return Err(FluxCliError::NoEvents);
    }

    let mut processor = FluxProcessor::new(config)?;
    let mut snapshots = Vec::new();
    for (index, event) in events.iter().enumerate() {
        match processor.process(event) {
            Ok(mut fused) => snapshots.append(&mut fused),
            Err(e @ FusionError::MalformedEvidence { .. }) => {
                warn!(index, error = %e, "Skipping malformed event");
            }
            Err(e) => return Err(e.into()),
        }
    }
    snapshots.append(&mut processor.finish());

    let metrics = processor.metrics();
    info!(
        events = events.len(),
        malformed = metrics.malformed_rejected,
        snapshots = snapshots.len(),
        late_dropped = metrics.late_dropped,
        "Transform complete"
    );
    if snapshots.is_empty() {
        return Err(FluxCliError::NoSnapshots);
    }

    let encoder = SnapshotEncoder::new();
    let output_data = match output_format {
        OutputFormat::Ndjson => {
            let mut lines = Vec::with_capacity(snapshots.len());
            for snapshot in &snapshots {
                lines.push(encoder.encode_to_json(snapshot)?);
            }
            lines.join("\n") + "\n"
        }
        OutputFormat::Json => {
            let envelopes: Vec<_> = snapshots.iter().map(|s| encoder.encode(s)).collect();
            serde_json::to_string(&envelopes)?
        }
        OutputFormat::JsonPretty => {
            let envelopes: Vec<_> = snapshots.iter().map(|s| encoder.encode(s)).collect();
            serde_json::to_string_pretty(&envelopes)?
        }
    };

    if output.to_string_lossy() == "-" {
        print!("{}", output_data);
    } else {
        fs::write(output, output_data)?;
    }

    Ok(())
}

fn cmd_run(config: FusionConfig, print_metrics: bool) -> Result<(), FluxCliError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let engine = FluxEngine::start(config)?;
        engine
            .register_consumer(
                "stdout",
                Arc::new(NdjsonConsumer::new(io::stdout(), SnapshotEncoder::new())),
            )
            .await;

        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let stream_error = submit_lines(&engine, stdin).await;

        // Flush open windows even when the stream ended on an error.
        let metrics = engine.shutdown().await;
        if print_metrics {
            eprintln!("{}", serde_json::to_string(&metrics)?);
        }
        match stream_error {
            Some(e) => Err(e),
            None => Ok::<(), FluxCliError>(()),
        }
    })
}

/// Submit every NDJSON line of `reader`, skipping bad records.
///
/// Returns the error that ended the stream early, if any.
async fn submit_lines<R>(engine: &FluxEngine, reader: R) -> Option<FluxCliError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_num = 0usize;
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return None,
            Err(e) => return Some(FluxCliError::Io(e)),
        };
        line_num += 1;
        let event = match RawEventAdapter::parse_line(&line) {
            None => continue,
            Some(Ok(event)) => event,
            Some(Err(e)) => {
                warn!(line = line_num, error = %e, "Skipping unparseable line");
                continue;
            }
        };
        match engine.submit(event).await {
            Ok(()) => {}
            Err(e @ FusionError::MalformedEvidence { .. }) => {
                warn!(line = line_num, error = %e, "Skipping malformed event");
            }
            Err(e) => return Some(e.into()),
        }
    }
}

fn cmd_validate(
    input: &Path,
    input_format: InputFormat,
    json: bool,
    config: FusionConfig,
) -> Result<(), FluxCliError> {
    let events = parse_events(&read_input(input)?, &input_format)?;
    let normalizer = Normalizer::new(config.normalizer);
    let results = RawEventAdapter::validate_events(&events, &normalizer, Utc::now());

    let report = ValidationReport {
        total_events: events.len(),
        valid_events: events.len() - results.len(),
        invalid_events: results.len(),
        errors: results
            .iter()
            .map(|r| ValidationErrorDetail {
                index: r.index,
                event_id: r.event_id.clone(),
                modality: r.modality.clone(),
                error: r.error.clone(),
            })
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Validation Report");
        println!("=================");
        println!("Total events:   {}", report.total_events);
        println!("Valid events:   {}", report.valid_events);
        println!("Invalid events: {}", report.invalid_events);

        if !report.errors.is_empty() {
            println!("\nErrors:");
            for err in &report.errors {
                println!(
                    "  - {} event {} (index {}): {}",
                    err.modality,
                    err.event_id.as_deref().unwrap_or("unknown"),
                    err.index,
                    err.error
                );
            }
        }
    }

    if report.invalid_events > 0 {
        Err(FluxCliError::ValidationFailed(report.invalid_events))
    } else {
        Ok(())
    }
}

fn cmd_doctor(config_path: Option<&Path>, json: bool) -> Result<(), FluxCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck {
        name: "flux_version".to_string(),
        status: CheckStatus::Ok,
        message: format!("Flux version {}", FLUX_VERSION),
    });

    checks.push(DoctorCheck {
        name: "schema_version".to_string(),
        status: CheckStatus::Ok,
        message: format!("Input schema: {}, output schema: {}", SCHEMA_VERSION, SNAPSHOT_SCHEMA_VERSION),
    });

    let config = match config_path {
        Some(path) if !path.exists() => {
            checks.push(DoctorCheck {
                name: "config".to_string(),
                status: CheckStatus::Error,
                message: format!("Config file {} does not exist", path.display()),
            });
            None
        }
        Some(path) => match FusionConfig::from_file(path) {
            Ok(config) => {
                checks.push(DoctorCheck {
                    name: "config".to_string(),
                    status: CheckStatus::Ok,
                    message: format!("Config file {} is valid", path.display()),
                });
                Some(config)
            }
            Err(e) => {
                checks.push(DoctorCheck {
                    name: "config".to_string(),
                    status: CheckStatus::Error,
                    message: e.to_string(),
                });
                None
            }
        },
        None => {
            checks.push(DoctorCheck {
                name: "config".to_string(),
                status: CheckStatus::Ok,
                message: "No config file, using defaults".to_string(),
            });
            Some(FusionConfig::default())
        }
    };

    if let Some(config) = &config {
        let anchors = config.normalizer.anchors.len();
        checks.push(DoctorCheck {
            name: "anchors".to_string(),
            status: if anchors == 0 {
                CheckStatus::Warning
            } else {
                CheckStatus::Ok
            },
            message: if anchors == 0 {
                "No anchors registered; CDR and probe records need inline coordinates".to_string()
            } else {
                format!("{} anchors registered", anchors)
            },
        });

        checks.push(DoctorCheck {
            name: "window".to_string(),
            status: CheckStatus::Ok,
            message: format!(
                "{}s windows, {}s lateness, late policy {:?}",
                config.window.window_size_secs,
                config.window.allowed_lateness_secs,
                config.window.late_policy
            ),
        });

        checks.push(DoctorCheck {
            name: "runtime".to_string(),
            status: CheckStatus::Ok,
            message: format!(
                "{} resolver shards, {} fusion workers",
                config.runtime.resolver_shards, config.runtime.fusion_workers
            ),
        });
    }

    let stdin_check = if atty::is(atty::Stream::Stdin) {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a TTY (interactive mode)".to_string(),
        }
    } else {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a pipe (streaming mode ready)".to_string(),
        }
    };
    checks.push(stdin_check);

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: FLUX_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Flux Doctor Report");
        println!("==================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");

        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report
        .checks
        .iter()
        .any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(FluxCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

fn cmd_schema(schema_type: SchemaType, json_schema: bool) -> Result<(), FluxCliError> {
    match schema_type {
        SchemaType::Input => {
            if json_schema {
                println!("{}", get_input_json_schema());
            } else {
                println!("Input Schema: {}", SCHEMA_VERSION);
                println!();
                println!("One JSON object per line, tagged by \"modality\":");
                println!();
                println!("1. gps - Device positioning fixes");
                println!("   - device_id, timestamp, lat/latitude, lon/longitude");
                println!("   - optional accuracy_m, speed_kmph");
                println!();
                println!("2. cdr - Call-detail records");
                println!("   - subscriber_id (or user_id), timestamp");
                println!("   - tower_id resolved through the anchor registry, or tower_lat/tower_lon");
                println!("   - optional signal_dbm, sector_azimuth_deg, event_type");
                println!();
                println!("3. probe - Wireless probe-request sightings");
                println!("   - device_hash, timestamp");
                println!("   - sensor_id resolved through the anchor registry, or sensor_lat/sensor_lon");
                println!("   - optional rssi_dbm");
            }
        }
        SchemaType::Output => {
            if json_schema {
                println!("{}", get_output_json_schema());
            } else {
                println!("Output Schema: {}", SNAPSHOT_SCHEMA_VERSION);
                println!();
                println!("Each record contains:");
                println!();
                println!("- schema_version");
                println!("- producer: {{ name, version, instance_id }}");
                println!("- encoded_at_utc");
                println!("- quality: {{ freshness_sec, confidence, modality_count, evidence_count }}");
                println!("- snapshot:");
                println!("  - entity_id, window_start, window_end");
                println!("  - fused_location: {{ lat, lon }}, location_uncertainty_m");
                println!("  - contributing_modalities, evidence_count, entity_confidence");
                println!("  - kind (initial or correction), revision, generated_at");
            }
        }
    }

    Ok(())
}

fn get_input_json_schema() -> String {
    let timestamp = serde_json::json!({ "type": "string", "format": "date-time" });
    serde_json::json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "title": SCHEMA_VERSION,
        "description": "Mobility raw event schema",
        "oneOf": [
            {
                "type": "object",
                "required": ["modality", "device_id", "timestamp"],
                "properties": {
                    "modality": { "const": "gps" },
                    "event_id": { "type": "string" },
                    "device_id": { "type": "string" },
                    "timestamp": timestamp,
                    "lat": { "type": "number", "minimum": -90, "maximum": 90 },
                    "lon": { "type": "number", "minimum": -180, "maximum": 180 },
                    "accuracy_m": { "type": "number", "exclusiveMinimum": 0 },
                    "speed_kmph": { "type": "number" }
                }
            },
            {
                "type": "object",
                "required": ["modality", "subscriber_id", "timestamp"],
                "properties": {
                    "modality": { "const": "cdr" },
                    "event_id": { "type": "string" },
                    "subscriber_id": { "type": "string" },
                    "timestamp": timestamp,
                    "tower_id": { "type": "string" },
                    "tower_lat": { "type": "number" },
                    "tower_lon": { "type": "number" },
                    "signal_dbm": { "type": "number" },
                    "sector_azimuth_deg": { "type": "number" },
                    "event_type": { "type": "string" }
                }
            },
            {
                "type": "object",
                "required": ["modality", "device_hash", "timestamp"],
                "properties": {
                    "modality": { "const": "probe" },
                    "event_id": { "type": "string" },
                    "device_hash": { "type": "string" },
                    "timestamp": timestamp,
                    "sensor_id": { "type": "string" },
                    "sensor_lat": { "type": "number" },
                    "sensor_lon": { "type": "number" },
                    "rssi_dbm": { "type": "number" }
                }
            }
        ]
    })
    .to_string()
}

fn get_output_json_schema() -> String {
    serde_json::json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "title": SNAPSHOT_SCHEMA_VERSION,
        "description": "Mobility fused snapshot envelope",
        "type": "object",
        "required": ["schema_version", "producer", "encoded_at_utc", "quality", "snapshot"],
        "properties": {
            "schema_version": { "type": "string", "const": SNAPSHOT_SCHEMA_VERSION },
            "producer": {
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "version": { "type": "string" },
                    "instance_id": { "type": "string" }
                }
            },
            "encoded_at_utc": { "type": "string", "format": "date-time" },
            "quality": {
                "type": "object",
                "properties": {
                    "freshness_sec": { "type": "integer" },
                    "confidence": { "type": "number" },
                    "modality_count": { "type": "integer" },
                    "evidence_count": { "type": "integer" }
                }
            },
            "snapshot": {
                "type": "object",
                "required": [
                    "entity_id", "window_start", "window_end", "fused_location",
                    "location_uncertainty_m", "contributing_modalities", "evidence_count",
                    "entity_confidence", "kind", "revision", "generated_at"
                ],
                "properties": {
                    "entity_id": { "type": "string", "format": "uuid" },
                    "window_start": { "type": "string", "format": "date-time" },
                    "window_end": { "type": "string", "format": "date-time" },
                    "fused_location": {
                        "type": "object",
                        "properties": {
                            "lat": { "type": "number" },
                            "lon": { "type": "number" }
                        }
                    },
                    "location_uncertainty_m": { "type": "number" },
                    "contributing_modalities": {
                        "type": "array",
                        "items": { "type": "string", "enum": ["gps", "cdr", "probe"] }
                    },
                    "evidence_count": { "type": "integer" },
                    "entity_confidence": { "type": "number" },
                    "kind": { "type": "string", "enum": ["initial", "correction"] },
                    "revision": { "type": "integer" },
                    "generated_at": { "type": "string", "format": "date-time" }
                }
            }
        }
    })
    .to_string()
}

// Error types

#[derive(Debug)]
enum FluxCliError {
    Io(io::Error),
    Fusion(FusionError),
    Json(serde_json::Error),
    NoEvents,
    NoSnapshots,
    ValidationFailed(usize),
    DoctorFailed,
}

impl From<io::Error> for FluxCliError {
    fn from(e: io::Error) -> Self {
        FluxCliError::Io(e)
    }
}

impl From<FusionError> for FluxCliError {
    fn from(e: FusionError) -> Self {
        FluxCliError::Fusion(e)
    }
}

impl From<serde_json::Error> for FluxCliError {
    fn from(e: serde_json::Error) -> Self {
        FluxCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<FluxCliError> for CliError {
    fn from(e: FluxCliError) -> Self {
        match e {
            FluxCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            FluxCliError::Fusion(e) => {
                let (code, hint) = match &e {
                    FusionError::InvalidConfig(_) => {
                        ("CONFIG_ERROR", "Run 'flux doctor --config <file>' for details")
                    }
                    FusionError::ParseError(_) | FusionError::JsonError(_) => (
                        "PARSE_ERROR",
                        "Ensure input matches the mobility.raw_event.v1 schema",
                    ),
                    FusionError::MalformedEvidence { .. } => {
                        ("MALFORMED_EVIDENCE", "Run 'flux validate' for details")
                    }
                    _ => ("FUSION_ERROR", "Re-run with --verbose for details"),
                };
                CliError {
                    code: code.to_string(),
                    message: e.to_string(),
                    hint: Some(hint.to_string()),
                }
            }
            FluxCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            FluxCliError::NoEvents => CliError {
                code: "NO_EVENTS".to_string(),
                message: "No events found in input".to_string(),
                hint: Some("Ensure input file is not empty".to_string()),
            },
            FluxCliError::NoSnapshots => CliError {
                code: "NO_SNAPSHOTS".to_string(),
                message: "No snapshots were produced".to_string(),
                hint: Some("Run 'flux validate' to check for rejected events".to_string()),
            },
            FluxCliError::ValidationFailed(count) => CliError {
                code: "VALIDATION_FAILED".to_string(),
                message: format!("{} events failed validation", count),
                hint: Some("Fix validation errors and retry".to_string()),
            },
            FluxCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct ValidationReport {
    total_events: usize,
    valid_events: usize,
    invalid_events: usize,
    errors: Vec<ValidationErrorDetail>,
}

#[derive(serde::Serialize)]
struct ValidationErrorDetail {
    index: usize,
    event_id: Option<String>,
    modality: String,
    error: String,
}

#[derive(serde::Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(serde::Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}

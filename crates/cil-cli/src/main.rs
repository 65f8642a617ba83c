use anyhow::{bail, Context, Result};
use cil_core::worksheet_contracts::{
    Batch, CriterionAxis, FilterColumn, Grouping, GroupingMode, ResetScope,
};
use cil_core::RECORD_COLUMNS;
use cil_storage::dashboard::ReportFilter;
use cil_storage::RecordStore;
use cil_worksheets::{GenerationOutcome, GenerationRequest, WorksheetConfig, WorksheetEngine};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cil")]
#[command(about = "Field-inspection work-sheet engine", long_about = None)]
struct Cli {
    /// SQLite database holding the current snapshot
    #[arg(long, env = "CIL_DB", default_value = "cil.db", global = true)]
    db: PathBuf,
    /// TOML file with engine settings
    #[arg(long, env = "CIL_CONFIG", global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replace the stored snapshot with a CSV export, keeping claims
    Import { path: PathBuf },
    /// Partition eligible records into work sheets and claim them
    Generate {
        /// PT, LOCALIDADE or AVULSO
        #[arg(long, default_value = "PT")]
        mode: String,
        /// Zone or locality for PT / LOCALIDADE
        #[arg(long)]
        value: Option<String>,
        /// Identifier for AVULSO; repeatable
        #[arg(long = "cil")]
        cils: Vec<String>,
        /// File of identifiers for AVULSO, separated by newlines, commas or semicolons
        #[arg(long)]
        cils_file: Option<PathBuf>,
        #[arg(long)]
        max_batches: Option<usize>,
        #[arg(long)]
        groups_per_batch: Option<usize>,
        #[arg(long)]
        criterion_axis: Option<String>,
        #[arg(long)]
        criterion_value: Option<String>,
        /// Directory receiving folha_<n>.csv
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
    /// Clear claims for a zone, a locality or everything
    Reset {
        /// pt, localidade or avulso
        scope: String,
        value: Option<String>,
        /// Required; a reset cannot be undone
        #[arg(long)]
        yes: bool,
    },
    /// Distinct values of a filter column
    Values { column: String },
    /// Dashboard aggregates as JSON
    Stats {
        /// Also print the distribution over this criterion axis
        #[arg(long)]
        axis: Option<String>,
        #[arg(long)]
        axis_value: Option<String>,
    },
    /// Detailed report as CSV on stdout
    Report {
        #[arg(long)]
        criterio: Option<String>,
        #[arg(long)]
        pt: Option<String>,
        #[arg(long)]
        localidade: Option<String>,
        #[arg(long)]
        estado: Option<String>,
    },
}

#[derive(Serialize)]
struct GenerateSummary {
    status: &'static str,
    batches: Vec<BatchSummary>,
    rows_claimed: usize,
    nibs_claimed: usize,
    unmatched_identifiers: Vec<String>,
}

#[derive(Serialize)]
struct BatchSummary {
    folha: usize,
    nibs: usize,
    records: usize,
    file: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => WorksheetConfig::default(),
    };
    debug!(event = "cli_start", db = %cli.db.display());

    let store = RecordStore::open_with_busy_timeout(&cli.db, config.busy_timeout())
        .with_context(|| format!("Failed to open database {}", cli.db.display()))?;

    match cli.command {
        Commands::Import { path } => {
            let bytes =
                fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
            let mut engine = WorksheetEngine::new(store, config);
            let report = engine.import_snapshot(&bytes)?;
            print_json(&serde_json::json!({
                "rows_loaded": report.rows_loaded,
                "skipped_rows": report.skipped_rows,
                "preserved_claims": report.preserved_claims,
                "delimiter": char::from(report.delimiter).to_string(),
            }))?;
        }
        Commands::Generate {
            mode,
            value,
            cils,
            cils_file,
            max_batches,
            groups_per_batch,
            criterion_axis,
            criterion_value,
            out_dir,
        } => {
            let mut identifiers = cils;
            if let Some(path) = &cils_file {
                let content = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                identifiers.extend(parse_identifier_list(&content));
            }
            let grouping = build_grouping(&mode, value, identifiers)?;

            let mut limits = config.default_limits();
            if let Some(max_batches) = max_batches {
                limits.max_batches = max_batches;
            }
            if let Some(groups_per_batch) = groups_per_batch {
                limits.groups_per_batch = groups_per_batch;
            }

            let request = GenerationRequest::from_operator_input(
                grouping,
                limits,
                criterion_axis.as_deref(),
                criterion_value.as_deref(),
            )?;
            let mut engine = WorksheetEngine::new(store, config);
            let outcome = engine.generate_batches(&request)?;

            let status = match outcome {
                GenerationOutcome::Generated(_) => "generated",
                GenerationOutcome::NothingEligible { .. } => "nothing_eligible",
            };
            let mut batches = Vec::new();
            if !outcome.batches().is_empty() {
                fs::create_dir_all(&out_dir)
                    .with_context(|| format!("Failed to create {}", out_dir.display()))?;
            }
            for batch in outcome.batches() {
                let file = write_batch_csv(&out_dir, batch)?;
                batches.push(BatchSummary {
                    folha: batch.number,
                    nibs: batch.group_count(),
                    records: batch.records.len(),
                    file,
                });
            }

            print_json(&GenerateSummary {
                status,
                batches,
                rows_claimed: outcome.rows_claimed(),
                nibs_claimed: outcome.nibs_claimed(),
                unmatched_identifiers: outcome.unmatched_identifiers().to_vec(),
            })?;
        }
        Commands::Reset { scope, value, yes } => {
            let scope = ResetScope::parse(&scope, value.as_deref())?;
            if !yes {
                bail!(
                    "Refusing to reset {} claims without --yes",
                    scope.as_str().to_lowercase()
                );
            }
            let mut engine = WorksheetEngine::new(store, config);
            let affected = engine.reset_claims(&scope)?;
            print_json(&serde_json::json!({
                "scope": scope,
                "affected": affected,
            }))?;
        }
        Commands::Values { column } => {
            let column = column.parse::<FilterColumn>()?;
            print_json(&store.distinct_values(column)?)?;
        }
        Commands::Stats { axis, axis_value } => {
            let general = store.general_stats()?;
            let metrics = store.operational_metrics()?;
            let distribution = match axis {
                Some(axis) => {
                    let axis = axis.parse::<CriterionAxis>()?;
                    Some(store.criterion_distribution(axis, axis_value.as_deref())?)
                }
                None => None,
            };
            print_json(&serde_json::json!({
                "general": general,
                "operational": metrics,
                "distribution": distribution,
            }))?;
        }
        Commands::Report {
            criterio,
            pt,
            localidade,
            estado,
        } => {
            let rows = store.detailed_report(&ReportFilter {
                criterio,
                pt,
                localidade,
                estado,
            })?;
            let mut writer = csv::Writer::from_writer(std::io::stdout());
            for row in &rows {
                writer.serialize(row)?;
            }
            writer.flush()?;
        }
    }

    Ok(())
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("CIL_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn load_config(path: &Path) -> Result<WorksheetConfig> {
    if !path.exists() {
        return Ok(WorksheetConfig::default());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("Failed to parse config {}", path.display()))
}

fn build_grouping(mode: &str, value: Option<String>, identifiers: Vec<String>) -> Result<Grouping> {
    let grouping = match mode.parse::<GroupingMode>()? {
        GroupingMode::ByPt => Grouping::Pt(value.context("--value is required for PT")?),
        GroupingMode::ByLocalidade => {
            Grouping::Localidade(value.context("--value is required for LOCALIDADE")?)
        }
        GroupingMode::ByExplicitList => Grouping::ExplicitList(identifiers),
    };
    Ok(grouping)
}

fn parse_identifier_list(content: &str) -> Vec<String> {
    content
        .split(|ch: char| ch == '\n' || ch == '\r' || ch == ',' || ch == ';')
        .map(str::trim)
        .filter(|identifier| !identifier.is_empty())
        .map(str::to_string)
        .collect()
}

fn write_batch_csv(out_dir: &Path, batch: &Batch) -> Result<PathBuf> {
    let path = out_dir.join(format!("folha_{}.csv", batch.number));
    let mut writer = csv::Writer::from_path(&path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    let mut header = vec!["folha"];
    header.extend(RECORD_COLUMNS);
    writer.write_record(&header)?;

    let folha = batch.number.to_string();
    for record in &batch.records {
        let mut row = vec![folha.clone()];
        row.extend(record.to_row());
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(path)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

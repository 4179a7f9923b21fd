use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use nhs_metrics::config::{StoreBackend, TrustCodeOrder};
use nhs_metrics::export::exporter_for;
use nhs_metrics::logging::init_logger;
use nhs_metrics::pipeline::AcceptedRecord;
use nhs_metrics::prelude::*;
use nhs_metrics::store::open_store;
use nhs_metrics::tender::read_tenders;

#[derive(Parser)]
#[command(name = "nhscli")]
#[command(about = "NHS Metrics CLI - Transform, validate, and load NHS trust performance exports", long_about = None)]
struct Cli {
    /// Debug logging (RUST_LOG still wins when set)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Transform, validate, and upload one or more CSV exports
    Run(RunArgs),
    /// Generate a column mapping from a CSV header row
    GenerateMapping(MappingArgs),
    /// Check a CSV header row for the required columns
    ValidateHeaders(HeaderArgs),
    /// Normalize a tender export into JSON Lines
    Tenders(TenderArgs),
    /// Show or save the effective configuration
    Config(ConfigArgs),
}

#[derive(Args)]
struct RunArgs {
    /// CSV export to process (repeat for several files)
    #[arg(short, long, required = true)]
    csv: Vec<PathBuf>,
    /// Records per store write
    #[arg(short, long)]
    batch_size: Option<usize>,
    /// Configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Column mapping file; generated from the header when omitted
    #[arg(short, long)]
    mapping: Option<PathBuf>,
    /// Store backend
    #[arg(long, value_enum)]
    store: Option<StoreOpt>,
    /// Write to an in-memory store only
    #[arg(long)]
    dry_run: bool,
    /// Reject anything strict validation does not accept
    #[arg(long)]
    strict_only: bool,
    /// Uppercase trust codes before validating them
    #[arg(long)]
    normalize_first: bool,
    /// Directory for run reports
    #[arg(long)]
    report_dir: Option<PathBuf>,
    /// Also export accepted records to this file
    #[arg(short, long)]
    export: Option<PathBuf>,
    /// Export format
    #[arg(long, value_enum, default_value_t = ExportFormatOpt::Json)]
    format: ExportFormatOpt,
}

#[derive(Args)]
struct MappingArgs {
    /// CSV export whose header row is mapped
    #[arg(short, long)]
    csv: PathBuf,
    /// Output mapping file
    #[arg(short, long, default_value = "mapping.json")]
    output: PathBuf,
}

#[derive(Args)]
struct HeaderArgs {
    /// CSV export to check
    #[arg(short, long)]
    csv: PathBuf,
}

#[derive(Args)]
struct TenderArgs {
    /// Tender CSV export
    #[arg(short, long)]
    csv: PathBuf,
    /// Output JSON Lines file
    #[arg(short, long, default_value = "tenders.jsonl")]
    output: PathBuf,
}

#[derive(Args)]
struct ConfigArgs {
    #[command(subcommand)]
    action: ConfigAction,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Save the effective configuration
    Save {
        /// Target file; defaults to the user config directory
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum StoreOpt {
    Memory,
    File,
    Rest,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum ExportFormatOpt {
    Json,
    Jsonl,
    Sql,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    let result = match cli.command {
        Commands::Run(args) => cmd_run(args),
        Commands::GenerateMapping(args) => cmd_generate_mapping(args),
        Commands::ValidateHeaders(args) => cmd_validate_headers(args),
        Commands::Tenders(args) => cmd_tenders(args),
        Commands::Config(args) => cmd_config(args),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            match e.downcast_ref::<PipelineError>() {
                Some(err) => eprintln!("Error: {}", err.user_message()),
                None => eprintln!("Error: {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    match path {
        Some(path) => Ok(PipelineConfig::from_file(path)?.with_env_overrides()),
        None => Ok(PipelineConfig::load()),
    }
}

fn cmd_run(args: RunArgs) -> anyhow::Result<ExitCode> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(size) = args.batch_size {
        config.batch_size = size;
    }
    if let Some(mapping) = args.mapping {
        config.mapping_path = Some(mapping);
    }
    if let Some(dir) = args.report_dir {
        config.report_dir = dir;
    }
    if let Some(store) = args.store {
        config.store.backend = match store {
            StoreOpt::Memory => StoreBackend::Memory,
            StoreOpt::File => StoreBackend::File,
            StoreOpt::Rest => StoreBackend::Rest,
        };
    }
    if args.strict_only {
        config.validation_chain = vec![ValidationMode::Strict];
    }
    if args.normalize_first {
        config.trust_code_order = TrustCodeOrder::NormalizeThenValidate;
    }
    config.validate()?;

    let store: Arc<dyn RecordStore> = if args.dry_run {
        println!("Dry run: records are kept in memory only");
        Arc::new(MemoryStore::new())
    } else {
        open_store(&config.store)?
    };

    let report_dir = config.report_dir.clone();
    let pipeline = BatchUploadPipeline::new(store, config).keep_accepted(args.export.is_some());

    let mut reports = Vec::with_capacity(args.csv.len());
    let mut accepted: Vec<AcceptedRecord> = Vec::new();
    if args.export.is_some() || args.csv.len() == 1 {
        for path in &args.csv {
            let outcome = pipeline.run_detailed(path)?;
            accepted.extend(outcome.accepted);
            reports.push(outcome.report);
        }
    } else {
        for report in pipeline.run_many(&args.csv) {
            reports.push(report?);
        }
    }

    let mut aborted = false;
    for report in &reports {
        report.print_summary();
        let artifacts = report
            .write_artifacts(&report_dir)
            .with_context(|| format!("writing reports to {}", report_dir.display()))?;
        println!("Report:        {}", artifacts.report_json.display());
        println!("Error report:  {}", artifacts.error_report.display());
        println!("Summary:       {}", artifacts.summary_markdown.display());
        aborted |= report.is_aborted();
    }

    if let Some(output) = args.export {
        let format = match args.format {
            ExportFormatOpt::Json => ExportFormat::Json,
            ExportFormatOpt::Jsonl => ExportFormat::JsonLines,
            ExportFormatOpt::Sql => ExportFormat::Sql,
        };
        let records: Vec<TrustPeriodRecord> = accepted.into_iter().map(|a| a.record).collect();
        exporter_for(format).export(&records, &output)?;
        println!("Exported {} records as {} to {}", records.len(), format, output.display());
    }

    Ok(if aborted { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

fn cmd_generate_mapping(args: MappingArgs) -> anyhow::Result<ExitCode> {
    let headers = CsvSource::read_headers(&args.csv)?;
    let mapping = ColumnMapping::from_headers(&headers);
    mapping.save(&args.output)?;
    println!("{}", mapping.summary());
    if !mapping.unmapped.is_empty() {
        println!("Unmapped columns: {}", mapping.unmapped.join(", "));
    }
    println!("Mapping saved to {}", args.output.display());
    Ok(ExitCode::SUCCESS)
}

fn cmd_validate_headers(args: HeaderArgs) -> anyhow::Result<ExitCode> {
    let headers = CsvSource::read_headers(&args.csv)?;
    let missing = TrustMetricsSchema::missing_required_columns(&headers);
    if missing.is_empty() {
        println!("✓ All {} required columns present ({} columns found)", TrustMetricsSchema::required_columns().len(), headers.len());
        Ok(ExitCode::SUCCESS)
    } else {
        println!("✗ Missing required columns ({} columns found):", headers.len());
        for column in &missing {
            println!("  - {}", column);
        }
        Ok(ExitCode::FAILURE)
    }
}

fn cmd_tenders(args: TenderArgs) -> anyhow::Result<ExitCode> {
    use std::io::{BufWriter, Write};

    let batch = read_tenders(&args.csv)?;
    let file = std::fs::File::create(&args.output)
        .with_context(|| format!("creating {}", args.output.display()))?;
    let mut writer = BufWriter::new(file);
    for tender in &batch.tenders {
        writeln!(writer, "{}", serde_json::to_string(tender)?)?;
    }
    writer.flush()?;

    println!(
        "Normalized {} tenders ({} skipped without id, {} failed) to {}",
        batch.tenders.len(),
        batch.skipped,
        batch.errors.len(),
        args.output.display()
    );
    for error in &batch.errors {
        eprintln!("  {}", error);
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_config(args: ConfigArgs) -> anyhow::Result<ExitCode> {
    let config = PipelineConfig::load();
    match args.action {
        ConfigAction::Show => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigAction::Save { path } => {
            let path = path
                .or_else(PipelineConfig::default_config_path)
                .context("no user config directory on this platform; pass --path")?;
            config.save(&path)?;
            println!("Configuration saved to {}", path.display());
        }
    }
    Ok(ExitCode::SUCCESS)
}

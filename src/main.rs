use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use legacy_import::{
    report, ConflictPolicy, EntityKind, ExecutionContext, Executor, ImportConfig, ImportError,
    ImportRunResult, ImportStore, RunSummary, SqliteStore,
};

/// Import legacy XML exports into the operational database
#[derive(Parser, Debug)]
#[command(name = "legacy-import", version)]
#[command(about = "Validate, map and import legacy school exports")]
struct Cli {
    /// TOML configuration file (defaults apply when absent)
    #[arg(long, global = true, env = "LEGACY_IMPORT_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database (overrides the config file)
    #[arg(long, global = true, env = "LEGACY_IMPORT_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import every document found in an input directory
    Run(RunArgs),

    /// List recent runs, most recent first
    History {
        #[arg(long, short = 'l', default_value_t = 10)]
        limit: usize,
    },

    /// Print one persisted run summary
    Show {
        /// Run id (UUID)
        id: String,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Directory holding the XML documents and their XSD schemas
    #[arg(long, short = 'i')]
    input: PathBuf,

    /// Exceptions report path (.json or .csv)
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,

    /// Leave existing records untouched
    #[arg(long, group = "policy")]
    skip_existing: bool,

    /// Overwrite existing records (audited per field)
    #[arg(long, group = "policy")]
    update: bool,

    /// Report existing records as failures (default)
    #[arg(long, group = "policy")]
    fail_on_conflict: bool,

    /// Validate and map only; nothing is written
    #[arg(long)]
    preview: bool,

    /// Identity recorded on the run and its audit events
    #[arg(long)]
    actor: Option<String>,
}

impl RunArgs {
    fn policy(&self) -> ConflictPolicy {
        if self.skip_existing {
            ConflictPolicy::SkipExisting
        } else if self.update {
            ConflictPolicy::Update
        } else {
            ConflictPolicy::FailOnConflict
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match dispatch(Cli::parse()) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("❌ {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn dispatch(cli: Cli) -> Result<ExitCode> {
    let mut config = match &cli.config {
        Some(path) => ImportConfig::load(path)?,
        None => ImportConfig::default(),
    };
    if let Some(db) = cli.db {
        config.database_path = db;
    }

    match cli.command {
        Command::Run(args) => run_import(config, args),
        Command::History { limit } => {
            show_history(&open_store(&config)?, limit)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Show { id } => show_run(&open_store(&config)?, &id),
    }
}

fn open_store(config: &ImportConfig) -> Result<SqliteStore> {
    SqliteStore::open(&config.database_path)
        .with_context(|| format!("Failed to open {}", config.database_path.display()))
}

fn run_import(mut config: ImportConfig, args: RunArgs) -> Result<ExitCode> {
    if let Some(actor) = &args.actor {
        config.actor = actor.clone();
    }
    let policy = args.policy();

    println!("📥 Legacy Import");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Input:  {}", args.input.display());
    println!("Policy: {}", policy);

    let context = ExecutionContext::new(config.actor.clone());
    let mut executor = Executor::new(&config, context);

    let outcome = if args.preview {
        executor.preview(&args.input, policy)
    } else {
        let mut store = open_store(&config)?;
        println!("Database: {}", config.database_path.display());
        executor.run(&mut store, &args.input, policy)
    };

    let result = match outcome {
        Ok(result) => result,
        Err(e @ ImportError::MissingInput(_)) => {
            eprintln!("\n❌ Import aborted: {}", e);
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => return Err(e.into()),
    };

    print!("{}", render_result(&result));

    if let Some(path) =
        report::write_report_if_needed(&result, &args.input, &config, args.output.as_deref())?
    {
        println!("\n📄 Exceptions report: {}", path.display());
    }

    Ok(exit_code(&result))
}

/// Non-zero for any failed record or validation error
fn exit_code(result: &ImportRunResult) -> ExitCode {
    if result.has_errors() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Per-kind table and totals; a preview says plainly that nothing was written
fn render_result(result: &ImportRunResult) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "\n{:<12} {:>8} {:>8} {:>8} {:>8} {:>8}\n",
        "Entity", "Mapped", "Created", "Updated", "Skipped", "Failed"
    ));
    for (kind, counters) in &result.per_kind {
        out.push_str(&format!(
            "{:<12} {:>8} {:>8} {:>8} {:>8} {:>8}\n",
            kind.name(),
            counters.mapped,
            counters.created,
            counters.updated,
            counters.skipped,
            counters.failed
        ));
    }

    let totals = result.totals();
    out.push_str("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n");
    if result.preview {
        out.push_str(&format!("✓ Mapped:            {}\n", totals.mapped));
        out.push_str(&format!("✓ Rejected:          {}\n", totals.failed));
    } else {
        out.push_str(&format!("✓ Processed:         {}\n", totals.processed()));
        out.push_str(&format!("✓ Success rate:      {:.1}%\n", result.success_rate()));
    }
    out.push_str(&format!("⚠️  Warnings:          {}\n", result.warnings.len()));
    out.push_str(&format!("❌ Validation errors: {}\n", result.validation_errors.len()));
    out.push_str(&format!("❌ Exceptions:        {}\n", result.exceptions.len()));

    if !result.skipped_entities.is_empty() {
        out.push_str(&format!(
            "⏭️  Skipped (no document): {}\n",
            kind_list(&result.skipped_entities)
        ));
    }
    if result.cancelled {
        out.push_str("🛑 Run was cancelled before completion\n");
    }
    out.push_str(&format!("Run id: {}\n", result.run_id));
    if result.preview {
        out.push_str("\n👀 Preview only: no data was written.\n");
    }
    out
}

fn kind_list(kinds: &[EntityKind]) -> String {
    kinds.iter().map(|k| k.name()).collect::<Vec<_>>().join(", ")
}

fn show_history(store: &dyn ImportStore, limit: usize) -> Result<()> {
    let runs = store.recent_runs(limit)?;
    if runs.is_empty() {
        println!("No runs recorded yet.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<20}  {:<16}  {:>9}  {:>8}",
        "Run id", "Started", "Policy", "Processed", "Success"
    );
    for run in &runs {
        println!(
            "{:<36}  {:<20}  {:<16}  {:>9}  {:>7.1}%",
            run.id,
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.policy.as_str(),
            run.total_processed,
            run.success_rate
        );
    }
    Ok(())
}

fn show_run(store: &dyn ImportStore, id: &str) -> Result<ExitCode> {
    match store.get_run(id)? {
        Some(summary) => {
            print_summary(&summary);
            Ok(ExitCode::SUCCESS)
        }
        None => {
            eprintln!("❌ No run with id {}", id);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn print_summary(summary: &RunSummary) {
    println!("Run {}", summary.id);
    println!("  Actor:    {}", summary.actor);
    println!("  Source:   {}", Path::new(&summary.source_path).display());
    println!("  Policy:   {}", summary.policy);
    println!("  Started:  {}", summary.started_at.to_rfc3339());
    if let Some(seconds) = summary.duration_seconds() {
        println!("  Duration: {}s", seconds);
    }
    if summary.cancelled {
        println!("  Cancelled");
    }
    for (kind, counters) in &summary.per_kind {
        println!(
            "  {:<12} created {:>5}  updated {:>5}  skipped {:>5}  failed {:>5}",
            kind.name(),
            counters.created,
            counters.updated,
            counters.skipped,
            counters.failed
        );
    }
    println!(
        "  Success rate {:.1}% of {} processed ({} validation errors, {} exceptions)",
        summary.success_rate,
        summary.total_processed,
        summary.validation_error_count,
        summary.exception_count
    );
    if !summary.skipped_entities.is_empty() {
        println!("  Skipped: {}", kind_list(&summary.skipped_entities));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const SCHOOLS_XSD: &str = r#"<xsd:schema xmlns:xsd="http://www.w3.org/2001/XMLSchema">
  <xsd:element name="dataroot">
    <xsd:complexType>
      <xsd:sequence>
        <xsd:element ref="Schools" minOccurs="0" maxOccurs="unbounded"/>
      </xsd:sequence>
    </xsd:complexType>
  </xsd:element>
  <xsd:element name="Schools">
    <xsd:complexType>
      <xsd:sequence>
        <xsd:element name="Code" minOccurs="1" type="xsd:string"/>
        <xsd:element name="Name" minOccurs="0" type="xsd:string"/>
      </xsd:sequence>
    </xsd:complexType>
  </xsd:element>
</xsd:schema>"#;

    fn write_schools(dir: &Path, rows: &str) {
        fs::write(dir.join("schools.xsd"), SCHOOLS_XSD).unwrap();
        fs::write(dir.join("schools.xml"), format!("<dataroot>{}</dataroot>", rows)).unwrap();
    }

    fn run_args(input: &Path, preview: bool) -> RunArgs {
        RunArgs {
            input: input.to_path_buf(),
            output: Some(input.join("exceptions.json")),
            skip_existing: false,
            update: false,
            fail_on_conflict: false,
            preview,
            actor: Some("tester".to_string()),
        }
    }

    fn config_in(dir: &Path) -> ImportConfig {
        ImportConfig {
            database_path: dir.join("import.db"),
            ..ImportConfig::default()
        }
    }

    #[test]
    fn test_policy_flags() {
        let mut args = run_args(Path::new("."), false);
        assert_eq!(args.policy(), ConflictPolicy::FailOnConflict);
        args.update = true;
        assert_eq!(args.policy(), ConflictPolicy::Update);
        args.update = false;
        args.skip_existing = true;
        assert_eq!(args.policy(), ConflictPolicy::SkipExisting);
    }

    #[test]
    fn test_policy_flags_are_mutually_exclusive() {
        let parsed = Cli::try_parse_from([
            "legacy-import", "run", "--input", "data", "--update", "--skip-existing",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_preview_output_says_nothing_was_written() {
        let dir = tempfile::tempdir().unwrap();
        write_schools(dir.path(), "<Schools><Code>S1</Code></Schools>");
        let config = config_in(dir.path());

        let result = Executor::new(&config, ExecutionContext::new("tester"))
            .preview(dir.path(), ConflictPolicy::Update)
            .unwrap();
        let text = render_result(&result);

        assert!(text.contains("no data was written"));
        assert!(text.contains("Mapped:            1"));
        assert_eq!(exit_code(&result), ExitCode::SUCCESS);

        let code = run_import(config.clone(), run_args(dir.path(), true)).unwrap();
        assert_eq!(code, ExitCode::SUCCESS);
        assert!(!config.database_path.exists());
        println!("✅ Preview output PASSED");
    }

    #[test]
    fn test_exit_code_reflects_failures() {
        let dir = tempfile::tempdir().unwrap();
        write_schools(
            dir.path(),
            "<Schools><Code>S1</Code></Schools><Schools><Name>No code</Name></Schools>",
        );
        let config = config_in(dir.path());

        let code = run_import(config.clone(), run_args(dir.path(), false)).unwrap();
        assert_eq!(code, ExitCode::FAILURE);
        assert!(dir.path().join("exceptions.json").exists());

        let missing = run_import(config, run_args(&dir.path().join("absent"), false)).unwrap();
        assert_eq!(missing, ExitCode::FAILURE);
        println!("✅ Exit codes PASSED");
    }

    #[test]
    fn test_clean_run_exits_zero() {
        let dir = tempfile::tempdir().unwrap();
        write_schools(dir.path(), "<Schools><Code>S1</Code><Name>Maple</Name></Schools>");
        let config = config_in(dir.path());

        let code = run_import(config.clone(), run_args(dir.path(), false)).unwrap();
        assert_eq!(code, ExitCode::SUCCESS);

        let store = open_store(&config).unwrap();
        assert_eq!(store.recent_runs(5).unwrap().len(), 1);
    }
}

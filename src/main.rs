use agesplit::driver::{RunConfig, run_pipeline};
use agesplit::pattern::classify;
use agesplit::store::{ArtifactKey, ArtifactStore};
use agesplit::tables::{
    CountryMeta, IncidenceEstimate, NotificationRecord, PriorRow, PriorSpec,
};
use agesplit::{InputTables, MissingnessPattern};
use clap::{Args, Parser, Subcommand};
use comfy_table::{Cell, ContentArrangement, Table, presets::UTF8_FULL};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "agesplit")]
#[command(about = "Age/sex disaggregation of national TB incidence", long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full disaggregation pipeline against an artifact store.
    Run(RunArgs),
    /// Tabulate missingness patterns in the notification table.
    Classify(ClassifyArgs),
    /// Write a default run configuration into the store.
    InitConfig(InitConfigArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Artifact store directory with the input tables.
    store: PathBuf,
    /// Optional configuration file; defaults to the store's run_config.json
    /// when present, else built-in defaults.
    #[arg(long = "config")]
    config: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ClassifyArgs {
    store: PathBuf,
}

#[derive(Args, Debug)]
struct InitConfigArgs {
    store: PathBuf,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run(args) => cmd_run(args),
        Command::Classify(args) => cmd_classify(args),
        Command::InitConfig(args) => cmd_init_config(args),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

fn load_tables(store: &ArtifactStore) -> Result<InputTables, String> {
    let incidence: Vec<IncidenceEstimate> = store
        .read_table(ArtifactKey::Incidence)
        .map_err(|e| e.to_string())?;
    let notifications: Vec<NotificationRecord> = store
        .read_table(ArtifactKey::Notifications)
        .map_err(|e| e.to_string())?;
    let prior_rows: Vec<PriorRow> = if store.exists(ArtifactKey::Priors) {
        store
            .read_table(ArtifactKey::Priors)
            .map_err(|e| e.to_string())?
    } else {
        Vec::new()
    };
    let meta: Vec<CountryMeta> = store
        .read_table(ArtifactKey::CountryMeta)
        .map_err(|e| e.to_string())?;
    Ok(InputTables {
        incidence,
        notifications,
        priors: PriorSpec::from_rows(&prior_rows),
        meta,
    })
}

fn cmd_run(args: RunArgs) -> Result<(), String> {
    let store = ArtifactStore::open(&args.store).map_err(|e| e.to_string())?;
    let tables = load_tables(&store)?;

    let config: RunConfig = if let Some(path) = &args.config {
        let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        serde_json::from_str(&text).map_err(|e| e.to_string())?
    } else if store.exists(ArtifactKey::RunConfig) {
        store
            .read_json(ArtifactKey::RunConfig)
            .map_err(|e| e.to_string())?
    } else {
        RunConfig::default()
    };

    let output = run_pipeline(&tables, &config);
    store
        .write_table(ArtifactKey::Splits, &output.rows)
        .map_err(|e| e.to_string())?;
    store
        .write_json(ArtifactKey::RunConfig, &config)
        .map_err(|e| e.to_string())?;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["country", "years", "rhat", "ess", "converged"]);
    for posterior in &output.posteriors {
        table.add_row(vec![
            Cell::new(&posterior.iso3),
            Cell::new(posterior.years.len()),
            Cell::new(format!("{:.3}", posterior.rhat)),
            Cell::new(format!("{:.0}", posterior.ess)),
            Cell::new(if posterior.converged { "yes" } else { "NO" }),
        ]);
    }
    println!("{table}");
    println!(
        "{} output rows, {} modeled countries, {} warning(s)",
        output.rows.len(),
        output.posteriors.len(),
        output.warnings.len()
    );
    for warning in &output.warnings {
        println!("  warning: {warning}");
    }
    Ok(())
}

fn cmd_classify(args: ClassifyArgs) -> Result<(), String> {
    let store = ArtifactStore::open(&args.store).map_err(|e| e.to_string())?;
    let notifications: Vec<NotificationRecord> = store
        .read_table(ArtifactKey::Notifications)
        .map_err(|e| e.to_string())?;

    let mut counts = [0usize; 6];
    for record in &notifications {
        let pattern = classify(record);
        counts[(pattern.code() - 1) as usize] += 1;
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["pattern", "granularity", "country-years"]);
    for pattern in MissingnessPattern::ALL {
        let cells = agesplit::grid(pattern).len();
        let granularity = if cells == 0 {
            "none".to_string()
        } else {
            format!("{cells} cells")
        };
        table.add_row(vec![
            Cell::new(pattern.code()),
            Cell::new(granularity),
            Cell::new(counts[(pattern.code() - 1) as usize]),
        ]);
    }
    println!("{table}");
    Ok(())
}

fn cmd_init_config(args: InitConfigArgs) -> Result<(), String> {
    let store = ArtifactStore::open(&args.store).map_err(|e| e.to_string())?;
    store
        .write_json(ArtifactKey::RunConfig, &RunConfig::default())
        .map_err(|e| e.to_string())?;
    println!("wrote {}", store.path(ArtifactKey::RunConfig).display());
    Ok(())
}

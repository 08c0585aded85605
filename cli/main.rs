#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;

use fedgwas::federate::{
    AssociationReport, BatchedCoefficients, BatchedSiteStatistics, SiteResiduals, reconcile_variants,
};
use fedgwas::types::{FitConfig, SolverKind};

#[derive(Args)]
pub struct CombineArgs {
    /// Per-site statistics artifacts (.toml), one per site
    #[arg(long = "site", value_name = "TOML", required = true, num_args = 1..)]
    pub sites: Vec<PathBuf>,

    /// Where to write the combined statistics
    #[arg(long, value_name = "TOML")]
    pub out: PathBuf,
}

#[derive(Args)]
pub struct SolveArgs {
    /// Combined statistics artifact produced by `combine`
    #[arg(long, value_name = "TOML")]
    pub stats: PathBuf,

    /// Optional fit configuration; flags given here take precedence
    #[arg(long, value_name = "TOML")]
    pub config: Option<PathBuf>,

    /// Solver strategy: inverse or cholesky (qr needs row-level data)
    #[arg(long)]
    pub solver: Option<SolverKind>,

    /// Count an intercept modeled outside the coefficient vector in the degrees of freedom
    #[arg(long)]
    pub include_bias: bool,

    /// Where to write the fitted coefficients
    #[arg(long, value_name = "TOML")]
    pub out: PathBuf,
}

#[derive(Args)]
pub struct ReportArgs {
    /// Combined statistics artifact produced by `combine`
    #[arg(long, value_name = "TOML")]
    pub stats: PathBuf,

    /// Coefficients artifact produced by `solve`
    #[arg(long, value_name = "TOML")]
    pub model: PathBuf,

    /// Per-site residual artifacts, one per site
    #[arg(long = "residuals", value_name = "TOML", required = true, num_args = 1..)]
    pub residuals: Vec<PathBuf>,

    /// Where to write the association table
    #[arg(long, value_name = "TSV")]
    pub out: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "fedgwas",
    version,
    about = "Federated association testing over per-site sufficient statistics",
    long_about = "Combines per-site XtX/Xty statistics, solves the global per-variant \
                 regressions and reports coefficients with standard errors, without any \
                 individual-level data leaving its site."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile variant lists across sites and sum their statistics
    #[command(about = "Combine per-site statistics (outputs: combined.toml)")]
    Combine(CombineArgs),

    /// Solve the global per-variant regressions from combined statistics
    #[command(about = "Solve coefficients from combined statistics (outputs: model.toml)")]
    Solve(SolveArgs),

    /// Build the association table from the second protocol round
    #[command(about = "Report coefficients, standard errors and t-statistics (outputs: report.tsv)")]
    Report(ReportArgs),
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();

    let result = match command {
        Some(Commands::Combine(args)) => combine(args),
        Some(Commands::Solve(args)) => solve(args),
        Some(Commands::Report(args)) => report(args),
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn load_sites(paths: &[PathBuf]) -> Result<Vec<BatchedSiteStatistics>, Box<dyn std::error::Error>> {
    paths
        .iter()
        .map(|path| {
            println!("Loading site statistics from: {}", path.display());
            BatchedSiteStatistics::load(path).map_err(Into::into)
        })
        .collect()
}

pub fn combine(args: CombineArgs) -> Result<(), Box<dyn std::error::Error>> {
    let sites = load_sites(&args.sites)?;
    let shared = reconcile_variants(&sites)?;
    println!(
        "{} variants are shared by all {} sites",
        shared.len(),
        sites.len()
    );

    let aligned = sites
        .iter()
        .map(|site| site.select_variants(&shared))
        .collect::<Result<Vec<_>, _>>()?;
    let combined = BatchedSiteStatistics::combine(&aligned)?;
    combined.save(&args.out)?;
    println!("Combined statistics saved to: {}", args.out.display());
    Ok(())
}

fn resolve_config(path: Option<&Path>) -> Result<FitConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            println!("Loading fit configuration from: {}", path.display());
            Ok(FitConfig::load(path)?)
        }
        None => Ok(FitConfig::default()),
    }
}

pub fn solve(args: SolveArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = resolve_config(args.config.as_deref())?;
    if let Some(solver) = args.solver {
        config.solver = solver;
    }
    config.include_bias |= args.include_bias;

    let stats = BatchedSiteStatistics::load(&args.stats)?;
    println!(
        "Solving {} regressions with the {} solver",
        stats.batch_size(),
        config.solver
    );

    let solver = config.solver.batched();
    let coefficients = stats.solve(solver.as_ref(), config.include_bias)?;
    coefficients.save(&args.out)?;
    println!("Coefficients saved to: {}", args.out.display());
    Ok(())
}

pub fn report(args: ReportArgs) -> Result<(), Box<dyn std::error::Error>> {
    let stats = BatchedSiteStatistics::load(&args.stats)?;
    let coefficients = BatchedCoefficients::load(&args.model)?;
    let residuals = args
        .residuals
        .iter()
        .map(|path| SiteResiduals::load(path))
        .collect::<Result<Vec<_>, _>>()?;
    let total = SiteResiduals::combine(&residuals)?;

    let table = AssociationReport::build(&stats, &coefficients, &total)?;
    table.write_tsv(&args.out)?;
    println!(
        "Association report with {} rows saved to: {}",
        table.rows.len(),
        args.out.display()
    );
    Ok(())
}

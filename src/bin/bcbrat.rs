use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{ArgAction, Parser};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use bcbrat::app::{App, ProgressSink, RunOptions, RunPlan, RunReport, TracingSink};
use bcbrat::config::{ConfigLoader, ConfigOverrides, ResolvedConfig};
use bcbrat::domain::WatershedKey;
use bcbrat::elevation::WcsElevationClient;
use bcbrat::error::BratError;
use bcbrat::ogcapi::OgcFeaturesClient;
use bcbrat::output::{JsonOutput, OutputMode};
use bcbrat::raster::{GdalRasterTool, RasterTool, RasterToolStatus};
use bcbrat::wfs::WfsClient;

#[derive(Parser)]
#[command(name = "bcbrat")]
#[command(about = "Assemble watershed-scoped BRAT input projects from BC open data")]
#[command(version, author)]
struct Cli {
    /// Config file (default: bcbrat.json in the working directory)
    #[arg(long)]
    config: Option<String>,

    /// Watershed key: an assessment watershed feature id, or group:<CODE>
    #[arg(long)]
    watershed: Option<WatershedKey>,

    /// Project directory
    #[arg(long)]
    output: Option<Utf8PathBuf>,

    /// Stop when any hydrology source fails instead of skipping it
    #[arg(long)]
    abort_on_partial_failure: bool,

    /// Keep the DEM as served and write the hillshade uncompressed
    #[arg(long)]
    no_compress: bool,

    /// Resolve the config and print the plan without fetching anything
    #[arg(long)]
    dry_run: bool,

    /// Print results as JSON on stdout
    #[arg(long)]
    json: bool,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Only warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verbosity {
    Warn,
    Info,
    Debug,
    Trace,
}

impl Verbosity {
    fn from_flags(verbose: u8, quiet: bool) -> Self {
        match (quiet, verbose) {
            (true, _) => Verbosity::Warn,
            (false, 0) => Verbosity::Info,
            (false, 1) => Verbosity::Debug,
            (false, _) => Verbosity::Trace,
        }
    }

    fn directive(self) -> &'static str {
        match self {
            Verbosity::Warn => "warn",
            Verbosity::Info => "info",
            Verbosity::Debug => "debug",
            Verbosity::Trace => "trace",
        }
    }
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<BratError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &BratError) -> u8 {
    match error {
        BratError::MissingConfig
        | BratError::ConfigRead(_)
        | BratError::ConfigParse(_)
        | BratError::ConfigValidation(_)
        | BratError::InvalidWatershedKey(_)
        | BratError::InvalidSourceId(_) => 2,
        BratError::SourceUnavailable { .. }
        | BratError::SourceStatus { .. }
        | BratError::PartialHydrologyFailure { .. }
        | BratError::ElevationHttp(_)
        | BratError::ElevationStatus { .. }
        | BratError::MissingTool(_)
        | BratError::RasterTool(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    let verbosity = Verbosity::from_flags(cli.verbose, cli.quiet);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.directive()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };
    let overrides = ConfigOverrides {
        watershed: cli.watershed,
        output_dir: cli.output,
        abort_on_partial_failure: cli.abort_on_partial_failure,
        no_compress: cli.no_compress,
    };
    let config = ConfigLoader::resolve(cli.config.as_deref(), &overrides)?;
    let raster_tool = GdalRasterTool::new();

    if cli.dry_run {
        let plan = RunPlan::new(&config);
        return print_plan(&plan, &raster_tool, output_mode);
    }

    if let RasterToolStatus::Missing { message } = raster_tool.tool_status(config.raster.compress)
    {
        return Err(BratError::MissingTool(message).into());
    }

    let app = build_app(&config, raster_tool)?;
    let sink: &dyn ProgressSink = match output_mode {
        OutputMode::Json => &JsonOutput,
        OutputMode::Human => &TracingSink,
    };
    let report = match app.run(&config, &RunOptions::default(), sink) {
        Ok(report) => report,
        Err(failure) => {
            if let Some(manifest) = &failure.manifest {
                let registered: Vec<&str> = manifest.datasets().map(|dataset| dataset.id()).collect();
                tracing::warn!(
                    registered = ?registered,
                    "run stopped; project manifest was not written"
                );
            }
            return Err(failure.error.into());
        }
    };

    match output_mode {
        OutputMode::Json => JsonOutput::print_report(&report).into_diagnostic(),
        OutputMode::Human => {
            print_summary(&report);
            Ok(())
        }
    }
}

fn build_app(
    config: &ResolvedConfig,
    raster_tool: GdalRasterTool,
) -> Result<App<WfsClient, OgcFeaturesClient, WcsElevationClient, GdalRasterTool>, BratError> {
    let features = WfsClient::new(config.services.wfs_url.clone())?;
    let hydrology = OgcFeaturesClient::new(config.services.features_url.clone())?;
    let elevation = WcsElevationClient::new(config.services.elevation_url.clone())?;
    Ok(App::new(features, hydrology, elevation, raster_tool))
}

fn print_plan(
    plan: &RunPlan,
    raster_tool: &GdalRasterTool,
    output_mode: OutputMode,
) -> miette::Result<()> {
    if output_mode == OutputMode::Json {
        return JsonOutput::print_plan(plan).into_diagnostic();
    }
    println!("Watershed: {} where {}", plan.watershed_source, plan.watershed_filter);
    println!("Project directory: {}", plan.project_dir);
    println!(
        "Raster: {} m, compression {}",
        plan.resolution,
        if plan.compress { "on" } else { "off" }
    );
    let tools = raster_tool.tool_info();
    println!(
        "GDAL: gdaldem {}, gdal_translate {}",
        tools.gdaldem.as_deref().unwrap_or("missing"),
        tools.gdal_translate.as_deref().unwrap_or("missing")
    );
    println!(
        "Hydrology ({}):",
        if plan.abort_on_partial_failure {
            "abort on failure"
        } else {
            "skip failed sources"
        }
    );
    for source in &plan.hydrology_sources {
        println!("  {source}");
    }
    println!("Vector layers:");
    for source in &plan.vector_layers {
        println!("  {source}");
    }
    println!("Outputs:");
    for output in &plan.outputs {
        println!("  {output}");
    }
    Ok(())
}

fn print_summary(report: &RunReport) {
    println!("Project written to {}", report.project_dir);
    for dataset in &report.datasets {
        let layers = dataset.layers();
        if layers.is_empty() {
            println!("  {}", dataset.id());
        } else {
            let names: Vec<&str> = layers.iter().map(|layer| layer.name.as_str()).collect();
            println!("  {} [{}]", dataset.id(), names.join(", "));
        }
    }
    if !report.empty_layers.is_empty() {
        println!("No features within bounds: {}", report.empty_layers.join(", "));
    }
    for failure in &report.failed_layers {
        println!("Skipped {}: {}", failure.source, failure.message);
    }
    println!("Manifest: {} ({} ms)", report.manifest_path, report.elapsed_ms);
}

use clap::{Args, Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;

use boundary_mapping::calibration::detector_cost_sweep;
use boundary_mapping::config::{ClosureMeasurementMode, DetectionMode, HyperparameterSet, MappingOptions};
use boundary_mapping::data::{read_path, write_polygon, write_poses};
use boundary_mapping::mapping::g2o::{read_g2o, write_g2o};
use boundary_mapping::mapping::pose_graph::MAX_ITERATIONS;
use boundary_mapping::mapping::{run_mapping, simplify_path};
use boundary_mapping::models::motion::NoiseModelKind;

#[derive(Parser)]
#[command(name = "boundary-mapping")]
#[command(about = "Map a closed boundary from a drifting odometry path")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Optimize the pose graph of a path and write the map
    Map(MapArgs),
    /// Print the detector cost over a neighborhood length x threshold grid as CSV
    Sweep(SweepArgs),
    /// Optimize a pose graph read from a g2o file
    Optimize(OptimizeArgs),
}

#[derive(Args)]
struct MapArgs {
    /// CSV file of x,y path points
    input: PathBuf,

    /// Hyperparameters to start from (TOML)
    #[arg(long)]
    params: Option<PathBuf>,

    /// Where to store the hyperparameters used by this run (TOML)
    #[arg(long)]
    save_params: Option<PathBuf>,

    /// Loop-closure detection: correlation | icp
    #[arg(long, default_value = "correlation")]
    detection: String,

    /// Loop-closure measurement: coincident | aligned
    #[arg(long, default_value = "coincident")]
    closure_measurement: String,

    /// Odometry noise model: per-axis | trigonometric
    #[arg(long, default_value = "per-axis")]
    noise_model: String,

    #[arg(long)]
    calibrate_detector: bool,

    #[arg(long)]
    calibrate_solver: bool,

    /// Cost evaluations per calibration
    #[arg(long, default_value_t = 30)]
    budget: usize,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Output CSV of optimized x,y,theta poses
    #[arg(long)]
    poses: Option<PathBuf>,

    /// Output CSV of the closed map polygon
    #[arg(long)]
    polygon: Option<PathBuf>,

    /// Output g2o file of the optimized graph
    #[arg(long)]
    g2o: Option<PathBuf>,
}

#[derive(Args)]
struct SweepArgs {
    /// CSV file of x,y path points
    input: PathBuf,

    #[arg(long)]
    params: Option<PathBuf>,

    /// Loop-closure detection: correlation | icp
    #[arg(long, default_value = "correlation")]
    detection: String,

    #[arg(long, value_delimiter = ',', default_value = "1,2,3,4,5")]
    neighborhood_lengths: Vec<f64>,

    #[arg(long, value_delimiter = ',', default_value = "0.001,0.01,0.05,0.1,0.5")]
    thresholds: Vec<f64>,
}

#[derive(Args)]
struct OptimizeArgs {
    /// g2o file with VERTEX_SE2 and EDGE_SE2 lines
    input: PathBuf,

    #[arg(long, default_value_t = MAX_ITERATIONS)]
    iterations: usize,

    /// Output CSV of optimized x,y,theta poses
    #[arg(long)]
    poses: Option<PathBuf>,

    /// Output g2o file of the optimized graph
    #[arg(long)]
    g2o: Option<PathBuf>,
}

fn load_params(path: &Option<PathBuf>) -> Result<HyperparameterSet, Box<dyn Error>> {
    Ok(match path {
        Some(path) => HyperparameterSet::load(path)?,
        None => HyperparameterSet::default(),
    })
}

fn map(args: MapArgs) -> Result<(), Box<dyn Error>> {
    let options = MappingOptions {
        detection: args.detection.parse::<DetectionMode>()?,
        closure_measurement: args.closure_measurement.parse::<ClosureMeasurementMode>()?,
        noise_model: args.noise_model.parse::<NoiseModelKind>()?,
        calibrate_detector: args.calibrate_detector,
        calibrate_solver: args.calibrate_solver,
        calibration_budget: args.budget,
        seed: args.seed,
    };
    let params = load_params(&args.params)?;
    let path = read_path(&args.input)?;

    let output = run_mapping(&path, params, &options)?;
    println!(
        "nodes: {}, loop closures: {}, iterations: {}, termination: {:?}, final error: {:.5}",
        output.graph.num_nodes(),
        output.closures.len(),
        output.report.iterations,
        output.report.termination_reason,
        output.report.final_error
    );
    match &output.circumference {
        Some(estimate) => println!("circumference: {:.3}", estimate.circumference),
        None => println!("circumference: insufficient loop closures"),
    }

    if let Some(file) = &args.poses {
        write_poses(file, output.poses())?;
    }
    if let Some(file) = &args.polygon {
        write_polygon(file, &output.polygon)?;
    }
    if let Some(file) = &args.g2o {
        write_g2o(file, &output.graph)?;
    }
    if let Some(file) = &args.save_params {
        output.hyperparameters.save(file)?;
    }
    Ok(())
}

fn sweep(args: SweepArgs) -> Result<(), Box<dyn Error>> {
    let mode = args.detection.parse::<DetectionMode>()?;
    let params = load_params(&args.params)?;
    let path = read_path(&args.input)?;
    let dominant = simplify_path(&path, &params.simplification)?;

    let cells = detector_cost_sweep(
        &dominant.points,
        &params.detector,
        mode,
        &args.neighborhood_lengths,
        &args.thresholds,
    );
    println!("neighborhood_length,max_dissimilarity,cost");
    for cell in cells {
        println!("{},{},{}", cell.neighborhood_length, cell.max_dissimilarity, cell.cost);
    }
    Ok(())
}

fn optimize(args: OptimizeArgs) -> Result<(), Box<dyn Error>> {
    let mut graph = read_g2o(&args.input)?;
    let report = graph.optimize(args.iterations);
    println!(
        "nodes: {}, edges: {}, iterations: {}, termination: {:?}, final error: {:.5}",
        graph.num_nodes(),
        graph.num_edges(),
        report.iterations,
        report.termination_reason,
        report.final_error
    );
    if let Some(file) = &args.poses {
        write_poses(file, &graph.poses)?;
    }
    if let Some(file) = &args.g2o {
        write_g2o(file, &graph)?;
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Command::Map(args) => map(args),
        Command::Sweep(args) => sweep(args),
        Command::Optimize(args) => optimize(args),
    }
}

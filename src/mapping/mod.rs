pub mod circumference;
pub mod g2o;
pub mod icp;
pub mod loop_closure;
pub mod measurement;
mod pipeline;
pub mod pose_graph;
pub mod simplify;

pub use circumference::CircumferenceEstimate;
pub use loop_closure::{detect, LoopClosureSet};
pub use pipeline::{build_graph, map_polygon, run_mapping, simplify_path, solve, MappingOutput};
pub use pose_graph::{OptimizationReport, PoseGraph, TerminationReason};

//! g2o text format for SE2 pose graphs (`VERTEX_SE2` / `EDGE_SE2`).
//!
//! Edges store their information matrix as the upper triangle
//! `i_11 i_12 i_13 i_22 i_23 i_33`. The format carries no edge kind, so on
//! import an edge between consecutive vertices is odometry and any other edge
//! is a loop closure.

use nalgebra::{Matrix3, Matrix3xX, Vector3};
use rustc_hash::FxHashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::error::{MappingError, Result};
use crate::mapping::pose_graph::{EdgeKind, EdgeSE2, PoseGraph};

fn numbers<const N: usize>(fields: &[&str], line: usize) -> Result<[f64; N]> {
    if fields.len() != N {
        return Err(MappingError::G2o(format!(
            "line {line}: expected {N} values, found {}",
            fields.len()
        )));
    }
    let mut out = [0.0; N];
    for (value, field) in out.iter_mut().zip(fields) {
        *value = field
            .parse()
            .map_err(|_| MappingError::G2o(format!("line {line}: invalid number '{field}'")))?;
    }
    Ok(out)
}

fn id(field: Option<&&str>, line: usize) -> Result<u32> {
    field
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| MappingError::G2o(format!("line {line}: invalid vertex id")))
}

/// Serializes the graph, vertex ids being node indices.
pub fn to_g2o_string(graph: &PoseGraph) -> String {
    let mut out = String::new();
    for (i, pose) in graph.poses.column_iter().enumerate() {
        let _ = writeln!(out, "VERTEX_SE2 {i} {} {} {}", pose[0], pose[1], pose[2]);
    }
    for (e, edge) in graph.edges.iter().enumerate() {
        let (from, to) = graph.endpoints(e);
        let z = &edge.measurement;
        let o = &edge.information;
        let _ = writeln!(
            out,
            "EDGE_SE2 {from} {to} {} {} {} {} {} {} {} {} {}",
            z.x,
            z.y,
            z.z,
            o[(0, 0)],
            o[(0, 1)],
            o[(0, 2)],
            o[(1, 1)],
            o[(1, 2)],
            o[(2, 2)]
        );
    }
    out
}

pub fn write_g2o<P: AsRef<Path>>(path: P, graph: &PoseGraph) -> Result<()> {
    fs::write(path, to_g2o_string(graph))?;
    Ok(())
}

/// Parses `VERTEX_SE2` and `EDGE_SE2` lines. Vertices are ordered by id.
pub fn parse_g2o(content: &str) -> Result<PoseGraph> {
    let mut vertices: Vec<(u32, Vector3<f64>)> = Vec::new();
    let mut raw_edges: Vec<(u32, u32, EdgeSE2)> = Vec::new();

    for (n, line) in content.lines().enumerate() {
        let n = n + 1;
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.first() {
            None => continue,
            Some(&"VERTEX_SE2") => {
                let id = id(fields.get(1), n)?;
                let [x, y, angle] = numbers::<3>(&fields[2..], n)?;
                vertices.push((id, Vector3::new(x, y, angle)));
            }
            Some(&"EDGE_SE2") => {
                let from = id(fields.get(1), n)?;
                let to = id(fields.get(2), n)?;
                let [x, y, angle, i_11, i_12, i_13, i_22, i_23, i_33] =
                    numbers::<9>(fields.get(3..).unwrap_or_default(), n)?;

                #[rustfmt::skip]
                let information = Matrix3::new(
                    i_11, i_12, i_13,
                    i_12, i_22, i_23,
                    i_13, i_23, i_33
                );
                let kind = if to == from + 1 {
                    EdgeKind::Odometry
                } else {
                    EdgeKind::LoopClosure
                };
                raw_edges.push((from, to, EdgeSE2::new(Vector3::new(x, y, angle), information, kind)));
            }
            Some(other) => {
                return Err(MappingError::G2o(format!("line {n}: unsupported element {other}")));
            }
        }
    }

    vertices.sort_by_key(|(id, _)| *id);
    let lut: FxHashMap<u32, usize> = vertices.iter().enumerate().map(|(i, (id, _))| (*id, i)).collect();
    if lut.len() != vertices.len() {
        return Err(MappingError::G2o("duplicate vertex id".to_owned()));
    }

    let mut pairs = Vec::with_capacity(raw_edges.len());
    let mut edges = Vec::with_capacity(raw_edges.len());
    for (from, to, edge) in raw_edges {
        let (Some(&i), Some(&j)) = (lut.get(&from), lut.get(&to)) else {
            return Err(MappingError::G2o(format!("edge {from} -> {to} references an unknown vertex")));
        };
        pairs.push((i, j));
        edges.push(edge);
    }

    let poses: Vec<Vector3<f64>> = vertices.into_iter().map(|(_, pose)| pose).collect();
    PoseGraph::new(Matrix3xX::from_columns(&poses), &pairs, edges)
}

pub fn read_g2o<P: AsRef<Path>>(path: P) -> Result<PoseGraph> {
    parse_g2o(&fs::read_to_string(path)?)
}

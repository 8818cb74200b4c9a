//! CSV input of raw paths and CSV output of poses and map polygons.

use nalgebra::{Matrix3xX, Vector2};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;

use crate::error::{MappingError, Result};

#[derive(Debug, Serialize, Deserialize)]
struct PointRow {
    x: f64,
    y: f64,
}

#[derive(Debug, Serialize)]
struct PoseRow {
    x: f64,
    y: f64,
    theta: f64,
}

/// Reads `x,y` rows, with or without a header line.
pub fn read_path_from<R: io::Read>(reader: R) -> Result<Vec<Vector2<f64>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let mut path = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        if record.len() != 2 {
            return Err(MappingError::MalformedPath(format!(
                "line {}: expected 2 columns, found {}",
                line + 1,
                record.len()
            )));
        }
        let row: PointRow = match record.deserialize(None) {
            Ok(row) => row,
            // a leading non-numeric row is the header
            Err(_) if line == 0 && record.iter().all(|f| f.parse::<f64>().is_err()) => continue,
            Err(err) => {
                return Err(MappingError::MalformedPath(format!("line {}: {err}", line + 1)));
            }
        };
        if !row.x.is_finite() || !row.y.is_finite() {
            return Err(MappingError::MalformedPath(format!(
                "line {}: non-finite coordinate",
                line + 1
            )));
        }
        path.push(Vector2::new(row.x, row.y));
    }

    if path.len() < 3 {
        return Err(MappingError::PathTooShort { len: path.len() });
    }
    Ok(path)
}

pub fn read_path<P: AsRef<Path>>(path: P) -> Result<Vec<Vector2<f64>>> {
    read_path_from(std::fs::File::open(path)?)
}

pub fn write_poses_to<W: io::Write>(writer: W, poses: &Matrix3xX<f64>) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    for pose in poses.column_iter() {
        writer.serialize(PoseRow {
            x: pose[0],
            y: pose[1],
            theta: pose[2],
        })?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_poses<P: AsRef<Path>>(path: P, poses: &Matrix3xX<f64>) -> Result<()> {
    write_poses_to(std::fs::File::create(path)?, poses)
}

pub fn write_polygon_to<W: io::Write>(writer: W, polygon: &[Vector2<f64>]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    for p in polygon {
        writer.serialize(PointRow { x: p.x, y: p.y })?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_polygon<P: AsRef<Path>>(path: P, polygon: &[Vector2<f64>]) -> Result<()> {
    write_polygon_to(std::fs::File::create(path)?, polygon)
}

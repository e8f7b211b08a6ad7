//! Reader for LAS and LAZ files, built directly on the `las`/`laz` crates'
//! public point-stream API (point data is already projected and scaled to
//! real-world coordinates by the time the `las` crate hands it to us).

use super::{clamp_color, io_err, Metadata, Portion, PointReader, StreamTransform, PORTION_SIZE, STREAM_BATCH_SIZE};
use crate::error::{Result, TilerError};
use crate::geometry::aabb::Aabb;
use crate::geometry::point::PointBatch;
use las::{Read, Reader};
use nalgebra::Point3;
use std::path::{Path, PathBuf};

pub struct LasReader;

impl PointReader for LasReader {
    fn inspect(path: &Path) -> Result<Metadata> {
        let reader = Reader::from_path(path).map_err(|e| data_format_err(path, e))?;
        let header = reader.header();
        let point_count = header.number_of_points();
        if point_count == 0 {
            return Err(TilerError::DataFormat {
                path: path.to_path_buf(),
                message: "file contains no points".to_string(),
            });
        }
        let bounds = header.bounds();
        let aabb = Aabb::new(
            Point3::new(bounds.min.x, bounds.min.y, bounds.min.z),
            Point3::new(bounds.max.x, bounds.max.y, bounds.max.z),
        )
        .make_valid();

        let mut portions = Vec::new();
        let mut start = 0u64;
        while start < point_count {
            let end = (start + PORTION_SIZE).min(point_count);
            portions.push(Portion {
                start_point: start,
                end_point: end,
                byte_offset: start,
            });
            start = end;
        }

        Ok(Metadata {
            portions,
            avg_min: aabb.min,
            aabb,
            crs: None,
            point_count,
        })
    }

    fn stream(
        path: &Path,
        portion: &Portion,
        transform: StreamTransform,
        color_scale: Option<f32>,
        emit_intensity: bool,
    ) -> Result<Box<dyn Iterator<Item = Result<PointBatch>>>> {
        let path = path.to_path_buf();
        let portion = portion.clone();
        Ok(Box::new(LasStream::new(path, portion, transform, color_scale, emit_intensity)?))
    }
}

fn data_format_err(path: &Path, e: las::Error) -> TilerError {
    match e {
        las::Error::Io(io_e) => io_err(path, io_e),
        other => TilerError::DataFormat {
            path: path.to_path_buf(),
            message: other.to_string(),
        },
    }
}

struct LasStream {
    reader: Reader<std::io::BufReader<std::fs::File>>,
    path: PathBuf,
    remaining: u64,
    transform: StreamTransform,
    color_scale: Option<f32>,
    emit_intensity: bool,
}

impl LasStream {
    fn new(
        path: PathBuf,
        portion: Portion,
        transform: StreamTransform,
        color_scale: Option<f32>,
        emit_intensity: bool,
    ) -> Result<Self> {
        let mut reader = Reader::from_path(&path).map_err(|e| data_format_err(&path, e))?;
        reader
            .seek(portion.byte_offset)
            .map_err(|e| data_format_err(&path, e))?;
        Ok(LasStream {
            reader,
            path,
            remaining: portion.point_count(),
            transform,
            color_scale,
            emit_intensity,
        })
    }

    fn next_batch(&mut self) -> Result<Option<PointBatch>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let take = (self.remaining as usize).min(STREAM_BATCH_SIZE);
        let mut batch = PointBatch::with_capacity(take);
        for _ in 0..take {
            let point = match self.reader.read_point() {
                Ok(Some(p)) => p,
                Ok(None) => break,
                Err(e) => return Err(data_format_err(&self.path, e)),
            };
            let raw = Point3::new(point.x, point.y, point.z);
            let xyz = self.transform.apply(raw);
            let rgb = match point.color {
                Some(c) => [
                    clamp_color((c.red >> 8) as f32, self.color_scale),
                    clamp_color((c.green >> 8) as f32, self.color_scale),
                    clamp_color((c.blue >> 8) as f32, self.color_scale),
                ],
                None => [0, 0, 0],
            };
            let intensity = if self.emit_intensity {
                (point.intensity >> 8) as u8
            } else {
                0
            };
            let classification: u8 = u8::from(point.classification);
            batch.push(xyz, rgb, classification, intensity);
        }
        self.remaining -= batch.len() as u64;
        Ok(Some(batch))
    }
}

impl Iterator for LasStream {
    type Item = Result<PointBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_batch() {
            Ok(Some(batch)) if !batch.is_empty() => Some(Ok(batch)),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

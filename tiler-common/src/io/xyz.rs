//! Reader for whitespace/comma/tab-delimited XYZ and CSV point files.
//!
//! Column semantics are fixed by column count: 3 columns mean XYZ, 4 mean
//! XYZI, 6 mean XYZRGB, 7 mean XYZIRGB, 8 add a trailing classification
//! column; any further columns are ignored. A short sniff of the first 2 KB
//! infers the delimiter and whether a header line is present.

use super::{clamp_color, io_err, Metadata, Portion, PointReader, StreamTransform, PORTION_SIZE, STREAM_BATCH_SIZE};
use crate::error::{Result, TilerError};
use crate::geometry::aabb::Aabb;
use crate::geometry::point::PointBatch;
use nalgebra::Point3;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

fn sniff_delimiter(sample: &str) -> u8 {
    for candidate in [b',', b';', b'\t', b' '] {
        if sample.as_bytes().contains(&candidate) {
            return candidate;
        }
    }
    b' '
}

fn has_header(first_line: &str, delimiter: u8) -> bool {
    first_line
        .split(delimiter as char)
        .any(|field| field.trim().parse::<f64>().is_err())
}

pub struct XyzReader;

impl PointReader for XyzReader {
    fn inspect(path: &Path) -> Result<Metadata> {
        let file = File::open(path).map_err(|e| io_err(path, e))?;
        let mut reader = BufReader::new(file);

        let mut sample = vec![0u8; 2048];
        let n = reader.read(&mut sample).map_err(|e| io_err(path, e))?;
        sample.truncate(n);
        let sample_str = String::from_utf8_lossy(&sample).to_string();
        let delimiter = sniff_delimiter(&sample_str);

        reader.seek(SeekFrom::Start(0)).map_err(|e| io_err(path, e))?;
        let mut first_line = String::new();
        let header_len = reader
            .read_line(&mut first_line)
            .map_err(|e| io_err(path, e))?;
        let header_present = has_header(&first_line, delimiter);

        let data_start: u64 = if header_present { header_len as u64 } else { 0 };
        reader.seek(SeekFrom::Start(data_start)).map_err(|e| io_err(path, e))?;

        let mut aabb: Option<Aabb> = None;
        let mut count: u64 = 0;
        let mut portions = Vec::new();
        let mut portion_start_point = 0u64;
        let mut portion_start_offset = data_start;

        let mut line = String::new();
        loop {
            line.clear();
            let pos_before = reader.stream_position().map_err(|e| io_err(path, e))?;
            let n = reader.read_line(&mut line).map_err(|e| io_err(path, e))?;
            if n == 0 {
                break;
            }
            let fields: Vec<&str> = line.trim_end().split(delimiter as char).collect();
            if fields.len() < 3 {
                continue;
            }
            let x: f64 = fields[0].trim().parse().unwrap_or(0.0);
            let y: f64 = fields[1].trim().parse().unwrap_or(0.0);
            let z: f64 = fields[2].trim().parse().unwrap_or(0.0);
            let p = Point3::new(x, y, z);
            aabb = Some(match aabb {
                Some(mut a) => {
                    a.extend_union(&Aabb::new(p, p));
                    a
                }
                None => Aabb::new(p, p),
            });

            if count > 0 && count % PORTION_SIZE == 0 {
                portions.push(Portion {
                    start_point: portion_start_point,
                    end_point: count,
                    byte_offset: portion_start_offset,
                });
                portion_start_point = count;
                portion_start_offset = pos_before;
            }
            count += 1;
        }

        if count == 0 {
            return Err(TilerError::DataFormat {
                path: path.to_path_buf(),
                message: "file contains no points".to_string(),
            });
        }
        portions.push(Portion {
            start_point: portion_start_point,
            end_point: count,
            byte_offset: portion_start_offset,
        });

        let aabb = aabb.unwrap().make_valid();
        let avg_min = aabb.min;
        Ok(Metadata {
            portions,
            aabb,
            crs: None,
            point_count: count,
            avg_min,
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
        Ok(Box::new(XyzStream::new(path, portion, transform, color_scale, emit_intensity)?))
    }
}

// Delimiter detection needs a second, cheap sniff when streaming a portion in
// isolation (a worker thread does not retain the dispatcher's inspect-time state).
fn sniff_delimiter_at(path: &Path) -> Result<u8> {
    let mut file = File::open(path).map_err(|e| io_err(path, e))?;
    let mut sample = vec![0u8; 2048];
    let n = file.read(&mut sample).map_err(|e| io_err(path, e))?;
    sample.truncate(n);
    Ok(sniff_delimiter(&String::from_utf8_lossy(&sample)))
}

struct XyzStream {
    reader: BufReader<File>,
    path: PathBuf,
    remaining: u64,
    transform: StreamTransform,
    color_scale: Option<f32>,
    emit_intensity: bool,
    delimiter: u8,
    column_count: Option<usize>,
}

impl XyzStream {
    fn new(
        path: PathBuf,
        portion: Portion,
        transform: StreamTransform,
        color_scale: Option<f32>,
        emit_intensity: bool,
    ) -> Result<Self> {
        let delimiter = sniff_delimiter_at(&path)?;
        let mut file = File::open(&path).map_err(|e| io_err(&path, e))?;
        file.seek(SeekFrom::Start(portion.byte_offset)).map_err(|e| io_err(&path, e))?;
        Ok(XyzStream {
            reader: BufReader::new(file),
            path,
            remaining: portion.point_count(),
            transform,
            color_scale,
            emit_intensity,
            delimiter,
            column_count: None,
        })
    }

    fn next_batch(&mut self) -> Result<Option<PointBatch>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let take = (self.remaining as usize).min(STREAM_BATCH_SIZE);
        let mut batch = PointBatch::with_capacity(take);
        let mut line = String::new();
        for _ in 0..take {
            line.clear();
            let n = self.reader.read_line(&mut line).map_err(|e| io_err(&self.path, e))?;
            if n == 0 {
                break;
            }
            let fields: Vec<&str> = line.trim_end().split(self.delimiter as char).collect();
            let column_count = *self.column_count.get_or_insert(fields.len().clamp(3, 8));

            let parse = |i: usize| -> f64 { fields.get(i).and_then(|s| s.trim().parse().ok()).unwrap_or(0.0) };
            let x = parse(0);
            let y = parse(1);
            let z = parse(2);
            let raw = Point3::new(x, y, z);
            let xyz = self.transform.apply(raw);

            let (rgb, intensity, classification) = match column_count {
                3 => ([0, 0, 0], 0.0, 0),
                4 => ([0, 0, 0], parse(3), 0),
                6 => (
                    [parse(3) as f32, parse(4) as f32, parse(5) as f32],
                    0.0,
                    0,
                ),
                7 => (
                    [parse(4) as f32, parse(5) as f32, parse(6) as f32],
                    parse(3),
                    0,
                ),
                _ => (
                    [parse(4) as f32, parse(5) as f32, parse(6) as f32],
                    parse(3),
                    parse(7) as u8,
                ),
            };
            let rgb_u8 = [
                clamp_color(rgb[0], self.color_scale),
                clamp_color(rgb[1], self.color_scale),
                clamp_color(rgb[2], self.color_scale),
            ];
            let intensity_u8 = if self.emit_intensity { intensity as u8 } else { 0 };
            batch.push(xyz, rgb_u8, classification, intensity_u8);
        }
        self.remaining -= batch.len() as u64;
        if self.remaining > 0 && batch.len() < take {
            // file ended early; stop requesting more than was actually available
            self.remaining = 0;
        }
        Ok(Some(batch))
    }
}

impl Iterator for XyzStream {
    type Item = Result<PointBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_batch() {
            Ok(Some(batch)) if !batch.is_empty() => Some(Ok(batch)),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp(contents: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("tiler-xyz-test-{:p}.xyz", &contents as *const _));
        let mut f = File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn inspects_simple_xyz_file() {
        let path = write_tmp("0 0 0\n1 1 1\n");
        let meta = XyzReader::inspect(&path).unwrap();
        assert_eq!(meta.point_count, 2);
        assert_eq!(meta.portions.len(), 1);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn column_count_determines_semantics() {
        assert_eq!(has_header("not,a,number", b','), true);
        assert_eq!(has_header("1.0,2.0,3.0", b','), false);
    }
}

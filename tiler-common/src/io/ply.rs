//! Reader for ASCII and binary (little/big-endian) PLY point clouds.
//!
//! Only scalar vertex properties are understood; list properties (e.g. face
//! indices) are rejected during header parsing since a point cloud has none.

use super::{clamp_color, io_err, Metadata, Portion, PointReader, StreamTransform, PORTION_SIZE, STREAM_BATCH_SIZE};
use crate::error::{Result, TilerError};
use crate::geometry::aabb::Aabb;
use crate::geometry::point::PointBatch;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use nalgebra::Point3;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq)]
enum DataType {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
}

impl DataType {
    fn from_str(input: &str) -> Result<Self> {
        Ok(match input {
            "float" | "float32" => DataType::Float32,
            "double" | "float64" => DataType::Float64,
            "char" | "int8" => DataType::Int8,
            "uchar" | "uint8" => DataType::Uint8,
            "short" | "int16" => DataType::Int16,
            "ushort" | "uint16" => DataType::Uint16,
            "int" | "int32" => DataType::Int32,
            "uint" | "uint32" => DataType::Uint32,
            other => {
                return Err(TilerError::DataFormat {
                    path: PathBuf::new(),
                    message: format!("unsupported ply property type: {other}"),
                })
            }
        })
    }

    fn byte_len(self) -> usize {
        match self {
            DataType::Int8 | DataType::Uint8 => 1,
            DataType::Int16 | DataType::Uint16 => 2,
            DataType::Int32 | DataType::Uint32 | DataType::Float32 => 4,
            DataType::Float64 => 8,
        }
    }

    fn read(self, buf: &[u8], big_endian: bool) -> f64 {
        match (self, big_endian) {
            (DataType::Int8, _) => buf[0] as i8 as f64,
            (DataType::Uint8, _) => buf[0] as f64,
            (DataType::Int16, false) => LittleEndian::read_i16(buf) as f64,
            (DataType::Int16, true) => BigEndian::read_i16(buf) as f64,
            (DataType::Uint16, false) => LittleEndian::read_u16(buf) as f64,
            (DataType::Uint16, true) => BigEndian::read_u16(buf) as f64,
            (DataType::Int32, false) => LittleEndian::read_i32(buf) as f64,
            (DataType::Int32, true) => BigEndian::read_i32(buf) as f64,
            (DataType::Uint32, false) => LittleEndian::read_u32(buf) as f64,
            (DataType::Uint32, true) => BigEndian::read_u32(buf) as f64,
            (DataType::Float32, false) => LittleEndian::read_f32(buf) as f64,
            (DataType::Float32, true) => BigEndian::read_f32(buf) as f64,
            (DataType::Float64, false) => LittleEndian::read_f64(buf),
            (DataType::Float64, true) => BigEndian::read_f64(buf),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Format {
    Ascii,
    BinaryLittleEndian,
    BinaryBigEndian,
}

#[derive(Debug, Clone)]
struct ScalarProperty {
    name: String,
    data_type: DataType,
}

#[derive(Debug)]
struct Header {
    format: Format,
    vertex_count: u64,
    properties: Vec<ScalarProperty>,
}

impl Header {
    fn index_of(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p.name == name)
    }

    fn record_byte_len(&self) -> usize {
        self.properties.iter().map(|p| p.data_type.byte_len()).sum()
    }
}

fn parse_header<R: BufRead>(reader: &mut R, path: &Path) -> Result<(Header, u64)> {
    let mut header_len = 0u64;
    let mut line = String::new();
    header_len += reader.read_line(&mut line).map_err(|e| io_err(path, e))? as u64;
    if line.trim() != "ply" {
        return Err(TilerError::DataFormat {
            path: path.to_path_buf(),
            message: "not a ply file".to_string(),
        });
    }

    let mut format = None;
    let mut vertex_count = None;
    let mut properties = Vec::new();
    let mut in_vertex_element = false;

    loop {
        line.clear();
        let n = reader.read_line(&mut line).map_err(|e| io_err(path, e))?;
        if n == 0 {
            return Err(TilerError::DataFormat {
                path: path.to_path_buf(),
                message: "unexpected end of header".to_string(),
            });
        }
        header_len += n as u64;
        let entries: Vec<&str> = line.trim().split_whitespace().collect();
        if entries.is_empty() {
            continue;
        }
        match entries[0] {
            "format" if entries.len() == 3 => {
                format = Some(match entries[1] {
                    "ascii" => Format::Ascii,
                    "binary_little_endian" => Format::BinaryLittleEndian,
                    "binary_big_endian" => Format::BinaryBigEndian,
                    other => {
                        return Err(TilerError::DataFormat {
                            path: path.to_path_buf(),
                            message: format!("unsupported ply format: {other}"),
                        })
                    }
                });
            }
            "element" if entries.len() == 3 => {
                in_vertex_element = entries[1] == "vertex";
                if in_vertex_element {
                    vertex_count = Some(entries[2].parse::<u64>().map_err(|_| TilerError::DataFormat {
                        path: path.to_path_buf(),
                        message: format!("invalid vertex count: {}", entries[2]),
                    })?);
                }
            }
            "property" if in_vertex_element => {
                if entries.get(1) == Some(&"list") {
                    return Err(TilerError::DataFormat {
                        path: path.to_path_buf(),
                        message: "list properties are not supported on vertex elements".to_string(),
                    });
                }
                if entries.len() == 3 {
                    properties.push(ScalarProperty {
                        data_type: DataType::from_str(entries[1])?,
                        name: entries[2].to_string(),
                    });
                }
            }
            "end_header" => break,
            _ => {}
        }
    }

    let format = format.ok_or_else(|| TilerError::DataFormat {
        path: path.to_path_buf(),
        message: "no format specified".to_string(),
    })?;
    let vertex_count = vertex_count.unwrap_or(0);

    Ok((
        Header {
            format,
            vertex_count,
            properties,
        },
        header_len,
    ))
}

pub struct PlyReader;

impl PointReader for PlyReader {
    fn inspect(path: &Path) -> Result<Metadata> {
        let file = File::open(path).map_err(|e| io_err(path, e))?;
        let mut reader = BufReader::new(file);
        let (header, header_len) = parse_header(&mut reader, path)?;
        if header.vertex_count == 0 {
            return Err(TilerError::DataFormat {
                path: path.to_path_buf(),
                message: "file contains no points".to_string(),
            });
        }

        let x_idx = require_index(&header, "x", path)?;
        let y_idx = require_index(&header, "y", path)?;
        let z_idx = require_index(&header, "z", path)?;

        let mut aabb: Option<Aabb> = None;
        let mut portions = Vec::new();
        let mut portion_start_point = 0u64;
        let mut portion_start_offset = header_len;

        match header.format {
            Format::Ascii => {
                let mut line = String::new();
                let mut offset = header_len;
                for i in 0..header.vertex_count {
                    line.clear();
                    let n = reader.read_line(&mut line).map_err(|e| io_err(path, e))?;
                    if n == 0 {
                        break;
                    }
                    let fields: Vec<&str> = line.trim().split_whitespace().collect();
                    let p = Point3::new(
                        fields.get(x_idx).and_then(|s| s.parse().ok()).unwrap_or(0.0),
                        fields.get(y_idx).and_then(|s| s.parse().ok()).unwrap_or(0.0),
                        fields.get(z_idx).and_then(|s| s.parse().ok()).unwrap_or(0.0),
                    );
                    extend_aabb(&mut aabb, p);
                    if i > 0 && i % PORTION_SIZE == 0 {
                        portions.push(Portion {
                            start_point: portion_start_point,
                            end_point: i,
                            byte_offset: portion_start_offset,
                        });
                        portion_start_point = i;
                        portion_start_offset = offset;
                    }
                    offset += n as u64;
                }
            }
            Format::BinaryLittleEndian | Format::BinaryBigEndian => {
                let record_len = header.record_byte_len();
                let mut buf = vec![0u8; record_len];
                let big_endian = header.format == Format::BinaryBigEndian;
                for i in 0..header.vertex_count {
                    reader.read_exact(&mut buf).map_err(|e| io_err(path, e))?;
                    let p = Point3::new(
                        read_field(&header, &buf, x_idx, big_endian),
                        read_field(&header, &buf, y_idx, big_endian),
                        read_field(&header, &buf, z_idx, big_endian),
                    );
                    extend_aabb(&mut aabb, p);
                    if i > 0 && i % PORTION_SIZE == 0 {
                        portions.push(Portion {
                            start_point: portion_start_point,
                            end_point: i,
                            byte_offset: portion_start_offset,
                        });
                        portion_start_point = i;
                        portion_start_offset = header_len + i * record_len as u64;
                    }
                }
            }
        }

        portions.push(Portion {
            start_point: portion_start_point,
            end_point: header.vertex_count,
            byte_offset: portion_start_offset,
        });

        let aabb = aabb
            .ok_or_else(|| TilerError::DataFormat {
                path: path.to_path_buf(),
                message: "file contains no points".to_string(),
            })?
            .make_valid();
        let avg_min = aabb.min;

        Ok(Metadata {
            portions,
            aabb,
            crs: None,
            point_count: header.vertex_count,
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
        Ok(Box::new(PlyStream::new(path, portion, transform, color_scale, emit_intensity)?))
    }
}

fn require_index(header: &Header, name: &str, path: &Path) -> Result<usize> {
    header.index_of(name).ok_or_else(|| TilerError::DataFormat {
        path: path.to_path_buf(),
        message: format!("vertex element is missing required property '{name}'"),
    })
}

fn extend_aabb(aabb: &mut Option<Aabb>, p: Point3<f64>) {
    *aabb = Some(match aabb.take() {
        Some(mut a) => {
            a.extend_union(&Aabb::new(p, p));
            a
        }
        None => Aabb::new(p, p),
    });
}

fn read_field(header: &Header, buf: &[u8], idx: usize, big_endian: bool) -> f64 {
    let mut offset = 0usize;
    for (i, prop) in header.properties.iter().enumerate() {
        let len = prop.data_type.byte_len();
        if i == idx {
            return prop.data_type.read(&buf[offset..offset + len], big_endian);
        }
        offset += len;
    }
    0.0
}

struct PlyStream {
    reader: BufReader<File>,
    path: PathBuf,
    remaining: u64,
    transform: StreamTransform,
    color_scale: Option<f32>,
    emit_intensity: bool,
    header: Header,
    x_idx: usize,
    y_idx: usize,
    z_idx: usize,
    r_idx: Option<usize>,
    g_idx: Option<usize>,
    b_idx: Option<usize>,
    intensity_idx: Option<usize>,
    classification_idx: Option<usize>,
}

impl PlyStream {
    fn new(
        path: PathBuf,
        portion: Portion,
        transform: StreamTransform,
        color_scale: Option<f32>,
        emit_intensity: bool,
    ) -> Result<Self> {
        let file = File::open(&path).map_err(|e| io_err(&path, e))?;
        let mut reader = BufReader::new(file);
        let (header, _) = parse_header(&mut reader, &path)?;
        let x_idx = require_index(&header, "x", &path)?;
        let y_idx = require_index(&header, "y", &path)?;
        let z_idx = require_index(&header, "z", &path)?;
        let r_idx = header.index_of("red").or_else(|| header.index_of("r"));
        let g_idx = header.index_of("green").or_else(|| header.index_of("g"));
        let b_idx = header.index_of("blue").or_else(|| header.index_of("b"));
        let intensity_idx = header.index_of("intensity");
        let classification_idx = header.index_of("classification").or_else(|| header.index_of("class"));

        reader.seek(SeekFrom::Start(portion.byte_offset)).map_err(|e| io_err(&path, e))?;

        Ok(PlyStream {
            reader,
            path,
            remaining: portion.point_count(),
            transform,
            color_scale,
            emit_intensity,
            header,
            x_idx,
            y_idx,
            z_idx,
            r_idx,
            g_idx,
            b_idx,
            intensity_idx,
            classification_idx,
        })
    }

    fn next_batch(&mut self) -> Result<Option<PointBatch>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let take = (self.remaining as usize).min(STREAM_BATCH_SIZE);
        let mut batch = PointBatch::with_capacity(take);

        match self.header.format {
            Format::Ascii => {
                let mut line = String::new();
                for _ in 0..take {
                    line.clear();
                    let n = self.reader.read_line(&mut line).map_err(|e| io_err(&self.path, e))?;
                    if n == 0 {
                        break;
                    }
                    let fields: Vec<&str> = line.trim().split_whitespace().collect();
                    let field = |i: usize| -> f64 { fields.get(i).and_then(|s| s.parse().ok()).unwrap_or(0.0) };
                    self.push_point(&mut batch, field(self.x_idx), field(self.y_idx), field(self.z_idx), |idx| field(idx));
                }
            }
            Format::BinaryLittleEndian | Format::BinaryBigEndian => {
                let record_len = self.header.record_byte_len();
                let big_endian = self.header.format == Format::BinaryBigEndian;
                let mut buf = vec![0u8; record_len];
                for _ in 0..take {
                    match self.reader.read_exact(&mut buf) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                        Err(e) => return Err(io_err(&self.path, e)),
                    }
                    let header = &self.header;
                    let field = |idx: usize| read_field(header, &buf, idx, big_endian);
                    self.push_point(&mut batch, field(self.x_idx), field(self.y_idx), field(self.z_idx), field);
                }
            }
        }

        self.remaining -= batch.len() as u64;
        Ok(Some(batch))
    }

    fn push_point(&self, batch: &mut PointBatch, x: f64, y: f64, z: f64, field: impl Fn(usize) -> f64) {
        let raw = Point3::new(x, y, z);
        let xyz = self.transform.apply(raw);
        let rgb = [
            clamp_color(self.r_idx.map(&field).unwrap_or(0.0) as f32, self.color_scale),
            clamp_color(self.g_idx.map(&field).unwrap_or(0.0) as f32, self.color_scale),
            clamp_color(self.b_idx.map(&field).unwrap_or(0.0) as f32, self.color_scale),
        ];
        let intensity = if self.emit_intensity {
            self.intensity_idx.map(&field).unwrap_or(0.0) as u8
        } else {
            0
        };
        let classification = self.classification_idx.map(&field).unwrap_or(0.0) as u8;
        batch.push(xyz, rgb, classification, intensity);
    }
}

impl Iterator for PlyStream {
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

    fn write_tmp(contents: &[u8]) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("tiler-ply-test-{:p}.ply", &contents as *const _));
        let mut f = File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[test]
    fn inspects_ascii_ply_file() {
        let contents = b"ply\nformat ascii 1.0\nelement vertex 2\nproperty float x\nproperty float y\nproperty float z\nend_header\n0 0 0\n1 1 1\n";
        let path = write_tmp(contents);
        let meta = PlyReader::inspect(&path).unwrap();
        assert_eq!(meta.point_count, 2);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn rejects_list_properties() {
        let contents = b"ply\nformat ascii 1.0\nelement vertex 1\nproperty list uchar int vertex_indices\nend_header\n3 0 1 2\n";
        let path = write_tmp(contents);
        let err = PlyReader::inspect(&path);
        assert!(err.is_err());
        std::fs::remove_file(&path).ok();
    }
}

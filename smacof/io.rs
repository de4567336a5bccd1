// ========================================================================================
//
//                        Input and output collaborators
//
// ========================================================================================
//
// Distance and weight matrices are square matrices of 16-bit signed integers, read
// row-block by row-block for the rows a worker owns. When the run uses repetitions the
// file holds a smaller base matrix and global `(row, col)` maps onto
// `(row mod base, col mod base)`. Text inputs (initial mapping, simple weights, labels)
// are small and parsed in full by a single thread.

use crate::config::{SolverConfig, WeightMode};
use crate::distances::{DistanceStore, DistanceTransform, QuantizedRows, RleLengthError, RleRows, WeightView, decode, encode};
use crate::types::{PointSet, RowRange};
use log::debug;
use memchr::memchr_iter;
use memmap2::Mmap;
use rayon::prelude::*;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("could not access '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("'{path}' holds {found} bytes, a {side}x{side} matrix of 16-bit values needs {expected}")]
    MatrixSize {
        path: PathBuf,
        side: usize,
        expected: u64,
        found: u64,
    },
    #[error("dense matrix holds {found} values, expected {expected}")]
    DenseShape { expected: usize, found: usize },
    #[error("malformed line {line} in '{path}': {reason}")]
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("'{path}' provides {found} {what}, expected {expected}")]
    Count {
        path: PathBuf,
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("the distance source holds {found} points, the run needs {expected}")]
    SourceSize { expected: usize, found: usize },
    #[error("run-length weights are inconsistent: {0}")]
    Rle(#[from] RleLengthError),
    #[error("no {0} was configured")]
    NotConfigured(&'static str),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> InputError + '_ {
    move |source| InputError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ----------------------------------------------------------------------------------------
//  Matrix sources
// ----------------------------------------------------------------------------------------

/// Provides the quantized rows of an `N x N` matrix.
pub trait DistanceSource: Send + Sync {
    fn n_points(&self) -> usize;

    /// Quantized values of `rows`, each spanning all `N` columns.
    fn read_rows(&self, rows: RowRange) -> Result<QuantizedRows, InputError>;
}

/// A matrix held in memory, quantized once at construction.
#[derive(Debug, Clone)]
pub struct DenseDistanceSource {
    n: usize,
    raw: Vec<i16>,
}

impl DenseDistanceSource {
    /// Quantizes `values` (row-major, `n x n`, missing entries negative).
    pub fn from_values(n: usize, values: &[f64]) -> Result<Self, InputError> {
        if values.len() != n * n {
            return Err(InputError::DenseShape {
                expected: n * n,
                found: values.len(),
            });
        }
        let raw = values.par_iter().map(|&value| encode(value)).collect();
        Ok(Self { n, raw })
    }

    pub fn from_raw(n: usize, raw: Vec<i16>) -> Result<Self, InputError> {
        if raw.len() != n * n {
            return Err(InputError::DenseShape {
                expected: n * n,
                found: raw.len(),
            });
        }
        Ok(Self { n, raw })
    }
}

impl DistanceSource for DenseDistanceSource {
    fn n_points(&self) -> usize {
        self.n
    }

    fn read_rows(&self, rows: RowRange) -> Result<QuantizedRows, InputError> {
        let data = self.raw[rows.start() * self.n..rows.end() * self.n].to_vec();
        QuantizedRows::new(rows, self.n, data).ok_or(InputError::DenseShape {
            expected: rows.len() * self.n,
            found: 0,
        })
    }
}

/// A memory-mapped binary matrix file.
#[derive(Debug)]
pub struct BinaryMatrixFile {
    path: PathBuf,
    mmap: Mmap,
    base: usize,
    n_points: usize,
    big_endian: bool,
}

impl BinaryMatrixFile {
    /// Maps `path`, which must hold a `base x base` matrix with
    /// `base = n_points / repetitions`.
    pub fn open(
        path: &Path,
        n_points: usize,
        repetitions: usize,
        big_endian: bool,
    ) -> Result<Self, InputError> {
        let base = n_points / repetitions.max(1);
        let file = File::open(path).map_err(io_error(path))?;
        // SAFETY: the input matrix is treated as read-only for the lifetime of the run.
        let mmap = unsafe { Mmap::map(&file) }.map_err(io_error(path))?;
        let expected = (base * base * 2) as u64;
        let found = mmap.len() as u64;
        if found != expected {
            return Err(InputError::MatrixSize {
                path: path.to_path_buf(),
                side: base,
                expected,
                found,
            });
        }
        debug!(
            "Mapped {} ({}x{} base matrix, {} repetitions)",
            path.display(),
            base,
            base,
            repetitions
        );
        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            base,
            n_points,
            big_endian,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    fn value(&self, row: usize, col: usize) -> i16 {
        let offset = ((row % self.base) * self.base + col % self.base) * 2;
        let bytes = [self.mmap[offset], self.mmap[offset + 1]];
        if self.big_endian {
            i16::from_be_bytes(bytes)
        } else {
            i16::from_le_bytes(bytes)
        }
    }
}

impl DistanceSource for BinaryMatrixFile {
    fn n_points(&self) -> usize {
        self.n_points
    }

    fn read_rows(&self, rows: RowRange) -> Result<QuantizedRows, InputError> {
        let n = self.n_points;
        let mut data = Vec::with_capacity(rows.len() * n);
        for row in rows.iter() {
            data.extend((0..n).map(|col| self.value(row, col)));
        }
        QuantizedRows::new(rows, n, data).ok_or(InputError::DenseShape {
            expected: rows.len() * n,
            found: 0,
        })
    }
}

/// Where base weights come from.
#[derive(Clone)]
pub enum WeightSource {
    Uniform,
    Matrix(Arc<dyn DistanceSource>),
    Rle(Arc<dyn DistanceSource>),
    Simple(Arc<[f64]>),
}

impl WeightSource {
    /// Builds the weight view of `rows`.
    pub fn view(&self, rows: RowRange) -> Result<WeightView, InputError> {
        Ok(match self {
            WeightSource::Uniform => WeightView::Uniform,
            WeightSource::Matrix(source) => WeightView::Matrix(source.read_rows(rows)?),
            WeightSource::Rle(source) => {
                let quantized = source.read_rows(rows)?;
                let n = quantized.n_cols();
                let dense: Vec<f64> = rows
                    .iter()
                    .flat_map(|row| quantized.row(row).iter().map(|&raw| decode(raw)))
                    .collect();
                WeightView::Rle(RleRows::compress(rows, n, &dense)?)
            }
            WeightSource::Simple(points) => WeightView::Simple(Arc::clone(points)),
        })
    }
}

/// Everything a worker needs to build its [`DistanceStore`].
#[derive(Clone)]
pub struct InputSet {
    pub distances: Arc<dyn DistanceSource>,
    pub weights: WeightSource,
    pub transform: DistanceTransform,
    pub sammon: bool,
}

impl InputSet {
    /// Opens the files named by `config`.
    pub fn from_config(config: &SolverConfig) -> Result<Self, InputError> {
        let n = config.number_data_points;
        let distance_path = config
            .distance_matrix_file
            .as_deref()
            .ok_or(InputError::NotConfigured("distance matrix file"))?;
        let distances: Arc<dyn DistanceSource> = Arc::new(BinaryMatrixFile::open(
            distance_path,
            n,
            config.repetitions,
            config.big_endian,
        )?);

        let weights = match (&config.weight_matrix_file, config.weight_mode) {
            (None, _) => WeightSource::Uniform,
            (Some(path), WeightMode::Simple) => {
                let values = read_simple_weights(path, config.base_points())?;
                let values: Vec<f64> = (0..n).map(|i| values[i % values.len()]).collect();
                WeightSource::Simple(Arc::from(values))
            }
            (Some(path), mode) => {
                let file = BinaryMatrixFile::open(path, n, config.repetitions, config.big_endian)?;
                if mode == WeightMode::Rle {
                    WeightSource::Rle(Arc::new(file))
                } else {
                    WeightSource::Matrix(Arc::new(file))
                }
            }
        };

        Ok(Self {
            distances,
            weights,
            transform: config.distance_transform,
            sammon: config.is_sammon,
        })
    }

    /// An in-memory input with uniform weights.
    pub fn in_memory(n: usize, values: &[f64]) -> Result<Self, InputError> {
        Ok(Self {
            distances: Arc::new(DenseDistanceSource::from_values(n, values)?),
            weights: WeightSource::Uniform,
            transform: DistanceTransform::Identity,
            sammon: false,
        })
    }

    pub fn store(&self, rows: RowRange) -> Result<DistanceStore, InputError> {
        Ok(DistanceStore::new(
            self.distances.read_rows(rows)?,
            self.weights.view(rows)?,
            self.transform,
            self.sammon,
        ))
    }
}

// ----------------------------------------------------------------------------------------
//  Text inputs
// ----------------------------------------------------------------------------------------

/// Non-empty lines of `bytes` with their 1-based line numbers.
fn lines(bytes: &[u8]) -> impl Iterator<Item = (usize, &[u8])> {
    let mut start = 0;
    let ends = memchr_iter(b'\n', bytes).chain(std::iter::once(bytes.len()));
    ends.enumerate().filter_map(move |(index, end)| {
        let line = &bytes[start.min(end)..end];
        start = end + 1;
        let line = line.trim_ascii();
        (!line.is_empty()).then_some((index + 1, line))
    })
}

fn parse_field(path: &Path, line: usize, field: &[u8]) -> Result<f64, InputError> {
    lexical_core::parse::<f64>(field.trim_ascii()).map_err(|err| InputError::Malformed {
        path: path.to_path_buf(),
        line,
        reason: format!("'{}' is not a number ({err})", String::from_utf8_lossy(field)),
    })
}

/// Reads an `n x dim` tab-separated point file. Extra columns are ignored.
pub fn read_initial_mapping(path: &Path, n: usize, dim: usize) -> Result<Vec<f64>, InputError> {
    let bytes = fs::read(path).map_err(io_error(path))?;
    let mut points = Vec::with_capacity(n * dim);
    let mut rows = 0;
    for (line_no, line) in lines(&bytes) {
        rows += 1;
        if rows > n {
            continue;
        }
        let mut fields = line.split(|&b| b == b'\t');
        for column in 0..dim {
            let field = fields.next().ok_or_else(|| InputError::Malformed {
                path: path.to_path_buf(),
                line: line_no,
                reason: format!("expected {dim} columns, found {column}"),
            })?;
            points.push(parse_field(path, line_no, field)?);
        }
    }
    if rows != n {
        return Err(InputError::Count {
            path: path.to_path_buf(),
            what: "points",
            expected: n,
            found: rows,
        });
    }
    Ok(points)
}

/// Reads one weight per line.
pub fn read_simple_weights(path: &Path, n: usize) -> Result<Vec<f64>, InputError> {
    let bytes = fs::read(path).map_err(io_error(path))?;
    let values = lines(&bytes)
        .map(|(line_no, line)| parse_field(path, line_no, line))
        .collect::<Result<Vec<_>, _>>()?;
    if values.len() != n {
        return Err(InputError::Count {
            path: path.to_path_buf(),
            what: "weights",
            expected: n,
            found: values.len(),
        });
    }
    Ok(values)
}

/// Reads `id label` lines.
pub fn read_labels(path: &Path) -> Result<HashMap<usize, String>, InputError> {
    let text = fs::read_to_string(path).map_err(io_error(path))?;
    let mut labels = HashMap::new();
    for (index, line) in text.lines().enumerate() {
        let mut fields = line.split_whitespace();
        let Some(id) = fields.next() else {
            continue;
        };
        let id = id.parse::<usize>().map_err(|err| InputError::Malformed {
            path: path.to_path_buf(),
            line: index + 1,
            reason: format!("'{id}' is not a point index ({err})"),
        })?;
        labels.insert(id, fields.next().unwrap_or("1").to_string());
    }
    Ok(labels)
}

// ----------------------------------------------------------------------------------------
//  Output
// ----------------------------------------------------------------------------------------

/// At most ten fractional digits, without trailing zeros.
pub fn format_coordinate(value: f64) -> String {
    let mut text = format!("{value:.10}");
    if text.contains('.') {
        let trimmed = text.trim_end_matches('0').trim_end_matches('.').len();
        text.truncate(trimmed);
    }
    if text == "-0" {
        text.remove(0);
    }
    text
}

/// Writes `index \t x_1 \t ... \t x_D \t label` per point; the label defaults to `1`.
pub fn write_points(
    path: &Path,
    points: &PointSet,
    labels: Option<&HashMap<usize, String>>,
) -> Result<(), InputError> {
    let file = File::create(path).map_err(io_error(path))?;
    let mut writer = BufWriter::new(file);
    let mut line = String::new();
    for (index, point) in points.rows().into_iter().enumerate() {
        line.clear();
        // Writing into a String cannot fail.
        let _ = write!(line, "{index}");
        for &coordinate in point {
            line.push('\t');
            line.push_str(&format_coordinate(coordinate));
        }
        line.push('\t');
        line.push_str(labels.and_then(|l| l.get(&index)).map_or("1", String::as_str));
        line.push('\n');
        writer.write_all(line.as_bytes()).map_err(io_error(path))?;
    }
    writer.flush().map_err(io_error(path))
}

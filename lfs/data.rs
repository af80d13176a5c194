//! # Data Loading and Writing
//!
//! Reads delimited text with a header row into the matrix the engine is built from, and
//! writes the selection matrix back out.
//!
//! - Delimiters: tab, comma or runs of whitespace, detected from the header line.
//! - Rows with a missing or non-numeric value in a used column are skipped and counted,
//!   not treated as errors.
//! - Class values must be integral; distinct values become ids `0..` in ascending order.

use crate::rng::entropy_seed;
use ahash::AHashMap;
use itertools::Itertools;
use ndarray::{Array2, ArrayView2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Error from the CSV reader or writer: {0}")]
    CsvError(#[from] csv::Error),
    #[error("The input file has no header row.")]
    MissingHeader,
    #[error("The column '{0}' was not found in the input file. Please check spelling and case.")]
    ColumnNotFound(String),
    #[error("No usable rows in the selected range ({skipped} skipped).")]
    NoValidRows { skipped: usize },
    #[error("At least two classes are required, found {found}.")]
    TooFewClasses { found: usize },
    #[error("The selection matrix is {found:?}, but the dataset is {expected:?}.")]
    ShapeMismatch {
        found: (usize, usize),
        expected: (usize, usize),
    },
    #[error("Failed to assemble the feature matrix: {0}")]
    ShapeError(#[from] ndarray::ShapeError),
    #[error("Invalid synthetic dataset parameters: {0}")]
    InvalidSynthetic(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Delimiter {
    Byte(u8),
    Whitespace,
}

fn detect_delimiter(header: &str) -> Delimiter {
    if header.contains('\t') {
        Delimiter::Byte(b'\t')
    } else if header.contains(',') {
        Delimiter::Byte(b',')
    } else {
        Delimiter::Whitespace
    }
}

/// Which columns and rows to load.
#[derive(Clone, Debug, Default)]
pub struct ReadOptions {
    /// Feature column names; every column except the class column when `None`.
    pub features: Option<Vec<String>>,
    /// Class column name; the last column when `None`.
    pub class_column: Option<String>,
    /// First data row to consider (0-based, header excluded).
    pub start_row: usize,
    /// One past the last data row to consider.
    pub end_row: Option<usize>,
}

/// A loaded, validated table.
#[derive(Clone, Debug)]
pub struct Dataset {
    pub feature_names: Vec<String>,
    pub class_name: String,
    /// `n_rows × n_features`, rows in file order.
    pub features: Array2<f64>,
    /// Class id of every loaded row.
    pub classes: Vec<usize>,
    /// Original class value of every id.
    pub class_labels: Vec<i64>,
    /// Data row (0-based, header excluded) each loaded row came from.
    pub source_rows: Vec<usize>,
    /// Data rows inside the selected range.
    pub total_rows: usize,
    pub skipped_rows: usize,
}

impl Dataset {
    pub fn n_rows(&self) -> usize {
        self.features.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.features.ncols()
    }

    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.class_labels.len()];
        for c in &self.classes {
            counts[*c] += 1;
        }
        counts
    }

    /// The `n × (n_features + 1)` matrix [`crate::Lfs::new`] takes: features, then class id.
    pub fn engine_matrix(&self) -> Array2<f64> {
        let (n, p) = self.features.dim();
        let mut out = Array2::zeros((n, p + 1));
        out.slice_mut(ndarray::s![.., ..p]).assign(&self.features);
        for (row, class) in self.classes.iter().enumerate() {
            out[[row, p]] = *class as f64;
        }
        out
    }

    pub fn log_summary(&self) {
        log::info!(
            "Loaded {} of {} rows ({} skipped), {} features, class column '{}'.",
            self.n_rows(),
            self.total_rows,
            self.skipped_rows,
            self.n_features(),
            self.class_name
        );
        for (label, count) in self.class_labels.iter().zip(self.class_counts()) {
            log::info!("  class {label}: {count} rows");
        }
    }
}

fn split_records(text: &str, delimiter: Delimiter) -> Result<Vec<Vec<String>>, DataError> {
    match delimiter {
        Delimiter::Whitespace => Ok(text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| line.split_whitespace().map(str::to_string).collect())
            .collect()),
        Delimiter::Byte(byte) => {
            let mut reader = csv::ReaderBuilder::new()
                .delimiter(byte)
                .has_headers(false)
                .flexible(true)
                .trim(csv::Trim::All)
                .from_reader(text.as_bytes());
            let mut records = Vec::new();
            for record in reader.records() {
                let record = record?;
                if record.iter().all(str::is_empty) {
                    continue;
                }
                records.push(record.iter().map(str::to_string).collect());
            }
            Ok(records)
        }
    }
}

/// Column name to index; a repeated name resolves to its first column.
fn header_index(header: &[String]) -> AHashMap<&str, usize> {
    let mut index = AHashMap::with_capacity(header.len());
    for (col, name) in header.iter().enumerate() {
        index.entry(name.as_str()).or_insert(col);
    }
    index
}

fn column_index(index: &AHashMap<&str, usize>, name: &str) -> Result<usize, DataError> {
    index
        .get(name)
        .copied()
        .ok_or_else(|| DataError::ColumnNotFound(name.to_string()))
}

fn parse_value(record: &[String], col: usize) -> Option<f64> {
    record
        .get(col)
        .and_then(|field| field.parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

/// Reads a delimited text file.
pub fn read_dataset(path: &Path, options: &ReadOptions) -> Result<Dataset, DataError> {
    let text = fs::read_to_string(path)?;
    parse_dataset(&text, options)
}

/// Parses delimited text whose first non-empty line is the header.
pub fn parse_dataset(text: &str, options: &ReadOptions) -> Result<Dataset, DataError> {
    let header_line = text
        .lines()
        .find(|line| !line.trim().is_empty())
        .ok_or(DataError::MissingHeader)?;
    let mut records = split_records(text, detect_delimiter(header_line))?.into_iter();
    let header = records.next().ok_or(DataError::MissingHeader)?;

    // --- 1. Resolve columns ---
    let index = header_index(&header);
    let class_col = match &options.class_column {
        Some(name) => column_index(&index, name)?,
        None => header.len().checked_sub(1).ok_or(DataError::MissingHeader)?,
    };
    let feature_cols: Vec<usize> = match &options.features {
        Some(names) => names
            .iter()
            .map(|name| column_index(&index, name))
            .collect::<Result<_, _>>()?,
        None => (0..header.len()).filter(|c| *c != class_col).collect(),
    };

    // --- 2. Parse rows, skipping incomplete ones ---
    let mut values = Vec::new();
    let mut raw_classes = Vec::new();
    let mut source_rows = Vec::new();
    let mut total_rows = 0;
    let mut skipped_rows = 0;
    let end_row = options.end_row.unwrap_or(usize::MAX);
    for (row, record) in records.enumerate() {
        if row < options.start_row || row >= end_row {
            continue;
        }
        total_rows += 1;
        let class = parse_value(&record, class_col).filter(|v| v.fract() == 0.0);
        let feats: Option<Vec<f64>> = feature_cols
            .iter()
            .map(|c| parse_value(&record, *c))
            .collect();
        match (class, feats) {
            (Some(class), Some(feats)) => {
                values.extend(feats);
                raw_classes.push(class as i64);
                source_rows.push(row);
            }
            _ => {
                skipped_rows += 1;
                log::debug!("Skipping data row {row}: missing or non-numeric value.");
            }
        }
    }
    if source_rows.is_empty() {
        return Err(DataError::NoValidRows {
            skipped: skipped_rows,
        });
    }
    if skipped_rows > 0 {
        log::warn!("Skipped {skipped_rows} of {total_rows} rows with missing or non-numeric values.");
    }

    // --- 3. Map class values to ids ---
    let class_labels: Vec<i64> = raw_classes.iter().copied().sorted_unstable().dedup().collect();
    if class_labels.len() < 2 {
        return Err(DataError::TooFewClasses {
            found: class_labels.len(),
        });
    }
    let classes = raw_classes
        .iter()
        .map(|v| class_labels.partition_point(|l| l < v))
        .collect();

    let features = Array2::from_shape_vec((source_rows.len(), feature_cols.len()), values)?;
    Ok(Dataset {
        feature_names: feature_cols.iter().map(|c| header[*c].clone()).collect(),
        class_name: header[class_col].clone(),
        features,
        classes,
        class_labels,
        source_rows,
        total_rows,
        skipped_rows,
    })
}

/// Writes `f` as TSV: `row`, `class`, then one 0/1 column per feature.
pub fn write_selections(
    path: &Path,
    dataset: &Dataset,
    f: ArrayView2<'_, u8>,
) -> Result<(), DataError> {
    let expected = (dataset.n_rows(), dataset.n_features());
    if f.dim() != expected {
        return Err(DataError::ShapeMismatch {
            found: f.dim(),
            expected,
        });
    }
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(
        out,
        "row\tclass\t{}",
        dataset.feature_names.iter().join("\t")
    )?;
    for (i, flags) in f.rows().into_iter().enumerate() {
        writeln!(
            out,
            "{}\t{}\t{}",
            dataset.source_rows[i],
            dataset.class_labels[dataset.classes[i]],
            flags.iter().join("\t")
        )?;
    }
    out.flush()?;
    Ok(())
}

/// Writes how often each feature was selected, most frequent first.
pub fn write_frequency_summary(
    path: &Path,
    feature_names: &[String],
    frequency: &[f64],
) -> Result<(), DataError> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "feature\tfrequency")?;
    for (name, freq) in feature_names
        .iter()
        .zip(frequency)
        .sorted_by(|a, b| b.1.total_cmp(a.1))
    {
        writeln!(out, "{name}\t{freq:.6}")?;
    }
    out.flush()?;
    Ok(())
}

/// Writes the features and class labels of `dataset` as TSV with a header.
pub fn write_dataset(path: &Path, dataset: &Dataset) -> Result<(), DataError> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)?;
    writer.write_record(
        dataset
            .feature_names
            .iter()
            .chain(std::iter::once(&dataset.class_name)),
    )?;
    for (row, class) in dataset.features.rows().into_iter().zip(&dataset.classes) {
        let mut fields: Vec<String> = row.iter().map(|v| format!("{v:.6}")).collect();
        fields.push(dataset.class_labels[*class].to_string());
        writer.write_record(&fields)?;
    }
    writer.flush()?;
    Ok(())
}

/// Shape of a synthetic dataset.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SyntheticSpec {
    pub n_cases: usize,
    pub n_vars: usize,
    /// Leading variables whose mean moves with the class.
    pub n_informative: usize,
    pub n_classes: usize,
    /// Mean shift per class step on informative variables, in noise standard deviations.
    pub shift: f64,
}

/// Gaussian noise with `n_informative` class-shifted variables. Case `i` is in class
/// `i % n_classes`. Without a seed the thread-local generator picks one.
pub fn synthetic_dataset(spec: &SyntheticSpec, seed: Option<u64>) -> Result<Dataset, DataError> {
    if spec.n_classes < 2 || spec.n_cases < spec.n_classes {
        return Err(DataError::InvalidSynthetic(format!(
            "{} cases cannot cover {} classes (at least two are needed)",
            spec.n_cases, spec.n_classes
        )));
    }
    if spec.n_vars == 0 || spec.n_informative > spec.n_vars {
        return Err(DataError::InvalidSynthetic(format!(
            "{} informative of {} variables",
            spec.n_informative, spec.n_vars
        )));
    }
    let seed = seed.unwrap_or_else(entropy_seed);
    log::debug!("Synthetic dataset seed: {seed}");
    let mut rng = StdRng::seed_from_u64(seed);
    let noise =
        Normal::new(0.0, 1.0).map_err(|e| DataError::InvalidSynthetic(e.to_string()))?;

    let classes: Vec<usize> = (0..spec.n_cases).map(|i| i % spec.n_classes).collect();
    let features = Array2::from_shape_fn((spec.n_cases, spec.n_vars), |(i, v)| {
        let x = noise.sample(&mut rng);
        if v < spec.n_informative {
            x + spec.shift * classes[i] as f64
        } else {
            x
        }
    });
    Ok(Dataset {
        feature_names: (1..=spec.n_vars).map(|v| format!("x{v}")).collect(),
        class_name: "class".to_string(),
        features,
        classes,
        class_labels: (0..spec.n_classes as i64).collect(),
        source_rows: (0..spec.n_cases).collect(),
        total_rows: spec.n_cases,
        skipped_rows: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::tempdir;

    #[test]
    fn whitespace_file_with_bad_rows() {
        let text = "a   b  y\n1.0 2.0 5\n3.0 x 7\n\n4.0 6.0 5\n2.0 1.0 7.5\n8.0 9.0 7\n";
        let data = parse_dataset(text, &ReadOptions::default()).unwrap();
        assert_eq!(data.feature_names, vec!["a", "b"]);
        assert_eq!(data.class_name, "y");
        assert_eq!(data.total_rows, 5);
        assert_eq!(data.skipped_rows, 2);
        assert_eq!(data.source_rows, vec![0, 2, 4]);
        assert_eq!(data.class_labels, vec![5, 7]);
        assert_eq!(data.classes, vec![0, 0, 1]);
        assert_eq!(data.class_counts(), vec![2, 1]);
        assert_eq!(data.features, array![[1.0, 2.0], [4.0, 6.0], [8.0, 9.0]]);
    }

    #[test]
    fn comma_file_with_named_columns_and_range() {
        let text = "id,cls,u,v\n1,2,0.5,1.5\n2,0,0.25,2.5\n3,2,0.75,3.5\n4,0,1.0,4.5\n";
        let options = ReadOptions {
            features: Some(vec!["v".to_string(), "u".to_string()]),
            class_column: Some("cls".to_string()),
            start_row: 1,
            end_row: Some(4),
        };
        let data = parse_dataset(text, &options).unwrap();
        assert_eq!(data.feature_names, vec!["v", "u"]);
        assert_eq!(data.total_rows, 3);
        assert_eq!(data.source_rows, vec![1, 2, 3]);
        assert_eq!(data.features.row(0).to_vec(), vec![2.5, 0.25]);
        assert_eq!(
            data.engine_matrix().column(2).to_vec(),
            vec![0.0, 1.0, 0.0]
        );
    }

    #[test]
    fn missing_column_and_single_class_are_errors() {
        let options = ReadOptions {
            class_column: Some("nope".to_string()),
            ..ReadOptions::default()
        };
        assert!(matches!(
            parse_dataset("a\tb\n1\t2\n", &options),
            Err(DataError::ColumnNotFound(name)) if name == "nope"
        ));
        assert!(matches!(
            parse_dataset("a\tb\n1\t2\n3\t2\n", &ReadOptions::default()),
            Err(DataError::TooFewClasses { found: 1 })
        ));
        assert!(matches!(
            parse_dataset("a\tb\nx\t2\n", &ReadOptions::default()),
            Err(DataError::NoValidRows { skipped: 1 })
        ));
    }

    #[test]
    fn selections_are_written_with_labels() {
        let data = parse_dataset("p q c\n1 2 3\n4 5 9\n", &ReadOptions::default()).unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("sel.tsv");
        write_selections(&path, &data, array![[1u8, 0], [0, 1]].view()).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "row\tclass\tp\tq\n0\t3\t1\t0\n1\t9\t0\t1\n");

        assert!(matches!(
            write_selections(&path, &data, array![[1u8], [0]].view()),
            Err(DataError::ShapeMismatch { .. })
        ));

        let summary = dir.path().join("freq.tsv");
        write_frequency_summary(&summary, &data.feature_names, &[0.25, 0.75]).unwrap();
        let text = fs::read_to_string(&summary).unwrap();
        assert_eq!(text, "feature\tfrequency\nq\t0.750000\np\t0.250000\n");
    }

    #[test]
    fn synthetic_data_is_seeded_and_readable() {
        let spec = SyntheticSpec {
            n_cases: 12,
            n_vars: 5,
            n_informative: 2,
            n_classes: 3,
            shift: 4.0,
        };
        let a = synthetic_dataset(&spec, Some(7)).unwrap();
        let b = synthetic_dataset(&spec, Some(7)).unwrap();
        assert_eq!(a.features, b.features);
        assert_eq!(a.class_counts(), vec![4, 4, 4]);

        let dir = tempdir().unwrap();
        let path = dir.path().join("synth.tsv");
        write_dataset(&path, &a).unwrap();
        let back = read_dataset(&path, &ReadOptions::default()).unwrap();
        assert_eq!(back.n_rows(), 12);
        assert_eq!(back.feature_names, a.feature_names);
        assert_eq!(back.classes, a.classes);
        for (x, y) in back.features.iter().zip(a.features.iter()) {
            assert!((x - y).abs() < 1e-6);
        }

        let bad = SyntheticSpec {
            n_informative: 9,
            ..spec
        };
        assert!(synthetic_dataset(&bad, Some(1)).is_err());
    }
}

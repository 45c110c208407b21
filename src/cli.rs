//! CLI utilities for the knnwire binaries.
//!
//! Query vectors are read from plain text: one vector per line, components
//! separated by whitespace or commas. Blank lines and lines starting with `#` are
//! skipped.
use std::{
    fs::File,
    io::{BufRead, BufReader, Write},
    path::Path,
};

use crate::{
    client::QueryResult,
    error::{ClientError, Result},
    matrix::Matrix,
};

/// Parse text vectors from `reader` into a matrix, one row per line.
pub fn read_vectors<R: BufRead>(reader: R) -> Result<Matrix<f32>> {
    let mut rows: Vec<Vec<f32>> = Vec::new();

    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let row = line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<f32>().map_err(|_| {
                    ClientError::InvalidArgument(format!(
                        "line {}: '{s}' is not a number",
                        n + 1
                    ))
                })
            })
            .collect::<Result<Vec<f32>>>()?;
        rows.push(row);
    }

    Matrix::from_rows(&rows)
}

/// Read text vectors from the file at `path`.
pub fn load_vectors(path: &Path) -> Result<Matrix<f32>> {
    let file = File::open(path).map_err(|e| {
        ClientError::InvalidArgument(format!("cannot open '{}': {e}", path.display()))
    })?;
    read_vectors(BufReader::new(file))
}

/// Write one line per query: `row: index(distance) index(distance) ...`.
pub fn write_results<W: Write>(mut writer: W, result: &QueryResult) -> Result<()> {
    for (row, (indices, distances)) in result
        .indices
        .iter_rows()
        .zip(result.distances.iter_rows())
        .enumerate()
    {
        write!(writer, "{row}:")?;
        for (i, d) in indices.iter().zip(distances) {
            write!(writer, " {i}({d})")?;
        }
        writeln!(writer)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempdir::TempDir;

    use super::*;
    use crate::protocol::Timings;

    #[test]
    fn reads_whitespace_and_commas() {
        let input = b"# two vectors\n0 0\n\n1.5, -2\n";
        let m = read_vectors(&input[..]).unwrap();

        assert_eq!(m.shape(), (2, 2));
        assert_eq!(m.row(1), &[1.5, -2.0]);
    }

    #[test]
    fn rejects_ragged_lines() {
        let input = b"0 0\n1 2 3\n";
        assert!(matches!(
            read_vectors(&input[..]),
            Err(ClientError::InvalidArgument(_))
        ));
    }

    #[test]
    fn rejects_non_numbers() {
        let input = b"0 x\n";
        let err = read_vectors(&input[..]).unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn loads_vectors_from_file() {
        let dir = TempDir::new("knnwire").unwrap();
        let path = dir.path().join("queries.txt");
        fs::write(&path, "0 0\n1 0\n5 5\n").unwrap();

        let m = load_vectors(&path).unwrap();
        assert_eq!(m.shape(), (3, 2));
    }

    #[test]
    fn missing_file_is_invalid_argument() {
        let dir = TempDir::new("knnwire").unwrap();
        let res = load_vectors(&dir.path().join("absent.txt"));
        assert!(matches!(res, Err(ClientError::InvalidArgument(_))));
    }

    #[test]
    fn results_are_written_per_row() {
        let result = QueryResult {
            distances: Matrix::new(1, 2, vec![0.0, 1.0]).unwrap(),
            indices: Matrix::new(1, 2, vec![0, 1]).unwrap(),
            timings: Timings::default(),
        };
        let mut out = Vec::new();
        write_results(&mut out, &result).unwrap();

        assert_eq!(String::from_utf8(out).unwrap(), "0: 0(0) 1(1)\n");
    }
}

//! Plain text matrix files as written by `numpy.savetxt(fname, x,
//! delimiter=',')`.
//!
//! Each value is printed as `%.18e` (e.g. `8.000000000000000000e+02`) and
//! values in a row are separated by `,`.

use std::{fmt::Write as _, io::Write as _, path::Path};

use crate::{Error, Result};

/// Format one value like C `printf("%.18e")`.
pub fn format_value(value: f64) -> String {
    if value.is_nan() {
        return "nan".into();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.into();
    }
    let s = format!("{value:.18e}");
    // Rust prints the exponent without sign or padding ("8.0e2").
    let (mantissa, exponent) = s.split_once('e').unwrap_or((&s, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let sign = if exponent < 0 { '-' } else { '+' };
    format!("{mantissa}e{sign}{:02}", exponent.abs())
}

/// Format rows of values, one line per row.
pub fn format_rows<R: AsRef<[f64]>>(rows: &[R]) -> String {
    let mut out = String::new();
    for row in rows {
        let row: Vec<String> = row.as_ref().iter().map(|v| format_value(*v)).collect();
        // Writing to a String cannot fail.
        let _ = writeln!(out, "{}", row.join(","));
    }
    out
}

fn save_rows<P: AsRef<Path>, R: AsRef<[f64]>>(path: P, rows: &[R]) -> Result<()> {
    let mut f = std::fs::File::create(path)?;
    f.write_all(format_rows(rows).as_bytes())?;
    Ok(())
}

/// Save a row major 3x3 camera matrix as three lines of three values.
pub fn save_camera_matrix_txt<P: AsRef<Path>>(path: P, camera_matrix: &[f64; 9]) -> Result<()> {
    let rows: Vec<&[f64]> = camera_matrix.chunks(3).collect();
    save_rows(path, &rows)
}

/// Save the distortion coefficients as a single line.
pub fn save_distortion_txt<P: AsRef<Path>>(path: P, distortion_coeffs: &[f64; 5]) -> Result<()> {
    save_rows(path, &[distortion_coeffs])
}

/// Read a file written by [save_camera_matrix_txt] or [save_distortion_txt].
pub fn load_txt<P: AsRef<Path>>(path: P) -> Result<Vec<Vec<f64>>> {
    let contents = std::fs::read_to_string(path)?;
    parse_rows(&contents)
}

pub fn parse_rows(contents: &str) -> Result<Vec<Vec<f64>>> {
    let mut rows = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let row = line
            .split(',')
            .map(|v| {
                let v = v.trim();
                v.parse::<f64>().map_err(|_| Error::ParseFloat {
                    line: idx + 1,
                    value: v.to_string(),
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        rows.push(row);
    }
    Ok(rows)
}

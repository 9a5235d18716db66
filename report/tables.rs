use crate::forest::inference::{AverageEffect, CalibrationTest, TargetSample};
use crate::forest::stats::Coefficient;
use serde::Serialize;
use std::fmt::Write as FmtWrite;
use std::path::Path;

/// A titled table of pre-formatted cells.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub title: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Mean CATE and doubly robust effect within one CATE quintile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QuintileRow {
    pub quintile: u32,
    pub rows: usize,
    pub mean_cate: f64,
    pub effect: AverageEffect,
}

/// Covariate means in the bottom and top CATE quintiles.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceRow {
    pub covariate: String,
    pub mean_low: f64,
    pub mean_high: f64,
    pub difference: f64,
    pub std_difference: f64,
}

fn num(value: f64) -> String {
    if value.is_nan() {
        "NA".to_string()
    } else if value != 0.0 && value.abs() < 1e-4 {
        format!("{value:.3e}")
    } else {
        format!("{value:.4}")
    }
}

impl Table {
    fn new(title: &str, headers: &[&str]) -> Self {
        Self {
            title: title.to_string(),
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    fn push(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    /// Column-aligned text, headed by the title.
    pub fn render(&self) -> String {
        let mut widths: Vec<usize> = self.headers.iter().map(|h| h.chars().count()).collect();
        for row in &self.rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.chars().count());
            }
        }
        let mut out = String::new();
        let _ = writeln!(out, "{}", self.title);
        let line = |cells: &[String], out: &mut String| {
            let padded: Vec<String> = cells
                .iter()
                .zip(&widths)
                .enumerate()
                .map(|(i, (cell, &width))| {
                    if i == 0 {
                        format!("{cell:<width$}")
                    } else {
                        format!("{cell:>width$}")
                    }
                })
                .collect();
            let _ = writeln!(out, "  {}", padded.join("  "));
        };
        line(&self.headers, &mut out);
        for row in &self.rows {
            line(row, &mut out);
        }
        out
    }

    pub fn write_tsv(&self, path: &Path) -> Result<(), csv::Error> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_path(path)?;
        writer.write_record(&self.headers)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

pub fn calibration(test: &CalibrationTest) -> Table {
    let mut table = Table::new(
        "Best linear fit using forest predictions (on held-out data)",
        &["term", "estimate", "std_error", "t_value", "p_value_greater"],
    );
    for (term, c) in [
        ("mean.forest.prediction", &test.mean_forest_prediction),
        ("differential.forest.prediction", &test.differential_forest_prediction),
    ] {
        table.push(vec![
            term.to_string(),
            num(c.estimate),
            num(c.std_error),
            num(c.t_value),
            num(c.p_value),
        ]);
    }
    table
}

pub fn average_effects(effects: &[(TargetSample, AverageEffect)]) -> Table {
    let mut table = Table::new(
        "Average treatment effects (doubly robust)",
        &["target_sample", "estimate", "std_error", "ci_lower", "ci_upper"],
    );
    for (target, effect) in effects {
        table.push(vec![
            target.to_string(),
            num(effect.estimate),
            num(effect.std_error),
            num(effect.estimate - 1.96 * effect.std_error),
            num(effect.estimate + 1.96 * effect.std_error),
        ]);
    }
    table
}

pub fn quintiles(rows: &[QuintileRow]) -> Table {
    let mut table = Table::new(
        "Treatment effects by CATE quintile",
        &["quintile", "rows", "mean_cate", "aipw_estimate", "aipw_std_error"],
    );
    for row in rows {
        table.push(vec![
            row.quintile.to_string(),
            row.rows.to_string(),
            num(row.mean_cate),
            num(row.effect.estimate),
            num(row.effect.std_error),
        ]);
    }
    table
}

pub fn balance(rows: &[BalanceRow]) -> Table {
    let mut table = Table::new(
        "Covariate means, bottom vs. top CATE quintile",
        &["covariate", "mean_low", "mean_high", "difference", "std_difference"],
    );
    for row in rows {
        table.push(vec![
            row.covariate.clone(),
            num(row.mean_low),
            num(row.mean_high),
            num(row.difference),
            num(row.std_difference),
        ]);
    }
    table
}

pub fn projection(coefficients: &[(String, Coefficient)]) -> Table {
    let mut table = Table::new(
        "Best linear projection of the CATE",
        &["term", "estimate", "std_error", "t_value", "p_value"],
    );
    for (term, c) in coefficients {
        table.push(vec![
            term.clone(),
            num(c.estimate),
            num(c.std_error),
            num(c.t_value),
            num(c.p_value),
        ]);
    }
    table
}

/// Importance rows, most important first.
pub fn importance(scores: &[(String, f64)]) -> Table {
    let mut sorted = scores.to_vec();
    sorted.sort_by(|a, b| b.1.total_cmp(&a.1));
    let mut table = Table::new("Variable importance", &["covariate", "importance"]);
    for (name, score) in sorted {
        table.push(vec![name, num(score)]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn render_aligns_columns() {
        let table = importance(&[("female".to_string(), 0.1), ("par_inc".to_string(), 0.9)]);
        let text = table.render();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Variable importance");
        assert_eq!(lines[1], "  covariate  importance");
        assert_eq!(lines[2], "  par_inc        0.9000");
        assert_eq!(lines[3], "  female         0.1000");
    }

    #[test]
    fn tsv_output_has_header_and_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ate.tsv");
        let table = average_effects(&[(
            TargetSample::All,
            AverageEffect {
                estimate: 1.0,
                std_error: 0.5,
            },
        )]);
        table.write_tsv(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "target_sample\testimate\tstd_error\tci_lower\tci_upper\nall\t1.0000\t0.5000\t0.0200\t1.9800\n"
        );
    }

    #[test]
    fn tiny_and_missing_numbers_are_readable() {
        assert_eq!(num(f64::NAN), "NA");
        assert_eq!(num(0.0), "0.0000");
        assert_eq!(num(0.00001234), "1.234e-5");
    }
}

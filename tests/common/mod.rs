use polars::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Bernoulli, Distribution, Normal};
use std::fs::File;
use std::path::Path;

/// A randomised trial with the standard column names.
///
/// The effect is `1 + 2 * female`, the treatment is exactly balanced, and
/// `fe_state` takes five levels that shift the outcome.
pub fn synthetic_trial(n: usize, seed: u64) -> DataFrame {
    let mut rng = StdRng::seed_from_u64(seed);
    let coin = Bernoulli::new(0.5).unwrap();
    let born_here = Bernoulli::new(0.8).unwrap();
    let income = Normal::new(50.0, 15.0).unwrap();
    let noise = Normal::new(0.0, 1.0).unwrap();

    let mut treatment: Vec<f64> = (0..n).map(|i| (i % 2) as f64).collect();
    treatment.shuffle(&mut rng);

    let mut female = Vec::with_capacity(n);
    let mut par_inc = Vec::with_capacity(n);
    let mut par_sch = Vec::with_capacity(n);
    let mut native = Vec::with_capacity(n);
    let mut state = Vec::with_capacity(n);
    let mut y = Vec::with_capacity(n);
    for (i, &w) in treatment.iter().enumerate() {
        let f = if coin.sample(&mut rng) { 1.0 } else { 0.0 };
        let inc: f64 = income.sample(&mut rng);
        let sch = rng.gen_range(8..=20) as f64;
        let nat = if born_here.sample(&mut rng) { 1.0 } else { 0.0 };
        let s = i % 5;
        let tau = 1.0 + 2.0 * f;
        y.push(0.5 * s as f64 + 0.02 * inc + 0.1 * sch + tau * w + noise.sample(&mut rng));
        female.push(f);
        par_inc.push(inc);
        par_sch.push(sch);
        native.push(nat);
        state.push(format!("s{s}"));
    }

    df!(
        "female" => female,
        "par_inc" => par_inc,
        "par_sch" => par_sch,
        "native" => native,
        "fe_state" => state,
        "Treatment" => treatment,
        "y" => y,
    )
    .unwrap()
}

pub fn write_tsv(frame: &mut DataFrame, path: &Path) {
    let mut file = File::create(path).unwrap();
    CsvWriter::new(&mut file)
        .include_header(true)
        .with_separator(b'\t')
        .finish(frame)
        .unwrap();
}

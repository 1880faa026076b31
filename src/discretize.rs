//! Prints HL-Gauss target distributions.

use std::io::stdout;

use serde::Serialize;

use crate::math::hl_gauss::HlGauss;
use crate::opts::DiscretizeOpts;
use crate::prelude::*;

#[derive(Serialize)]
struct Discretization {
    bin_centers: Vec<f64>,
    targets: Vec<Target>,
}

#[derive(Serialize)]
struct Target {
    reward: f64,
    probabilities: Vec<f64>,

    /// The reward decoded back from the distribution.
    expected_value: f64,
}

pub fn run(opts: DiscretizeOpts) -> Result {
    let discretization = discretize(&opts)?;
    serde_json::to_writer_pretty(stdout(), &discretization)?;
    println!();
    Ok(())
}

fn discretize(opts: &DiscretizeOpts) -> Result<Discretization> {
    let hl_gauss = HlGauss::new(opts.v_min, opts.v_max, opts.n_bins, opts.sigma_over_bin_size)?;
    let targets = opts
        .rewards
        .iter()
        .zip(hl_gauss.target(&opts.rewards))
        .map(|(&reward, probabilities)| -> Result<Target> {
            Ok(Target {
                reward,
                expected_value: hl_gauss.expected_value(&probabilities)?,
                probabilities,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Discretization {
        bin_centers: hl_gauss.bin_centers(),
        targets,
    })
}

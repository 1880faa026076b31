use std::fs::File;
use std::io::Read;
use std::path::Path;

use clap::ValueEnum;
use itertools::Itertools;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::features::{FeatureProvider, MovieFeatureTable};
use crate::opts::DataOpts;
use crate::prelude::*;

/// Single row of the ratings export.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Rating {
    pub user_id: String,
    pub movie_id: String,
    pub rating_val: f64,
}

#[derive(Serialize, Deserialize, ValueEnum, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RewardPolicy {
    /// `1.0` for ratings at or above the threshold, `0.0` otherwise.
    #[default]
    Threshold,

    /// The rating divided by the maximal rating.
    Scaled,
}

impl RewardPolicy {
    #[must_use]
    pub fn reward(self, rating: f64, threshold: f64, max_rating: f64) -> f64 {
        match self {
            Self::Threshold if rating >= threshold => 1.0,
            Self::Threshold => 0.0,
            Self::Scaled => rating / max_rating,
        }
    }
}

#[instrument(level = "info", skip_all, fields(path = ?path.as_ref()))]
pub fn load_ratings(path: impl AsRef<Path>) -> Result<Vec<Rating>> {
    let start_instant = Instant::now();
    let file = File::open(path.as_ref())
        .with_context(|| format!("failed to open `{}`", path.as_ref().display()))?;
    let ratings = read_ratings(file)?;
    info!(n_ratings = ratings.len(), elapsed = ?start_instant.elapsed(), "loaded");
    Ok(ratings)
}

pub fn read_ratings(reader: impl Read) -> Result<Vec<Rating>> {
    csv::Reader::from_reader(reader)
        .deserialize()
        .enumerate()
        .map(|(i, record)| record.with_context(|| format!("invalid rating #{}", i + 1)))
        .collect()
}

/// Rating resolved against the feature tables.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Sample {
    pub user_index: usize,
    pub movie_index: usize,
    pub reward: f64,
}

pub struct Dataset {
    /// Distinct users of the kept ratings, `Sample::user_index` points here.
    pub user_ids: Vec<String>,

    pub train: Vec<Sample>,
    pub test: Vec<Sample>,
}

impl Dataset {
    /// Filters the ratings, turns them into rewards, and splits them into the train and test sets.
    ///
    /// Ratings of movies without features are dropped.
    #[instrument(level = "info", skip_all, fields(n_ratings = ratings.len()))]
    pub fn build(
        ratings: Vec<Rating>,
        movies: &MovieFeatureTable,
        opts: &DataOpts,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        let n_ratings = ratings.len();
        let is_selected = |id: &String, selection: &Option<Vec<String>>| {
            selection
                .as_ref()
                .map_or(true, |selection| selection.contains(id))
        };
        let ratings = ratings
            .into_iter()
            .filter(|rating| is_selected(&rating.user_id, &opts.only_users))
            .filter(|rating| is_selected(&rating.movie_id, &opts.only_movies))
            .collect_vec();
        let n_selected = ratings.len();

        let (ratings, unknown): (Vec<_>, Vec<_>) = ratings
            .into_iter()
            .partition(|rating| movies.contains(&rating.movie_id));
        if !unknown.is_empty() {
            warn!(n_dropped = unknown.len(), "dropped the ratings of movies without features");
        }
        if ratings.is_empty() {
            bail!("no ratings left out of {}", n_ratings);
        }

        let user_ids = ratings
            .iter()
            .map(|rating| rating.user_id.clone())
            .unique()
            .sorted()
            .collect_vec();
        let user_index: AHashMap<&str, usize> = user_ids
            .iter()
            .enumerate()
            .map(|(i, user_id)| (user_id.as_str(), i))
            .collect();

        let mut samples = ratings
            .iter()
            .map(|rating| -> Result<Sample> {
                Ok(Sample {
                    user_index: user_index[rating.user_id.as_str()],
                    movie_index: movies
                        .index_of(&rating.movie_id)
                        .ok_or_else(|| ModelError::UnknownIdentifier(rating.movie_id.clone()))?,
                    reward: opts.reward_policy.reward(
                        rating.rating_val,
                        opts.reward_threshold,
                        opts.max_rating,
                    ),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        samples.shuffle(rng);
        let n_test = (samples.len() as f64 * opts.test_fraction).round() as usize;
        let train = samples.split_off(n_test);
        let test = samples;
        if train.is_empty() {
            bail!("no training ratings left after holding out {} for testing", test.len());
        }

        info!(
            n_selected,
            n_users = user_ids.len(),
            n_train = train.len(),
            n_test = test.len(),
            "built",
        );
        Ok(Self {
            user_ids,
            train,
            test,
        })
    }
}

/// Shuffles the samples and yields the mini-batches.
pub fn shuffled_batches<'a>(
    samples: &'a mut [Sample],
    batch_size: usize,
    rng: &mut impl Rng,
) -> impl Iterator<Item = &'a [Sample]> {
    samples.shuffle(rng);
    let samples: &'a [Sample] = samples;
    samples.chunks(batch_size.max(1))
}

#[cfg(test)]
pub mod tests {
    use clap::Parser;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::features::tests::MOVIES;
    use crate::opts::{Opts, Subcommand};

    pub const RATINGS: &str = "\
user_id,movie_id,rating_val
ann,alien,9
ann,heat,4
bob,heat,8
bob,up,7
cid,up,2
cid,vertigo,10
";

    fn data_opts(extra: &[&str]) -> Result<DataOpts> {
        let mut arguments = vec![
            "movie-recommender",
            "train-bandit",
            "--ratings",
            "ratings.csv",
            "--movies",
            "movies.json",
            "-o",
            "snapshot.json",
        ];
        arguments.extend_from_slice(extra);
        match Opts::try_parse_from(arguments)?.subcommand {
            Subcommand::TrainBandit(opts) => Ok(opts.data),
            _ => bail!("expected `train-bandit`"),
        }
    }

    #[test]
    fn read_ratings_ok() -> Result {
        let ratings = read_ratings(RATINGS.as_bytes())?;
        assert_eq!(ratings.len(), 6);
        assert_eq!(
            ratings[0],
            Rating {
                user_id: "ann".to_string(),
                movie_id: "alien".to_string(),
                rating_val: 9.0,
            },
        );
        Ok(())
    }

    #[test]
    fn reward_policy_ok() {
        assert!((RewardPolicy::Threshold.reward(7.0, 7.0, 10.0) - 1.0).abs() < f64::EPSILON);
        assert!(RewardPolicy::Threshold.reward(6.0, 7.0, 10.0).abs() < f64::EPSILON);
        assert!((RewardPolicy::Scaled.reward(6.0, 7.0, 10.0) - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn build_drops_unknown_movies_ok() -> Result {
        let movies = MovieFeatureTable::from_reader(MOVIES.as_bytes())?;
        let opts = data_opts(&["--test-fraction", "0.4"])?;
        let dataset = Dataset::build(
            read_ratings(RATINGS.as_bytes())?,
            &movies,
            &opts,
            &mut StdRng::seed_from_u64(0),
        )?;
        assert_eq!(dataset.user_ids, vec!["ann", "bob", "cid"]);
        assert_eq!(dataset.train.len() + dataset.test.len(), 5);
        assert_eq!(dataset.test.len(), 2);
        let positives = dataset
            .train
            .iter()
            .chain(&dataset.test)
            .filter(|sample| sample.reward > 0.5)
            .count();
        assert_eq!(positives, 3);
        Ok(())
    }

    #[test]
    fn build_restricts_users_ok() -> Result {
        let movies = MovieFeatureTable::from_reader(MOVIES.as_bytes())?;
        let opts = data_opts(&["--only-users", "bob,cid", "--only-movies", "up"])?;
        let dataset = Dataset::build(
            read_ratings(RATINGS.as_bytes())?,
            &movies,
            &opts,
            &mut StdRng::seed_from_u64(0),
        )?;
        assert_eq!(dataset.user_ids, vec!["bob", "cid"]);
        assert_eq!(dataset.train.len() + dataset.test.len(), 2);
        Ok(())
    }

    #[test]
    fn build_without_ratings_fails() -> Result {
        let movies = MovieFeatureTable::from_reader(MOVIES.as_bytes())?;
        let opts = data_opts(&["--only-movies", "vertigo"])?;
        let result = Dataset::build(
            read_ratings(RATINGS.as_bytes())?,
            &movies,
            &opts,
            &mut StdRng::seed_from_u64(0),
        );
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn shuffled_batches_ok() {
        let mut samples: Vec<Sample> = (0..10)
            .map(|i| Sample {
                user_index: i,
                movie_index: i,
                reward: 0.0,
            })
            .collect();
        let sizes: Vec<usize> = shuffled_batches(&mut samples, 4, &mut StdRng::seed_from_u64(0))
            .map(<[Sample]>::len)
            .collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }
}

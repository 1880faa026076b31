//! Fits the linear contextual bandit over the ratings.

use std::sync::atomic::{AtomicBool, Ordering};

use nalgebra::DMatrix;

use crate::bandit::{ContextLayout, LinearBandit, SharedBandit};
use crate::features::{FeatureProvider, MovieFeatureTable, UserEmbeddingTable};
use crate::helpers::periodic::Periodic;
use crate::helpers::tracing::format_elapsed;
use crate::opts::TrainBanditOpts;
use crate::prelude::*;
use crate::snapshot::{BanditSnapshot, Snapshot};
use crate::trainer::dataset::{load_ratings, shuffled_batches, Dataset, Sample};
use crate::trainer::loss::Rmse;

#[instrument(skip_all)]
pub fn run(opts: TrainBanditOpts, stop: &AtomicBool) -> Result {
    sentry::configure_scope(|scope| scope.set_tag("app", "train-bandit"));
    let start_instant = Instant::now();

    let movies = MovieFeatureTable::load(&opts.data.movies)?;
    let users = match &opts.bandit.user_snapshot {
        Some(path) => Some(
            Snapshot::load(path)?
                .users
                .ok_or_else(|| anyhow!("`{}` has no user embeddings", path.display()))?,
        ),
        None => None,
    };
    let ratings = load_ratings(&opts.data.ratings)?;
    let mut rng = crate::trainer::rng(opts.data.seed);
    let mut dataset = Dataset::build(ratings, &movies, &opts.data, &mut rng)?;

    let contexts = Contexts::new(&movies, users.as_ref(), &dataset.user_ids)?;
    let bandit = SharedBandit::new(LinearBandit::new(
        contexts.layout.dimension(),
        opts.bandit.inversion,
    )?);
    info!(dimension = contexts.layout.dimension(), strategy = ?opts.bandit.inversion, "running…");

    for epoch in 1..=opts.data.n_epochs {
        let mut progressive = Rmse::default();
        let mut periodic = Periodic::new(opts.data.log_interval);
        for batch in shuffled_batches(&mut dataset.train, opts.data.batch_size, &mut rng) {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            let (batch_contexts, rewards) = contexts.assemble(batch)?;
            let predictions = bandit.predict_matrix(&batch_contexts)?;
            for (prediction, reward) in predictions.iter().zip(&rewards) {
                progressive.push(reward - prediction);
            }
            bandit.update_matrix(&batch_contexts, &rewards)?;
            if periodic.should_trigger() {
                info!(
                    epoch,
                    n_observations = bandit.read().n_observations(),
                    rmse = progressive.average(),
                );
            }
        }

        let mut test = Rmse::default();
        for batch in dataset.test.chunks(opts.data.batch_size) {
            let (batch_contexts, rewards) = contexts.assemble(batch)?;
            let predictions = bandit.predict_matrix(&batch_contexts)?;
            for (prediction, reward) in predictions.iter().zip(&rewards) {
                test.push(reward - prediction);
            }
        }
        info!(
            epoch,
            progressive_rmse = progressive.average(),
            test_rmse = test.average(),
            n_test = test.count(),
            elapsed = %format_elapsed(start_instant),
        );
        if stop.load(Ordering::Relaxed) {
            warn!(epoch, "interrupted");
            break;
        }
    }

    Snapshot {
        bandit: Some(BanditSnapshot {
            layout: contexts.layout,
            state: bandit.state(),
        }),
        users,
        ..Default::default()
    }
    .save(&opts.output)
}

/// Builds the context rows of the rating samples.
struct Contexts<'a> {
    layout: ContextLayout,
    movies: &'a MovieFeatureTable,

    /// User embeddings and the embedding row of every dataset user.
    users: Option<(&'a UserEmbeddingTable, Vec<usize>)>,
}

impl<'a> Contexts<'a> {
    fn new(
        movies: &'a MovieFeatureTable,
        users: Option<&'a UserEmbeddingTable>,
        user_ids: &[String],
    ) -> Result<Self> {
        let users = match users {
            Some(users) => {
                let rows = user_ids
                    .iter()
                    .map(|user_id| {
                        users
                            .index_of(user_id)
                            .ok_or_else(|| anyhow!("user `{}` has no embedding", user_id))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Some((users, rows))
            }
            None => None,
        };
        Ok(Self {
            layout: ContextLayout {
                movie_width: movies.width(),
                user_width: users.as_ref().map_or(0, |(users, _)| users.width()),
            },
            movies,
            users,
        })
    }

    fn assemble(&self, batch: &[Sample]) -> Result<(DMatrix<f64>, Vec<f64>)> {
        let movie_indices: Vec<usize> = batch.iter().map(|sample| sample.movie_index).collect();
        let movies = self.movies.gather(&movie_indices)?;
        let users = match &self.users {
            Some((users, rows)) => {
                let indices: Vec<usize> =
                    batch.iter().map(|sample| rows[sample.user_index]).collect();
                Some(users.gather(&indices)?)
            }
            None => None,
        };
        let contexts = self.layout.assemble(&movies, users.as_ref())?;
        Ok((contexts, batch.iter().map(|sample| sample.reward).collect()))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use clap::Parser;

    use super::*;
    use crate::features::tests::MOVIES;
    use crate::opts::{Opts, Subcommand};
    use crate::trainer::dataset::tests::RATINGS;

    fn parse(arguments: Vec<&std::ffi::OsStr>) -> Result<TrainBanditOpts> {
        match Opts::try_parse_from(arguments)?.subcommand {
            Subcommand::TrainBandit(opts) => Ok(opts),
            _ => bail!("expected `train-bandit`"),
        }
    }

    #[test]
    fn run_ok() -> Result {
        let directory = tempfile::tempdir()?;
        let ratings = directory.path().join("ratings.csv");
        let movies = directory.path().join("movies.json");
        let output = directory.path().join("snapshot.json");
        fs::write(&ratings, RATINGS)?;
        fs::write(&movies, MOVIES)?;

        let opts = parse(vec![
            "movie-recommender".as_ref(),
            "train-bandit".as_ref(),
            "--ratings".as_ref(),
            ratings.as_os_str(),
            "--movies".as_ref(),
            movies.as_os_str(),
            "--inversion".as_ref(),
            "full-reinversion".as_ref(),
            "--n-epochs".as_ref(),
            "2".as_ref(),
            "--seed".as_ref(),
            "1".as_ref(),
            "-o".as_ref(),
            output.as_os_str(),
        ])?;
        run(opts, &AtomicBool::new(false))?;

        let snapshot = Snapshot::load(&output)?;
        let bandit = snapshot.bandit.ok_or_else(|| anyhow!("no bandit"))?;
        assert_eq!(bandit.layout.dimension(), 5);
        assert!(snapshot.users.is_none());
        assert!(bandit.state.n_observations > 0);
        Ok(())
    }

    #[test]
    fn interrupted_run_still_saves_ok() -> Result {
        let directory = tempfile::tempdir()?;
        let ratings = directory.path().join("ratings.csv");
        let movies = directory.path().join("movies.json");
        let output = directory.path().join("snapshot.json");
        fs::write(&ratings, RATINGS)?;
        fs::write(&movies, MOVIES)?;

        let opts = parse(vec![
            "movie-recommender".as_ref(),
            "train-bandit".as_ref(),
            "--ratings".as_ref(),
            ratings.as_os_str(),
            "--movies".as_ref(),
            movies.as_os_str(),
            "-o".as_ref(),
            output.as_os_str(),
        ])?;
        run(opts, &AtomicBool::new(true))?;

        let snapshot = Snapshot::load(&output)?;
        let bandit = snapshot.bandit.ok_or_else(|| anyhow!("no bandit"))?;
        assert_eq!(bandit.state.n_observations, 0);
        Ok(())
    }

    #[test]
    fn contexts_with_users_ok() -> Result {
        let movies = MovieFeatureTable::from_reader(MOVIES.as_bytes())?;
        let users = UserEmbeddingTable::new(
            vec!["bob".to_string(), "ann".to_string()],
            2,
            &mut crate::trainer::rng(Some(0)),
        )?;
        let contexts = Contexts::new(&movies, Some(&users), &["ann".to_string()])?;
        assert_eq!(contexts.layout.dimension(), 4 + 2 + 1);

        let (matrix, rewards) = contexts.assemble(&[Sample {
            user_index: 0,
            movie_index: 2,
            reward: 1.0,
        }])?;
        assert_eq!(rewards, vec![1.0]);
        assert_eq!(matrix.columns(4, 2), users.lookup(&["ann"])?.columns(0, 2));
        assert!((matrix[(0, 6)] - 1.0).abs() < f64::EPSILON);

        assert!(Contexts::new(&movies, Some(&users), &["cid".to_string()]).is_err());
        Ok(())
    }
}

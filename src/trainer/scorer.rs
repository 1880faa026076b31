//! Trains the factorization-machine scorer jointly with the user embeddings.

use std::sync::atomic::{AtomicBool, Ordering};

use itertools::Itertools;
use nalgebra::DVector;
use rand::rngs::StdRng;

use crate::features::{FeatureProvider, MovieFeatureTable, UserEmbeddingTable};
use crate::helpers::periodic::Periodic;
use crate::helpers::tracing::format_elapsed;
use crate::opts::TrainScorerOpts;
use crate::prelude::*;
use crate::scorer::{AdamW, FactorizationMachine, Parameters, ScorerConfig};
use crate::snapshot::Snapshot;
use crate::trainer::dataset::{load_ratings, shuffled_batches, Dataset, Sample};
use crate::trainer::learning_rate::LearningRate;
use crate::trainer::loss::{Loss, LossPair, MeanLoss};

/// Constant prediction the losses are compared against.
const BASELINE_PROBABILITY: f64 = 0.5;

#[instrument(skip_all)]
pub fn run(opts: TrainScorerOpts, stop: &AtomicBool) -> Result {
    sentry::configure_scope(|scope| scope.set_tag("app", "train-scorer"));
    let start_instant = Instant::now();

    let movies = MovieFeatureTable::load(&opts.data.movies)?;
    let ratings = load_ratings(&opts.data.ratings)?;
    let mut rng = crate::trainer::rng(opts.data.seed);
    let mut dataset = Dataset::build(ratings, &movies, &opts.data, &mut rng)?;

    let user_ids = dataset.user_ids.clone();
    let users = UserEmbeddingTable::new(user_ids, opts.scorer.user_width, &mut rng)?;
    let config = ScorerConfig {
        movie_width: movies.width(),
        user_width: opts.scorer.user_width,
        n_movie_groups: opts.scorer.n_movie_groups,
        n_user_groups: opts.scorer.n_user_groups,
        group_width: opts.scorer.group_width,
        mlp_widths: opts.scorer.mlp_widths.clone(),
        activation: opts.scorer.activation,
        dropout: opts.scorer.dropout,
    };
    let scorer = FactorizationMachine::new(config, &mut rng)?;
    let optimizer =
        AdamW::new(opts.optimizer.learning_rate).weight_decay(opts.optimizer.weight_decay);
    let mut trainer = ScorerTrainer {
        movies: &movies,
        users,
        scorer,
        optimizer,
        loss: opts.scorer.loss,
        rng,
    };

    let baseline = LossPair {
        train: baseline_loss(opts.scorer.loss, &dataset.train),
        test: baseline_loss(opts.scorer.loss, &dataset.test),
    };
    info!(baseline.train, baseline.test, "running…");

    let learning_rates = LearningRate::new(
        opts.optimizer.learning_rate,
        opts.optimizer.learning_rate_decay,
        opts.optimizer.min_learning_rate,
    );
    let mut best: Option<(LossPair, FactorizationMachine, UserEmbeddingTable)> = None;
    for (epoch, learning_rate) in (1..=opts.data.n_epochs).zip(learning_rates) {
        trainer.optimizer.set_learning_rate(learning_rate);
        let mut losses = LossPair::builder();
        let mut periodic = Periodic::new(opts.data.log_interval);
        let batches =
            shuffled_batches(&mut dataset.train, opts.data.batch_size, &mut trainer.rng)
                .collect_vec();
        for (i, batch) in batches.iter().enumerate() {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            losses.train.push_batch(trainer.step(batch)?, batch.len());
            if periodic.should_trigger() {
                info!(epoch, n_batches = i + 1, of = batches.len(), loss = losses.train.finalise());
            }
        }
        let interrupted = stop.load(Ordering::Relaxed);
        for batch in dataset.test.chunks(opts.data.batch_size) {
            losses.test.push_batch(trainer.evaluate(batch)?, batch.len());
        }
        let losses = losses.finalise();
        if !losses.train.is_finite() && !interrupted {
            bail!("the training loss diverged at epoch #{}", epoch);
        }

        info!(
            epoch,
            learning_rate,
            train_loss = losses.train,
            test_loss = losses.test,
            d_test_loss = losses.test - baseline.test,
            elapsed = %format_elapsed(start_instant),
        );
        if losses.improves_on(best.as_ref().map(|(best, ..)| best)) {
            best = Some((losses, trainer.scorer.clone(), trainer.users.clone()));
        }
        if interrupted {
            warn!(epoch, "interrupted");
            break;
        }
    }

    let (best, scorer, users) =
        best.unwrap_or((LossPair::infinity(), trainer.scorer, trainer.users));
    info!(best.train, best.test, "saving…");
    Snapshot {
        scorer: Some(scorer),
        users: Some(users),
        ..Default::default()
    }
    .save(&opts.output)
}

/// Loss of always predicting [`BASELINE_PROBABILITY`].
fn baseline_loss(loss: Loss, samples: &[Sample]) -> f64 {
    let mut mean = MeanLoss::default();
    for sample in samples {
        mean.push_sample(loss.of_probability(BASELINE_PROBABILITY, sample.reward));
    }
    mean.finalise()
}

struct ScorerTrainer<'a> {
    movies: &'a MovieFeatureTable,
    users: UserEmbeddingTable,
    scorer: FactorizationMachine,
    optimizer: AdamW,
    loss: Loss,
    rng: StdRng,
}

impl ScorerTrainer<'_> {
    /// One optimizer step over the batch, returns the mean batch loss.
    #[instrument(level = "trace", skip_all, fields(batch_size = batch.len()))]
    fn step(&mut self, batch: &[Sample]) -> Result<f64> {
        let (movie_indices, user_indices, targets) = unzip_batch(batch);
        let movies = self.movies.gather(&movie_indices)?;
        let users = self.users.gather(&user_indices)?;

        self.scorer.zero_gradients();
        self.users.zero_gradients();
        let logits = self.scorer.forward_train(&movies, &users, &mut self.rng)?;
        let (loss, logit_gradient) = self.loss.evaluate(&logits, &targets)?;
        let input_gradients = self.scorer.backward(&logit_gradient)?;
        self.users.scatter_gradient(&user_indices, &input_gradients.users)?;

        let mut parameters = self.scorer.parameters_mut();
        parameters.extend(self.users.parameters_mut());
        self.optimizer.step(&mut parameters);
        Ok(loss)
    }

    fn evaluate(&self, batch: &[Sample]) -> Result<f64> {
        let (movie_indices, user_indices, targets) = unzip_batch(batch);
        let logits: DVector<f64> = self.scorer.score(
            &self.movies.gather(&movie_indices)?,
            &self.users.gather(&user_indices)?,
        )?;
        Ok(self.loss.evaluate(&logits, &targets)?.0)
    }
}

fn unzip_batch(batch: &[Sample]) -> (Vec<usize>, Vec<usize>, Vec<f64>) {
    let mut movie_indices = Vec::with_capacity(batch.len());
    let mut user_indices = Vec::with_capacity(batch.len());
    let mut targets = Vec::with_capacity(batch.len());
    for sample in batch {
        movie_indices.push(sample.movie_index);
        user_indices.push(sample.user_index);
        targets.push(sample.reward);
    }
    (movie_indices, user_indices, targets)
}

//! Ranks the movies for a single user.

use std::io::stdout;

use itertools::Itertools;
use nalgebra::{DMatrix, DVector};
use rand::Rng;
use serde::Serialize;

use crate::bandit::LinearBandit;
use crate::features::{FeatureProvider, MovieFeatureTable, UserEmbeddingTable};
use crate::math::sigmoid;
use crate::opts::RecommendOpts;
use crate::prelude::*;
use crate::scorer::FactorizationMachine;
use crate::snapshot::{BanditSnapshot, Snapshot};
use crate::trainer::dataset::load_ratings;

/// Candidates are scored in chunks to bound the batch matrices.
const CHUNK_SIZE: usize = 4096;

#[derive(Serialize, Debug, PartialEq)]
pub struct Recommendation {
    pub movie_id: String,
    pub score: f64,
}

#[instrument(skip_all, fields(user_id = %opts.user_id))]
pub fn run(opts: RecommendOpts) -> Result {
    let snapshot = Snapshot::load(&opts.snapshot)?;
    let movies = MovieFeatureTable::load(&opts.movies)?;

    let rated: AHashSet<String> = match &opts.exclude_rated {
        Some(path) => load_ratings(path)?
            .into_iter()
            .filter(|rating| rating.user_id == opts.user_id)
            .map(|rating| rating.movie_id)
            .collect(),
        None => AHashSet::default(),
    };
    let candidates = (0..movies.len())
        .filter(|&i| !rated.contains(&movies.ids()[i]))
        .collect_vec();
    info!(n_candidates = candidates.len(), n_rated = rated.len(), "scoring…");

    let scores = if opts.bandit {
        let bandit = snapshot
            .bandit
            .as_ref()
            .ok_or_else(|| anyhow!("the snapshot has no bandit"))?;
        let mut rng = crate::trainer::rng(opts.seed);
        let rng = opts.thompson.then_some(&mut rng);
        let users = snapshot.users.as_ref();
        score_with_bandit(bandit, users, &opts.user_id, &movies, &candidates, rng)?
    } else {
        let scorer = snapshot
            .scorer
            .as_ref()
            .ok_or_else(|| anyhow!("the snapshot has no scorer"))?;
        let users = snapshot
            .users
            .as_ref()
            .ok_or_else(|| anyhow!("the snapshot has no user embeddings"))?;
        score_with_scorer(scorer, users, &opts.user_id, &movies, &candidates)?
    };

    let recommendations = top_k(&movies, &candidates, &scores, opts.top_k);
    serde_json::to_writer_pretty(stdout(), &recommendations)?;
    println!();
    Ok(())
}

/// Probability of a positive outcome for every candidate.
pub fn score_with_scorer(
    scorer: &FactorizationMachine,
    users: &UserEmbeddingTable,
    user_id: &str,
    movies: &MovieFeatureTable,
    candidates: &[usize],
) -> Result<DVector<f64>, ModelError> {
    let user_index = users
        .index_of(user_id)
        .ok_or_else(|| ModelError::UnknownIdentifier(user_id.to_string()))?;
    let mut scores = Vec::with_capacity(candidates.len());
    for chunk in candidates.chunks(CHUNK_SIZE) {
        let user_rows = users.gather(&vec![user_index; chunk.len()])?;
        let logits = scorer.score(&movies.gather(chunk)?, &user_rows)?;
        scores.extend(logits.iter().map(|&logit| sigmoid(logit)));
    }
    Ok(DVector::from_vec(scores))
}

/// Expected reward of every candidate, under a sampled policy when `rng` is given.
///
/// The same policy sample scores all the candidates.
pub fn score_with_bandit(
    snapshot: &BanditSnapshot,
    users: Option<&UserEmbeddingTable>,
    user_id: &str,
    movies: &MovieFeatureTable,
    candidates: &[usize],
    rng: Option<&mut impl Rng>,
) -> Result<DVector<f64>, ModelError> {
    let bandit = LinearBandit::restore(snapshot.state.clone())?;
    let user = match users.filter(|_| snapshot.layout.user_width != 0) {
        Some(users) => Some(users.lookup(&[user_id])?),
        None => None,
    };
    let policy = match rng {
        Some(rng) => bandit.sample_policy(rng)?,
        None => bandit.policy().clone(),
    };
    let mut scores = Vec::with_capacity(candidates.len());
    for chunk in candidates.chunks(CHUNK_SIZE) {
        let user_rows = user
            .as_ref()
            .map(|user| DMatrix::from_fn(chunk.len(), user.ncols(), |_, j| user[(0, j)]));
        let contexts = snapshot
            .layout
            .assemble(&movies.gather(chunk)?, user_rows.as_ref())?;
        scores.extend((contexts * &policy).iter().copied());
    }
    Ok(DVector::from_vec(scores))
}

/// Best `k` candidates by descending score, skipping non-finite scores.
fn top_k(
    movies: &MovieFeatureTable,
    candidates: &[usize],
    scores: &DVector<f64>,
    k: usize,
) -> Vec<Recommendation> {
    candidates
        .iter()
        .zip(scores.iter())
        .filter(|(_, score)| score.is_finite())
        .sorted_by(|(_, left), (_, right)| right.total_cmp(left))
        .take(k)
        .map(|(&index, &score)| Recommendation {
            movie_id: movies.ids()[index].clone(),
            score,
        })
        .collect()
}

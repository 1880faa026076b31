//! CLI options.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand as ClapSubcommand};

use crate::bandit::InversionStrategy;
use crate::prelude::*;
use crate::scorer::Activation;
use crate::trainer::{Loss, RewardPolicy};

mod parsers;

#[derive(Parser)]
#[command(author, version, about, long_about = None, propagate_version = true)]
pub struct Opts {
    /// Sentry DSN
    #[arg(short, long, env = "MOVIE_RECOMMENDER_SENTRY_DSN")]
    pub sentry_dsn: Option<String>,

    /// Performance monitoring sample rate
    #[arg(
        long,
        default_value = "0",
        env = "MOVIE_RECOMMENDER_TRACES_SAMPLE_RATE",
        value_parser = parsers::probability_f32,
    )]
    pub traces_sample_rate: f32,

    #[command(subcommand)]
    pub subcommand: Subcommand,
}

#[derive(ClapSubcommand)]
pub enum Subcommand {
    TrainScorer(TrainScorerOpts),
    TrainBandit(TrainBanditOpts),
    Recommend(RecommendOpts),
    Discretize(DiscretizeOpts),
}

/// Ratings and movie features shared by the trainers
#[derive(Args, Clone)]
pub struct DataOpts {
    /// Ratings CSV with the `user_id,movie_id,rating_val` columns
    #[arg(long, env = "MOVIE_RECOMMENDER_RATINGS")]
    pub ratings: PathBuf,

    /// Movie features JSON document
    #[arg(long, env = "MOVIE_RECOMMENDER_MOVIES")]
    pub movies: PathBuf,

    /// Turns a rating into a reward
    #[arg(long, value_enum, default_value_t = RewardPolicy::Threshold)]
    pub reward_policy: RewardPolicy,

    /// Minimal rating considered a positive outcome by the `threshold` policy
    #[arg(long, default_value = "7")]
    pub reward_threshold: f64,

    /// Maximal rating, the `scaled` policy divides by it
    #[arg(long, default_value = "10", value_parser = parsers::positive_f64)]
    pub max_rating: f64,

    /// Fraction of the ratings held out for testing
    #[arg(long, default_value = "0.2", value_parser = parsers::probability_f64)]
    pub test_fraction: f64,

    /// Only use ratings by these users
    #[arg(long, value_delimiter = ',')]
    pub only_users: Option<Vec<String>>,

    /// Only use ratings of these movies
    #[arg(long, value_delimiter = ',')]
    pub only_movies: Option<Vec<String>>,

    /// Mini-batch size
    #[arg(long, default_value = "16", value_parser = parsers::non_zero_usize)]
    pub batch_size: usize,

    /// Number of passes over the training ratings
    #[arg(long, default_value = "10", value_parser = parsers::non_zero_usize)]
    pub n_epochs: usize,

    /// Random seed, drawn from the OS when omitted
    #[arg(long, env = "MOVIE_RECOMMENDER_SEED")]
    pub seed: Option<u64>,

    /// Batch progress logging interval
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub log_interval: StdDuration,
}

/// Factorization-machine scorer hyperparameters
#[derive(Args, Clone)]
pub struct ScorerOpts {
    /// Trainable user embedding width
    #[arg(long, default_value = "64", value_parser = parsers::non_zero_usize)]
    pub user_width: usize,

    /// Number of movie latent groups
    #[arg(long, default_value = "4", value_parser = parsers::non_zero_usize)]
    pub n_movie_groups: usize,

    /// Number of user latent groups
    #[arg(long, default_value = "4", value_parser = parsers::non_zero_usize)]
    pub n_user_groups: usize,

    /// Width of every latent group
    #[arg(long, default_value = "8", value_parser = parsers::non_zero_usize)]
    pub group_width: usize,

    /// MLP layer widths, the last one must be 1
    #[arg(long, value_delimiter = ',', default_value = "32,1")]
    pub mlp_widths: Vec<usize>,

    /// Activation between the MLP layers
    #[arg(long, value_enum, default_value_t = Activation::Relu)]
    pub activation: Activation,

    /// Dropout probability after the hidden MLP layers
    #[arg(long, default_value = "0.1", value_parser = parsers::probability_f64)]
    pub dropout: f64,

    /// Training loss
    #[arg(long, value_enum, default_value_t = Loss::Bce)]
    pub loss: Loss,
}

/// AdamW hyperparameters
#[derive(Args, Clone)]
pub struct OptimizerOpts {
    /// Initial learning rate
    #[arg(long, default_value = "0.001", value_parser = parsers::positive_f64)]
    pub learning_rate: f64,

    /// Learning rate decay per epoch
    #[arg(long, default_value = "0", value_parser = parsers::non_negative_f64)]
    pub learning_rate_decay: f64,

    /// Learning rate floor
    #[arg(long, default_value = "0.00001", value_parser = parsers::positive_f64)]
    pub min_learning_rate: f64,

    /// Decoupled weight decay
    #[arg(long, default_value = "0.01", value_parser = parsers::non_negative_f64)]
    pub weight_decay: f64,
}

/// Linear contextual bandit hyperparameters
#[derive(Args, Clone)]
pub struct BanditOpts {
    /// Covariance inverse update strategy
    #[arg(long, value_enum, default_value_t = InversionStrategy::ShermanMorrison)]
    pub inversion: InversionStrategy,

    /// Snapshot with trained user embeddings, appended to the movie features when given
    #[arg(long)]
    pub user_snapshot: Option<PathBuf>,
}

/// Trains the factorization-machine scorer together with the user embeddings
#[derive(Args, Clone)]
pub struct TrainScorerOpts {
    #[command(flatten)]
    pub data: DataOpts,

    #[command(flatten)]
    pub scorer: ScorerOpts,

    #[command(flatten)]
    pub optimizer: OptimizerOpts,

    /// Output snapshot
    #[arg(short, long)]
    pub output: PathBuf,
}

/// Fits the linear contextual bandit over the ratings with progressive validation
#[derive(Args, Clone)]
pub struct TrainBanditOpts {
    #[command(flatten)]
    pub data: DataOpts,

    #[command(flatten)]
    pub bandit: BanditOpts,

    /// Output snapshot
    #[arg(short, long)]
    pub output: PathBuf,
}

/// Ranks the movies for a user
#[derive(Args, Clone)]
pub struct RecommendOpts {
    /// Trained snapshot
    #[arg(long)]
    pub snapshot: PathBuf,

    /// Movie features JSON document
    #[arg(long, env = "MOVIE_RECOMMENDER_MOVIES")]
    pub movies: PathBuf,

    /// User to recommend for
    #[arg(long)]
    pub user_id: String,

    /// Ranks with the bandit instead of the scorer
    #[arg(long)]
    pub bandit: bool,

    /// Samples the bandit policy instead of using the point estimate
    #[arg(long, requires = "bandit")]
    pub thompson: bool,

    /// Ratings CSV, the movies the user has already rated are skipped
    #[arg(long)]
    pub exclude_rated: Option<PathBuf>,

    /// Number of recommendations
    #[arg(short = 'k', long, default_value = "10", value_parser = parsers::non_zero_usize)]
    pub top_k: usize,

    /// Random seed for the Thompson sampling
    #[arg(long)]
    pub seed: Option<u64>,
}

/// Prints the HL-Gauss target distributions of the rewards as JSON
#[derive(Args, Clone)]
pub struct DiscretizeOpts {
    /// Lower end of the support
    #[arg(long, default_value = "0")]
    pub v_min: f64,

    /// Upper end of the support
    #[arg(long, default_value = "10")]
    pub v_max: f64,

    /// Number of bins
    #[arg(long, default_value = "10", value_parser = parsers::non_zero_usize)]
    pub n_bins: usize,

    /// Gaussian standard deviation relative to the bin width
    #[arg(long, default_value = "0.75", value_parser = parsers::positive_f64)]
    pub sigma_over_bin_size: f64,

    /// Rewards to discretize
    #[arg(required = true, allow_negative_numbers = true)]
    pub rewards: Vec<f64>,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn verify_command_ok() {
        Opts::command().debug_assert();
    }

    #[test]
    fn parse_train_scorer_ok() -> Result {
        let opts = Opts::try_parse_from([
            "movie-recommender",
            "train-scorer",
            "--ratings",
            "ratings.csv",
            "--movies",
            "movies.json",
            "--mlp-widths",
            "16,8,1",
            "--loss",
            "mse",
            "-o",
            "snapshot.json",
        ])?;
        let Subcommand::TrainScorer(opts) = opts.subcommand else {
            bail!("expected `train-scorer`");
        };
        assert_eq!(opts.scorer.mlp_widths, vec![16, 8, 1]);
        assert_eq!(opts.scorer.loss, Loss::Mse);
        assert_eq!(opts.data.batch_size, 16);
        assert_eq!(opts.data.log_interval, StdDuration::from_secs(10));
        Ok(())
    }

    #[test]
    fn zero_batch_size_fails() {
        let result = Opts::try_parse_from([
            "movie-recommender",
            "train-bandit",
            "--ratings",
            "ratings.csv",
            "--movies",
            "movies.json",
            "--batch-size",
            "0",
            "-o",
            "snapshot.json",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn thompson_requires_bandit_fails() {
        let result = Opts::try_parse_from([
            "movie-recommender",
            "recommend",
            "--snapshot",
            "snapshot.json",
            "--movies",
            "movies.json",
            "--user-id",
            "ann",
            "--thompson",
        ]);
        assert!(result.is_err());
    }
}

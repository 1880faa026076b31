use nalgebra::{DMatrix, DVector};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ensure_dimension, ModelError};
use crate::scorer::{Activation, Linear, Mlp, MlpBuilder, Parameter, Parameters};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScorerConfig {
    /// Raw movie vector width `Dm`.
    pub movie_width: usize,

    /// Raw user vector width `Du`.
    pub user_width: usize,

    /// Number of movie latent groups `Km`.
    pub n_movie_groups: usize,

    /// Number of user latent groups `Ku`.
    pub n_user_groups: usize,

    /// Shared latent group width `e`.
    pub group_width: usize,

    /// MLP layer widths, ending in `1`.
    pub mlp_widths: Vec<usize>,

    pub activation: Activation,

    /// Dropout after the hidden MLP layers, training only.
    pub dropout: f64,
}

impl ScorerConfig {
    pub fn validate(&self) -> Result<(), ModelError> {
        for (name, value) in [
            ("movie width", self.movie_width),
            ("user width", self.user_width),
            ("movie group count", self.n_movie_groups),
            ("user group count", self.n_user_groups),
            ("group width", self.group_width),
        ] {
            if value == 0 {
                return Err(ModelError::configuration(format!("{} must be positive", name)));
            }
        }
        if self.mlp_widths.last() != Some(&1) {
            return Err(ModelError::configuration(format!(
                "the last MLP layer must produce a single logit, got {:?}",
                self.mlp_widths,
            )));
        }
        Ok(())
    }

    const fn movie_latent_width(&self) -> usize {
        self.n_movie_groups * self.group_width
    }

    const fn user_latent_width(&self) -> usize {
        self.n_user_groups * self.group_width
    }
}

/// Input gradients of the last training pass.
#[derive(Debug)]
pub struct InputGradients {
    pub movies: DMatrix<f64>,
    pub users: DMatrix<f64>,
}

/// Per-row group sums of the last training pass.
#[derive(Debug, Clone)]
struct GroupSums {
    movies: DMatrix<f64>,
    users: DMatrix<f64>,
}

/// Factorization machine with an MLP residual:
///
/// `logit = mlp([movie latents, user latents]) + movie bias + user bias + Σᵢⱼ ⟨mᵢ, uⱼ⟩`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FactorizationMachine {
    config: ScorerConfig,

    /// `Dm → Km·e + 1`, the trailing output is the additive movie term.
    movie_projection: Linear,

    /// `Du → Ku·e + 1`, the trailing output is the additive user term.
    user_projection: Linear,

    mlp: Mlp,

    #[serde(skip)]
    group_sums: Option<GroupSums>,
}

impl FactorizationMachine {
    pub fn new(config: ScorerConfig, rng: &mut impl Rng) -> Result<Self, ModelError> {
        config.validate()?;
        let movie_projection =
            Linear::new(config.movie_width, config.movie_latent_width() + 1, rng);
        let user_projection =
            Linear::new(config.user_width, config.user_latent_width() + 1, rng);
        let mlp = MlpBuilder::new(config.movie_latent_width() + config.user_latent_width())
            .widths(&config.mlp_widths)
            .activation(config.activation)
            .dropout(config.dropout)
            .build(rng)?;
        Ok(Self {
            config,
            movie_projection,
            user_projection,
            mlp,
            group_sums: None,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &ScorerConfig {
        &self.config
    }

    /// Checks a deserialized scorer against its own configuration.
    pub fn validate(&self) -> Result<(), ModelError> {
        self.config.validate()?;
        self.movie_projection
            .validate(self.config.movie_width, self.config.movie_latent_width() + 1)?;
        self.user_projection
            .validate(self.config.user_width, self.config.user_latent_width() + 1)?;
        self.mlp
            .validate(self.config.movie_latent_width() + self.config.user_latent_width())?;
        if self.mlp.widths() != self.config.mlp_widths {
            return Err(ModelError::configuration("MLP layers disagree with the configuration"));
        }
        Ok(())
    }

    /// Logits for `n` movie rows paired with `n` user rows.
    pub fn score(
        &self,
        movies: &DMatrix<f64>,
        users: &DMatrix<f64>,
    ) -> Result<DVector<f64>, ModelError> {
        self.check_inputs(movies, users)?;
        let movie_dense = self.movie_projection.forward(movies);
        let user_dense = self.user_projection.forward(users);
        let mlp_output = self.mlp.forward(&self.concatenate_latents(&movie_dense, &user_dense));
        Ok(self.combine(&movie_dense, &user_dense, &mlp_output).0)
    }

    /// The `Km × Ku` grid of latent dot products, one per batch row.
    pub fn interaction_grid(
        &self,
        movies: &DMatrix<f64>,
        users: &DMatrix<f64>,
    ) -> Result<Vec<DMatrix<f64>>, ModelError> {
        self.check_inputs(movies, users)?;
        pairwise_interaction_grid(
            &self.movie_latents(&self.movie_projection.forward(movies)),
            &self.user_latents(&self.user_projection.forward(users)),
            self.config.group_width,
        )
    }

    /// Training pass: applies dropout and caches what [`FactorizationMachine::backward`] needs.
    pub fn forward_train(
        &mut self,
        movies: &DMatrix<f64>,
        users: &DMatrix<f64>,
        rng: &mut impl Rng,
    ) -> Result<DVector<f64>, ModelError> {
        self.check_inputs(movies, users)?;
        let movie_dense = self.movie_projection.forward_train(movies.clone());
        let user_dense = self.user_projection.forward_train(users.clone());
        let latents = self.concatenate_latents(&movie_dense, &user_dense);
        let mlp_output = self.mlp.forward_train(latents, rng);
        let (logits, group_sums) = self.combine(&movie_dense, &user_dense, &mlp_output);
        self.group_sums = Some(group_sums);
        Ok(logits)
    }

    /// Accumulates the parameter gradients given `∂loss/∂logit`.
    pub fn backward(
        &mut self,
        logit_gradient: &DVector<f64>,
    ) -> Result<InputGradients, ModelError> {
        let group_sums = self.group_sums.take().ok_or_else(|| {
            ModelError::configuration("backward pass without a training forward pass")
        })?;
        let n_rows = group_sums.movies.nrows();
        ensure_dimension("logit gradient", n_rows, logit_gradient.len())?;

        let movie_latent_width = self.config.movie_latent_width();
        let user_latent_width = self.config.user_latent_width();
        let latent_gradient = self
            .mlp
            .backward(&DMatrix::from_column_slice(n_rows, 1, logit_gradient.as_slice()))?;

        // ∂/∂mᵢ Σᵢⱼ ⟨mᵢ, uⱼ⟩ = Σⱼ uⱼ, and symmetrically for the users.
        let movie_gradient = self.dense_gradient(
            logit_gradient,
            &group_sums.users,
            self.config.n_movie_groups,
            &latent_gradient.columns(0, movie_latent_width).into_owned(),
        );
        let user_gradient = self.dense_gradient(
            logit_gradient,
            &group_sums.movies,
            self.config.n_user_groups,
            &latent_gradient
                .columns(movie_latent_width, user_latent_width)
                .into_owned(),
        );

        Ok(InputGradients {
            movies: self.movie_projection.backward(&movie_gradient)?,
            users: self.user_projection.backward(&user_gradient)?,
        })
    }

    fn check_inputs(
        &self,
        movies: &DMatrix<f64>,
        users: &DMatrix<f64>,
    ) -> Result<(), ModelError> {
        ensure_dimension("movie vector", self.config.movie_width, movies.ncols())?;
        ensure_dimension("user vector", self.config.user_width, users.ncols())?;
        ensure_dimension("user batch", movies.nrows(), users.nrows())
    }

    fn movie_latents(&self, movie_dense: &DMatrix<f64>) -> DMatrix<f64> {
        movie_dense.columns(0, self.config.movie_latent_width()).into_owned()
    }

    fn user_latents(&self, user_dense: &DMatrix<f64>) -> DMatrix<f64> {
        user_dense.columns(0, self.config.user_latent_width()).into_owned()
    }

    fn concatenate_latents(
        &self,
        movie_dense: &DMatrix<f64>,
        user_dense: &DMatrix<f64>,
    ) -> DMatrix<f64> {
        let movie_latent_width = self.config.movie_latent_width();
        let user_latent_width = self.config.user_latent_width();
        let mut latents =
            DMatrix::zeros(movie_dense.nrows(), movie_latent_width + user_latent_width);
        latents
            .columns_mut(0, movie_latent_width)
            .copy_from(&movie_dense.columns(0, movie_latent_width));
        latents
            .columns_mut(movie_latent_width, user_latent_width)
            .copy_from(&user_dense.columns(0, user_latent_width));
        latents
    }

    fn combine(
        &self,
        movie_dense: &DMatrix<f64>,
        user_dense: &DMatrix<f64>,
        mlp_output: &DMatrix<f64>,
    ) -> (DVector<f64>, GroupSums) {
        let group_width = self.config.group_width;
        let group_sums = GroupSums {
            movies: group_sum(&self.movie_latents(movie_dense), group_width),
            users: group_sum(&self.user_latents(user_dense), group_width),
        };
        let interactions = row_dots(&group_sums.movies, &group_sums.users);
        let logits = DVector::from_fn(movie_dense.nrows(), |i, _| {
            mlp_output[(i, 0)]
                + movie_dense[(i, movie_dense.ncols() - 1)]
                + user_dense[(i, user_dense.ncols() - 1)]
                + interactions[i]
        });
        (logits, group_sums)
    }

    /// Gradient of one projection's output: the FM term for every latent group,
    /// the MLP term on top, and the logit gradient itself for the additive column.
    fn dense_gradient(
        &self,
        logit_gradient: &DVector<f64>,
        other_group_sum: &DMatrix<f64>,
        n_groups: usize,
        mlp_gradient: &DMatrix<f64>,
    ) -> DMatrix<f64> {
        let group_width = self.config.group_width;
        let latent_width = n_groups * group_width;
        let n_rows = logit_gradient.len();
        let mut gradient = DMatrix::zeros(n_rows, latent_width + 1);
        for row in 0..n_rows {
            for group in 0..n_groups {
                for k in 0..group_width {
                    gradient[(row, group * group_width + k)] =
                        logit_gradient[row] * other_group_sum[(row, k)];
                }
            }
            gradient[(row, latent_width)] = logit_gradient[row];
        }
        let mut latent_gradient = gradient.columns_mut(0, latent_width);
        latent_gradient += mlp_gradient;
        gradient
    }
}

impl Parameters for FactorizationMachine {
    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut parameters = self.movie_projection.parameters_mut();
        parameters.extend(self.user_projection.parameters_mut());
        parameters.extend(self.mlp.parameters_mut());
        parameters
    }
}

/// Sums the `e`-wide column groups of every row: `n × (K·e) → n × e`.
fn group_sum(latents: &DMatrix<f64>, group_width: usize) -> DMatrix<f64> {
    let mut sum = DMatrix::zeros(latents.nrows(), group_width);
    for group in 0..latents.ncols() / group_width {
        sum += latents.columns(group * group_width, group_width);
    }
    sum
}

fn row_dots(left: &DMatrix<f64>, right: &DMatrix<f64>) -> DVector<f64> {
    DVector::from_fn(left.nrows(), |i, _| left.row(i).dot(&right.row(i)))
}

/// Explicit `Km × Ku` grids of latent dot products.
pub fn pairwise_interaction_grid(
    movie_latents: &DMatrix<f64>,
    user_latents: &DMatrix<f64>,
    group_width: usize,
) -> Result<Vec<DMatrix<f64>>, ModelError> {
    check_latents(movie_latents, user_latents, group_width)?;
    let n_movie_groups = movie_latents.ncols() / group_width;
    let n_user_groups = user_latents.ncols() / group_width;
    Ok((0..movie_latents.nrows())
        .map(|row| {
            DMatrix::from_fn(n_movie_groups, n_user_groups, |i, j| {
                movie_latents
                    .view((row, i * group_width), (1, group_width))
                    .dot(&user_latents.view((row, j * group_width), (1, group_width)))
            })
        })
        .collect())
}

fn check_latents(
    movie_latents: &DMatrix<f64>,
    user_latents: &DMatrix<f64>,
    group_width: usize,
) -> Result<(), ModelError> {
    if group_width == 0 {
        return Err(ModelError::configuration("group width must be positive"));
    }
    ensure_dimension("user latent batch", movie_latents.nrows(), user_latents.nrows())?;
    for (what, latents) in [("movie", movie_latents), ("user", user_latents)] {
        if latents.ncols() % group_width != 0 {
            return Err(ModelError::configuration(format!(
                "{} latent width {} is not a multiple of the group width {}",
                what,
                latents.ncols(),
                group_width,
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand::Rng;
    use rand_distr::StandardNormal;

    use super::*;
    use crate::prelude::Result;

    fn config() -> ScorerConfig {
        ScorerConfig {
            movie_width: 5,
            user_width: 3,
            n_movie_groups: 2,
            n_user_groups: 3,
            group_width: 2,
            mlp_widths: vec![4, 1],
            activation: Activation::Tanh,
            dropout: 0.0,
        }
    }

    fn random_matrix(rng: &mut StdRng, n_rows: usize, n_columns: usize) -> DMatrix<f64> {
        DMatrix::from_fn(n_rows, n_columns, |_, _| rng.sample(StandardNormal))
    }

    #[test]
    fn score_shape_ok() -> Result {
        let mut rng = StdRng::seed_from_u64(0);
        let scorer = FactorizationMachine::new(config(), &mut rng)?;
        let movies = random_matrix(&mut rng, 7, 5);
        let users = random_matrix(&mut rng, 7, 3);
        let logits = scorer.score(&movies, &users)?;
        assert_eq!(logits.len(), 7);
        assert!(logits.iter().all(|logit| logit.is_finite()));
        Ok(())
    }

    #[test]
    fn invalid_mlp_fails() {
        let config = ScorerConfig {
            mlp_widths: vec![4, 2],
            ..config()
        };
        assert!(matches!(
            FactorizationMachine::new(config, &mut StdRng::seed_from_u64(0)),
            Err(ModelError::Configuration(_)),
        ));
    }

    #[test]
    fn zero_dimension_fails() {
        let config = ScorerConfig {
            group_width: 0,
            ..config()
        };
        assert!(FactorizationMachine::new(config, &mut StdRng::seed_from_u64(0)).is_err());
    }

    #[test]
    fn wrong_widths_fail() -> Result {
        let mut rng = StdRng::seed_from_u64(1);
        let scorer = FactorizationMachine::new(config(), &mut rng)?;
        assert!(matches!(
            scorer.score(&random_matrix(&mut rng, 2, 4), &random_matrix(&mut rng, 2, 3)),
            Err(ModelError::DimensionMismatch { what: "movie vector", expected: 5, actual: 4 }),
        ));
        assert!(matches!(
            scorer.score(&random_matrix(&mut rng, 2, 5), &random_matrix(&mut rng, 2, 4)),
            Err(ModelError::DimensionMismatch { what: "user vector", expected: 3, actual: 4 }),
        ));
        assert!(matches!(
            scorer.score(&random_matrix(&mut rng, 2, 5), &random_matrix(&mut rng, 3, 3)),
            Err(ModelError::DimensionMismatch { what: "user batch", .. }),
        ));
        Ok(())
    }

    #[test]
    fn grid_sums_to_interaction_term_ok() -> Result {
        let mut rng = StdRng::seed_from_u64(2);
        let scorer = FactorizationMachine::new(config(), &mut rng)?;
        let movies = random_matrix(&mut rng, 4, 5);
        let users = random_matrix(&mut rng, 4, 3);

        let grids = scorer.interaction_grid(&movies, &users)?;
        assert_eq!(grids.len(), 4);
        assert_eq!(grids[0].shape(), (2, 3));

        let movie_dense = scorer.movie_projection.forward(&movies);
        let user_dense = scorer.user_projection.forward(&users);
        let latents = scorer.concatenate_latents(&movie_dense, &user_dense);
        let mlp_output = scorer.mlp.forward(&latents);
        let logits = scorer.score(&movies, &users)?;
        for (row, grid) in grids.iter().enumerate() {
            let expected =
                mlp_output[(row, 0)] + movie_dense[(row, 4)] + user_dense[(row, 6)] + grid.sum();
            assert!((logits[row] - expected).abs() < 1e-12);
        }
        Ok(())
    }

    #[test]
    fn inference_matches_training_pass_ok() -> Result {
        let mut rng = StdRng::seed_from_u64(3);
        let mut scorer = FactorizationMachine::new(config(), &mut rng)?;
        let movies = random_matrix(&mut rng, 3, 5);
        let users = random_matrix(&mut rng, 3, 3);
        let inference = scorer.score(&movies, &users)?;
        let training = scorer.forward_train(&movies, &users, &mut rng)?;
        assert!((inference - training).amax() < 1e-12);
        Ok(())
    }

    /// Compares the analytic gradients of `Σ wᵢ logitᵢ` with central differences.
    #[test]
    fn gradients_match_finite_differences_ok() -> Result {
        const EPSILON: f64 = 1e-6;

        let mut rng = StdRng::seed_from_u64(4);
        let mut scorer = FactorizationMachine::new(config(), &mut rng)?;
        let movies = random_matrix(&mut rng, 3, 5);
        let users = random_matrix(&mut rng, 3, 3);
        let weights = DVector::from_fn(3, |_, _| rng.sample(StandardNormal));
        let objective =
            |scorer: &FactorizationMachine, movies: &DMatrix<f64>, users: &DMatrix<f64>| {
                scorer.score(movies, users).map(|logits| logits.dot(&weights))
            };

        scorer.zero_gradients();
        scorer.forward_train(&movies, &users, &mut rng)?;
        let input_gradients = scorer.backward(&weights)?;
        let analytic: Vec<DMatrix<f64>> = scorer
            .parameters_mut()
            .into_iter()
            .map(|parameter| {
                let shape = parameter.value().shape();
                parameter
                    .gradient()
                    .cloned()
                    .unwrap_or_else(|| DMatrix::zeros(shape.0, shape.1))
            })
            .collect();

        let n_parameters = analytic.len();
        assert_eq!(n_parameters, 8);
        for (index, gradient) in analytic.iter().enumerate() {
            for k in 0..gradient.len() {
                scorer.parameters_mut()[index].value_mut()[k] += EPSILON;
                let plus = objective(&scorer, &movies, &users)?;
                scorer.parameters_mut()[index].value_mut()[k] -= 2.0 * EPSILON;
                let minus = objective(&scorer, &movies, &users)?;
                scorer.parameters_mut()[index].value_mut()[k] += EPSILON;
                let numeric = (plus - minus) / (2.0 * EPSILON);
                assert!(
                    (numeric - gradient[k]).abs() < 1e-5 * (1.0 + numeric.abs()),
                    "parameter {} entry {}: {} vs {}",
                    index,
                    k,
                    numeric,
                    gradient[k],
                );
            }
        }

        for k in 0..users.len() {
            let mut shifted = users.clone();
            shifted[k] += EPSILON;
            let plus = objective(&scorer, &movies, &shifted)?;
            shifted[k] -= 2.0 * EPSILON;
            let minus = objective(&scorer, &movies, &shifted)?;
            let numeric = (plus - minus) / (2.0 * EPSILON);
            assert!((numeric - input_gradients.users[k]).abs() < 1e-5 * (1.0 + numeric.abs()));
        }
        assert_eq!(input_gradients.movies.shape(), movies.shape());
        Ok(())
    }

    #[test]
    fn json_round_trip_ok() -> Result {
        let mut rng = StdRng::seed_from_u64(5);
        let scorer = FactorizationMachine::new(config(), &mut rng)?;
        let json = serde_json::to_string(&scorer)?;
        let restored: FactorizationMachine = serde_json::from_str(&json)?;
        restored.validate()?;
        let movies = random_matrix(&mut rng, 2, 5);
        let users = random_matrix(&mut rng, 2, 3);
        let difference = restored.score(&movies, &users)? - scorer.score(&movies, &users)?;
        assert!(difference.amax() < 1e-9);
        Ok(())
    }

    proptest! {
        #[test]
        fn interaction_sum_ignores_group_order(
            values in prop::collection::vec(-10.0..10.0f64, 2 * (3 + 4) * 2),
            shift in 0..3usize,
        ) {
            let (n_movie_groups, n_user_groups, group_width) = (3, 4, 2);
            let movies = DMatrix::from_row_slice(2, n_movie_groups * group_width, &values[..12]);
            let users = DMatrix::from_row_slice(2, n_user_groups * group_width, &values[12..]);
            let rotate = |latents: &DMatrix<f64>, n_groups: usize| {
                DMatrix::from_fn(latents.nrows(), latents.ncols(), |row, column| {
                    let group = (column / group_width + shift) % n_groups;
                    latents[(row, group * group_width + column % group_width)]
                })
            };

            let interaction_sum = |movies: &DMatrix<f64>, users: &DMatrix<f64>| {
                row_dots(&group_sum(movies, group_width), &group_sum(users, group_width))
            };
            let sum = interaction_sum(&movies, &users);
            let permuted =
                interaction_sum(&rotate(&movies, n_movie_groups), &rotate(&users, n_user_groups));
            let grids = pairwise_interaction_grid(&movies, &users, group_width).unwrap();

            prop_assert!((&sum - &permuted).amax() < 1e-9);
            for (row, grid) in grids.iter().enumerate() {
                prop_assert!((grid.sum() - sum[row]).abs() < 1e-9);
            }
        }
    }
}

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use nalgebra::DMatrix;
use serde::Deserialize;

use crate::features::{gather_rows, FeatureProvider, FeatureSchema};
use crate::prelude::*;

#[derive(Deserialize)]
struct MovieFeaturesDocument {
    fields: FeatureSchema,
    movies: Vec<MovieEntry>,
}

#[derive(Deserialize)]
struct MovieEntry {
    id: String,
    features: AHashMap<String, Vec<f64>>,
}

/// Read-only table of assembled movie feature vectors.
pub struct MovieFeatureTable {
    schema: FeatureSchema,
    ids: Vec<String>,
    index: AHashMap<String, usize>,

    /// Row-major `ids.len() × schema.width()` values.
    values: Vec<f64>,
}

impl MovieFeatureTable {
    #[instrument(level = "info", skip_all, fields(path = ?path.as_ref()))]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let start_instant = Instant::now();
        let file = File::open(path.as_ref())
            .with_context(|| format!("failed to open `{}`", path.as_ref().display()))?;
        let table = Self::from_reader(BufReader::new(file))?;
        info!(
            n_movies = table.len(),
            width = table.width(),
            elapsed = ?start_instant.elapsed(),
            "loaded",
        );
        Ok(table)
    }

    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let document: MovieFeaturesDocument =
            serde_json::from_reader(reader).context("failed to parse the movie features")?;
        let schema = document.fields;
        let mut ids = Vec::with_capacity(document.movies.len());
        let mut index = AHashMap::default();
        let mut values = Vec::with_capacity(document.movies.len() * schema.width());
        for movie in document.movies {
            let vector = schema
                .assemble(&movie.features)
                .with_context(|| format!("invalid features of movie `{}`", movie.id))?;
            if index.insert(movie.id.clone(), ids.len()).is_some() {
                bail!("movie `{}` is listed twice", movie.id);
            }
            values.extend(vector);
            ids.push(movie.id);
        }
        Ok(Self {
            schema,
            ids,
            index,
            values,
        })
    }

    #[must_use]
    pub const fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    #[must_use]
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }
}

impl FeatureProvider for MovieFeatureTable {
    fn width(&self) -> usize {
        self.schema.width()
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    fn gather(&self, indices: &[usize]) -> Result<DMatrix<f64>, ModelError> {
        gather_rows(&self.values, self.schema.width(), indices)
    }
}

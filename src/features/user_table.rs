use nalgebra::DMatrix;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::{ensure_dimension, ModelError};
use crate::features::FeatureProvider;
use crate::prelude::AHashMap;
use crate::scorer::{Parameter, Parameters};

#[derive(Serialize, Deserialize)]
struct UserEmbeddingRecord {
    ids: Vec<String>,
    embeddings: Parameter,
}

/// Trainable user vectors, one row per known user.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(try_from = "UserEmbeddingRecord", into = "UserEmbeddingRecord")]
pub struct UserEmbeddingTable {
    ids: Vec<String>,
    index: AHashMap<String, usize>,
    embeddings: Parameter,
}

impl TryFrom<UserEmbeddingRecord> for UserEmbeddingTable {
    type Error = ModelError;

    fn try_from(record: UserEmbeddingRecord) -> Result<Self, Self::Error> {
        let n_rows = record.embeddings.value().nrows();
        ensure_dimension("user embeddings", record.ids.len(), n_rows)?;
        Ok(Self {
            index: index_ids(&record.ids)?,
            ids: record.ids,
            embeddings: record.embeddings,
        })
    }
}

impl From<UserEmbeddingTable> for UserEmbeddingRecord {
    fn from(table: UserEmbeddingTable) -> Self {
        Self {
            ids: table.ids,
            embeddings: table.embeddings,
        }
    }
}

impl UserEmbeddingTable {
    /// Draws every embedding from the standard normal distribution.
    pub fn new(ids: Vec<String>, width: usize, rng: &mut impl Rng) -> Result<Self, ModelError> {
        if width == 0 {
            return Err(ModelError::configuration("user embedding width must be positive"));
        }
        let embeddings = DMatrix::from_fn(ids.len(), width, |_, _| rng.sample(StandardNormal));
        Ok(Self {
            index: index_ids(&ids)?,
            ids,
            embeddings: Parameter::new(embeddings),
        })
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

    /// Adds the batch gradient rows onto the gathered users' rows.
    pub fn scatter_gradient(
        &mut self,
        indices: &[usize],
        gradient: &DMatrix<f64>,
    ) -> Result<(), ModelError> {
        ensure_dimension("user gradient rows", indices.len(), gradient.nrows())?;
        ensure_dimension("user gradient width", self.width(), gradient.ncols())?;
        if let Some(&index) = indices.iter().find(|&&index| index >= self.len()) {
            return Err(ModelError::UnknownIdentifier(format!("user row #{}", index)));
        }
        self.embeddings.accumulate_rows(indices, gradient);
        Ok(())
    }
}

impl FeatureProvider for UserEmbeddingTable {
    fn width(&self) -> usize {
        self.embeddings.value().ncols()
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    fn gather(&self, indices: &[usize]) -> Result<DMatrix<f64>, ModelError> {
        let embeddings = self.embeddings.value();
        if let Some(&index) = indices.iter().find(|&&index| index >= embeddings.nrows()) {
            return Err(ModelError::UnknownIdentifier(format!("user row #{}", index)));
        }
        Ok(embeddings.select_rows(indices))
    }
}

impl Parameters for UserEmbeddingTable {
    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![&mut self.embeddings]
    }
}

fn index_ids(ids: &[String]) -> Result<AHashMap<String, usize>, ModelError> {
    let mut index = AHashMap::default();
    for (i, id) in ids.iter().enumerate() {
        if index.insert(id.clone(), i).is_some() {
            return Err(ModelError::configuration(format!("user `{}` is listed twice", id)));
        }
    }
    Ok(index)
}

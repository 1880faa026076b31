use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::prelude::AHashMap;

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    #[default]
    Identity,

    /// `ln(1 + x)`, for heavy-tailed counts such as the number of votes.
    Log1p,
}

impl Transform {
    #[must_use]
    pub fn apply(self, value: f64) -> f64 {
        match self {
            Self::Identity => value,
            Self::Log1p => value.ln_1p(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub width: usize,

    #[serde(default)]
    pub transform: Transform,
}

/// Ordered list of named fields, fixed at configuration time.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(try_from = "Vec<FieldSpec>", into = "Vec<FieldSpec>")]
pub struct FeatureSchema {
    fields: Vec<FieldSpec>,
    width: usize,
}

impl TryFrom<Vec<FieldSpec>> for FeatureSchema {
    type Error = ModelError;

    fn try_from(fields: Vec<FieldSpec>) -> Result<Self, Self::Error> {
        Self::new(fields)
    }
}

impl From<FeatureSchema> for Vec<FieldSpec> {
    fn from(schema: FeatureSchema) -> Self {
        schema.fields
    }
}

impl FeatureSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Result<Self, ModelError> {
        if fields.is_empty() {
            return Err(ModelError::configuration("the feature schema is empty"));
        }
        let mut names = AHashMap::default();
        for (i, field) in fields.iter().enumerate() {
            if field.width == 0 {
                return Err(ModelError::configuration(format!(
                    "field `{}` has zero width",
                    field.name,
                )));
            }
            if names.insert(field.name.as_str(), i).is_some() {
                return Err(ModelError::configuration(format!(
                    "field `{}` is declared twice",
                    field.name,
                )));
            }
        }
        let width = fields.iter().map(|field| field.width).sum();
        Ok(Self { fields, width })
    }

    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    #[must_use]
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Concatenates the named field values in schema order, applying each field's transform.
    pub fn assemble(&self, values: &AHashMap<String, Vec<f64>>) -> Result<Vec<f64>, ModelError> {
        if let Some(unknown) = values
            .keys()
            .find(|name| !self.fields.iter().any(|field| &field.name == *name))
        {
            return Err(ModelError::configuration(format!("unknown field `{}`", unknown)));
        }
        let mut vector = Vec::with_capacity(self.width);
        for field in &self.fields {
            let value = values.get(&field.name).ok_or_else(|| {
                ModelError::configuration(format!("missing field `{}`", field.name))
            })?;
            if value.len() != field.width {
                return Err(ModelError::DimensionMismatch {
                    what: "feature field",
                    expected: field.width,
                    actual: value.len(),
                });
            }
            vector.extend(value.iter().map(|&x| field.transform.apply(x)));
        }
        Ok(vector)
    }
}

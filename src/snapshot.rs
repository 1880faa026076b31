//! Trained models persisted as a single JSON document.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bandit::{BanditState, ContextLayout};
use crate::error::ensure_dimension;
use crate::features::{FeatureProvider, UserEmbeddingTable};
use crate::prelude::*;
use crate::scorer::FactorizationMachine;

pub const VERSION: u32 = 1;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BanditSnapshot {
    pub layout: ContextLayout,
    pub state: BanditState,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Snapshot {
    pub version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandit: Option<BanditSnapshot>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scorer: Option<FactorizationMachine>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<UserEmbeddingTable>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: VERSION,
            bandit: None,
            scorer: None,
            users: None,
        }
    }
}

impl Snapshot {
    /// Checks every component and how they fit together.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.version != VERSION {
            return Err(ModelError::configuration(format!(
                "unsupported snapshot version {}, expected {}",
                self.version, VERSION,
            )));
        }
        if let Some(bandit) = &self.bandit {
            bandit.state.validate()?;
            let dimension = bandit.state.policy.len();
            ensure_dimension("bandit context", bandit.layout.dimension(), dimension)?;
            if bandit.layout.user_width != 0 {
                let users = self.users.as_ref().ok_or_else(|| {
                    ModelError::configuration("the bandit contexts need the user embeddings")
                })?;
                ensure_dimension("user vector", bandit.layout.user_width, users.width())?;
            }
        }
        if let Some(scorer) = &self.scorer {
            scorer.validate()?;
            if let Some(users) = &self.users {
                ensure_dimension("user vector", scorer.config().user_width, users.width())?;
            }
        }
        Ok(())
    }

    #[instrument(level = "info", skip_all, fields(path = ?path.as_ref()))]
    pub fn save(&self, path: impl AsRef<Path>) -> Result {
        let start_instant = Instant::now();
        let file = File::create(path.as_ref())
            .with_context(|| format!("failed to create `{}`", path.as_ref().display()))?;
        let mut writer = BufWriter::new(file);
        self.write(&mut writer)?;
        writer.flush()?;
        info!(elapsed = ?start_instant.elapsed(), "saved");
        Ok(())
    }

    #[instrument(level = "info", skip_all, fields(path = ?path.as_ref()))]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())
            .with_context(|| format!("failed to open `{}`", path.as_ref().display()))?;
        let snapshot = Self::read(BufReader::new(file))?;
        info!(
            has_bandit = snapshot.bandit.is_some(),
            has_scorer = snapshot.scorer.is_some(),
            n_users = snapshot.users.as_ref().map_or(0, UserEmbeddingTable::len),
            "loaded",
        );
        Ok(snapshot)
    }

    pub fn write(&self, writer: impl Write) -> Result {
        serde_json::to_writer(writer, self).context("failed to serialize the snapshot")
    }

    pub fn read(reader: impl Read) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_reader(reader).context("failed to parse the snapshot")?;
        snapshot.validate()?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::bandit::{InversionStrategy, LinearBandit};
    use crate::scorer::{Activation, ScorerConfig};

    fn snapshot() -> Result<Snapshot> {
        let mut rng = StdRng::seed_from_u64(0);
        let mut bandit = LinearBandit::new(4, InversionStrategy::ShermanMorrison)?;
        bandit.update(&[[1.0, 0.0, 2.0, 1.0]], &[1.0])?;
        let scorer = FactorizationMachine::new(
            ScorerConfig {
                movie_width: 3,
                user_width: 2,
                n_movie_groups: 2,
                n_user_groups: 2,
                group_width: 2,
                mlp_widths: vec![3, 1],
                activation: Activation::Relu,
                dropout: 0.1,
            },
            &mut rng,
        )?;
        let users = UserEmbeddingTable::new(vec!["ann".to_string()], 2, &mut rng)?;
        Ok(Snapshot {
            bandit: Some(BanditSnapshot {
                layout: ContextLayout {
                    movie_width: 3,
                    user_width: 0,
                },
                state: bandit.state(),
            }),
            scorer: Some(scorer),
            users: Some(users),
            ..Default::default()
        })
    }

    #[test]
    fn save_load_ok() -> Result {
        let directory = tempfile::tempdir()?;
        let path = directory.path().join("snapshot.json");
        let snapshot = snapshot()?;
        snapshot.save(&path)?;
        let loaded = Snapshot::load(&path)?;
        assert_eq!(loaded.version, VERSION);
        assert_eq!(
            loaded.bandit.map(|bandit| bandit.state),
            snapshot.bandit.map(|bandit| bandit.state),
        );
        assert!(loaded.scorer.is_some());
        assert_eq!(loaded.users.map(|users| users.len()), Some(1));
        Ok(())
    }

    #[test]
    fn empty_snapshot_ok() -> Result {
        let mut buffer = Vec::new();
        Snapshot::default().write(&mut buffer)?;
        assert_eq!(String::from_utf8(buffer.clone())?, r#"{"version":1}"#);
        assert!(Snapshot::read(buffer.as_slice())?.bandit.is_none());
        Ok(())
    }

    #[test]
    fn wrong_version_fails() {
        assert!(Snapshot::read(r#"{"version":2}"#.as_bytes()).is_err());
    }

    #[test]
    fn mismatched_layout_fails() -> Result {
        let mut snapshot = snapshot()?;
        if let Some(bandit) = &mut snapshot.bandit {
            bandit.layout.movie_width = 2;
        }
        assert!(matches!(
            snapshot.validate(),
            Err(ModelError::DimensionMismatch { what: "bandit context", .. }),
        ));
        Ok(())
    }

    #[test]
    fn bandit_without_users_fails() -> Result {
        let mut snapshot = snapshot()?;
        if let Some(bandit) = &mut snapshot.bandit {
            bandit.layout = ContextLayout {
                movie_width: 1,
                user_width: 2,
            };
        }
        snapshot.users = None;
        assert!(snapshot.validate().is_err());
        Ok(())
    }
}

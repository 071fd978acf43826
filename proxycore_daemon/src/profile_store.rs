//! JSON persistence of the provider profile.

use proxycore_session::{PlatformError, PlatformResult, ProviderProfile};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, error};

#[derive(Debug, Clone)]
pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored profile, or `None` if nothing has been saved yet.
    pub async fn load(&self) -> PlatformResult<Option<ProviderProfile>> {
        let contents = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                error!(file = %self.path.display(), "failed to read profile: {err}");
                return Err(err.into());
            }
        };

        serde_json::from_slice(&contents).map(Some).map_err(|err| {
            error!(file = %self.path.display(), "failed to parse profile: {err}");
            PlatformError::Other(format!("corrupt profile {}: {}", self.path.display(), err))
        })
    }

    pub async fn save(&self, profile: &ProviderProfile) -> PlatformResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let serialized = serde_json::to_vec_pretty(profile)
            .map_err(|err| PlatformError::Other(format!("failed to serialize profile: {err}")))?;

        // Write beside the target and rename so readers never see a partial file
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, serialized).await?;
        fs::rename(&staging, &self.path).await?;

        debug!(file = %self.path.display(), "Saved provider profile");
        Ok(())
    }
}

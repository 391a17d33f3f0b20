//! Build script generation and trace persistence contracts.

use async_trait::async_trait;

use crate::error::{GeneratorError, PersistError};
use crate::job::Job;

/// Turns a job payload into an executable build script.
#[async_trait]
pub trait BuildScriptGenerator: Send + Sync {
    async fn generate(&self, job: &dyn Job) -> Result<Vec<u8>, GeneratorError>;
}

/// Stores the build trace downloaded from an instance.
#[async_trait]
pub trait BuildTracePersister: Send + Sync {
    async fn persist(&self, job: &dyn Job, trace: &[u8]) -> Result<(), PersistError>;
}

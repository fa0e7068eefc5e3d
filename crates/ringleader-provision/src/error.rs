//! Provisioning error types

use crate::rollback::RollbackFailure;
use ringleader_cloud::CloudError;
use thiserror::Error;

/// Errors from the provisioning stages
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error("no free private address in {region}: gave up on subnet {subnet} after {probed} candidates")]
    AddressExhausted {
        region: String,
        subnet: String,
        probed: usize,
    },

    #[error("instance {instance_id} in {region} still pending after {waited_secs}s")]
    PendingTimeout {
        instance_id: String,
        region: String,
        waited_secs: u64,
    },

    #[error("provisioning interrupted")]
    Interrupted,

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("keytool not found in PATH; a JRE is required to generate the cluster keystore")]
    KeytoolNotFound,

    #[error("keytool invocation failed: {0}")]
    Keytool(String),

    #[error("registry lookup failed: {0}")]
    Registry(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Final failure of a provisioning run, after rollback has been attempted.
///
/// The original stage failure is always the primary error; compensation
/// steps that themselves failed ride along so they cannot mask it.
#[derive(Debug)]
pub struct RunFailure {
    pub error: ProvisionError,
    pub rollback_failures: Vec<RollbackFailure>,
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)?;
        if !self.rollback_failures.is_empty() {
            write!(
                f,
                " ({} rollback step(s) also failed; resources may need manual cleanup)",
                self.rollback_failures.len()
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for RunFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

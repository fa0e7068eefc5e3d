//! Credential generation and local storage
//!
//! The generated administrator password rides in the boot configuration so
//! nodes can bootstrap their superuser account, and is written to a local
//! owner-only file instead of being echoed to the terminal.

use crate::error::Result;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

const PASSWORD_LENGTH: usize = 32;
const CREDENTIALS_DIR: &str = ".ringleader";

/// Database account the password belongs to.
pub const ADMIN_USERNAME: &str = "cassandra";

/// Characters eligible for generated passwords. Backslash and both quote
/// characters are excluded so the password can be pasted into a
/// single-quoted shell argument.
fn password_chars() -> Vec<char> {
    let mut chars: Vec<char> = ('a'..='z').chain('A'..='Z').chain('0'..='9').collect();
    chars.extend("!#$%&()*+,-./:;<=>?@[]^_`{|}~".chars());
    chars
}

pub fn generate_password() -> String {
    let chars = password_chars();
    let mut rng = rand::thread_rng();
    (0..PASSWORD_LENGTH)
        .map(|_| chars[rng.gen_range(0..chars.len())])
        .collect()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClusterCredentials {
    pub cluster_name: String,
    pub username: String,
    pub password: String,
    pub created_at: DateTime<Utc>,
}

/// Write credentials under `.ringleader/` and return the file path.
/// On unix the file is created with owner-only permissions.
pub async fn write_credentials(
    base_dir: &Path,
    cluster_name: &str,
    password: &str,
) -> Result<PathBuf> {
    let dir = base_dir.join(CREDENTIALS_DIR);
    if !dir.exists() {
        fs::create_dir_all(&dir).await?;
    }

    let path = dir.join(format!("{cluster_name}-credentials.json"));
    let credentials = ClusterCredentials {
        cluster_name: cluster_name.to_string(),
        username: ADMIN_USERNAME.to_string(),
        password: password.to_string(),
        created_at: Utc::now(),
    };
    let content = serde_json::to_string_pretty(&credentials)?;
    fs::write(&path, content).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    tracing::info!(path = %path.display(), "wrote cluster credentials");
    Ok(path)
}

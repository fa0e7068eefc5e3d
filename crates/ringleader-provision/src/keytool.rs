//! keytool CLI wrapper
//!
//! Generates the cluster keystore and truststore with the JRE's keytool.
//! Every node receives the same material through its boot configuration so
//! inter-node transport encryption works out of the box.

use crate::error::{ProvisionError, Result};
use std::process::Stdio;
use tokio::process::Command;

const KEY_ALIAS: &str = "ringleader";
const KEY_VALIDITY_DAYS: &str = "36000";
const DNAME: &str = "c=JP, l=Tokyo, o=Chronista Club, cn=chronista.club";

/// Keystore and truststore bytes, ready for base64 embedding.
pub struct TlsMaterial {
    pub keystore: Vec<u8>,
    pub truststore: Vec<u8>,
}

/// Generate a keypair, export its certificate, and import it into a fresh
/// truststore. All three files live in a tempdir that is dropped on
/// return.
pub async fn generate_keystores(cluster_name: &str) -> Result<TlsMaterial> {
    let which = Command::new("which").arg("keytool").output().await?;
    if !which.status.success() {
        return Err(ProvisionError::KeytoolNotFound);
    }

    let dir = tempfile::tempdir()?;
    let keystore_path = dir.path().join("keystore");
    let cert_path = dir.path().join("cert");
    let truststore_path = dir.path().join("truststore");

    let mut genkeypair = Command::new("keytool");
    genkeypair
        .args(["-genkeypair", "-alias", KEY_ALIAS, "-keyalg", "RSA"])
        .args(["-validity", KEY_VALIDITY_DAYS])
        .arg("-keystore")
        .arg(&keystore_path)
        .args(["-dname", DNAME])
        .args(["-storepass", cluster_name, "-keypass", cluster_name]);
    run_keytool(genkeypair).await?;

    let mut export = Command::new("keytool");
    export
        .args(["-export", "-alias", KEY_ALIAS, "-rfc"])
        .arg("-keystore")
        .arg(&keystore_path)
        .arg("-file")
        .arg(&cert_path)
        .args(["-storepass", cluster_name]);
    run_keytool(export).await?;

    let mut import = Command::new("keytool");
    import
        .args(["-import", "-noprompt", "-alias", KEY_ALIAS])
        .arg("-file")
        .arg(&cert_path)
        .arg("-keystore")
        .arg(&truststore_path)
        .args(["-storepass", cluster_name]);
    run_keytool(import).await?;

    let keystore = tokio::fs::read(&keystore_path).await?;
    let truststore = tokio::fs::read(&truststore_path).await?;
    tracing::debug!(
        keystore_bytes = keystore.len(),
        truststore_bytes = truststore.len(),
        "generated cluster keystores"
    );
    Ok(TlsMaterial {
        keystore,
        truststore,
    })
}

async fn run_keytool(mut cmd: Command) -> Result<()> {
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let output = cmd.output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProvisionError::Keytool(stderr.to_string()));
    }
    Ok(())
}

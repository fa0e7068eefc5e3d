//! Boot configuration
//!
//! Renders the YAML payload every node boots with: the container runtime
//! source, cluster identity, the flattened cross-region seed list, the TLS
//! stores, and the generated administrator password. The payload is opaque
//! to the launcher; it is handed to the boot request unmodified.

use crate::error::Result;
use crate::keytool::{self, TlsMaterial};
use crate::launcher::DATA_DEVICE;
use crate::options::ClusterOptions;
use crate::{registry, secrets};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ringleader_cloud::NodeAddress;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// First line of the user data; the base image dispatches on it.
pub const USER_DATA_HEADER: &str = "#container-base-config";

const DATA_MOUNT_POINT: &str = "/var/lib/cassandra";

/// Opaque boot payload plus the secrets that went into it.
pub struct BootPayload {
    pub user_data: String,
    pub admin_password: String,
    pub runtime_version: String,
}

/// Builds the boot payload for a run. The orchestrator only sees this
/// interface; tests substitute a canned implementation.
#[async_trait]
pub trait BootConfigBuilder: Send + Sync {
    async fn build(
        &self,
        options: &ClusterOptions,
        seed_addresses: &HashMap<String, Vec<NodeAddress>>,
    ) -> Result<BootPayload>;
}

/// Production builder: keytool-generated TLS stores, registry version
/// lookup, freshly generated password.
pub struct StandardBootConfig;

#[async_trait]
impl BootConfigBuilder for StandardBootConfig {
    async fn build(
        &self,
        options: &ClusterOptions,
        seed_addresses: &HashMap<String, Vec<NodeAddress>>,
    ) -> Result<BootPayload> {
        let tls = keytool::generate_keystores(&options.cluster_name).await?;
        let runtime_version = registry::latest_runtime_version(&options.registry).await?;
        tracing::info!(version = %runtime_version, "resolved runtime image version");
        let admin_password = secrets::generate_password();
        let user_data =
            render_user_data(options, seed_addresses, &tls, &runtime_version, &admin_password)?;
        Ok(BootPayload {
            user_data,
            admin_password,
            runtime_version,
        })
    }
}

#[derive(Serialize)]
struct NodeRuntimeConfig<'a> {
    runtime: &'static str,
    source: String,
    application_id: &'a str,
    application_version: &'static str,
    networking: &'static str,
    ports: BTreeMap<String, String>,
    environment: Environment<'a>,
    mounts: BTreeMap<&'static str, Mount>,
}

#[derive(Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct Environment<'a> {
    cluster_name: &'a str,
    cluster_size: usize,
    regions: String,
    subnet_type: &'static str,
    seeds: String,
    keystore: String,
    truststore: String,
    admin_password: &'a str,
}

#[derive(Serialize)]
struct Mount {
    partition: &'static str,
    options: &'static str,
}

/// Render the YAML payload. Seeds are flattened across regions in
/// deployment order, matching the order nodes will contact them in.
pub fn render_user_data(
    options: &ClusterOptions,
    seed_addresses: &HashMap<String, Vec<NodeAddress>>,
    tls: &TlsMaterial,
    runtime_version: &str,
    admin_password: &str,
) -> Result<String> {
    let all_seeds: Vec<&str> = options
        .regions
        .iter()
        .filter_map(|region| seed_addresses.get(region))
        .flatten()
        .map(|address| address.ip.as_str())
        .collect();

    let ports = [("7001", "7001"), ("9042", "9042")]
        .into_iter()
        .map(|(host, container)| (host.to_string(), container.to_string()))
        .collect();

    let config = NodeRuntimeConfig {
        runtime: "Docker",
        source: format!(
            "{}/{}:{}",
            options.registry,
            registry::RUNTIME_IMAGE,
            runtime_version
        ),
        application_id: &options.cluster_name,
        application_version: "1.0",
        networking: "host",
        ports,
        environment: Environment {
            cluster_name: &options.cluster_name,
            cluster_size: options.cluster_size,
            regions: options.regions.join(" "),
            subnet_type: if options.internal { "internal" } else { "dmz" },
            seeds: all_seeds.join(","),
            keystore: BASE64.encode(&tls.keystore),
            truststore: BASE64.encode(&tls.truststore),
            admin_password,
        },
        mounts: BTreeMap::from([(
            DATA_MOUNT_POINT,
            Mount {
                partition: DATA_DEVICE,
                options: "noatime,nodiratime",
            },
        )]),
    };

    Ok(format!("{USER_DATA_HEADER}\n{}", serde_yaml::to_string(&config)?))
}

//! Options for one provisioning run
//!
//! Every knob flows through [`ClusterOptions`]; stages never read ambient
//! state.

use crate::error::{ProvisionError, Result};
use std::time::Duration;

/// Up to this many nodes per region are designated seed nodes.
const MAX_SEEDS_PER_REGION: usize = 3;

/// Configuration for a provisioning run
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Cluster name; also used as the security-group and tag name.
    pub cluster_name: String,

    /// Regions to deploy into, in deployment order.
    pub regions: Vec<String>,

    /// Number of nodes per region.
    pub cluster_size: usize,

    pub instance_type: String,

    /// Data volume parameters. IOPS only apply to provisioned-IOPS
    /// volume types.
    pub volume_type: String,
    pub volume_size_gb: i32,
    pub volume_iops: i32,

    /// Deploy into internal subnets using private addresses
    /// (single region only).
    pub internal: bool,

    pub termination_protection: bool,

    /// Name pattern the base machine image must match.
    pub image_pattern: String,

    /// Registry host serving the cluster runtime image.
    pub registry: String,

    /// Delay between node launches.
    pub launch_pacing: Duration,

    /// Poll interval and attempt bound for the post-launch pending wait.
    pub pending_poll_interval: Duration,
    pub pending_poll_attempts: u32,

    /// Candidate addresses probed per subnet before the private-mode scan
    /// gives up.
    pub subnet_scan_limit: usize,
}

impl ClusterOptions {
    pub fn new(cluster_name: impl Into<String>, regions: Vec<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            regions,
            cluster_size: 3,
            instance_type: "t3.micro".to_string(),
            volume_type: "gp3".to_string(),
            volume_size_gb: 8,
            volume_iops: 100,
            internal: false,
            termination_protection: true,
            image_pattern: "*container-base-*".to_string(),
            registry: "registry.ringleader.dev".to_string(),
            launch_pacing: Duration::from_secs(60),
            pending_poll_interval: Duration::from_secs(5),
            pending_poll_attempts: 120,
            subnet_scan_limit: 256,
        }
    }

    /// Seed nodes per region.
    pub fn seed_count(&self) -> usize {
        self.cluster_size.min(MAX_SEEDS_PER_REGION)
    }

    /// Name prefix of the subnets this deployment may use.
    pub fn subnet_prefix(&self) -> &'static str {
        if self.internal { "internal-" } else { "dmz-" }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.is_empty() {
            return Err(ProvisionError::InvalidOptions(
                "cluster name must not be empty".to_string(),
            ));
        }
        if self.regions.is_empty() {
            return Err(ProvisionError::InvalidOptions(
                "at least one region is required".to_string(),
            ));
        }
        if self.cluster_size == 0 {
            return Err(ProvisionError::InvalidOptions(
                "cluster size must be at least 1".to_string(),
            ));
        }
        if self.internal && self.regions.len() > 1 {
            return Err(ProvisionError::InvalidOptions(
                "internal deployments support exactly one region".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_count_caps_at_three() {
        let mut options = ClusterOptions::new("test", vec!["eu-west-1".to_string()]);
        for (size, expected) in [(1, 1), (2, 2), (3, 3), (4, 3), (12, 3)] {
            options.cluster_size = size;
            assert_eq!(options.seed_count(), expected);
        }
    }

    #[test]
    fn test_internal_requires_single_region() {
        let mut options = ClusterOptions::new(
            "test",
            vec!["eu-west-1".to_string(), "eu-central-1".to_string()],
        );
        options.internal = true;
        assert!(options.validate().is_err());

        options.regions.truncate(1);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_subnet_prefix_follows_mode() {
        let mut options = ClusterOptions::new("test", vec!["eu-west-1".to_string()]);
        assert_eq!(options.subnet_prefix(), "dmz-");
        options.internal = true;
        assert_eq!(options.subnet_prefix(), "internal-");
    }
}

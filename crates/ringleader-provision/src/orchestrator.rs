//! Provisioning orchestrator
//!
//! Drives a run through its stages: image discovery, address allocation,
//! topology planning, firewall setup, boot-config build, then seed and
//! normal node launches. Stages run strictly in that order because each
//! consumes the full cross-region output of its predecessors; within the
//! allocation and firewall stages the independent regions fan out.
//!
//! Any failure after the first stage short-circuits into a rollback pass
//! over the compensation log, and the original failure is always the one
//! reported. Node launches are paced: one fixed interval between any two
//! seed launches system-wide, and one before every normal-node launch.

use crate::allocator;
use crate::error::{ProvisionError, Result, RunFailure};
use crate::firewall;
use crate::launcher::{LaunchedNode, NodeLauncher, NodeRole};
use crate::options::ClusterOptions;
use crate::rollback::CompensationLog;
use crate::topology;
use crate::userdata::BootConfigBuilder;
use futures_util::future::join_all;
use ringleader_cloud::{MachineImage, NodeAddress, NodeProvider, Subnet};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Everything a successful run produced.
pub struct ProvisionOutcome {
    pub node_addresses: HashMap<String, Vec<NodeAddress>>,
    pub seed_addresses: HashMap<String, Vec<NodeAddress>>,
    pub security_groups: HashMap<String, String>,
    pub instances: Vec<LaunchedNode>,
    pub admin_password: String,
    pub runtime_version: String,
}

pub struct Orchestrator<'a> {
    provider: &'a dyn NodeProvider,
    boot: &'a dyn BootConfigBuilder,
    options: ClusterOptions,
    cancel: CancellationToken,
    pauses: u32,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        provider: &'a dyn NodeProvider,
        boot: &'a dyn BootConfigBuilder,
        options: ClusterOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            provider,
            boot,
            options,
            cancel,
            pauses: 0,
        }
    }

    /// Pacing intervals waited out so far.
    pub fn pauses_taken(&self) -> u32 {
        self.pauses
    }

    /// Run to completion or roll back.
    ///
    /// On failure every recorded resource is compensated; compensation
    /// steps that themselves fail are collected into the returned
    /// [`RunFailure`] alongside the original error.
    pub async fn run(&mut self) -> std::result::Result<ProvisionOutcome, RunFailure> {
        let mut log = CompensationLog::new();
        match self.run_stages(&mut log).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                tracing::warn!(%error, created = log.len(), "provisioning failed, rolling back");
                let rollback_failures = log.rollback(self.provider).await;
                Err(RunFailure {
                    error,
                    rollback_failures,
                })
            }
        }
    }

    async fn run_stages(&mut self, log: &mut CompensationLog) -> Result<ProvisionOutcome> {
        let options = self.options.clone();
        options.validate()?;
        self.ensure_active()?;

        let images = self.discover_images(&options).await?;
        self.ensure_active()?;

        let subnets =
            topology::fetch_subnets(self.provider, &options.regions, options.subnet_prefix())
                .await?;
        for region in &options.regions {
            if require(&subnets, region)?.is_empty() {
                return Err(ProvisionError::InvalidOptions(format!(
                    "no '{}' subnets found in {region}",
                    options.subnet_prefix()
                )));
            }
        }

        let node_addresses = self.allocate_addresses(&options, &subnets, log).await?;
        self.ensure_active()?;

        let seed_count = options.seed_count();
        let seed_addresses = topology::pick_seed_addresses(&node_addresses, seed_count);

        self.setup_firewalls(&options, &node_addresses, log).await?;
        let security_groups = log_groups(log);
        self.ensure_active()?;

        let boot = self.boot.build(&options, &seed_addresses).await?;
        self.ensure_active()?;

        let cancel = self.cancel.clone();
        let launcher = NodeLauncher {
            provider: self.provider,
            options: &options,
            cancel: &cancel,
        };
        let mut instances = Vec::new();

        // Seed nodes first, everywhere, with one pacing interval between
        // any two seed launches across all regions. The final seed gets no
        // trailing pause.
        let total_seeds: usize = seed_addresses.values().map(Vec::len).sum();
        let mut seeds_launched = 0;
        for region in &options.regions {
            let seeds = require(&seed_addresses, region)?;
            let region_subnets = require(&subnets, region)?;
            let image = require(&images, region)?;
            let group_id = require(&security_groups, region)?;
            for (i, address) in seeds.iter().enumerate() {
                self.ensure_active()?;
                let subnet_id = &region_subnets[i % region_subnets.len()].id;
                let node = launcher
                    .launch(
                        address,
                        image,
                        subnet_id,
                        group_id,
                        NodeRole::Seed,
                        &boot.user_data,
                        log,
                    )
                    .await?;
                instances.push(node);
                seeds_launched += 1;
                if seeds_launched < total_seeds {
                    tracing::info!("waiting before launching the next seed node");
                    self.pace().await?;
                }
            }
        }

        // Normal nodes, paced before every launch.
        for region in &options.regions {
            let addresses = require(&node_addresses, region)?;
            let region_subnets = require(&subnets, region)?;
            let image = require(&images, region)?;
            let group_id = require(&security_groups, region)?;
            for (i, address) in addresses.iter().enumerate() {
                if i < seed_count {
                    // Already launched as a seed.
                    continue;
                }
                self.ensure_active()?;
                tracing::info!("waiting before launching the next node");
                self.pace().await?;
                let subnet_id = &region_subnets[i % region_subnets.len()].id;
                let node = launcher
                    .launch(
                        address,
                        image,
                        subnet_id,
                        group_id,
                        NodeRole::Normal,
                        &boot.user_data,
                        log,
                    )
                    .await?;
                instances.push(node);
            }
        }

        tracing::info!(
            nodes = instances.len(),
            regions = options.regions.len(),
            "cluster provisioning completed"
        );
        Ok(ProvisionOutcome {
            node_addresses,
            seed_addresses,
            security_groups,
            instances,
            admin_password: boot.admin_password,
            runtime_version: boot.runtime_version,
        })
    }

    async fn discover_images(
        &self,
        options: &ClusterOptions,
    ) -> Result<HashMap<String, MachineImage>> {
        let tasks = options.regions.iter().map(|region| async move {
            let image = self
                .provider
                .find_latest_image(region, &options.image_pattern)
                .await?;
            tracing::info!(region, image = %image.name, "found base image");
            Ok::<_, ProvisionError>((region.clone(), image))
        });

        let mut images = HashMap::new();
        for outcome in join_all(tasks).await {
            let (region, image) = outcome?;
            images.insert(region, image);
        }
        Ok(images)
    }

    /// Allocate addresses in every region and record each reservation
    /// before any error is surfaced: public reservations are billable the
    /// moment they exist.
    async fn allocate_addresses(
        &self,
        options: &ClusterOptions,
        subnets: &HashMap<String, Vec<Subnet>>,
        log: &mut CompensationLog,
    ) -> Result<HashMap<String, Vec<NodeAddress>>> {
        if options.internal {
            let region = &options.regions[0];
            let addresses = allocator::allocate_private_addresses(
                self.provider,
                options,
                region,
                require(subnets, region)?,
            )
            .await?;
            return Ok(HashMap::from([(region.clone(), addresses)]));
        }

        let allocations = allocator::allocate_public_addresses(self.provider, options).await;
        let mut node_addresses = HashMap::new();
        let mut first_error = None;
        for allocation in allocations {
            for address in &allocation.addresses {
                log.record_address(address);
            }
            if let Some(error) = allocation.error
                && first_error.is_none()
            {
                first_error = Some(error);
            }
            node_addresses.insert(allocation.region, allocation.addresses);
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(node_addresses),
        }
    }

    /// Set up one security group per region, recording every created group
    /// before any region's error is surfaced.
    async fn setup_firewalls(
        &self,
        options: &ClusterOptions,
        node_addresses: &HashMap<String, Vec<NodeAddress>>,
        log: &mut CompensationLog,
    ) -> Result<()> {
        let results = firewall::setup_security_groups(self.provider, options, node_addresses).await;
        let mut first_error = None;
        for result in results {
            if let Some(group_id) = &result.group_id {
                log.record_security_group(&result.region, group_id);
            }
            if let Some(error) = result.error
                && first_error.is_none()
            {
                first_error = Some(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn pace(&mut self) -> Result<()> {
        let pacing = self.options.launch_pacing;
        let cancel = self.cancel.clone();
        tokio::select! {
            _ = tokio::time::sleep(pacing) => {}
            _ = cancel.cancelled() => return Err(ProvisionError::Interrupted),
        }
        self.pauses += 1;
        Ok(())
    }

    fn ensure_active(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(ProvisionError::Interrupted)
        } else {
            Ok(())
        }
    }
}

fn require<'m, T>(map: &'m HashMap<String, T>, region: &str) -> Result<&'m T> {
    // Stage outputs are keyed by deployment region; a miss means an
    // earlier stage did not run for this region.
    map.get(region).ok_or_else(|| {
        ProvisionError::InvalidOptions(format!("no stage output for region {region}"))
    })
}

/// Security groups recorded so far, keyed by region.
fn log_groups(log: &CompensationLog) -> HashMap<String, String> {
    log.security_groups()
        .map(|(region, group_id)| (region.to_string(), group_id.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockProvider, Op, StaticBootConfig};
    use ringleader_cloud::CloudError;
    use std::collections::HashSet;
    use std::time::Duration;

    fn options(regions: &[&str], cluster_size: usize) -> ClusterOptions {
        let mut options =
            ClusterOptions::new("hamlet", regions.iter().map(|r| r.to_string()).collect());
        options.cluster_size = cluster_size;
        options.launch_pacing = Duration::ZERO;
        options.pending_poll_interval = Duration::from_millis(1);
        options
    }

    fn roles(instances: &[LaunchedNode]) -> Vec<(String, NodeRole)> {
        instances
            .iter()
            .map(|node| (node.region.clone(), node.role))
            .collect()
    }

    #[tokio::test]
    async fn test_two_region_launch_ordering_and_pacing() {
        let provider = MockProvider::for_regions(&["region-a", "region-b"], "dmz-");
        let boot = StaticBootConfig;
        let mut orchestrator = Orchestrator::new(
            &provider,
            &boot,
            options(&["region-a", "region-b"], 4),
            CancellationToken::new(),
        );

        let outcome = orchestrator.run().await.unwrap();

        // All seeds everywhere, then all normals, regions in deployment
        // order within each phase.
        let expected: Vec<(String, NodeRole)> = [
            ("region-a", NodeRole::Seed),
            ("region-a", NodeRole::Seed),
            ("region-a", NodeRole::Seed),
            ("region-b", NodeRole::Seed),
            ("region-b", NodeRole::Seed),
            ("region-b", NodeRole::Seed),
            ("region-a", NodeRole::Normal),
            ("region-b", NodeRole::Normal),
        ]
        .into_iter()
        .map(|(region, role)| (region.to_string(), role))
        .collect();
        assert_eq!(roles(&outcome.instances), expected);

        // Five pauses between the six seeds, one before each normal.
        assert_eq!(orchestrator.pauses_taken(), 7);
    }

    #[tokio::test]
    async fn test_end_to_end_single_region_public() {
        let provider = MockProvider::for_regions(&["eu-west-1"], "dmz-");
        let boot = StaticBootConfig;
        let mut orchestrator = Orchestrator::new(
            &provider,
            &boot,
            options(&["eu-west-1"], 3),
            CancellationToken::new(),
        );

        let outcome = orchestrator.run().await.unwrap();

        assert_eq!(outcome.node_addresses["eu-west-1"].len(), 3);
        assert_eq!(outcome.seed_addresses["eu-west-1"].len(), 3);
        assert_eq!(outcome.security_groups.len(), 1);
        // Cluster of three is all seeds; two pauses between three seeds.
        assert_eq!(outcome.instances.len(), 3);
        assert!(outcome.instances.iter().all(|n| n.role == NodeRole::Seed));
        assert_eq!(orchestrator.pauses_taken(), 2);
        assert_eq!(outcome.admin_password, "hunter2");
        assert_eq!(outcome.runtime_version, "4.1.4");

        // Three mesh rules (one per node) plus the self-referential rule.
        let rules = provider.authorized_rules().remove(0);
        assert_eq!(rules.len(), 4);
    }

    #[tokio::test]
    async fn test_internal_mode_uses_private_addresses() {
        let provider = MockProvider::for_regions(&["eu-west-1"], "internal-");
        let boot = StaticBootConfig;
        let mut run_options = options(&["eu-west-1"], 2);
        run_options.internal = true;
        let mut orchestrator =
            Orchestrator::new(&provider, &boot, run_options, CancellationToken::new());

        let outcome = orchestrator.run().await.unwrap();

        assert_eq!(outcome.instances.len(), 2);
        let ops = provider.ops();
        assert!(!ops.iter().any(|op| matches!(op, Op::AllocateAddress { .. })));
        assert!(ops.iter().all(|op| match op {
            Op::RunInstance { private_ip, .. } => private_ip.is_some(),
            _ => true,
        }));
    }

    #[tokio::test]
    async fn test_failure_at_normal_launch_rolls_back_scoped() {
        let provider = MockProvider::for_regions(&["region-a", "region-b"], "dmz-");
        // Seventh boot request is the first normal node.
        provider.fail_on("run_instance", 7);
        let boot = StaticBootConfig;
        let mut orchestrator = Orchestrator::new(
            &provider,
            &boot,
            options(&["region-a", "region-b"], 4),
            CancellationToken::new(),
        );

        let failure = orchestrator.run().await.unwrap_err();
        assert!(matches!(
            failure.error,
            ProvisionError::Cloud(CloudError::ApiError(_))
        ));
        assert!(failure.rollback_failures.is_empty());

        let ops = provider.ops();

        // Every security group created up to the failure is deleted.
        let deleted = ops
            .iter()
            .filter(|op| matches!(op, Op::DeleteSecurityGroup { .. }))
            .count();
        assert_eq!(deleted, 2);

        // Only the never-attached addresses are released: 8 allocated,
        // 6 attached to the launched seeds.
        let allocated: HashSet<String> = ops
            .iter()
            .filter_map(|op| match op {
                Op::AllocateAddress { allocation_id, .. } => Some(allocation_id.clone()),
                _ => None,
            })
            .collect();
        let attached: HashSet<String> = ops
            .iter()
            .filter_map(|op| match op {
                Op::AssociateAddress { allocation_id, .. } => Some(allocation_id.clone()),
                _ => None,
            })
            .collect();
        let released: HashSet<String> = ops
            .iter()
            .filter_map(|op| match op {
                Op::ReleaseAddress { allocation_id, .. } => Some(allocation_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(allocated.len(), 8);
        assert_eq!(attached.len(), 6);
        assert_eq!(
            released,
            allocated.difference(&attached).cloned().collect::<HashSet<_>>()
        );
    }

    #[tokio::test]
    async fn test_firewall_failure_releases_reserved_addresses() {
        let provider = MockProvider::for_regions(&["region-a", "region-b"], "dmz-");
        provider.fail_on("create_security_group", 2);
        let boot = StaticBootConfig;
        let mut orchestrator = Orchestrator::new(
            &provider,
            &boot,
            options(&["region-a", "region-b"], 1),
            CancellationToken::new(),
        );

        let failure = orchestrator.run().await.unwrap_err();
        assert!(matches!(failure.error, ProvisionError::Cloud(_)));

        let ops = provider.ops();
        // The group that was created is cleaned up, both reservations are
        // released, and nothing was ever launched.
        assert_eq!(
            ops.iter()
                .filter(|op| matches!(op, Op::DeleteSecurityGroup { .. }))
                .count(),
            1
        );
        assert_eq!(
            ops.iter()
                .filter(|op| matches!(op, Op::ReleaseAddress { .. }))
                .count(),
            2
        );
        assert!(!ops.iter().any(|op| matches!(op, Op::RunInstance { .. })));
    }

    #[tokio::test]
    async fn test_image_discovery_failure_needs_no_rollback() {
        let provider = MockProvider::new();
        provider.add_subnet("eu-west-1", "dmz-a", "eu-west-1a", "10.0.0.0/24");
        // No image registered for the region.
        let boot = StaticBootConfig;
        let mut orchestrator = Orchestrator::new(
            &provider,
            &boot,
            options(&["eu-west-1"], 1),
            CancellationToken::new(),
        );

        let failure = orchestrator.run().await.unwrap_err();
        assert!(matches!(
            failure.error,
            ProvisionError::Cloud(CloudError::ImageNotFound { .. })
        ));
        assert!(failure.rollback_failures.is_empty());

        let ops = provider.ops();
        assert!(!ops.iter().any(|op| matches!(
            op,
            Op::ReleaseAddress { .. } | Op::DeleteSecurityGroup { .. }
        )));
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_before_creating_anything() {
        let provider = MockProvider::for_regions(&["eu-west-1"], "dmz-");
        let boot = StaticBootConfig;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut orchestrator =
            Orchestrator::new(&provider, &boot, options(&["eu-west-1"], 3), cancel);

        let failure = orchestrator.run().await.unwrap_err();
        assert!(matches!(failure.error, ProvisionError::Interrupted));
        assert!(provider.ops().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_failures_do_not_mask_the_original_error() {
        let provider = MockProvider::for_regions(&["eu-west-1"], "dmz-");
        provider.fail_on("run_instance", 1);
        provider.fail_on("delete_security_group", 1);
        let boot = StaticBootConfig;
        let mut orchestrator = Orchestrator::new(
            &provider,
            &boot,
            options(&["eu-west-1"], 1),
            CancellationToken::new(),
        );

        let failure = orchestrator.run().await.unwrap_err();
        assert!(matches!(failure.error, ProvisionError::Cloud(_)));
        assert_eq!(failure.rollback_failures.len(), 1);
        // The failed group delete did not stop the address release.
        assert!(provider
            .ops()
            .iter()
            .any(|op| matches!(op, Op::ReleaseAddress { .. })));
    }
}

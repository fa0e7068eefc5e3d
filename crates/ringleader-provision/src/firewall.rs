//! Security group setup
//!
//! One group per region, configured in a single ingress-authorization call.
//! Without internal mode the rule list admits every node address across all
//! regions on the cluster port, which is what lets regions mesh over public
//! addresses without a VPN; the allocator must therefore have finished in
//! every region before this stage starts.

use crate::error::{ProvisionError, Result};
use crate::options::ClusterOptions;
use futures_util::future::join_all;
use ringleader_cloud::{IngressRule, NodeAddress, NodeProvider};
use std::collections::HashMap;

/// Inter-node traffic (secure transport).
pub const CLUSTER_PORT: u16 = 7001;
/// Client protocol port; opened by operators later, mentioned in the
/// success summary.
pub const CLIENT_PORT: u16 = 9042;
const SSH_PORT: u16 = 22;

/// Name of the bastion-host security group SSH ingress is granted to,
/// when it exists.
pub const BASTION_GROUP: &str = "ssh-bastion";

/// One region's firewall pass. A created group is reported even when a
/// later call in the same region failed, so it lands in the rollback log.
pub struct RegionFirewall {
    pub region: String,
    pub group_id: Option<String>,
    pub error: Option<ProvisionError>,
}

/// Create and configure one security group per region, one task per
/// region.
pub async fn setup_security_groups(
    provider: &dyn NodeProvider,
    options: &ClusterOptions,
    node_addresses: &HashMap<String, Vec<NodeAddress>>,
) -> Vec<RegionFirewall> {
    let tasks = options
        .regions
        .iter()
        .map(|region| setup_region(provider, options, node_addresses, region));
    join_all(tasks).await
}

async fn setup_region(
    provider: &dyn NodeProvider,
    options: &ClusterOptions,
    node_addresses: &HashMap<String, Vec<NodeAddress>>,
    region: &str,
) -> RegionFirewall {
    tracing::info!(region, "configuring security group");
    let description = format!(
        "Allow {} nodes to talk to each other on port {}",
        options.cluster_name, CLUSTER_PORT
    );
    let group_id = match provider
        .create_security_group(region, &options.cluster_name, &description)
        .await
    {
        Ok(group_id) => group_id,
        Err(error) => {
            return RegionFirewall {
                region: region.to_string(),
                group_id: None,
                error: Some(error.into()),
            };
        }
    };

    let error = configure_group(provider, options, node_addresses, region, &group_id)
        .await
        .err();
    RegionFirewall {
        region: region.to_string(),
        group_id: Some(group_id),
        error,
    }
}

async fn configure_group(
    provider: &dyn NodeProvider,
    options: &ClusterOptions,
    node_addresses: &HashMap<String, Vec<NodeAddress>>,
    region: &str,
    group_id: &str,
) -> Result<()> {
    provider
        .tag_resource(region, group_id, &options.cluster_name)
        .await?;

    let mut rules = Vec::new();
    if !options.internal {
        // Full mesh: every node address from every region.
        for peer_region in &options.regions {
            for address in node_addresses.get(peer_region).into_iter().flatten() {
                rules.push(IngressRule::Tcp {
                    port: CLUSTER_PORT,
                    cidr: address.cidr(),
                });
            }
        }
    }

    // Members of the group may always talk to each other, which internal
    // deployments rely on entirely and multi-region setups still need for
    // in-group tooling.
    rules.push(IngressRule::AllFromGroup {
        group_id: group_id.to_string(),
    });

    match provider.find_security_group(region, BASTION_GROUP).await? {
        Some(bastion_id) => rules.push(IngressRule::TcpFromGroup {
            port: SSH_PORT,
            group_id: bastion_id,
        }),
        None => {
            tracing::info!(
                region,
                "no '{BASTION_GROUP}' group found, skipping the SSH ingress rule"
            );
        }
    }

    provider.authorize_ingress(region, group_id, &rules).await?;
    tracing::info!(region, group_id, rules = rules.len(), "security group configured");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockProvider;

    fn addresses(region: &str, count: usize, offset: u8) -> Vec<NodeAddress> {
        (0..count)
            .map(|i| NodeAddress::private(region, format!("198.51.100.{}", offset + i as u8)))
            .collect()
    }

    fn options(regions: &[&str]) -> ClusterOptions {
        ClusterOptions::new("hamlet", regions.iter().map(|r| r.to_string()).collect())
    }

    fn mesh_rule_count(rules: &[IngressRule]) -> usize {
        rules
            .iter()
            .filter(|rule| matches!(rule, IngressRule::Tcp { port, .. } if *port == CLUSTER_PORT))
            .count()
    }

    #[tokio::test]
    async fn test_mesh_rules_cover_all_regions() {
        let provider = MockProvider::new();
        let options = options(&["eu-west-1", "eu-central-1"]);
        let node_addresses = HashMap::from([
            ("eu-west-1".to_string(), addresses("eu-west-1", 3, 1)),
            ("eu-central-1".to_string(), addresses("eu-central-1", 3, 10)),
        ]);

        let results = setup_security_groups(&provider, &options, &node_addresses).await;
        assert_eq!(results.len(), 2);
        for result in &results {
            assert!(result.error.is_none());
            assert!(result.group_id.is_some());
        }

        // Each region's group admits all six node addresses.
        for rules in provider.authorized_rules() {
            assert_eq!(mesh_rule_count(&rules), 6);
            assert!(rules
                .iter()
                .any(|rule| matches!(rule, IngressRule::AllFromGroup { .. })));
        }
    }

    #[tokio::test]
    async fn test_internal_mode_has_no_mesh_rules() {
        let provider = MockProvider::new();
        let mut options = options(&["eu-west-1"]);
        options.internal = true;
        let node_addresses =
            HashMap::from([("eu-west-1".to_string(), addresses("eu-west-1", 3, 1))]);

        let results = setup_security_groups(&provider, &options, &node_addresses).await;
        assert!(results[0].error.is_none());

        let rules = provider.authorized_rules().remove(0);
        assert_eq!(mesh_rule_count(&rules), 0);
        assert!(rules
            .iter()
            .any(|rule| matches!(rule, IngressRule::AllFromGroup { .. })));
    }

    #[tokio::test]
    async fn test_bastion_rule_added_when_group_exists() {
        let provider = MockProvider::new();
        provider.set_bastion("sg-bastion");
        let options = options(&["eu-west-1"]);
        let node_addresses =
            HashMap::from([("eu-west-1".to_string(), addresses("eu-west-1", 1, 1))]);

        setup_security_groups(&provider, &options, &node_addresses).await;

        let rules = provider.authorized_rules().remove(0);
        assert!(rules.iter().any(|rule| matches!(
            rule,
            IngressRule::TcpFromGroup { port: 22, group_id } if group_id == "sg-bastion"
        )));
    }

    #[tokio::test]
    async fn test_missing_bastion_is_not_an_error() {
        let provider = MockProvider::new();
        let options = options(&["eu-west-1"]);
        let node_addresses =
            HashMap::from([("eu-west-1".to_string(), addresses("eu-west-1", 2, 1))]);

        let results = setup_security_groups(&provider, &options, &node_addresses).await;
        assert!(results[0].error.is_none());

        // All other rules still applied in one call.
        let rules = provider.authorized_rules().remove(0);
        assert_eq!(mesh_rule_count(&rules), 2);
        assert!(!rules
            .iter()
            .any(|rule| matches!(rule, IngressRule::TcpFromGroup { .. })));
    }

    #[tokio::test]
    async fn test_created_group_reported_when_authorize_fails() {
        let provider = MockProvider::new();
        provider.fail_on("authorize_ingress", 1);
        let options = options(&["eu-west-1"]);
        let node_addresses =
            HashMap::from([("eu-west-1".to_string(), addresses("eu-west-1", 1, 1))]);

        let results = setup_security_groups(&provider, &options, &node_addresses).await;
        assert!(results[0].error.is_some());
        // The group exists and must reach the rollback log.
        assert!(results[0].group_id.is_some());
    }
}

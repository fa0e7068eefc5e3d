//! Topology planning
//!
//! Subnet discovery (name-prefix filter, availability-zone order) and seed
//! designation. Seed selection is pure: the first `seed_count` addresses of
//! every region become that region's seed set.

use crate::error::Result;
use futures_util::future::join_all;
use ringleader_cloud::{NodeAddress, NodeProvider, Subnet};
use std::collections::HashMap;

/// Per-region subnets whose Name tag starts with `prefix`, ordered by
/// availability zone. The order matters: both the private-address scan and
/// the launcher place node `i` into subnet `i % len`.
pub async fn fetch_subnets(
    provider: &dyn NodeProvider,
    regions: &[String],
    prefix: &str,
) -> Result<HashMap<String, Vec<Subnet>>> {
    let tasks = regions.iter().map(|region| async move {
        let subnets = provider.list_subnets(region).await?;
        Ok::<_, ringleader_cloud::CloudError>((region.clone(), filter_subnets(subnets, prefix)))
    });

    let mut result = HashMap::new();
    for outcome in join_all(tasks).await {
        let (region, subnets) = outcome?;
        tracing::debug!(region, count = subnets.len(), prefix, "discovered subnets");
        result.insert(region, subnets);
    }
    Ok(result)
}

fn filter_subnets(subnets: Vec<Subnet>, prefix: &str) -> Vec<Subnet> {
    let mut subnets: Vec<Subnet> = subnets
        .into_iter()
        .filter(|subnet| {
            subnet
                .name
                .as_deref()
                .is_some_and(|name| name.starts_with(prefix))
        })
        .collect();
    subnets.sort_by(|a, b| a.availability_zone.cmp(&b.availability_zone));
    subnets
}

/// The first `seed_count` addresses of every region, preserving order.
pub fn pick_seed_addresses(
    node_addresses: &HashMap<String, Vec<NodeAddress>>,
    seed_count: usize,
) -> HashMap<String, Vec<NodeAddress>> {
    let mut seeds = HashMap::new();
    for (region, addresses) in node_addresses {
        let region_seeds: Vec<NodeAddress> =
            addresses.iter().take(seed_count).cloned().collect();
        tracing::info!(
            region,
            seeds = %region_seeds
                .iter()
                .map(|a| a.ip.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            "designated seed nodes"
        );
        seeds.insert(region.clone(), region_seeds);
    }
    seeds
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet(id: &str, az: &str, name: Option<&str>) -> Subnet {
        Subnet {
            id: id.to_string(),
            region: "eu-west-1".to_string(),
            availability_zone: az.to_string(),
            cidr_block: "10.0.0.0/24".to_string(),
            name: name.map(|n| n.to_string()),
        }
    }

    #[test]
    fn test_filter_subnets_by_prefix_and_az_order() {
        let subnets = vec![
            subnet("subnet-c", "eu-west-1c", Some("internal-c")),
            subnet("subnet-dmz", "eu-west-1a", Some("dmz-a")),
            subnet("subnet-a", "eu-west-1a", Some("internal-a")),
            subnet("subnet-untagged", "eu-west-1b", None),
        ];

        let filtered = filter_subnets(subnets, "internal-");
        let ids: Vec<&str> = filtered.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["subnet-a", "subnet-c"]);
    }

    #[test]
    fn test_seed_set_is_a_prefix_of_the_address_list() {
        let addresses: Vec<NodeAddress> = (1..=5)
            .map(|i| NodeAddress::private("eu-west-1", format!("10.0.0.{}", 10 + i)))
            .collect();
        let node_addresses = HashMap::from([("eu-west-1".to_string(), addresses.clone())]);

        let seeds = pick_seed_addresses(&node_addresses, 3);
        assert_eq!(seeds["eu-west-1"], addresses[..3].to_vec());
    }

    #[test]
    fn test_seed_count_larger_than_cluster() {
        let addresses = vec![NodeAddress::private("eu-west-1", "10.0.0.11")];
        let node_addresses = HashMap::from([("eu-west-1".to_string(), addresses.clone())]);

        let seeds = pick_seed_addresses(&node_addresses, 3);
        assert_eq!(seeds["eu-west-1"], addresses);
    }

    #[test]
    fn test_empty_region_gives_empty_seed_set() {
        let node_addresses = HashMap::from([("eu-west-1".to_string(), Vec::new())]);
        let seeds = pick_seed_addresses(&node_addresses, 3);
        assert!(seeds["eu-west-1"].is_empty());
    }
}

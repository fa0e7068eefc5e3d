use crate::CreateArgs;
use colored::Colorize;
use ringleader_cloud_aws::AwsNodeProvider;
use ringleader_provision::{
    ClusterOptions, NodeRole, Orchestrator, ProvisionOutcome, RunFailure, StandardBootConfig,
    firewall, secrets,
};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub async fn handle(args: CreateArgs) -> anyhow::Result<()> {
    let options = cluster_options(&args);
    options.validate()?;

    println!(
        "{}",
        format!(
            "Provisioning cluster {} ({} nodes per region) into: {}",
            options.cluster_name.as_str().cyan(),
            options.cluster_size,
            options.regions.join(", ")
        )
        .bold()
    );

    let provider = AwsNodeProvider::new();
    let boot = StandardBootConfig;
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!();
                eprintln!("{}", "Interrupt received, rolling back...".yellow());
                cancel.cancel();
            }
        });
    }

    let mut orchestrator = Orchestrator::new(&provider, &boot, options.clone(), cancel);
    match orchestrator.run().await {
        Ok(outcome) => {
            let credentials_path = secrets::write_credentials(
                Path::new("."),
                &options.cluster_name,
                &outcome.admin_password,
            )
            .await?;
            print_success(&options, &outcome, &credentials_path.display().to_string());
            Ok(())
        }
        Err(failure) => {
            print_failure(&options, &failure);
            Err(failure.into())
        }
    }
}

fn cluster_options(args: &CreateArgs) -> ClusterOptions {
    let mut options = ClusterOptions::new(args.cluster_name.clone(), args.regions.clone());
    options.cluster_size = args.cluster_size;
    options.instance_type = args.instance_type.clone();
    options.volume_type = args.volume_type.clone();
    options.volume_size_gb = args.volume_size;
    options.volume_iops = args.volume_iops;
    options.internal = args.internal;
    options.termination_protection = !args.no_termination_protection;
    options.image_pattern = args.image_pattern.clone();
    options.registry = args.registry.clone();
    options.launch_pacing = Duration::from_secs(args.launch_pacing);
    options
}

fn print_success(options: &ClusterOptions, outcome: &ProvisionOutcome, credentials_path: &str) {
    println!();
    println!(
        "{}",
        "Cluster provisioning completed successfully!".green().bold()
    );
    println!();
    println!(
        "{}",
        format!("Nodes ({} total):", outcome.instances.len()).bold()
    );
    for node in &outcome.instances {
        let role = match node.role {
            NodeRole::Seed => "seed",
            NodeRole::Normal => "normal",
        };
        println!(
            "  • {}  {}  {}  ({})",
            node.region.as_str().cyan(),
            node.instance_id,
            node.ip,
            role
        );
    }
    println!(
        "
The Cassandra cluster {name} was created with {size} nodes in each of
the following regions: {regions} (runtime image version {version}).

The superuser credentials were written to {credentials_path}
(owner-readable only). You can now log in to any of the cluster nodes:

  $ cqlsh -u {user} -p \"$(jq -r .password {credentials_path})\" <node-address>

From there you can create non-superuser roles and otherwise configure
the cluster.

You might also need to update the security groups named {name}
(in all regions!) to allow access to the cluster from your application
on port {client_port}, and optionally from your monitoring tooling.",
        name = options.cluster_name,
        size = options.cluster_size,
        regions = options.regions.join(" "),
        version = outcome.runtime_version,
        credentials_path = credentials_path,
        user = secrets::ADMIN_USERNAME,
        client_port = firewall::CLIENT_PORT,
    );
}

fn print_failure(options: &ClusterOptions, failure: &RunFailure) {
    eprintln!();
    eprintln!("{}", "Cluster provisioning failed.".red().bold());
    if options.internal {
        eprintln!(
            "
You were deploying into an internal subnet in {region}. One possible
cause is that private addresses picked for the new nodes were taken by
other instances in the middle of the run; if the error below looks like
an address conflict, simply retrying may resolve it (you may still need
to clean up leftovers from this attempt first).",
            region = options.regions.join(", ")
        );
    }
    for rollback_failure in &failure.rollback_failures {
        eprintln!("  {} {}", "rollback:".yellow(), rollback_failure);
    }
}

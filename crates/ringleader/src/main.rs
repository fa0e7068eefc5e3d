mod commands;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ringleader")]
#[command(version)]
#[command(about = "Provision multi-region Cassandra clusters", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision a new cluster
    Create(CreateArgs),
}

#[derive(Args)]
pub struct CreateArgs {
    /// Cluster name; also used as the security-group and tag name
    pub cluster_name: String,

    /// Regions to deploy into, in deployment order
    #[arg(required = true)]
    pub regions: Vec<String>,

    /// Number of nodes per region
    #[arg(long, default_value_t = 3)]
    pub cluster_size: usize,

    #[arg(long, default_value = "t3.micro")]
    pub instance_type: String,

    /// Data volume type (gp3 | io1 | io2 | standard)
    #[arg(long, default_value = "gp3")]
    pub volume_type: String,

    /// Data volume size in GB
    #[arg(long, default_value_t = 8)]
    pub volume_size: i32,

    /// Data volume IOPS, for provisioned-IOPS volume types
    #[arg(long, default_value_t = 100)]
    pub volume_iops: i32,

    /// Leave API termination protection off on the instances
    #[arg(long)]
    pub no_termination_protection: bool,

    /// Deploy into internal subnets using private addresses
    /// (single region only)
    #[arg(long)]
    pub internal: bool,

    /// Name pattern of the base machine image
    #[arg(long, default_value = "*container-base-*")]
    pub image_pattern: String,

    /// Registry host serving the cluster runtime image
    #[arg(long, default_value = "registry.ringleader.dev", env = "RINGLEADER_REGISTRY")]
    pub registry: String,

    /// Seconds to wait between node launches
    #[arg(long, default_value_t = 60)]
    pub launch_pacing: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Create(args) => commands::create::handle(args).await,
    }
}

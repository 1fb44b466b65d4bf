//! Surge operator - staged remediation of managed policies across cluster fleets

use clap::Parser;
use kube::{Client, CustomResourceExt};

use surge::crd::ClusterGroupUpgrade;
use surge::telemetry;

/// Surge - Kubernetes operator for staged, canary-first policy remediation
#[derive(Parser, Debug)]
#[command(name = "surge", version, about, long_about = None)]
struct Cli {
    /// Generate the CRD manifest and exit
    #[arg(long)]
    crd: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&ClusterGroupUpgrade::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    telemetry::init_telemetry().map_err(|e| anyhow::anyhow!("telemetry init failed: {}", e))?;
    tracing::info!("Surge controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    surge::controller::run(client).await;

    tracing::info!("Surge controller shutting down");
    Ok(())
}

mod beacon;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "beacon",
    version,
    about = "Beacon - hostname-routing Minecraft reverse proxy"
)]
struct Cli {
    /// Path to the Beacon config file (.toml/.yaml/.yml). If omitted, uses BEACON_CONFIG; then auto-detects beacon.toml > beacon.yaml > beacon.yml from CWD; then falls back to the OS default config path.
    #[arg(long, env = "BEACON_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    beacon::run(cli.config).await
}

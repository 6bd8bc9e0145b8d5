mod prism;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "prism",
    version,
    about = "Prism - layer-4 reverse proxy and reverse-tunnel gateway"
)]
struct Cli {
    /// Path to the Prism config file (.toml/.yaml/.yml). If omitted, uses PRISM_CONFIG,
    /// then auto-detects prism.toml > prism.yaml > prism.yml from CWD, then the OS
    /// default config dir.
    #[arg(long, env = "PRISM_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    prism::app::run(cli.config).await
}

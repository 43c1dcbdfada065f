mod edgetun;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "edgetun",
    version,
    about = "edgetun - TCP/UDP tunnel over CDN-fronted websocket and QUIC edges"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses EDGETUN_CONFIG; then auto-detects edgetun.toml > edgetun.yaml > edgetun.yml from CWD; then falls back to the OS default path (Linux: /etc/edgetun/edgetun.toml; others: user config dir).
    #[arg(long, env = "EDGETUN_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    edgetun::run(cli.config).await
}

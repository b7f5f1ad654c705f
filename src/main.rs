mod holepunch;

use clap::{Parser, Subcommand};

use holepunch::{app::RunOptions, config::Overrides};

#[derive(Debug, Parser)]
#[command(
    name = "holepunch-server",
    version,
    about = "Holepunch - SSH reverse-tunnel server for clients without inbound connectivity"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the tunnel server.
    Server {
        /// Path to the config file (.toml/.yaml/.yml). If omitted, uses HOLEPUNCH_CONFIG; then auto-detects holepunch.toml > holepunch.yaml > holepunch.yml from CWD; then falls back to the OS default path (Linux: /etc/holepunch/holepunch.toml; others: user config dir).
        #[arg(long, env = "HOLEPUNCH_CONFIG")]
        config: Option<std::path::PathBuf>,

        /// Serve SSH over raw TCP on this address (":2222" binds all interfaces).
        #[arg(long, value_name = "ADDR")]
        sshd_tcp: Option<String>,

        /// Serve SSH over WebSocket on the HTTP listener.
        #[arg(long)]
        sshd_websocket: bool,

        /// Serve the virtual-host reverse proxy on the HTTP listener.
        #[arg(long)]
        http_reverse_proxy: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Server {
            config,
            sshd_tcp,
            sshd_websocket,
            http_reverse_proxy,
        } => {
            holepunch::run(RunOptions {
                config_path: config,
                overrides: Overrides {
                    sshd_tcp,
                    sshd_websocket,
                    http_reverse_proxy,
                },
            })
            .await
        }
    }
}

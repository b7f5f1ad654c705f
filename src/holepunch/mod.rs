pub mod admin;
pub mod app;
pub mod bridge;
pub mod config;
pub mod logging;
pub mod messages;
pub mod net;
pub mod portforward;
pub mod reverseproxy;
pub mod server;
pub mod sshd;
pub mod supervisor;
pub mod telemetry;
pub mod wsconn;

pub async fn run(opts: app::RunOptions) -> anyhow::Result<()> {
    app::run(opts).await
}

pub mod app;
pub mod config;
pub mod conn;
pub mod gateway;
pub mod listener;
pub mod logging;
pub mod protocol;
pub mod router;
pub mod server;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}

use relay_gateway::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AppConfig::from_env()?;
    relay_gateway::run(cfg).await
}

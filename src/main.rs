#[tokio::main]
async fn main() -> anyhow::Result<()> {
    market_orchestrator::run().await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    lightning_server::run_server().await
}

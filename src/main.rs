//! Binary entry point.

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    ferrocoin::cli::run().await
}

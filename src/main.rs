#[tokio::main]
async fn main() {
    market_core::init_tracing();

    if let Err(error) = market_core::run().await {
        tracing::error!(%error, "market core failed");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn main() {
    if let Err(error) = atm_chart_feed_lib::run().await {
        tracing::error!(%error, "feed exited with an error");
        std::process::exit(1);
    }
}

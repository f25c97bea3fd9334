#[tokio::main]
async fn main() {
    if let Err(err) = expo_api::run().await {
        tracing::error!(error = %err, "expo-api failed");
        std::process::exit(1);
    }
}

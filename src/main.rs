#[tokio::main]
async fn main() {
    offline_sync::run().await
}

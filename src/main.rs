#[tokio::main]
async fn main() {
    botmirror::server::run().await;
}

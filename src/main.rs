#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    wa_gateway::app::run().await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ollama_lancache::cli::run().await
}

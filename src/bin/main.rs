//! Binary entrypoint for the wbs-engine tool

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    wbs_engine::cli::run().await
}

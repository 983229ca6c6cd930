use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    sweperf_bench::cli::run().await
}

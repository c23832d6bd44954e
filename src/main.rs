// `main.rs` is intentionally tiny: the implementation lives in the library
// modules so tests and other binaries can reach `server::run()` and the
// pipeline pieces directly.

/// Start the service.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sensor_ingest::server::run().await
}

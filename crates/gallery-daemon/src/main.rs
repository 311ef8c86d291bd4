use anyhow::Result;

use gallery_daemon::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = telemetry::init("gallery-daemon")?;
    gallery_daemon::server::run().await
}

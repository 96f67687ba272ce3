use anyhow::Result;

use ayb_server::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = telemetry::init("ayb-server")?;
    ayb_server::server::run().await
}

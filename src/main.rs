//! booking-ingest server entrypoint.

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    booking_ingest::server::run().await
}

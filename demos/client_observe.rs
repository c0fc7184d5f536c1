use std::sync::Arc;
use std::time::Duration;

use coap_client::{channel, ClientConfig, ClientError, CoapClient, ResourceTarget};
use tokio_stream::StreamExt;

/// Prints notifications of an observable resource until it stays quiet for a minute.
#[tokio::main]
async fn main() -> Result<(), ClientError> {
    env_logger::init();
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/counter".to_string());
    let client = CoapClient::start(ClientConfig::new("127.0.0.1")).await?;

    let (sink, notifications) = channel();
    client.register_handler("printer", Arc::new(sink))?;
    let target = ResourceTarget::new(path);
    client.start_observe(true, &target, "printer")?;

    let notifications = notifications.timeout(Duration::from_secs(60));
    tokio::pin!(notifications);
    while let Some(Ok(notification)) = notifications.next().await {
        match notification.payload_text() {
            Some(text) => println!("{}: {text}", notification.request_uri()),
            None => println!("relation on {} interrupted", notification.request_uri()),
        }
    }

    client.stop_observe(&target)?;
    client.stop().await;
    Ok(())
}

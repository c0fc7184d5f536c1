use coap_client::{ClientConfig, ClientError, CoapClient, OutboundMessage, ResourceTarget};

/// Queries a CoAP server on localhost, or on the host given as the first argument.
#[tokio::main]
async fn main() -> Result<(), ClientError> {
    env_logger::init();
    let host = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let client = CoapClient::start(ClientConfig::new(host)).await?;

    if let Err(e) = client.test_connectivity().await {
        log::warn!("{e}");
    }

    for link in client.discover(true, None, None, None).await? {
        println!("{} {:?}", link.uri(), link.attributes());
    }

    let response = client
        .get(true, &ResourceTarget::new("/hello"), &OutboundMessage::new())
        .await?;
    match response.payload_text() {
        Some(text) => println!("{}: {text}", response.code().unwrap_or_default()),
        None => println!("no response from {}", response.request_uri()),
    }

    client.stop().await;
    Ok(())
}

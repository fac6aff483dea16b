use std::time::Duration;

use kv_client::*;
use tracing_subscriber::EnvFilter;

async fn test_basic_operations(client: &StoreClient) -> Result<(), Box<dyn std::error::Error>> {
    // Set a key-value pair
    println!("Setting key 'smoke:hello' to 'world'");
    client.save("smoke:hello", "world").await?;

    // Get the value back
    let value = client.get("smoke:hello").await?;
    println!("Value for 'smoke:hello': {:?}", value);

    // Try getting a non-existent key
    let value = client.get("smoke:nonexistent").await?;
    println!("Value for 'smoke:nonexistent': {:?}", value);

    // Delete the key, twice
    println!("Deleting key 'smoke:hello'");
    let removed = client.delete("smoke:hello").await?;
    let removed_again = client.delete("smoke:hello").await?;
    println!("Removed: {} / second delete removed: {}", removed, removed_again);

    println!("Exists after deletion: {}", client.key_exists("smoke:hello").await?);
    Ok(())
}

async fn test_message_queue(client: &StoreClient) -> Result<(), Box<dyn std::error::Error>> {
    let key = "smoke:queue";
    client.delete(key).await?;

    for message in ["first", "second", "third"] {
        let len = client.push_message(key, message).await?;
        println!("Pushed {:?}, queue length {}", message, len);
    }
    while let Some(message) = client.pop_message(key).await? {
        println!("Popped {:?}", message);
    }

    // A list is not a string
    client.push_message(key, "x").await?;
    match client.get(key).await {
        Err(StoreError::TypeMismatch { .. }) => println!("GET on a list failed with WRONGTYPE as expected"),
        other => println!("Unexpected GET result on a list: {:?}", other),
    }
    client.delete(key).await?;
    Ok(())
}

async fn test_expiry_notifications(client: &StoreClient) -> Result<(), Box<dyn std::error::Error>> {
    let mut events = client.subscribe_events();
    client.enable_key_expiry_subscription().await?;

    println!("Saving 'smoke:ephemeral' with a 1s expiry");
    client.save_with_ttl("smoke:ephemeral", "soon gone", Duration::from_secs(1)).await?;

    let deadline = tokio::time::sleep(Duration::from_secs(5));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(StoreEvent::KeyExpired { channel, message }) => {
                    println!("Expired on {}: {}", channel, message);
                    if message == "smoke:ephemeral" {
                        break;
                    }
                }
                Some(other) => println!("Event: {:?}", other),
                None => break,
            },
            _ = &mut deadline => {
                println!("No expiry notification within 5s (is notify-keyspace-events enabled?)");
                break;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = StoreConfig::from_env()?;
    println!("Connecting to {} (database {})...", config.endpoint(), config.database);
    let client = StoreClient::connect(config).await?;

    let _log_events = client.on_event(|event| {
        if !matches!(event, StoreEvent::KeyExpired { .. }) {
            println!("Connection event: {:?}", event);
        }
    });

    if !client.is_connected() {
        println!("Server not reachable yet; operations will fail until it is.");
    }

    println!("\n➡️ Running basic operations...");
    test_basic_operations(&client).await?;

    println!("\n➡️ Running message queue...");
    test_message_queue(&client).await?;

    println!("\n➡️ Running expiry notifications...");
    test_expiry_notifications(&client).await?;

    println!("\n=== Smoke run completed ===");
    Ok(())
}

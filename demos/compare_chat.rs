use std::error::Error;
use std::sync::Arc;

use comparely_sdk::auth::{AuthApiClient, MemorySessionStore};
use comparely_sdk::config::ClientConfig;
use comparely_sdk::stream::proto::{COMPARE_REQUEST, COMPARE_RESPONSE};
use comparely_sdk::stream::{ChannelNotifier, Message, WebSocketClient};
use secrecy::SecretString;
use serde_json::json;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let email = "REPLACE_WITH_EMAIL".to_string();
    let password = SecretString::new("REPLACE_WITH_PASSWORD".to_string());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let config = ClientConfig::from_env()?;
        let session = Arc::new(MemorySessionStore::new());
        AuthApiClient::new(&config)?
            .login_into(session.as_ref(), &email, &password)
            .await?;

        let (notifier, mut notices) = ChannelNotifier::new();
        let client = WebSocketClient::builder(config, session)
            .notifier(notifier)
            .spawn()?;

        let (answers_tx, mut answers) = mpsc::unbounded_channel();
        let subscription = client.subscribe(move |message| {
            if message.kind == COMPARE_RESPONSE || message.is_error() {
                let _ = answers_tx.send(message.clone());
            }
        });

        let request = Message::new(
            COMPARE_REQUEST,
            json!({"query": "Compare the two cheapest 27-inch 4K monitors"}),
        );
        if !client.send_message(request).await {
            println!("not connected yet, request queued ({} pending)", client.queued_len());
        }

        loop {
            tokio::select! {
                Some(notice) = notices.recv() => println!("[{}] {notice}", client.state()),
                Some(answer) = answers.recv() => {
                    println!("{}: {}", answer.kind, answer.data);
                    if answer.is_error() || answer.data.get("done") == Some(&json!(true)) {
                        break;
                    }
                }
                else => break,
            }
        }

        subscription.unsubscribe();
        let undelivered = client.close().await;
        if !undelivered.is_empty() {
            println!("{} message(s) were never delivered", undelivered.len());
        }
        Ok::<(), Box<dyn Error>>(())
    })
}

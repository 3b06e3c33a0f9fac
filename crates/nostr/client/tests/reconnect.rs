//! Reconnect and migration behavior against an in-process relay.

mod support;

use nostr::{LocalSigner, generate_secret_key};
use nostr_mux::{ClientConfig, ConnectionStatus, Filter, NostrClient, ServerRole};
use std::sync::Arc;
use support::{MockRelay, config_for, note};
use tokio::time::{Duration, sleep, timeout};

fn fast_retry(url: &str, grace_period_ms: u64) -> ClientConfig {
    let mut config = config_for(url);
    config.reconnect.base_delay_ms = 20;
    config.reconnect.max_delay_ms = 100;
    config.reconnect.grace_period_ms = grace_period_ms;
    config.reconnect.connect_timeout_ms = 1_000;
    config
}

fn client_with(config: ClientConfig) -> NostrClient {
    let signer = Arc::new(LocalSigner::new(generate_secret_key()).unwrap());
    NostrClient::new(config, signer).unwrap()
}

async fn wait_status(
    client: &NostrClient,
    role: ServerRole,
    check: impl FnMut(&ConnectionStatus) -> bool,
) -> ConnectionStatus {
    let mut rx = client.watch_status(role);
    let status = timeout(Duration::from_secs(5), rx.wait_for(check))
        .await
        .expect("status never matched")
        .unwrap();
    status.clone()
}

#[tokio::test]
async fn test_reconnects_after_server_closes_socket() {
    let relay = MockRelay::start().await;
    relay.seed(note(&generate_secret_key(), 100, "survives"));
    let client = client_with(fast_retry(&relay.url(), 5_000));
    client.connect(ServerRole::Caching).await.unwrap();
    assert_eq!(relay.connection_count(), 1);

    relay.drop_connections();
    let status = wait_status(&client, ServerRole::Caching, |s| {
        s.is_connected() && s.retry_count >= 1
    })
    .await;
    assert_eq!(status.retry_count, 1);
    assert_eq!(relay.connection_count(), 2);

    let result = client
        .request(ServerRole::Caching, &Filter::new().kinds(vec![1]).to_payload())
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(result.events[0].content, "survives");

    client.shutdown().await;
}

#[tokio::test]
async fn test_grace_period_resets_retry_count() {
    let relay = MockRelay::start().await;
    let client = client_with(fast_retry(&relay.url(), 1_000));
    client.connect(ServerRole::Caching).await.unwrap();

    // short-lived connections keep counting
    relay.drop_connections();
    wait_status(&client, ServerRole::Caching, |s| {
        s.is_connected() && s.retry_count == 1
    })
    .await;
    relay.drop_connections();
    wait_status(&client, ServerRole::Caching, |s| {
        s.is_connected() && s.retry_count == 2
    })
    .await;

    // a connection that outlives the grace period starts over
    sleep(Duration::from_millis(1_300)).await;
    relay.drop_connections();
    let status = wait_status(&client, ServerRole::Caching, |s| {
        s.is_connected() && s.retry_count == 1
    })
    .await;
    assert!(status.last_error.is_none());
    assert_eq!(relay.connection_count(), 4);

    client.shutdown().await;
}

#[tokio::test]
async fn test_connect_to_new_url_closes_previous_connection() {
    let first = MockRelay::start().await;
    let second = MockRelay::start().await;
    second.seed(note(&generate_secret_key(), 100, "on second"));
    let client = client_with(fast_retry(&first.url(), 5_000));

    client.connect(ServerRole::Caching).await.unwrap();
    assert_eq!(first.open_connections(), 1);

    client
        .connect_to(ServerRole::Caching, &second.url())
        .await
        .unwrap();
    let status = client.status(ServerRole::Caching);
    assert!(status.is_connected());
    assert_eq!(
        status.url.map(|u| u.to_string().trim_end_matches('/').to_string()),
        Some(second.url())
    );

    timeout(Duration::from_secs(5), async {
        while first.open_connections() > 0 {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("first connection still open");

    let result = client
        .request(ServerRole::Caching, &Filter::new().kinds(vec![1]).to_payload())
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(result.events[0].content, "on second");
    assert!(first.request_ids().is_empty());
    assert_eq!(second.request_ids().len(), 1);
    assert_eq!(first.connection_count(), 1);

    client.shutdown().await;
}

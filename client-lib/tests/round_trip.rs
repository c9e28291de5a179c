use std::sync::Arc;
use std::time::Duration;

use messenger_client::{Client, Reply, hash_password};
use messenger_server::{ChatServer, ServerConfig};
use tempfile::TempDir;
use tokio::sync::oneshot;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn next_reply(client: &Client) -> Reply {
    tokio::time::timeout(TIMEOUT, client.receive_message())
        .await
        .expect("timed out waiting for reply")
        .expect("connection closed")
}

#[tokio::test]
async fn test_client_hashes_password_and_logs_in() {
    let temp = TempDir::new().unwrap();
    let config = ServerConfig::default()
        .with_listen_addr("127.0.0.1:0".parse().unwrap())
        .with_data_dir(temp.path());
    let server = ChatServer::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let state = Arc::clone(server.state());

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.run(async {
        let _ = stop_rx.await;
    }));

    let client = Client::connect(addr).await.unwrap();

    assert!(client.send_input("/newChat").await.is_err());

    client.send_input("/register alice hunter2").await.unwrap();
    let reply = next_reply(&client).await;
    assert_eq!(reply.identity, "anonymous");
    assert_eq!(reply.text, "New user added: alice");

    assert_eq!(
        state.credentials.verify("alice", &hash_password("hunter2")).await,
        Ok(())
    );

    client.send_input("/login alice hunter2").await.unwrap();
    let reply = next_reply(&client).await;
    assert_eq!(reply.identity, "alice");
    assert!(!reply.is_error());

    client.send_input("/logout").await.unwrap();
    assert_eq!(next_reply(&client).await.identity, "anonymous");

    stop_tx.send(()).unwrap();
    tokio::time::timeout(TIMEOUT, handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    // The server closed the connection during shutdown.
    let closed = tokio::time::timeout(TIMEOUT, client.receive_message()).await.unwrap();
    assert!(closed.is_none());
}

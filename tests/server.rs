use std::sync::Arc;
use std::time::Duration;

use sheaf::server::client::SheafClient;
use sheaf::{start_server, Database, StoreConfig};

async fn start_test_server(addr: &'static str) -> Arc<Database> {
    let db = Database::open_in_memory(StoreConfig::default()).unwrap();
    let server_db = Arc::clone(&db);
    tokio::spawn(async move {
        let _ = start_server(addr, server_db).await;
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    db
}

#[tokio::test]
async fn put_get_commit_over_the_wire() {
    let db = start_test_server("127.0.0.1:19610").await;

    let result = tokio::task::spawn_blocking(|| {
        let mut client = SheafClient::connect("127.0.0.1:19610")?;
        let session_id = client.open_session()?;
        assert!(session_id > 0);

        assert_eq!(client.put("kv", b"alpha", b"one")?, None);
        assert_eq!(client.get("kv", b"alpha")?, Some(b"one".to_vec()));
        client.commit()?;

        // A second connection sees the committed value.
        let mut other = SheafClient::connect("127.0.0.1:19610")?;
        other.open_session()?;
        assert_eq!(other.get("kv", b"alpha")?, Some(b"one".to_vec()));
        Ok::<_, sheaf::SheafError>(())
    })
    .await
    .unwrap();
    result.unwrap();

    db.close().unwrap();
}

#[tokio::test]
async fn rollback_discards_the_session_writes() {
    let db = start_test_server("127.0.0.1:19611").await;

    let result = tokio::task::spawn_blocking(|| {
        let mut client = SheafClient::connect("127.0.0.1:19611")?;
        client.open_session()?;
        client.put("kv", b"beta", b"pending")?;
        assert_eq!(client.get("kv", b"beta")?, Some(b"pending".to_vec()));
        client.rollback()?;

        let mut other = SheafClient::connect("127.0.0.1:19611")?;
        other.open_session()?;
        assert_eq!(other.get("kv", b"beta")?, None);
        Ok::<_, sheaf::SheafError>(())
    })
    .await
    .unwrap();
    result.unwrap();

    db.close().unwrap();
}

#[tokio::test]
async fn commands_without_a_session_are_rejected() {
    let db = start_test_server("127.0.0.1:19612").await;

    let result = tokio::task::spawn_blocking(|| {
        let mut client = SheafClient::connect("127.0.0.1:19612")?;
        let err = client.get("kv", b"x").unwrap_err();
        assert!(err.to_string().contains("no open session"), "got {err}");
        Ok::<_, sheaf::SheafError>(())
    })
    .await
    .unwrap();
    result.unwrap();

    db.close().unwrap();
}

#[tokio::test]
async fn remove_round_trip() {
    let db = start_test_server("127.0.0.1:19613").await;

    let result = tokio::task::spawn_blocking(|| {
        let mut client = SheafClient::connect("127.0.0.1:19613")?;
        client.open_session()?;
        client.put("kv", b"gamma", b"g1")?;
        assert_eq!(client.remove("kv", b"gamma")?, Some(b"g1".to_vec()));
        assert_eq!(client.remove("kv", b"gamma")?, None);
        client.commit()?;
        Ok::<_, sheaf::SheafError>(())
    })
    .await
    .unwrap();
    result.unwrap();

    db.close().unwrap();
}

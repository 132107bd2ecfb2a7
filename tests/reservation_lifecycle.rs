mod common;

use std::time::Duration;

use common::{test_config, TestServer};

#[tokio::test]
async fn release_returns_job_to_ready_queue() {
    let server = TestServer::start(test_config()).await;
    let mut client = server.connect().await;

    client.send_put(5, 0, 60, b"work").await;
    client.send("reserve").await;
    let (header, _) = client.read_job().await;
    let id = header.split(' ').nth(1).unwrap();

    client.send(&format!("release {id} 5 0")).await;
    assert_eq!(client.read_line().await, "RELEASED");

    client.send("reserve").await;
    let (header, body) = client.read_job().await;
    assert_eq!(header, format!("RESERVED {id} 4"));
    assert_eq!(body, b"work");

    server.shutdown().await;
}

#[tokio::test]
async fn touch_refreshes_ttr_for_the_reserving_connection() {
    let server = TestServer::start(test_config()).await;
    let mut client = server.connect().await;

    client.send_put(0, 0, 60, b"job").await;
    client.send("reserve").await;
    let (header, _) = client.read_job().await;
    let id = header.split(' ').nth(1).unwrap();

    client.send(&format!("touch {id}")).await;
    assert_eq!(client.read_line().await, "TOUCHED");

    server.shutdown().await;
}

#[tokio::test]
async fn another_connection_cannot_bury_release_touch_or_delete_a_reserved_job() {
    let server = TestServer::start(test_config()).await;
    let mut owner = server.connect().await;
    let mut stranger = server.connect().await;

    owner.send_put(0, 0, 60, b"mine").await;
    owner.send("reserve").await;
    let (header, _) = owner.read_job().await;
    let id: &str = header.split(' ').nth(1).unwrap();

    stranger.send(&format!("bury {id} 0")).await;
    assert_eq!(stranger.read_line().await, "NOT_FOUND");

    stranger.send(&format!("release {id} 0 0")).await;
    assert_eq!(stranger.read_line().await, "NOT_FOUND");

    stranger.send(&format!("touch {id}")).await;
    assert_eq!(stranger.read_line().await, "NOT_FOUND");

    stranger.send(&format!("delete {id}")).await;
    assert_eq!(stranger.read_line().await, "NOT_FOUND");

    // the owning connection can still act on its own reservation
    owner.send(&format!("delete {id}")).await;
    assert_eq!(owner.read_line().await, "DELETED");

    server.shutdown().await;
}

#[tokio::test]
async fn a_blocked_reserve_is_woken_by_a_later_put_from_another_connection() {
    let server = TestServer::start(test_config()).await;
    let mut worker = server.connect().await;
    let mut producer = server.connect().await;

    // worker blocks on a plain reserve with no ready job anywhere and no
    // other timer pending; it must be woken by the producer's put, not by
    // some unrelated timeout eventually firing.
    worker.send("reserve").await;

    producer.send_put(0, 0, 60, b"wake-me").await;

    let (header, body) = tokio::time::timeout(Duration::from_secs(2), worker.read_job())
        .await
        .expect("blocked reserve should be dispatched as soon as the job is put, not after a timer");
    assert_eq!(header, "RESERVED 1 7");
    assert_eq!(body, b"wake-me");

    server.shutdown().await;
}

#[tokio::test]
async fn closing_a_connection_releases_its_reservations() {
    let server = TestServer::start(test_config()).await;
    let mut producer = server.connect().await;

    producer.send_put(0, 0, 60, b"orphaned").await;

    let mut worker = server.connect().await;
    worker.send("reserve").await;
    let (header, _) = worker.read_job().await;
    let id = header.split(' ').nth(1).unwrap().to_string();

    worker.disconnect().await;

    // give the server task time to observe the closed channel and run
    // drop_conn before the next reserve is dispatched
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    producer.send("reserve").await;
    let (header, body) = producer.read_job().await;
    assert_eq!(header, format!("RESERVED {id} 8"));
    assert_eq!(body, b"orphaned");

    server.shutdown().await;
}

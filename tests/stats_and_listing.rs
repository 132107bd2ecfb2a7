mod common;

use common::{test_config, TestServer};

#[tokio::test]
async fn stats_job_reports_tube_and_state() {
    let server = TestServer::start(test_config()).await;
    let mut client = server.connect().await;

    client.send("use orders").await;
    assert_eq!(client.read_line().await, "USING orders");
    client.send_put(5, 0, 60, b"payload").await;

    client.send("stats-job 1").await;
    let (header, body) = client.read_job().await;
    assert!(header.starts_with("OK "));
    let yaml = String::from_utf8(body).unwrap();
    assert!(yaml.contains("tube: orders"));
    assert!(yaml.contains("state: ready"));

    server.shutdown().await;
}

#[tokio::test]
async fn stats_job_for_unknown_job_is_not_found() {
    let server = TestServer::start(test_config()).await;
    let mut client = server.connect().await;

    client.send("stats-job 999").await;
    assert_eq!(client.read_line().await, "NOT_FOUND");

    server.shutdown().await;
}

#[tokio::test]
async fn list_tubes_includes_every_tube_ever_used() {
    let server = TestServer::start(test_config()).await;
    let mut client = server.connect().await;

    client.send("use orders").await;
    assert_eq!(client.read_line().await, "USING orders");

    client.send("list-tubes").await;
    let (header, body) = client.read_job().await;
    assert!(header.starts_with("OK "));
    let yaml = String::from_utf8(body).unwrap();
    assert!(yaml.contains("- default"));
    assert!(yaml.contains("- orders"));

    server.shutdown().await;
}

#[tokio::test]
async fn stats_tube_reports_ready_count() {
    let server = TestServer::start(test_config()).await;
    let mut client = server.connect().await;

    client.send_put(0, 0, 60, b"a").await;
    client.send_put(0, 0, 60, b"b").await;

    client.send("stats-tube default").await;
    let (header, body) = client.read_job().await;
    assert!(header.starts_with("OK "));
    let yaml = String::from_utf8(body).unwrap();
    assert!(yaml.contains("current-jobs-ready: 2"));

    server.shutdown().await;
}

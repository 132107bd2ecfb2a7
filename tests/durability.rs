mod common;

use common::{wal_config, TestServer};

#[tokio::test]
async fn jobs_survive_a_restart_when_a_write_ahead_log_is_configured() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = wal_config(dir.path().to_path_buf());

    let server = TestServer::start(config.clone()).await;
    let mut client = server.connect().await;

    assert_eq!(client.send_put(10, 0, 60, b"persisted").await, "INSERTED 1");
    client.send("delete 1").await;
    assert_eq!(client.read_line().await, "DELETED");
    assert_eq!(client.send_put(20, 0, 60, b"survivor").await, "INSERTED 2");

    server.shutdown().await;

    // restart against the same directory: job 1 was deleted and should stay
    // gone, job 2 should come back ready to be reserved.
    let server = TestServer::start(config).await;
    let mut client = server.connect().await;

    client.send("reserve-with-timeout 1").await;
    let (header, body) = client.read_job().await;
    assert_eq!(header, "RESERVED 2 8");
    assert_eq!(body, b"survivor");

    client.send("delete 2").await;
    assert_eq!(client.read_line().await, "DELETED");

    client.send("reserve-with-timeout 1").await;
    assert_eq!(client.read_line().await, "TIMED_OUT");

    server.shutdown().await;
}

#[tokio::test]
async fn a_second_server_refuses_to_start_against_a_locked_write_ahead_log_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = wal_config(dir.path().to_path_buf());

    let server = TestServer::start(config.clone()).await;

    let result = beanstalk_rs::server::Server::open(&config).await;
    assert!(matches!(
        result,
        Err(beanstalk_rs::server::OpenError::Wal(beanstalk_rs::wal::Error::Locked(_)))
    ));

    server.shutdown().await;
}

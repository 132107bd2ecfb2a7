mod common;

use common::{test_config, TestServer};

#[tokio::test]
async fn put_reserve_delete_round_trip() {
    let server = TestServer::start(test_config()).await;
    let mut client = server.connect().await;

    assert_eq!(client.send_put(10, 0, 60, b"hello").await, "INSERTED 1");

    client.send("reserve").await;
    let (header, body) = client.read_job().await;
    assert_eq!(header, "RESERVED 1 5");
    assert_eq!(body, b"hello");

    client.send("delete 1").await;
    assert_eq!(client.read_line().await, "DELETED");

    client.send("delete 1").await;
    assert_eq!(client.read_line().await, "NOT_FOUND");

    server.shutdown().await;
}

#[tokio::test]
async fn unknown_command_is_rejected_without_closing_the_connection() {
    let server = TestServer::start(test_config()).await;
    let mut client = server.connect().await;

    client.send("frobnicate").await;
    assert_eq!(client.read_line().await, "UNKNOWN_COMMAND");

    // the connection should still be usable afterwards
    assert_eq!(client.send_put(1, 0, 60, b"x").await, "INSERTED 1");

    server.shutdown().await;
}

#[tokio::test]
async fn rejects_priority_above_u32_max() {
    let server = TestServer::start(test_config()).await;
    let mut client = server.connect().await;

    client.send("put 4294967296 0 60 1").await;
    assert_eq!(client.read_line().await, "BAD_FORMAT");

    server.shutdown().await;
}

#[tokio::test]
async fn job_too_big_rejects_oversized_put() {
    let mut config = test_config();
    config.max_job_size = 4;
    let server = TestServer::start(config).await;
    let mut client = server.connect().await;

    assert_eq!(client.send_put(0, 0, 60, b"12345").await, "JOB_TOO_BIG");

    server.shutdown().await;
}

#[tokio::test]
async fn use_and_list_tube_used_track_the_producer_tube() {
    let server = TestServer::start(test_config()).await;
    let mut client = server.connect().await;

    client.send("use orders").await;
    assert_eq!(client.read_line().await, "USING orders");

    client.send("list-tube-used").await;
    assert_eq!(client.read_line().await, "USING orders");

    server.shutdown().await;
}

#[tokio::test]
async fn watch_and_ignore_report_watch_count_and_refuse_to_empty_the_watchlist() {
    let server = TestServer::start(test_config()).await;
    let mut client = server.connect().await;

    // every connection starts watching "default"
    client.send("watch orders").await;
    assert_eq!(client.read_line().await, "WATCHING 2");

    client.send("ignore default").await;
    assert_eq!(client.read_line().await, "WATCHING 1");

    // refusing to leave the watchlist empty
    client.send("ignore orders").await;
    assert_eq!(client.read_line().await, "NOT_IGNORED");

    server.shutdown().await;
}

#[tokio::test]
async fn kick_then_reserve_round_trip() {
    let server = TestServer::start(test_config()).await;
    let mut client = server.connect().await;

    client.send_put(0, 0, 60, b"buried-body").await;
    client.send("reserve").await;
    let (header, _) = client.read_job().await;
    let id = header.split(' ').nth(1).unwrap();

    client.send(&format!("bury {id} 0")).await;
    assert_eq!(client.read_line().await, "BURIED");

    client.send("kick 10").await;
    assert_eq!(client.read_line().await, "KICKED 1");

    client.send("reserve").await;
    let (header, body) = client.read_job().await;
    assert_eq!(header, format!("RESERVED {id} 11"));
    assert_eq!(body, b"buried-body");

    server.shutdown().await;
}

#[tokio::test]
async fn bulk_put_then_bulk_delete() {
    let server = TestServer::start(test_config()).await;
    let mut client = server.connect().await;

    let mut ids = Vec::new();
    for i in 0..20u32 {
        let reply = client.send_put(i, 0, 60, format!("job-{i}").as_bytes()).await;
        let id = reply.strip_prefix("INSERTED ").unwrap().parse::<u64>().unwrap();
        ids.push(id);
    }

    for id in &ids {
        client.send("reserve").await;
        let _ = client.read_job().await;
        client.send(&format!("delete {id}")).await;
        assert_eq!(client.read_line().await, "DELETED");
    }

    server.shutdown().await;
}

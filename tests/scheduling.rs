mod common;

use std::time::Duration;

use common::{test_config, TestServer};

#[tokio::test]
async fn delayed_job_becomes_ready_after_its_delay_elapses() {
    let server = TestServer::start(test_config()).await;
    let mut client = server.connect().await;

    let reply = client.send_put(0, 1, 60, b"later").await;
    assert_eq!(reply, "INSERTED 1");

    client.send("reserve-with-timeout 3").await;
    let (header, body) = client.read_job().await;
    assert_eq!(header, "RESERVED 1 5");
    assert_eq!(body, b"later");

    server.shutdown().await;
}

#[tokio::test]
async fn reserve_with_timeout_times_out_with_no_ready_jobs() {
    let server = TestServer::start(test_config()).await;
    let mut client = server.connect().await;

    client.send("reserve-with-timeout 1").await;
    assert_eq!(client.read_line().await, "TIMED_OUT");

    server.shutdown().await;
}

#[tokio::test]
async fn paused_tube_blocks_reserve_until_the_pause_lifts() {
    let server = TestServer::start(test_config()).await;
    let mut client = server.connect().await;

    client.send_put(0, 0, 60, b"paused-job").await;

    client.send("pause-tube default 1").await;
    assert_eq!(client.read_line().await, "PAUSED");

    client.send("reserve-with-timeout 3").await;
    let (header, _) = client.read_job().await;
    assert_eq!(header, "RESERVED 1 10");

    server.shutdown().await;
}

#[tokio::test]
async fn pause_tube_on_an_unknown_tube_is_not_found() {
    let server = TestServer::start(test_config()).await;
    let mut client = server.connect().await;

    client.send("pause-tube no-such-tube 5").await;
    assert_eq!(client.read_line().await, "NOT_FOUND");

    server.shutdown().await;
}

#[tokio::test]
async fn short_ttr_reservation_receives_deadline_soon_before_timing_out() {
    let server = TestServer::start(test_config()).await;
    let mut client = server.connect().await;

    client.send_put(0, 0, 1, b"hot").await;
    client.send("reserve").await;
    let (header, _) = client.read_job().await;
    assert_eq!(header, "RESERVED 1 3");

    // a second reserve on the same TTR-bound job should warn this
    // connection its reservation is about to expire, rather than block
    // silently until the TTR fires.
    client.send("reserve-with-timeout 2").await;
    assert_eq!(client.read_line().await, "DEADLINE_SOON");

    server.shutdown().await;
}

#[tokio::test]
async fn reservation_is_released_back_to_ready_when_ttr_expires() {
    let server = TestServer::start(test_config()).await;
    let mut worker = server.connect().await;
    let mut watcher = server.connect().await;

    worker.send_put(0, 0, 1, b"ttr-job").await;
    worker.send("reserve").await;
    let (header, _) = worker.read_job().await;
    assert_eq!(header, "RESERVED 1 7");

    watcher.send("reserve-with-timeout 3").await;
    let (header, body) = watcher.read_job().await;
    assert_eq!(header, "RESERVED 1 7");
    assert_eq!(body, b"ttr-job");

    server.shutdown().await;
}

//! Session teardown

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{server, PathProfile, Resolver};
use socketace::{ClientOptions, DnsClient, DnsTransport, ServerOptions, TunnelError, TunnelStream};

fn client() -> DnsClient {
    DnsClient::new(ClientOptions {
        domain: common::DOMAIN.into(),
        poll_interval: Duration::from_millis(100),
        ..Default::default()
    })
}

#[tokio::test]
async fn test_close_sends_final_ack_and_teardown_once() {
    let server = server(ServerOptions::default());
    let resolver = Resolver::new(server.clone(), PathProfile::default());
    let transport: Arc<dyn DnsTransport> = resolver.clone();

    let conn = client().connect(transport).await.unwrap();
    assert_eq!(server.user_count().await, 1);

    conn.close().await.unwrap();
    let commands = resolver.commands();
    assert!(
        commands.ends_with(b"ko"),
        "close should end with a final poll and a teardown: {:?}",
        String::from_utf8_lossy(&commands)
    );
    assert_eq!(server.user_count().await, 0, "server should drop the session");
    assert!(resolver.is_closed());

    let sent = resolver.query_count();
    conn.close().await.unwrap();
    assert_eq!(resolver.query_count(), sent, "second close must not touch the network");

    assert!(matches!(conn.write(b"late").await, Err(TunnelError::Closed)));
    let mut buf = [0u8; 8];
    assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn test_close_after_server_dropped_session() {
    let server = server(ServerOptions {
        idle_timeout: Duration::from_millis(1),
        ..Default::default()
    });
    let transport: Arc<dyn DnsTransport> = Resolver::new(server.clone(), PathProfile::default());
    let conn = client().connect(transport).await.unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    server.reap_idle().await;

    // BADCONN on teardown is not an error
    conn.close().await.unwrap();
}

#[tokio::test]
async fn test_server_close_ends_client_reads() {
    let server = server(ServerOptions::default());
    let transport: Arc<dyn DnsTransport> = Resolver::new(server.clone(), PathProfile::default());
    let conn = client().connect(transport).await.unwrap();

    let accepted = tokio::time::timeout(Duration::from_secs(5), server.accept())
        .await
        .unwrap()
        .unwrap();
    accepted.close().await.unwrap();

    // the next poll gets BADCONN and the poller shuts the stream down
    let mut buf = [0u8; 8];
    let n = tokio::time::timeout(Duration::from_secs(5), conn.read(&mut buf))
        .await
        .expect("read should end")
        .unwrap();
    assert_eq!(n, 0);
    conn.close().await.unwrap();
}

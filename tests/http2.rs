use std::{sync::Arc, thread, time::Duration};

use bytes::Bytes;
use cqrpc::{
    CallError, Client, Code, HandlerFault, HandlerRegistry, HookPoint, Hooks, Http2Transport,
    Server, ServerConfig, StopReason,
};

#[test]
fn echo_over_loopback() {
    let transport = Http2Transport::new().expect("runtime starts");
    let handlers = HandlerRegistry::new().with(
        "/test.Echo/Echo",
        |request: Bytes| -> Result<Bytes, HandlerFault> { Ok(request) },
    );

    let (port_tx, port_rx) = crossbeam_channel::bounded(1);
    let hooks = Hooks::new().on(HookPoint::Bind, move |payload| {
        let port = payload["port"].as_u64().unwrap_or(0);
        port_tx.send(port).map_err(|err| err.to_string().into())
    });
    let server = Server::new(Arc::new(transport.clone()), handlers)
        .with_config(ServerConfig {
            poll_slice: Duration::from_millis(50),
            shutdown_grace: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(1),
            ..ServerConfig::new("127.0.0.1:0")
        })
        .with_hooks(hooks);
    let signal = server.shutdown_signal();
    let server = thread::spawn(move || server.serve());

    let port = port_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("bind hook reports the port");
    assert_ne!(port, 0);
    let target = format!("127.0.0.1:{port}");

    let client = Client::new(Arc::new(transport.clone()));
    let response = client
        .execute(
            &target,
            "/test.Echo/Echo",
            Bytes::from_static(&[1, 2, 3]),
            &[Bytes::from_static(b"x-request-id"), Bytes::from_static(b"42")],
            Some(Duration::from_secs(5)),
        )
        .expect("echo succeeds");
    assert_eq!(response.message, Some(Bytes::from_static(&[1, 2, 3])));

    let err = client
        .execute(
            &target,
            "/test.Echo/Missing",
            Bytes::from_static(b"x"),
            &[],
            Some(Duration::from_secs(5)),
        )
        .expect_err("method is not registered");
    match err {
        CallError::RemoteFault(status) => {
            assert_eq!(status.code(), Code::Unimplemented);
            assert!(status.detail().contains("/test.Echo/Missing"));
        }
        other => panic!("unexpected error: {other}"),
    }

    signal.trigger();
    let summary = server
        .join()
        .expect("server thread")
        .expect("server stops cleanly");
    assert_eq!(summary.stop_reason, StopReason::Interrupted);
    assert_eq!(summary.calls_completed, 2);
}

#[test]
fn refused_connection_is_unavailable() {
    let transport = Http2Transport::new().expect("runtime starts");
    let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("probe bind");
    let port = probe.local_addr().expect("probe addr").port();
    drop(probe);

    let err = Client::new(Arc::new(transport))
        .execute(
            &format!("127.0.0.1:{port}"),
            "/test.Echo/Echo",
            Bytes::from_static(b"x"),
            &[],
            Some(Duration::from_secs(5)),
        )
        .expect_err("nothing listens");
    assert_eq!(err.code(), Some(Code::Unavailable));
}

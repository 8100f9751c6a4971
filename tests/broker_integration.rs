//! End-to-end exercise of a device logging in over WebSocket and an
//! application driving it over the IPC socket, against a mocked web
//! application.

use std::time::Duration;

use devicebroker::balancer::LoadBalancer;
use devicebroker::ipc;
use devicebroker::webapp::WebAppClient;
use devicebroker::wire::{IpcRequest, IpcResponse};
use devicebroker::worker::pool::WorkerPool;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn find_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Boot a full broker (balancer + worker pool + device listener + ipc
/// listener) against `webapp`, returning the device port and ipc port.
async fn spawn_broker(webapp_url: &str) -> (u16, u16) {
    let webapp = WebAppClient::new(webapp_url.to_string()).unwrap();
    let (balancer, to_worker_rx) = LoadBalancer::new(2);
    let (_pool, from_worker_rx) = WorkerPool::spawn(webapp, to_worker_rx);

    for (idx, rx) in from_worker_rx.into_iter().enumerate() {
        let balancer = balancer.clone();
        tokio::spawn(async move { balancer.receive_messages_from_worker(idx, rx).await });
    }

    let device_port = find_free_port().await;
    let device_listener = TcpListener::bind(("127.0.0.1", device_port)).await.unwrap();
    let device_balancer = balancer.clone();
    tokio::spawn(async move {
        loop {
            let (stream, peer) = device_listener.accept().await.unwrap();
            let balancer = device_balancer.clone();
            tokio::spawn(async move {
                let _ = balancer.serve_device(stream, peer).await;
            });
        }
    });

    let ipc_port = find_free_port().await;
    let sock_name = format!("127.0.0.1:{ipc_port}");
    tokio::spawn(async move {
        let _ = ipc::run(balancer, &sock_name).await;
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    (device_port, ipc_port)
}

async fn ipc_roundtrip(ipc_port: u16, request: IpcRequest) -> IpcResponse {
    let stream = TcpStream::connect(("127.0.0.1", ipc_port)).await.unwrap();
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    framed.send(serde_json::to_vec(&request).unwrap().into()).await.unwrap();
    let frame = framed.next().await.unwrap().unwrap();
    serde_json::from_slice(&frame).unwrap()
}

#[tokio::test]
async fn device_registers_logs_in_and_is_visible_to_the_application() {
    let webapp = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/device/check_registration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "tok-123"})))
        .mount(&webapp)
        .await;
    Mock::given(method("POST"))
        .and(path("/device/check_login"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&webapp)
        .await;

    let (device_port, ipc_port) = spawn_broker(&webapp.uri()).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{device_port}"))
        .await
        .unwrap();

    ws.send(Message::text(
        "<Message><Request>Register</Request><DeviceSerialNo>SN-1</DeviceSerialNo></Message>",
    ))
    .await
    .unwrap();
    let register_reply = ws.next().await.unwrap().unwrap().into_text().unwrap();
    assert!(register_reply.contains("<Result>OK</Result>"));
    assert!(register_reply.contains("<Token>tok-123</Token>"));

    ws.send(Message::text(
        "<Message><Request>Login</Request><DeviceSerialNo>SN-1</DeviceSerialNo><Token>tok-123</Token></Message>",
    ))
    .await
    .unwrap();
    let login_reply = ws.next().await.unwrap().unwrap().into_text().unwrap();
    assert!(login_reply.contains("<Result>OK</Result>"));

    tokio::time::sleep(Duration::from_millis(50)).await;

    let resp = ipc_roundtrip(ipc_port, IpcRequest::FindDeviceById { device_id: "SN-1".to_string() }).await;
    match resp {
        IpcResponse::FindDeviceById { client_id, .. } => assert!(client_id.is_some()),
        other => panic!("unexpected response: {other:?}"),
    }

    let resp = ipc_roundtrip(ipc_port, IpcRequest::GetAllOnlineDevices).await;
    match resp {
        IpcResponse::GetAllOnlineDevices { devices } => {
            assert_eq!(devices.len(), 1);
            assert_eq!(devices[0].device_id, "SN-1");
        }
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn send_and_receive_pairs_the_application_request_with_the_devices_reply() {
    let webapp = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/device/check_login"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&webapp)
        .await;

    let (device_port, ipc_port) = spawn_broker(&webapp.uri()).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{device_port}"))
        .await
        .unwrap();
    ws.send(Message::text(
        "<Message><Request>Login</Request><DeviceSerialNo>SN-2</DeviceSerialNo></Message>",
    ))
    .await
    .unwrap();
    let _ = ws.next().await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let client_id = match ipc_roundtrip(ipc_port, IpcRequest::FindDeviceById { device_id: "SN-2".to_string() }).await {
        IpcResponse::FindDeviceById { client_id: Some(id), .. } => id,
        other => panic!("device not found: {other:?}"),
    };

    let app_task = tokio::spawn(async move {
        ipc_roundtrip(
            ipc_port,
            IpcRequest::SendAndReceive { client_id, request: "<Message><Query>Status</Query></Message>".to_string() },
        )
        .await
    });

    // The device sees the request arrive and answers with a frame that is
    // neither a Request nor an Event, which the worker forwards untouched.
    let forwarded = ws.next().await.unwrap().unwrap().into_text().unwrap();
    assert!(forwarded.contains("Query"));
    ws.send(Message::text("<Message><Answer>42</Answer></Message>")).await.unwrap();

    match app_task.await.unwrap() {
        IpcResponse::SendAndReceive { success: true, response: Some(body), .. } => {
            assert!(body.contains("Answer"));
        }
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn send_and_receive_fails_fast_when_the_device_is_offline() {
    let webapp = MockServer::start().await;
    let (_device_port, ipc_port) = spawn_broker(&webapp.uri()).await;

    let resp = ipc_roundtrip(
        ipc_port,
        IpcRequest::SendAndReceive { client_id: 999, request: "<Message/>".to_string() },
    )
    .await;

    match resp {
        IpcResponse::SendAndReceive { success: false, error: Some(reason), response: None } => {
            assert_eq!(reason, "Device is offline");
        }
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn status_reports_connected_and_logged_in_counts() {
    let webapp = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/device/check_login"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&webapp)
        .await;

    let (device_port, ipc_port) = spawn_broker(&webapp.uri()).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{device_port}"))
        .await
        .unwrap();
    ws.send(Message::text(
        "<Message><Request>Login</Request><DeviceSerialNo>SN-3</DeviceSerialNo></Message>",
    ))
    .await
    .unwrap();
    let _ = ws.next().await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    match ipc_roundtrip(ipc_port, IpcRequest::Status).await {
        IpcResponse::Status { connected_devices, logged_in_devices, worker_count, .. } => {
            assert_eq!(connected_devices, 1);
            assert_eq!(logged_in_devices, 1);
            assert_eq!(worker_count, 2);
        }
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test]
async fn second_login_with_the_same_serial_evicts_the_first_session() {
    let webapp = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/device/check_login"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&webapp)
        .await;

    let (device_port, ipc_port) = spawn_broker(&webapp.uri()).await;

    let (mut ws_a, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{device_port}"))
        .await
        .unwrap();
    ws_a.send(Message::text(
        "<Message><Request>Login</Request><DeviceSerialNo>SN-DUP</DeviceSerialNo></Message>",
    ))
    .await
    .unwrap();
    let _ = ws_a.next().await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let client_id_a = match ipc_roundtrip(ipc_port, IpcRequest::FindDeviceById { device_id: "SN-DUP".to_string() }).await
    {
        IpcResponse::FindDeviceById { client_id: Some(id), .. } => id,
        other => panic!("device not found: {other:?}"),
    };

    let (mut ws_b, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{device_port}"))
        .await
        .unwrap();
    ws_b.send(Message::text(
        "<Message><Request>Login</Request><DeviceSerialNo>SN-DUP</DeviceSerialNo></Message>",
    ))
    .await
    .unwrap();
    let _ = ws_b.next().await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Session A's transport is force-closed by the balancer as the
    // last-writer-wins side effect of B claiming the same device id: the
    // close handshake yields a Close frame (or an outright error) followed
    // by end of stream.
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws_a.next().await {
                None => return true,
                Some(Err(_)) => return true,
                Some(Ok(Message::Close(_))) => continue,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .expect("session A's socket should close");
    assert!(closed);

    match ipc_roundtrip(ipc_port, IpcRequest::FindDeviceById { device_id: "SN-DUP".to_string() }).await {
        IpcResponse::FindDeviceById { client_id: Some(client_id_b), .. } => {
            assert_ne!(client_id_b, client_id_a);
        }
        other => panic!("unexpected response: {other:?}"),
    }

    match ipc_roundtrip(ipc_port, IpcRequest::GetConnectionInfo { client_id: client_id_a }).await {
        IpcResponse::GetConnectionInfo { device_id, .. } => {
            assert_eq!(device_id, None, "session A's entry was removed from clients_map on teardown");
        }
        other => panic!("unexpected response: {other:?}"),
    }
}

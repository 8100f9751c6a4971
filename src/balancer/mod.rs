//! The load balancer: the hub that owns every device WebSocket connection,
//! assigns each one to a worker, and answers application requests over the
//! IPC socket.
//!
//! `state` bundles the client/device maps with the round-robin cursor and
//! next-client-id counter behind one `tokio::sync::Mutex` — the same single
//! lock the original guards all four with. Every [`OnlineDevice`] then has
//! its own `send` lock for the one thing `state`'s lock must never be held
//! across: writing to that device's socket. Code in this module always
//! acquires `state`'s lock first and drops it before touching a device's
//! `send` lock, never the other way around.

pub mod pending;
pub mod session;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::metrics::Metrics;
use crate::wire::{DeviceInfo, FromWorker, IpcRequest, IpcResponse, ToWorker};
use crate::ClientId;
use session::OnlineDevice;

/// A `SendAndReceive` call waits at most this long for a device reply
/// before giving up.
const SEND_AND_RECEIVE_TIMEOUT: Duration = Duration::from_secs(30);

struct SharedState {
    next_client_id: ClientId,
    worker_cursor: usize,
    clients_map: HashMap<ClientId, Arc<OnlineDevice>>,
    devices_map: HashMap<String, Arc<OnlineDevice>>,
}

pub struct LoadBalancer {
    state: Mutex<SharedState>,
    worker_senders: Vec<mpsc::Sender<ToWorker>>,
    started_at: Instant,
    metrics: Metrics,
}

impl LoadBalancer {
    /// Build a balancer wired to `num_workers` worker tasks, returning the
    /// receiving half of each `ToWorker` channel for
    /// [`WorkerPool::spawn`](crate::worker::pool::WorkerPool::spawn) to consume.
    pub fn new(num_workers: usize) -> (Arc<Self>, Vec<mpsc::Receiver<ToWorker>>) {
        let mut worker_senders = Vec::with_capacity(num_workers);
        let mut worker_receivers = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let (tx, rx) = mpsc::channel(256);
            worker_senders.push(tx);
            worker_receivers.push(rx);
        }

        let balancer = Arc::new(Self {
            state: Mutex::new(SharedState {
                next_client_id: 0,
                worker_cursor: 0,
                clients_map: HashMap::new(),
                devices_map: HashMap::new(),
            }),
            worker_senders,
            started_at: Instant::now(),
            metrics: Metrics::new(),
        });

        (balancer, worker_receivers)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_senders.len()
    }

    /// Handle one accepted device TCP connection end to end: perform the
    /// WebSocket handshake, assign a client id and a worker, relay every
    /// frame to that worker, and clean up on disconnect.
    pub async fn serve_device(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        let (sink, mut source) = ws.split();

        let (client_id, worker_index, online_device) = {
            let mut state = self.state.lock().await;
            let client_id = state.next_client_id;
            let worker_index = state.worker_cursor;
            state.worker_cursor =
                if worker_index + 1 < self.worker_senders.len() { worker_index + 1 } else { 0 };
            state.next_client_id = client_id + 1;

            let online_device = Arc::new(OnlineDevice::new(client_id, worker_index, sink));
            state.clients_map.insert(client_id, online_device.clone());
            (client_id, worker_index, online_device)
        };

        info!(client_id, peer = %peer, "assigned id to websocket connection");
        self.metrics.record_connection_accepted();

        let worker_tx = self.worker_senders[worker_index].clone();
        let _ = worker_tx.send(ToWorker::ClientConnected { client_id }).await;

        loop {
            match source.next().await {
                Some(Ok(Message::Text(text))) => {
                    let payload = text.to_string();
                    if worker_tx.send(ToWorker::MessageFromClient { client_id, payload }).await.is_err() {
                        warn!(client_id, "worker channel closed while relaying message");
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // binary/ping/pong carry no protocol meaning here
                Some(Err(e)) => {
                    warn!(client_id, err = %e, "exception in client");
                    break;
                }
            }
        }

        let _ = worker_tx.send(ToWorker::ClientDisconnected { client_id }).await;

        {
            let mut state = self.state.lock().await;
            state.clients_map.remove(&client_id);
            if let Some(device_id) = online_device.device_id() {
                // A duplicate login may already have swapped this device id
                // over to a newer session before this teardown runs; only
                // remove the mapping if it still points back at us, so the
                // winner of the race is never evicted by the loser's cleanup.
                let still_ours = state
                    .devices_map
                    .get(&device_id)
                    .is_some_and(|d| d.client_id == client_id);
                if still_ours {
                    state.devices_map.remove(&device_id);
                }
            }
        }

        {
            let mut guard = online_device.send.lock().await;
            guard.closed = true;
            for responder in guard.pending.drain() {
                let _ = responder.send(Err("Connection to the device was lost.".to_string()));
            }
        }

        info!(client_id, "removed client");
        Ok(())
    }

    /// Pump `FromWorker` messages for one worker into [`Self::process_message_from_worker`]
    /// until that worker's channel closes.
    pub async fn receive_messages_from_worker(&self, worker_index: usize, mut inbox: mpsc::Receiver<FromWorker>) {
        while let Some(msg) = inbox.recv().await {
            self.metrics.record_worker_message();
            self.process_message_from_worker(worker_index, msg).await;
        }
    }

    async fn process_message_from_worker(&self, _worker_index: usize, msg: FromWorker) {
        match msg {
            FromWorker::AssignDeviceId { client_id, device_id, attribs } => {
                self.assign_device_id(client_id, device_id, attribs).await;
            }
            FromWorker::SendMessageToClient { client_id, payload } => {
                self.send_message_to_client(client_id, payload).await;
            }
            FromWorker::ResponseFromDevice { client_id, payload } => {
                self.response_from_device(client_id, payload).await;
            }
        }
    }

    async fn assign_device_id(&self, client_id: ClientId, device_id: String, attribs: HashMap<String, String>) {
        let (online_device, bumped) = {
            let mut state = self.state.lock().await;
            let online_device = state.clients_map.get(&client_id).cloned();

            let mut bumped = None;
            if let Some(dev) = &online_device {
                let old_device_id = {
                    let mut meta = dev.meta.lock().expect("device meta mutex poisoned");
                    let old = meta.device_id.take();
                    meta.device_id = Some(device_id.clone());
                    meta.attribs = attribs;
                    old
                };
                if let Some(old) = old_device_id {
                    state.devices_map.remove(&old);
                }
                bumped = state.devices_map.remove(&device_id);
                state.devices_map.insert(device_id.clone(), dev.clone());
            }
            (online_device, bumped)
        };

        if let Some(bumped) = bumped {
            warn!(
                old_client_id = bumped.client_id,
                device_id, "disconnecting old client with the same device id"
            );
            let mut guard = bumped.send.lock().await;
            let _ = guard.sink.close().await;
        }

        match online_device {
            Some(_) => info!(device_id, client_id, "assigned device id to client"),
            None => warn!(device_id, client_id, "failed to assign device id: client not found"),
        }
    }

    async fn send_message_to_client(&self, client_id: ClientId, payload: String) {
        let online_device = { self.state.lock().await.clients_map.get(&client_id).cloned() };
        match online_device {
            Some(dev) => {
                let mut guard = dev.send.lock().await;
                if let Err(e) = guard.sink.send(Message::text(payload)).await {
                    warn!(client_id, err = %e, "exception while sending to client");
                }
            }
            None => warn!(client_id, "failed to send message to client: client not found"),
        }
    }

    async fn response_from_device(&self, client_id: ClientId, payload: String) {
        let online_device = { self.state.lock().await.clients_map.get(&client_id).cloned() };
        let Some(dev) = online_device else { return };

        let responder = {
            let mut guard = dev.send.lock().await;
            guard.pending.pop_front()
        };
        if let Some(responder) = responder {
            let _ = responder.send(Ok(payload));
        }
    }

    /// Dispatch one application IPC request to completion.
    pub async fn process_message_from_application(&self, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::FindDeviceById { device_id } => self.find_device_by_id(&device_id).await,
            IpcRequest::GetAllOnlineDevices => self.get_all_online_devices().await,
            IpcRequest::GetConnectionInfo { client_id } => self.get_connection_info(client_id).await,
            IpcRequest::SendAndReceive { client_id, request } => self.send_and_receive(client_id, request).await,
            IpcRequest::Status => self.status().await,
        }
    }

    async fn find_device_by_id(&self, device_id: &str) -> IpcResponse {
        let dev = { self.state.lock().await.devices_map.get(device_id).cloned() };
        match dev {
            Some(d) => IpcResponse::FindDeviceById { client_id: Some(d.client_id), attribs: Some(d.attribs()) },
            None => IpcResponse::FindDeviceById { client_id: None, attribs: None },
        }
    }

    async fn get_all_online_devices(&self) -> IpcResponse {
        let devices = {
            let state = self.state.lock().await;
            state
                .devices_map
                .iter()
                .map(|(device_id, d)| DeviceInfo {
                    device_id: device_id.clone(),
                    client_id: d.client_id,
                    attribs: d.attribs(),
                })
                .collect()
        };
        IpcResponse::GetAllOnlineDevices { devices }
    }

    async fn get_connection_info(&self, client_id: ClientId) -> IpcResponse {
        let dev = { self.state.lock().await.clients_map.get(&client_id).cloned() };
        match dev {
            Some(d) => IpcResponse::GetConnectionInfo { device_id: d.device_id(), attribs: Some(d.attribs()) },
            None => IpcResponse::GetConnectionInfo { device_id: None, attribs: None },
        }
    }

    async fn send_and_receive(&self, client_id: ClientId, request: String) -> IpcResponse {
        let online_device = { self.state.lock().await.clients_map.get(&client_id).cloned() };
        let Some(online_device) = online_device else {
            return offline_response();
        };

        let (tx, rx) = oneshot::channel();
        let handle = {
            let mut guard = online_device.send.lock().await;
            if guard.closed {
                return offline_response();
            }
            let handle = guard.pending.push_back(tx);
            if let Err(e) = guard.sink.send(Message::text(request)).await {
                guard.pending.remove(handle);
                return IpcResponse::SendAndReceive { success: false, error: Some(e.to_string()), response: None };
            }
            handle
        };

        match timeout(SEND_AND_RECEIVE_TIMEOUT, rx).await {
            Ok(Ok(Ok(payload))) => IpcResponse::SendAndReceive { success: true, error: None, response: Some(payload) },
            Ok(Ok(Err(reason))) => IpcResponse::SendAndReceive { success: false, error: Some(reason), response: None },
            Ok(Err(_)) => {
                let mut guard = online_device.send.lock().await;
                guard.pending.remove(handle);
                offline_response()
            }
            Err(_) => {
                let mut guard = online_device.send.lock().await;
                guard.pending.remove(handle);
                IpcResponse::SendAndReceive { success: false, error: Some("Timed out".to_string()), response: None }
            }
        }
    }

    async fn status(&self) -> IpcResponse {
        let state = self.state.lock().await;
        IpcResponse::Status {
            uptime_secs: self.started_at.elapsed().as_secs(),
            connected_devices: state.clients_map.len() as u64,
            logged_in_devices: state.devices_map.len() as u64,
            worker_count: self.worker_senders.len(),
            messages_processed: self.metrics.worker_messages_processed(),
        }
    }
}

fn offline_response() -> IpcResponse {
    IpcResponse::SendAndReceive { success: false, error: Some("Device is offline".to_string()), response: None }
}

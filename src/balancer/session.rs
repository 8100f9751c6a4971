//! Per-connection device session state held by the [`crate::balancer`].

use std::collections::HashMap;
use std::sync::Mutex as SyncMutex;

use futures_util::stream::SplitSink;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::pending::PendingList;
use crate::ClientId;

pub type DeviceSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Fields the balancer only ever touches while already holding its own
/// `lock` — `device_id` and `attribs` are assigned together in
/// `AssignDeviceId` and read together by `FindDeviceById`/`GetConnectionInfo`,
/// all under that same lock, so a plain blocking mutex here is never
/// contended across an `.await`.
#[derive(Default)]
pub struct DeviceMeta {
    pub device_id: Option<String>,
    pub attribs: HashMap<String, String>,
}

/// Everything that must change atomically with respect to a frame being
/// written to the device's socket: the socket itself, whether the session
/// has been torn down, and the FIFO of requests awaiting a reply. Mirrors
/// the set of state the original guards with a single `send_lock`.
pub struct SendGuarded {
    pub sink: DeviceSink,
    pub closed: bool,
    pub pending: PendingList,
}

pub struct OnlineDevice {
    pub client_id: ClientId,
    pub worker_index: usize,
    pub meta: SyncMutex<DeviceMeta>,
    pub send: Mutex<SendGuarded>,
}

impl OnlineDevice {
    pub fn new(client_id: ClientId, worker_index: usize, sink: DeviceSink) -> Self {
        Self {
            client_id,
            worker_index,
            meta: SyncMutex::new(DeviceMeta::default()),
            send: Mutex::new(SendGuarded { sink, closed: false, pending: PendingList::new() }),
        }
    }

    pub fn device_id(&self) -> Option<String> {
        self.meta.lock().expect("device meta mutex poisoned").device_id.clone()
    }

    pub fn attribs(&self) -> HashMap<String, String> {
        self.meta.lock().expect("device meta mutex poisoned").attribs.clone()
    }
}

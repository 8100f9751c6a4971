//! Control-protocol message types shared between the load balancer and workers,
//! and the opcode surface exposed to application clients over the IPC socket.
//!
//! The original design numbered these as integer command codes sent down an
//! OS pipe (`CLIENT_CONNECTED = 1`, `ASSIGN_DEVICE_ID = 101`, ...). Workers
//! here are in-process tasks (see [`crate::worker`]), so the balancer/worker
//! control channel is a typed `tokio::sync::mpsc` channel instead of a pipe —
//! the enum variants below replace the numeric codes one-for-one.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ClientId;

/// Messages sent from the load balancer down to a worker.
#[derive(Debug)]
pub enum ToWorker {
    /// A new device connection was accepted and assigned to this worker.
    ClientConnected { client_id: ClientId },
    /// A raw WebSocket text frame arrived from the device.
    MessageFromClient { client_id: ClientId, payload: String },
    /// The device connection was torn down.
    ClientDisconnected { client_id: ClientId },
}

/// Messages sent from a worker back up to the load balancer.
#[derive(Debug)]
pub enum FromWorker {
    /// The device completed login; give it a stable device identity.
    AssignDeviceId {
        client_id: ClientId,
        device_id: String,
        attribs: HashMap<String, String>,
    },
    /// Send a frame to the device's WebSocket verbatim.
    SendMessageToClient { client_id: ClientId, payload: String },
    /// A frame that was not itself a request/event — treat it as the reply
    /// to whatever application request is currently outstanding for this device.
    ResponseFromDevice { client_id: ClientId, payload: String },
}

/// Opcodes accepted on the application-facing IPC socket.
///
/// Encoded as a tagged JSON object (see [`crate::ipc::codec`]) rather than
/// a numeric code, since the IPC wire format here is JSON rather than a
/// pickled Python tuple.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum IpcRequest {
    FindDeviceById { device_id: String },
    GetAllOnlineDevices,
    GetConnectionInfo { client_id: ClientId },
    SendAndReceive { client_id: ClientId, request: String },
    /// Not in the original opcode set; surfaces the ambient metrics/uptime
    /// counters described in SPEC_FULL.md's AMBIENT STACK section.
    Status,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub client_id: ClientId,
    pub attribs: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum IpcResponse {
    FindDeviceById {
        client_id: Option<ClientId>,
        attribs: Option<HashMap<String, String>>,
    },
    GetAllOnlineDevices {
        devices: Vec<DeviceInfo>,
    },
    GetConnectionInfo {
        device_id: Option<String>,
        attribs: Option<HashMap<String, String>>,
    },
    SendAndReceive {
        success: bool,
        error: Option<String>,
        response: Option<String>,
    },
    Status {
        uptime_secs: u64,
        connected_devices: u64,
        logged_in_devices: u64,
        worker_count: usize,
        messages_processed: u64,
    },
}

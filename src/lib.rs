pub mod balancer;
pub mod config;
pub mod doctor;
pub mod ipc;
pub mod metrics;
pub mod observability;
pub mod webapp;
pub mod wire;
pub mod worker;
pub mod xml;

/// Identifies one WebSocket connection for the lifetime of that connection.
/// Assigned sequentially by the balancer; distinct from a device's stable
/// `device_id`, which only exists once a device has logged in.
pub type ClientId = u64;

//! Worker tasks: the half of the broker that understands device-frame XML
//! and talks to the external web application.
//!
//! The original load-balances incoming device traffic across OS worker
//! *processes* connected by pipes, so that one slow webapp round-trip never
//! blocks any other device's frames. A Rust worker doesn't need a process —
//! [`WorkerPool`](pool::WorkerPool) spawns one `tokio::spawn` task per
//! worker instead, each with its own [`ToWorker`]/[`FromWorker`] channel
//! pair, and the `reqwest` calls inside already yield to the runtime while
//! in flight. Routing is otherwise identical: one worker is sticky per
//! device connection for its whole lifetime (see [`crate::balancer`]).

pub mod pool;

use std::collections::HashMap;
use std::collections::HashSet;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::webapp::WebAppClient;
use crate::wire::{FromWorker, ToWorker};
use crate::xml::{self, Element};
use crate::ClientId;

pub struct Worker {
    webapp: WebAppClient,
    device_logged_in: HashSet<ClientId>,
}

impl Worker {
    pub fn new(webapp: WebAppClient) -> Self {
        Self { webapp, device_logged_in: HashSet::new() }
    }

    pub async fn run(mut self, mut inbox: mpsc::Receiver<ToWorker>, outbox: mpsc::Sender<FromWorker>) {
        while let Some(msg) = inbox.recv().await {
            self.process_command(msg, &outbox).await;
        }
    }

    async fn process_command(&mut self, msg: ToWorker, outbox: &mpsc::Sender<FromWorker>) {
        match msg {
            ToWorker::ClientConnected { .. } => {}
            ToWorker::ClientDisconnected { client_id } => {
                self.device_logged_in.remove(&client_id);
            }
            ToWorker::MessageFromClient { client_id, payload } => {
                if let Err(e) = self.handle_frame(client_id, &payload, outbox).await {
                    warn!(client_id, err = %e, "exception while handling device frame");
                }
            }
        }
    }

    async fn handle_frame(
        &mut self,
        client_id: ClientId,
        payload: &str,
        outbox: &mpsc::Sender<FromWorker>,
    ) -> anyhow::Result<()> {
        let parsed = xml::parse(payload)?;

        if let Some(request) = parsed.child_text(xml::TAG_REQUEST) {
            match request.as_str() {
                "Register" => self.process_register(client_id, &parsed, outbox).await?,
                "Login" => self.process_login(client_id, &parsed, outbox).await?,
                _ => {}
            }
        } else if let Some(event) = parsed.child_text(xml::TAG_EVENT) {
            if self.device_logged_in.contains(&client_id) {
                match event.as_str() {
                    "AdminLog" | "AdminLog_v2" | "TimeLog" | "TimeLog_v2" => {
                        self.process_log(client_id, &event, &parsed, outbox).await?;
                    }
                    "KeepAlive" => self.process_keepalive(client_id, outbox).await?,
                    _ => {}
                }
            }
        } else {
            // Not a request or event frame — treat it as the reply to an
            // outstanding application `SendAndReceive` call.
            let _ = outbox
                .send(FromWorker::ResponseFromDevice { client_id, payload: payload.to_string() })
                .await;
        }

        Ok(())
    }

    async fn process_register(
        &self,
        client_id: ClientId,
        parsed: &Element,
        outbox: &mpsc::Sender<FromWorker>,
    ) -> anyhow::Result<()> {
        let Some(sn) = parsed.child_text(xml::TAG_DEVICE_SERIAL_NO) else {
            return Ok(());
        };
        let terminal_type = parsed.child_text("TerminalType");
        let product_name = parsed.child_text("ProductName");
        let cloud_id = parsed.child_text("CloudId");

        let Some(outcome) = self
            .webapp
            .check_registration(&sn, terminal_type.as_deref(), product_name.as_deref(), cloud_id.as_deref())
            .await
        else {
            // Webapp unreachable or answered with something that isn't
            // JSON — swallow, same as any other failed message dispatch.
            return Ok(());
        };

        let result = if outcome.succeeded { xml::RESULT_OK } else { xml::RESULT_FAIL };
        let payload = xml::build_message(&[
            (xml::TAG_RESPONSE, Some("Register")),
            (xml::TAG_DEVICE_SERIAL_NO, Some(sn.as_str())),
            (xml::TAG_TOKEN, outcome.token.as_deref()),
            (xml::TAG_RESULT, Some(result)),
        ])?;

        let _ = outbox.send(FromWorker::SendMessageToClient { client_id, payload }).await;
        Ok(())
    }

    async fn process_login(
        &mut self,
        client_id: ClientId,
        parsed: &Element,
        outbox: &mpsc::Sender<FromWorker>,
    ) -> anyhow::Result<()> {
        let sn = parsed.child_text(xml::TAG_DEVICE_SERIAL_NO);
        let token = parsed.child_text(xml::TAG_TOKEN);
        let terminal_type = parsed.child_text("TerminalType");
        let product_name = parsed.child_text("ProductName");

        let Some(outcome) = self.webapp.check_login(sn.as_deref(), token.as_deref()).await else {
            // Webapp unreachable — swallow, same as any other failed
            // message dispatch; the device may time out on its own.
            return Ok(());
        };

        let payload = xml::build_message(&[
            (xml::TAG_RESPONSE, Some("Login")),
            (xml::TAG_DEVICE_SERIAL_NO, sn.as_deref()),
            (xml::TAG_RESULT, Some(outcome.result.as_str())),
        ])?;
        let _ = outbox.send(FromWorker::SendMessageToClient { client_id, payload }).await;

        if outcome.succeeded {
            // A device identity requires a serial number; a login that
            // somehow succeeds without one has nothing to key the device
            // map on, so it's logged in but never gets a stable device id.
            if let Some(device_id) = sn {
                self.device_logged_in.insert(client_id);

                let mut attribs = HashMap::new();
                if let Some(tt) = terminal_type {
                    attribs.insert("terminal_type".to_string(), tt);
                }
                if let Some(pn) = product_name {
                    attribs.insert("product_name".to_string(), pn);
                }

                let _ = outbox
                    .send(FromWorker::AssignDeviceId { client_id, device_id, attribs })
                    .await;
            }
        }

        Ok(())
    }

    async fn process_log(
        &self,
        client_id: ClientId,
        log_type: &str,
        parsed: &Element,
        outbox: &mpsc::Sender<FromWorker>,
    ) -> anyhow::Result<()> {
        let mut data = serde_json::Map::new();
        for child in &parsed.children {
            data.insert(child.tag.clone(), child.text.clone().map(Value::String).unwrap_or(Value::Null));
        }

        let succeeded = self.webapp.upload_log(log_type, &Value::Object(data)).await;

        let trans_id = parsed.child_text(xml::TAG_TRANS_ID);
        let mut fields = vec![
            (xml::TAG_RESPONSE, Some(log_type)),
            (xml::TAG_RESULT, Some(if succeeded { xml::RESULT_OK } else { xml::RESULT_FAIL })),
        ];
        if let Some(ref t) = trans_id {
            fields.push((xml::TAG_TRANS_ID, Some(t.as_str())));
        }

        let payload = xml::build_message(&fields)?;
        let _ = outbox.send(FromWorker::SendMessageToClient { client_id, payload }).await;
        Ok(())
    }

    async fn process_keepalive(&self, client_id: ClientId, outbox: &mpsc::Sender<FromWorker>) -> anyhow::Result<()> {
        let payload = xml::build_message(&[
            (xml::TAG_RESPONSE, Some("KeepAlive")),
            (xml::TAG_RESULT, Some(xml::RESULT_OK)),
        ])?;
        let _ = outbox.send(FromWorker::SendMessageToClient { client_id, payload }).await;
        Ok(())
    }
}

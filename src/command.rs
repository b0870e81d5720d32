use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::{CallId, EventBus, Result, SessionError, SipMessage, SipMethod, Subscription};

pub const JSON_CONTENT_TYPE: &str = "application/json;charset=utf-8";

// Commands carried over INFO
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallCommand {
    CallPark,
    StartCallRecord,
    StopCallRecord,
}

impl CallCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallCommand::CallPark => "callpark",
            CallCommand::StartCallRecord => "startcallrecord",
            CallCommand::StopCallRecord => "stopcallrecord",
        }
    }
}

impl fmt::Display for CallCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{"request":{"reqid":N,"command":"..."}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub request: CommandRequestBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequestBody {
    pub reqid: u64,
    pub command: CallCommand,
}

impl CommandRequest {
    pub fn new(reqid: u64, command: CallCommand) -> Self {
        CommandRequest {
            request: CommandRequestBody { reqid, command },
        }
    }

    pub fn to_body(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// `{"response":{"reqid":N,"command":"...","result":{...}}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub response: CommandResponseBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponseBody {
    pub reqid: u64,
    // Kept as text so unknown commands from the server still parse
    pub command: String,
    #[serde(default)]
    pub result: serde_json::Value,
}

impl CommandResponseBody {
    pub fn result_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.result.clone())?)
    }
}

/// Outcome of a park request. A non-zero `code` is a normal refusal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallParkResult {
    pub code: i64,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "park extension", default)]
    pub park_extension: String,
}

impl CallParkResult {
    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

type PendingTable = Arc<Mutex<HashMap<u64, oneshot::Sender<CommandResponseBody>>>>;

/// Request ids and the table of commands awaiting a response
pub struct CommandChannel {
    call_id: CallId,
    next_reqid: AtomicU64,
    pending: PendingTable,
}

impl CommandChannel {
    pub fn new(call_id: CallId) -> Self {
        CommandChannel {
            call_id,
            next_reqid: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Strictly increasing per session, never reused
    pub fn next_reqid(&self) -> u64 {
        self.next_reqid.fetch_add(1, Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Register interest in the response to `reqid` before the request goes out.
    pub fn watch(&self, bus: &Arc<EventBus>, reqid: u64, command: CallCommand) -> PendingCommand {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(reqid, tx);

        let table = self.pending.clone();
        let call_id = self.call_id.clone();
        let subscription = bus.subscribe::<SipMessage, _>(move |message| {
            let Some(response) = match_response(message, &call_id, reqid, command) else {
                return;
            };
            if let Some(tx) = table.lock().remove(&reqid) {
                let _ = tx.send(response);
            }
        });

        PendingCommand {
            reqid,
            command,
            rx,
            table: self.pending.clone(),
            _subscription: subscription,
        }
    }

    /// Drop every waiter; their `wait` resolves with an error.
    pub fn cancel_all(&self) {
        self.pending.lock().clear();
    }
}

fn match_response(
    message: &SipMessage,
    call_id: &CallId,
    reqid: u64,
    command: CallCommand,
) -> Option<CommandResponseBody> {
    if message.method() != Some(SipMethod::Info) {
        return None;
    }
    if message.get_call_id().map(String::as_str) != Some(call_id.as_str()) {
        return None;
    }
    let parsed: CommandResponse = serde_json::from_str(message.body_str()).ok()?;
    let body = parsed.response;
    (body.reqid == reqid && body.command == command.as_str()).then_some(body)
}

/// A command awaiting its response. Dropping it releases the table entry
/// and the inbound handler.
pub struct PendingCommand {
    reqid: u64,
    command: CallCommand,
    rx: oneshot::Receiver<CommandResponseBody>,
    table: PendingTable,
    _subscription: Subscription,
}

impl PendingCommand {
    pub fn reqid(&self) -> u64 {
        self.reqid
    }

    pub async fn wait(mut self, deadline: Option<Duration>) -> Result<CommandResponseBody> {
        let command = self.command;
        let received = match deadline {
            Some(after) => tokio::time::timeout(after, &mut self.rx)
                .await
                .map_err(|_| SessionError::Timeout {
                    operation: command.as_str(),
                    after,
                })?,
            None => (&mut self.rx).await,
        };

        received.map_err(|_| SessionError::InvalidState(format!("{} command cancelled", command)))
    }
}

impl Drop for PendingCommand {
    fn drop(&mut self) {
        self.table.lock().remove(&self.reqid);
    }
}

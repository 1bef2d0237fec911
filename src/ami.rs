//! The AMI side: a client connection to the asterisk manager interface.
//!
//! The manager socket carries two interleaved kinds of `Key: Value` blocks,
//! each terminated by a blank line: responses to the actions we send, and
//! asynchronous events. Actions are strictly serialized on the wire — the
//! next queued action is transmitted only after the in-flight one has been
//! answered — so responses correlate to actions in send order. Every action
//! is additionally stamped with an `ActionID`, which is preferred for
//! correlation when the PBX echoes it back.
//!
//! ```ignore
//! let mut manager = fastami::ami::connect("127.0.0.1:5038", "admin", "secret", true).await?;
//! manager.ping().await?;
//! while let Some(event) = manager.next_event().await {
//!     println!("{:?}", event.get("event"));
//! }
//! ```
use std::collections::VecDeque;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::framer::LineFramer;

/// Contains all the ways in which talking to the manager interface can fail.
#[derive(Debug)]
pub enum AMIError {
    /// The login action was answered with `Response: Error`.
    LoginFailed(String),
    /// An action was answered with its error condition.
    Failure(String),
    /// The connection closed while actions were outstanding.
    ConnectionTerminated,
    /// Unable to open the manager connection.
    CannotConnect(tokio::io::Error),
}
impl std::fmt::Display for AMIError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::LoginFailed(x) => {
                write!(f, "Manager login failed: {x}")
            }
            Self::Failure(x) => {
                write!(f, "Manager action failed: {x}")
            }
            Self::ConnectionTerminated => {
                write!(f, "Manager connection terminated")
            }
            Self::CannotConnect(x) => {
                write!(f, "Unable to open the manager connection: {x}")
            }
        }
    }
}
impl std::error::Error for AMIError {}

/// One `Key: Value` block from the manager.
///
/// Keys are stored lowercased in wire order, values verbatim. Both responses
/// and events arrive in this shape; `get("event")` resp. `get("response")`
/// identifies them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AMIMessage {
    fields: Vec<(String, String)>,
}
impl AMIMessage {
    fn push(&mut self, key: String, value: String) {
        self.fields.push((key, value));
    }

    /// The value for the given (lowercase) key, first occurrence.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// An action that can be sent over the manager connection.
///
/// Implementing this trait is the way to extend the built-in action set: the
/// session takes care of the wire form (`Action:` header, `ActionID` stamp,
/// the fields, the terminating blank line) and of correlating the response.
pub trait AMIAction: Send + std::fmt::Debug {
    /// The action name as transmitted in the `Action:` header.
    fn name(&self) -> &'static str;

    /// Additional `Key: Value` headers for this action.
    fn fields(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    /// The `Response:` value that marks this action as failed.
    fn error_condition(&self) -> &'static str {
        "Error"
    }

    /// Map the error response message to the action-specific failure.
    fn failure(&self, message: String) -> AMIError {
        AMIError::Failure(message)
    }
}

/// The wire form of an action: a CRLF header block ended by an empty line,
/// which triggers processing on the server.
fn serialize(action: &dyn AMIAction, action_id: u64) -> String {
    let mut block = format!("Action: {}\r\nActionID: {}\r\n", action.name(), action_id);
    for (key, value) in action.fields() {
        block.push_str(key);
        block.push_str(": ");
        block.push_str(&value);
        block.push_str("\r\n");
    }
    block.push_str("\r\n");
    block
}

/// Authenticate to the manager. `events: false` asks the PBX not to send
/// unsolicited events on this connection.
#[derive(Debug)]
pub struct Login {
    pub username: String,
    pub secret: String,
    pub events: bool,
}
impl AMIAction for Login {
    fn name(&self) -> &'static str {
        "Login"
    }

    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Username", self.username.clone()),
            ("Secret", self.secret.clone()),
            ("Events", if self.events { "on" } else { "off" }.to_owned()),
        ]
    }

    fn failure(&self, message: String) -> AMIError {
        AMIError::LoginFailed(message)
    }
}

/// Keepalive. The PBX answers with `Response: Pong`.
#[derive(Debug)]
pub struct Ping;
impl AMIAction for Ping {
    fn name(&self) -> &'static str {
        "Ping"
    }
}

/// Request the PBX to hang up a channel after the given number of seconds,
/// effectively ending the active call.
#[derive(Debug)]
pub struct AbsoluteTimeout {
    /// Which channel to hang up, e.g. `SIP/123-1c20`.
    pub channel: String,
    /// Seconds until the hangup.
    pub timeout: u32,
}
impl AMIAction for AbsoluteTimeout {
    fn name(&self) -> &'static str {
        "AbsoluteTimeout"
    }

    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Channel", self.channel.clone()),
            ("Timeout", self.timeout.to_string()),
        ]
    }
}

/// Change the file name of a recording occurring on a channel (the two audio
/// files `filename-in`/`filename-out`).
#[derive(Debug)]
pub struct ChangeMonitor {
    pub channel: String,
    pub file: String,
}
impl AMIAction for ChangeMonitor {
    fn name(&self) -> &'static str {
        "ChangeMonitor"
    }

    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Channel", self.channel.clone()),
            ("File", self.file.clone()),
        ]
    }
}

/// An action waiting for its response block.
struct PendingAction {
    action: Box<dyn AMIAction>,
    action_id: u64,
    reply: oneshot::Sender<Result<AMIMessage, AMIError>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitBanner,
    Streaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageKind {
    Response,
    Event,
}

/// Client-side state machine for one manager connection.
///
/// Fed one record at a time; returns wire blocks to transmit. The pump task
/// owns it together with the transport, so all mutation happens from one
/// place.
struct AMISession {
    phase: Phase,
    /// Actions accepted but not yet on the wire.
    queued: VecDeque<PendingAction>,
    /// Actions on the wire, oldest first.
    in_flight: VecDeque<PendingAction>,
    partial: AMIMessage,
    kind: Option<MessageKind>,
    events: mpsc::UnboundedSender<AMIMessage>,
    next_action_id: u64,
}
impl AMISession {
    fn new(events: mpsc::UnboundedSender<AMIMessage>) -> AMISession {
        AMISession {
            phase: Phase::AwaitBanner,
            queued: VecDeque::new(),
            in_flight: VecDeque::new(),
            partial: AMIMessage::default(),
            kind: None,
            events,
            next_action_id: 0,
        }
    }

    /// Accept an action. Returns its wire block if the line is idle and past
    /// the banner; otherwise the action stays queued.
    fn enqueue(
        &mut self,
        action: Box<dyn AMIAction>,
        reply: oneshot::Sender<Result<AMIMessage, AMIError>>,
    ) -> Option<String> {
        self.next_action_id += 1;
        self.queued.push_back(PendingAction {
            action,
            action_id: self.next_action_id,
            reply,
        });
        self.maybe_transmit()
    }

    fn maybe_transmit(&mut self) -> Option<String> {
        if self.phase != Phase::Streaming || !self.in_flight.is_empty() {
            return None;
        }
        let pending = self.queued.pop_front()?;
        let block = serialize(pending.action.as_ref(), pending.action_id);
        trace!(action = pending.action.name(), "transmit action");
        self.in_flight.push_back(pending);
        Some(block)
    }

    /// Handle one record from the framer. Returns the next wire block to
    /// transmit, if this record freed the line.
    fn record_received(&mut self, record: &str) -> Option<String> {
        if self.phase == Phase::AwaitBanner {
            if record.starts_with("Asterisk Call Manager") {
                debug!(banner = record, "manager banner received");
                self.phase = Phase::Streaming;
                return self.maybe_transmit();
            }
            warn!(record, "unexpected line before the manager banner");
            return None;
        }
        if record.trim().is_empty() {
            return self.finalize_message();
        }
        match record.split_once(": ") {
            Some((key, value)) => {
                let key = key.to_ascii_lowercase();
                if self.kind.is_none() {
                    // the first key decides what this block is
                    self.kind = Some(if key == "event" {
                        MessageKind::Event
                    } else {
                        MessageKind::Response
                    });
                }
                self.partial.push(key, value.to_owned());
            }
            None => {
                warn!(record, "unparsable manager line");
            }
        }
        None
    }

    /// A blank record: settle the accumulated block.
    fn finalize_message(&mut self) -> Option<String> {
        let message = std::mem::take(&mut self.partial);
        match self.kind.take() {
            None => None,
            Some(MessageKind::Event) => {
                let _ = self.events.send(message);
                None
            }
            Some(MessageKind::Response) => {
                match self.matching_response(&message) {
                    None => {
                        warn!("response received without pending action");
                    }
                    Some(pending) => {
                        let settled =
                            if message.get("response") == Some(pending.action.error_condition()) {
                                let text = message.get("message").unwrap_or("").to_owned();
                                Err(pending.action.failure(text))
                            } else {
                                Ok(message)
                            };
                        let _ = pending.reply.send(settled);
                    }
                }
                self.maybe_transmit()
            }
        }
    }

    /// ActionID overlay with a FIFO fallback when the field is absent or
    /// unknown.
    fn matching_response(&mut self, message: &AMIMessage) -> Option<PendingAction> {
        if let Some(id) = message.get("actionid") {
            if let Some(index) = self
                .in_flight
                .iter()
                .position(|p| p.action_id.to_string() == id)
            {
                return self.in_flight.remove(index);
            }
        }
        self.in_flight.pop_front()
    }

    /// Settle everything outstanding as terminated.
    fn connection_lost(&mut self) {
        for pending in self.in_flight.drain(..).chain(self.queued.drain(..)) {
            let _ = pending.reply.send(Err(AMIError::ConnectionTerminated));
        }
    }
}

enum ClientMessage {
    Action {
        action: Box<dyn AMIAction>,
        reply: oneshot::Sender<Result<AMIMessage, AMIError>>,
    },
}

/// Per-connection pump: owns the transport and the session state machine.
async fn drive_manager<S>(
    mut stream: S,
    mut control: mpsc::UnboundedReceiver<ClientMessage>,
    mut session: AMISession,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framer = LineFramer::crlf();
    let mut buf = [0_u8; 2048];
    loop {
        tokio::select! {
            message = control.recv() => match message {
                Some(ClientMessage::Action { action, reply }) => {
                    if let Some(block) = session.enqueue(action, reply) {
                        if stream.write_all(block.as_bytes()).await.is_err() {
                            session.connection_lost();
                            return;
                        }
                    }
                }
                None => break,
            },
            read = stream.read(&mut buf) => match read {
                Ok(0) | Err(_) => {
                    debug!("manager connection terminated");
                    session.connection_lost();
                    return;
                }
                Ok(n) => match framer.push(&buf[..n]) {
                    Ok(records) => {
                        for record in records {
                            if let Some(block) = session.record_received(&record) {
                                if stream.write_all(block.as_bytes()).await.is_err() {
                                    session.connection_lost();
                                    return;
                                }
                            }
                        }
                    }
                    Err(error) => {
                        warn!(%error, "unparsable bytes from the manager");
                        session.connection_lost();
                        return;
                    }
                },
            },
        }
    }
    // the handle was dropped
    session.connection_lost();
    let _ = stream.shutdown().await;
}

/// Handle to a manager connection.
///
/// Actions settle in the order they are enqueued; events are drained with
/// [`next_event`](Self::next_event) by the single owner of this handle.
#[derive(Debug)]
pub struct AMIClient {
    control: mpsc::UnboundedSender<ClientMessage>,
    events: mpsc::UnboundedReceiver<AMIMessage>,
}
impl AMIClient {
    /// Send any [`AMIAction`] and wait for its response block.
    pub async fn send_action<A>(&self, action: A) -> Result<AMIMessage, AMIError>
    where
        A: AMIAction + 'static,
    {
        let (reply, settled) = oneshot::channel();
        self.control
            .send(ClientMessage::Action {
                action: Box::new(action),
                reply,
            })
            .map_err(|_| AMIError::ConnectionTerminated)?;
        settled.await.map_err(|_| AMIError::ConnectionTerminated)?
    }

    /// Ping the PBX.
    pub async fn ping(&self) -> Result<AMIMessage, AMIError> {
        self.send_action(Ping).await
    }

    /// Hang up `channel` after `timeout` seconds.
    pub async fn absolute_timeout(
        &self,
        channel: &str,
        timeout: u32,
    ) -> Result<AMIMessage, AMIError> {
        self.send_action(AbsoluteTimeout {
            channel: channel.to_owned(),
            timeout,
        })
        .await
    }

    /// Change the recording file name of `channel` to `file`.
    pub async fn change_monitor(&self, channel: &str, file: &str) -> Result<AMIMessage, AMIError> {
        self.send_action(ChangeMonitor {
            channel: channel.to_owned(),
            file: file.to_owned(),
        })
        .await
    }

    /// The next queued event; `None` once the connection is gone and the
    /// queue is drained.
    pub async fn next_event(&mut self) -> Option<AMIMessage> {
        self.events.recv().await
    }

    /// The next queued event if one is already there.
    pub fn try_next_event(&mut self) -> Option<AMIMessage> {
        self.events.try_recv().ok()
    }
}

/// Build a client over an already-open stream, with the login action queued
/// for transmission on banner receipt.
fn start_client<S>(
    stream: S,
    username: &str,
    secret: &str,
    events: bool,
) -> (
    AMIClient,
    oneshot::Receiver<Result<AMIMessage, AMIError>>,
)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (control, actions) = mpsc::unbounded_channel();
    let (event_sender, event_receiver) = mpsc::unbounded_channel();
    let mut session = AMISession::new(event_sender);
    let (reply, settled) = oneshot::channel();
    let transmitted = session.enqueue(
        Box::new(Login {
            username: username.to_owned(),
            secret: secret.to_owned(),
            events,
        }),
        reply,
    );
    debug_assert!(transmitted.is_none(), "nothing transmits before the banner");
    tokio::spawn(drive_manager(stream, actions, session));
    (
        AMIClient {
            control,
            events: event_receiver,
        },
        settled,
    )
}

/// Open a manager connection and log in.
///
/// The login action is enqueued before the connection starts streaming and is
/// transmitted as soon as the `Asterisk Call Manager/<v>` banner arrives; the
/// returned future resolves once its response settles.
///
/// # Errors
/// [`AMIError::LoginFailed`] when the PBX rejects the credentials,
/// [`AMIError::CannotConnect`] when the TCP connection cannot be opened.
pub async fn connect<A>(
    addr: A,
    username: &str,
    secret: &str,
    events: bool,
) -> Result<AMIClient, AMIError>
where
    A: ToSocketAddrs,
{
    let stream = TcpStream::connect(addr)
        .await
        .map_err(AMIError::CannotConnect)?;
    let (client, login) = start_client(stream, username, secret, events);
    login
        .await
        .map_err(|_| AMIError::ConnectionTerminated)??;
    Ok(client)
}

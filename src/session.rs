use std::collections::HashMap;
use std::sync::Arc;

use futures::Stream;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::demux::Demux;
use crate::error::PayloadError;
use crate::id::IdAllocator;
use crate::invocation::{Handler, InvocationTask};
use crate::messages::{
    CallOptions, CancelOptions, ClientRoles, Dict, ErrorDetails, ErrorType, HelloDetails,
    List, Message, PublishOptions, Reason, RegisterOptions, SubscribeOptions, URI,
};
use crate::transport::Transport;
use crate::{Auth, ChallengeResponse, Error, ErrorKind, Id, OperationError};

/// A call result or event payload, once translated out of its wire frame.
pub type Payload = Result<(Option<List>, Option<Dict>), PayloadError>;

/// The publication id a successful `publish` resolves to.
pub type PublicationId = Id;

/// Commands sent from `Channel`/stream handles into the driver task. The
/// driver is the sole owner of the transport and every piece of protocol
/// state; everything else reaches it only through this channel.
enum Command {
    Call {
        uri: URI,
        args: Option<List>,
        kwargs: Option<Dict>,
        reply: oneshot::Sender<(Id, UnboundedReceiverStream<Payload>)>,
    },
    CancelCall {
        request_id: Id,
    },
    Register {
        uri: URI,
        handler: Handler,
        reply: oneshot::Sender<Result<Id, OperationError>>,
    },
    Unregister {
        registration_id: Id,
    },
    Publish {
        uri: URI,
        args: Option<List>,
        kwargs: Option<Dict>,
        reply: oneshot::Sender<Result<PublicationId, OperationError>>,
    },
    Subscribe {
        uri: URI,
        reply: oneshot::Sender<Result<(Id, UnboundedReceiverStream<Payload>), OperationError>>,
    },
    Unsubscribe {
        subscription_id: Id,
    },
    Close {
        reply: oneshot::Sender<Result<(), Error>>,
    },
}

/// A connected WAMP session's public surface: call, register, publish,
/// subscribe, and a graceful close. Cheap to clone; every clone talks to the
/// same driver task.
#[derive(Clone)]
pub struct Channel {
    commands: mpsc::UnboundedSender<Command>,
}

/// Connects to `url`, negotiates the WebSocket subprotocol, and runs the
/// HELLO/WELCOME (or CHALLENGE/AUTHENTICATE) handshake for `realm`.
pub async fn connect(url: &str, realm: &str, auth: Option<Auth>) -> Result<Channel, Error> {
    let transport = crate::transport::connect(url).await?;
    connect_with_transport(transport, realm, auth).await
}

/// Runs the HELLO/WELCOME (or CHALLENGE/AUTHENTICATE) handshake for `realm`
/// over an already-constructed `transport`, then hands the connection off to
/// the driver task. This is the factory seam §4.1/§6 call out ("a secondary
/// factory injects an arbitrary underlying socket constructor") — `connect`
/// is just this function composed with the WebSocket transport's own
/// factory, and it's the seam tests plug `MockTransport` into.
pub async fn connect_with_transport(
    mut transport: Box<dyn Transport>,
    realm: &str,
    auth: Option<Auth>,
) -> Result<Channel, Error> {
    let session_id = handshake(transport.as_mut(), realm, &auth).await?;
    info!("session {} established on realm {}", session_id, realm);

    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    tokio::spawn(Driver::new(transport, commands_rx).run());
    Ok(Channel { commands: commands_tx })
}

async fn send_message(transport: &mut dyn Transport, message: &Message) -> Result<(), Error> {
    let text = serde_json::to_string(message)?;
    transport.send(text).await
}

async fn recv_message(transport: &mut dyn Transport) -> Result<Message, Error> {
    loop {
        let text = match transport.recv().await {
            Some(Ok(text)) => text,
            Some(Err(e)) => return Err(e),
            None => return Err(Error::new(ErrorKind::ConnectionLost)),
        };
        match serde_json::from_str::<RawFrame>(&text) {
            Ok(RawFrame::Known(message)) => return Ok(message),
            Ok(RawFrame::Unknown(tag)) => {
                warn!("dropping inbound frame with unrecognized kind tag {}", tag);
                continue;
            }
            Err(e) => return Err(Error::from(e)),
        }
    }
}

/// Distinguishes "a frame with a kind tag this crate doesn't implement"
/// (dropped per §8 scenario 10) from "malformed JSON" (fatal `ProtocolError`,
/// surfaced by `Message`'s own `Deserialize` impl failing).
enum RawFrame {
    Known(Message),
    Unknown(u64),
}

impl<'de> serde::Deserialize<'de> for RawFrame {
    fn deserialize<D>(deserializer: D) -> Result<RawFrame, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        let tag = value.get(0).and_then(|v| v.as_u64());
        match tag {
            Some(t) if KNOWN_KINDS.contains(&t) => {
                let message = Message::deserialize(value).map_err(serde::de::Error::custom)?;
                Ok(RawFrame::Known(message))
            }
            Some(other) => Ok(RawFrame::Unknown(other)),
            None => Err(serde::de::Error::custom("frame is not a WAMP message array")),
        }
    }
}

const KNOWN_KINDS: &[u64] = &[
    1, 2, 3, 4, 5, 6, 8, 16, 17, 32, 33, 34, 35, 36, 48, 49, 50, 64, 65, 66, 67, 68, 69, 70,
];

async fn handshake(
    transport: &mut dyn Transport,
    realm: &str,
    auth: &Option<Auth>,
) -> Result<Id, Error> {
    let details = match auth {
        Some(a) => HelloDetails::new_with_auth(ClientRoles::new(), &a.authid, a.authmethods.clone()),
        None => HelloDetails::new(ClientRoles::new()),
    };
    send_message(transport, &Message::Hello(URI::new(realm), details)).await?;

    loop {
        match recv_message(transport).await? {
            Message::Welcome(session_id, details) => {
                debug!("received WELCOME: {:?}", details);
                return Ok(session_id);
            }
            Message::Challenge(method, extra) => {
                let auth = auth.as_ref().ok_or_else(|| Error::new(ErrorKind::UnexpectedChallenge))?;
                let response = auth.challenge(&method, &extra).await;
                let (signature, reply_extra) = match response {
                    ChallengeResponse::Signature(sig) => (sig, Dict::new()),
                    ChallengeResponse::SignatureWithExtra(sig, extra) => (sig, extra),
                };
                send_message(transport, &Message::Authenticate(signature, reply_extra)).await?;
            }
            Message::Abort(details, reason) => {
                let mut dict = Dict::new();
                if let Some(message) = details.message() {
                    dict.insert("message".to_string(), serde_json::Value::String(message.to_string()));
                }
                return Err(Error::new(ErrorKind::AbortError(dict, reason)));
            }
            other => {
                return Err(Error::new(ErrorKind::ProtocolError(format!(
                    "unexpected message during handshake: {:?}",
                    other
                ))));
            }
        }
    }
}

impl Channel {
    /// Issues an independent `CALL`. Each invocation is its own logical
    /// operation: two calls to `call()` with the same arguments never share
    /// a request id or a reply stream.
    pub async fn call(&self, uri: &str, args: Option<List>, kwargs: Option<Dict>) -> CallStream {
        let (reply, reply_rx) = oneshot::channel();
        let _ = self.commands.send(Command::Call {
            uri: URI::new(uri),
            args,
            kwargs,
            reply,
        });
        match reply_rx.await {
            Ok((request_id, inner)) => CallStream {
                request_id,
                commands: self.commands.clone(),
                inner,
                terminated: false,
            },
            // The driver task already exited (transport closed/errored) before
            // it could allocate a request id for this call. Surface that as a
            // one-item stream rather than panicking the caller.
            Err(_) => CallStream::disconnected(self.commands.clone()),
        }
    }

    pub async fn register(&self, uri: &str, handler: Handler) -> Result<RegistrationHandle, OperationError> {
        let (reply, reply_rx) = oneshot::channel();
        let _ = self.commands.send(Command::Register {
            uri: URI::new(uri),
            handler,
            reply,
        });
        let registration_id = match reply_rx.await {
            Ok(result) => result?,
            Err(_) => return Err(disconnected_operation_error(ErrorType::Register)),
        };
        Ok(RegistrationHandle {
            registration_id,
            commands: self.commands.clone(),
        })
    }

    pub async fn publish(
        &self,
        uri: &str,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) -> Result<PublicationId, OperationError> {
        let (reply, reply_rx) = oneshot::channel();
        let _ = self.commands.send(Command::Publish {
            uri: URI::new(uri),
            args,
            kwargs,
            reply,
        });
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(disconnected_operation_error(ErrorType::Publish)),
        }
    }

    pub async fn subscribe(&self, uri: &str) -> Result<SubscriptionStream, OperationError> {
        let (reply, reply_rx) = oneshot::channel();
        let _ = self.commands.send(Command::Subscribe {
            uri: URI::new(uri),
            reply,
        });
        let (subscription_id, inner) = match reply_rx.await {
            Ok(result) => result?,
            Err(_) => return Err(disconnected_operation_error(ErrorType::Subscribe)),
        };
        Ok(SubscriptionStream {
            subscription_id,
            commands: self.commands.clone(),
            inner,
        })
    }

    pub async fn close(&self) -> Result<(), Error> {
        let (reply, reply_rx) = oneshot::channel();
        let _ = self.commands.send(Command::Close { reply });
        reply_rx.await.map_err(|_| Error::new(ErrorKind::ConnectionLost))?
    }
}

/// Builds the `OperationError` surfaced to `register`/`publish`/`subscribe`
/// when the driver task has already exited before it could reply (the
/// transport closed or errored out from under a pending command).
fn disconnected_operation_error(error_type: ErrorType) -> OperationError {
    OperationError::new(error_type, 0, Reason::NetworkFailure, None, None)
}

/// A pending or in-flight `CALL`'s reply stream. Dropping it before the call
/// terminates sends `CANCEL`; dropping it afterward is a no-op (the driver
/// suppresses the `CANCEL` once it has already removed the route).
pub struct CallStream {
    request_id: Id,
    commands: mpsc::UnboundedSender<Command>,
    inner: UnboundedReceiverStream<Payload>,
    terminated: bool,
}

impl CallStream {
    /// Builds a stream that immediately yields one session-failure payload
    /// and ends, for when the driver task is already gone before a `call()`
    /// could even be registered. `terminated` starts `true` so `Drop` never
    /// tries to cancel a request id that was never actually allocated.
    fn disconnected(commands: mpsc::UnboundedSender<Command>) -> CallStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Err(PayloadError::Session(Arc::new(Error::new(ErrorKind::ConnectionLost)))));
        CallStream {
            request_id: 0,
            commands,
            inner: UnboundedReceiverStream::new(rx),
            terminated: true,
        }
    }
}

impl futures::Stream for CallStream {
    type Item = Payload;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let poll = std::pin::Pin::new(&mut self.inner).poll_next(cx);
        if let std::task::Poll::Ready(None) = poll {
            self.terminated = true;
        }
        poll
    }
}

impl Drop for CallStream {
    fn drop(&mut self) {
        if !self.terminated {
            let _ = self.commands.send(Command::CancelCall {
                request_id: self.request_id,
            });
        }
    }
}

/// A subscription's event stream. Dropping it sends `UNSUBSCRIBE`.
pub struct SubscriptionStream {
    subscription_id: Id,
    commands: mpsc::UnboundedSender<Command>,
    inner: UnboundedReceiverStream<Payload>,
}

impl futures::Stream for SubscriptionStream {
    type Item = Payload;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        std::pin::Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for SubscriptionStream {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Unsubscribe {
            subscription_id: self.subscription_id,
        });
    }
}

/// A successful `register()`'s resource handle. Dropping it sends
/// `UNREGISTER`; in-flight invocations started before the drop continue to
/// completion on their own task.
pub struct RegistrationHandle {
    registration_id: Id,
    commands: mpsc::UnboundedSender<Command>,
}

impl RegistrationHandle {
    pub fn registration_id(&self) -> Id {
        self.registration_id
    }
}

impl Drop for RegistrationHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Unregister {
            registration_id: self.registration_id,
        });
    }
}

/// An outbound `REGISTER` awaiting its `REGISTERED`/`ERROR` reply. Unlike a
/// plain ack, completing this one has a side effect on driver state: success
/// binds the handler under the granted registration id.
struct PendingRegistration {
    handler: Handler,
    reply: oneshot::Sender<Result<Id, OperationError>>,
}

/// An outbound `SUBSCRIBE` awaiting its `SUBSCRIBED`/`ERROR` reply. Success
/// opens the event demux route under the granted subscription id.
struct PendingSubscription {
    reply: oneshot::Sender<Result<(Id, UnboundedReceiverStream<Payload>), OperationError>>,
}

/// The driver task: owns the transport and all protocol state, and is the
/// only place that ever touches either.
struct Driver {
    transport: Box<dyn Transport>,
    commands: mpsc::UnboundedReceiver<Command>,
    ids: IdAllocator,

    pending_calls: Demux<Id, Payload>,
    pending_subs: Demux<Id, Payload>,
    acks: HashMap<Id, oneshot::Sender<Message>>,
    pending_registrations: HashMap<Id, PendingRegistration>,
    pending_subscriptions: HashMap<Id, PendingSubscription>,
    registrations: HashMap<Id, Handler>,

    invocation_tasks: HashMap<Id, InvocationTask>,
    invocation_interrupts: HashMap<Id, mpsc::UnboundedSender<Message>>,
    outbound_tx: mpsc::UnboundedSender<Message>,
    outbound_rx: mpsc::UnboundedReceiver<Message>,
    invocation_done_tx: mpsc::UnboundedSender<Id>,
    invocation_done_rx: mpsc::UnboundedReceiver<Id>,
}

impl Driver {
    fn new(transport: Box<dyn Transport>, commands: mpsc::UnboundedReceiver<Command>) -> Driver {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (invocation_done_tx, invocation_done_rx) = mpsc::unbounded_channel();
        Driver {
            transport,
            commands,
            ids: IdAllocator::new(),
            pending_calls: Demux::new(),
            pending_subs: Demux::new(),
            acks: HashMap::new(),
            pending_registrations: HashMap::new(),
            pending_subscriptions: HashMap::new(),
            registrations: HashMap::new(),
            invocation_tasks: HashMap::new(),
            invocation_interrupts: HashMap::new(),
            outbound_tx,
            outbound_rx,
            invocation_done_tx,
            invocation_done_rx,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                frame = self.transport.recv() => {
                    match frame {
                        Some(Ok(text)) => self.handle_text(text).await,
                        Some(Err(e)) => {
                            self.fail(Arc::new(e)).await;
                            return;
                        }
                        None => {
                            self.fail(Arc::new(Error::new(ErrorKind::TransportClosed))).await;
                            return;
                        }
                    }
                }

                Some(command) = self.commands.recv() => {
                    if self.handle_command(command).await {
                        return;
                    }
                }

                Some(message) = self.outbound_rx.recv() => {
                    if let Err(e) = send_message(self.transport.as_mut(), &message).await {
                        warn!("failed to send outbound frame: {}", e);
                    }
                }

                Some(invocation_id) = self.invocation_done_rx.recv() => {
                    self.invocation_tasks.remove(&invocation_id);
                    self.invocation_interrupts.remove(&invocation_id);
                }
            }
        }
    }

    async fn handle_text(&mut self, text: String) {
        match serde_json::from_str::<RawFrame>(&text) {
            Ok(RawFrame::Known(message)) => self.handle_message(message).await,
            Ok(RawFrame::Unknown(tag)) => {
                warn!("dropping inbound frame with unrecognized kind tag {}", tag);
            }
            Err(e) => {
                warn!("dropping malformed inbound frame: {}", e);
            }
        }
    }

    async fn handle_message(&mut self, message: Message) {
        match message {
            Message::Result(request_id, details, args, kwargs) => {
                if details.progress {
                    self.pending_calls.dispatch(&request_id, Ok((args, kwargs)));
                } else if args.as_ref().map_or(true, |a| a.is_empty()) {
                    self.pending_calls.remove(&request_id);
                } else {
                    self.pending_calls.dispatch(&request_id, Ok((args, kwargs)));
                    self.pending_calls.remove(&request_id);
                }
            }
            Message::Error(ErrorType::Call, request_id, _details, reason, args, kwargs) => {
                self.pending_calls.dispatch(
                    &request_id,
                    Err(OperationError::new(ErrorType::Call, request_id, reason, args, kwargs).into()),
                );
                self.pending_calls.remove(&request_id);
            }
            Message::Event(subscription_id, _publication_id, _details, args, kwargs) => {
                self.pending_subs.dispatch(&subscription_id, Ok((args, kwargs)));
            }
            Message::Subscribed(request_id, subscription_id) => {
                match self.pending_subscriptions.remove(&request_id) {
                    Some(pending) => {
                        let stream = self.pending_subs.register(subscription_id);
                        let _ = pending.reply.send(Ok((subscription_id, stream)));
                    }
                    None => warn!("unsolicited SUBSCRIBED for request {}", request_id),
                }
            }
            Message::Published(request_id, publication_id) => {
                self.resolve_ack(request_id, Message::Published(request_id, publication_id));
            }
            Message::Registered(request_id, registration_id) => {
                match self.pending_registrations.remove(&request_id) {
                    Some(pending) => {
                        self.registrations.insert(registration_id, pending.handler);
                        let _ = pending.reply.send(Ok(registration_id));
                    }
                    None => warn!("unsolicited REGISTERED for request {}", request_id),
                }
            }
            Message::Unregistered(request_id) => {
                self.resolve_ack(request_id, Message::Unregistered(request_id));
            }
            Message::Unsubscribed(request_id) => {
                debug!("peer acknowledged unsubscribe of request {}", request_id);
            }
            Message::Error(error_type, request_id, details, reason, args, kwargs) => {
                if let Some(pending) = self.pending_registrations.remove(&request_id) {
                    let _ = pending.reply.send(Err(OperationError::new(
                        error_type, request_id, reason, args, kwargs,
                    )));
                } else if let Some(pending) = self.pending_subscriptions.remove(&request_id) {
                    let _ = pending.reply.send(Err(OperationError::new(
                        error_type, request_id, reason, args, kwargs,
                    )));
                } else if !self.resolve_ack(
                    request_id,
                    Message::Error(error_type, request_id, details, reason.clone(), args.clone(), kwargs.clone()),
                ) {
                    warn!("unsolicited ERROR for {:?} request {}: {}", error_type, request_id, reason);
                }
            }
            Message::Invocation(invocation_id, registration_id, details, args, kwargs) => {
                self.handle_invocation(invocation_id, registration_id, details.receive_progress, args, kwargs);
            }
            Message::Interrupt(invocation_id, options) => {
                match self.invocation_interrupts.get(&invocation_id) {
                    Some(tx) => {
                        let _ = tx.send(Message::Interrupt(invocation_id, options));
                    }
                    None => warn!("INTERRUPT for unknown invocation {}", invocation_id),
                }
            }
            Message::Goodbye(_details, reason) => {
                info!("router sent GOODBYE: {}", reason);
                let _ = send_message(
                    self.transport.as_mut(),
                    &Message::Goodbye(ErrorDetails::new(), Reason::GoodbyeAndOut),
                )
                .await;
            }
            other => {
                warn!("dropping frame not expected in established state: {:?}", other);
            }
        }
    }

    /// Forwards a reply to a plain outstanding ack (`PUBLISHED`/`UNREGISTERED`
    /// and their `ERROR` counterparts). Returns `false` if nothing was
    /// waiting on `request_id`.
    fn resolve_ack(&mut self, request_id: Id, message: Message) -> bool {
        match self.acks.remove(&request_id) {
            Some(sender) => {
                let _ = sender.send(message);
                true
            }
            None => false,
        }
    }

    fn handle_invocation(
        &mut self,
        invocation_id: Id,
        registration_id: Id,
        receive_progress: bool,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) {
        let handler = match self.registrations.get(&registration_id) {
            Some(handler) => handler.clone(),
            None => {
                warn!("INVOCATION for unknown registration {}", registration_id);
                let _ = self.outbound_tx.send(Message::Error(
                    ErrorType::Invocation,
                    invocation_id,
                    Dict::new(),
                    Reason::NoSuchRegistration,
                    None,
                    None,
                ));
                return;
            }
        };

        let (interrupt_tx, interrupt_rx) = mpsc::unbounded_channel();
        self.invocation_interrupts.insert(invocation_id, interrupt_tx);
        let task = InvocationTask::spawn(
            invocation_id,
            receive_progress,
            args,
            kwargs,
            handler,
            self.outbound_tx.clone(),
            self.invocation_done_tx.clone(),
            UnboundedReceiverStream::new(interrupt_rx),
        );
        self.invocation_tasks.insert(invocation_id, task);
    }

    /// Returns `true` if the driver loop should stop.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Call { uri, args, kwargs, reply } => {
                let request_id = self.ids.next();
                let stream = self.pending_calls.register(request_id);
                let _ = reply.send((request_id, stream));
                if let Err(e) = send_message(
                    self.transport.as_mut(),
                    &Message::Call(request_id, CallOptions::new(), uri, args, kwargs),
                )
                .await
                {
                    warn!("failed to send CALL: {}", e);
                }
            }
            Command::CancelCall { request_id } => {
                if self.pending_calls.contains(&request_id) {
                    self.pending_calls.remove(&request_id);
                    let _ = send_message(
                        self.transport.as_mut(),
                        &Message::Cancel(request_id, CancelOptions::kill()),
                    )
                    .await;
                }
            }
            Command::Register { uri, handler, reply } => {
                let request_id = self.ids.next();
                self.pending_registrations.insert(request_id, PendingRegistration { handler, reply });
                if let Err(e) = send_message(
                    self.transport.as_mut(),
                    &Message::Register(request_id, RegisterOptions::new(), uri),
                )
                .await
                {
                    warn!("failed to send REGISTER: {}", e);
                }
            }
            Command::Unregister { registration_id } => {
                self.registrations.remove(&registration_id);
                let request_id = self.ids.next();
                let (ack_tx, _ack_rx) = oneshot::channel::<Message>();
                self.acks.insert(request_id, ack_tx);
                let _ = send_message(
                    self.transport.as_mut(),
                    &Message::Unregister(request_id, registration_id),
                )
                .await;
            }
            Command::Publish { uri, args, kwargs, reply } => {
                let request_id = self.ids.next();
                let (ack_tx, ack_rx) = oneshot::channel();
                self.acks.insert(request_id, ack_tx);
                if let Err(e) = send_message(
                    self.transport.as_mut(),
                    &Message::Publish(request_id, PublishOptions::new(true), uri, args, kwargs),
                )
                .await
                {
                    warn!("failed to send PUBLISH: {}", e);
                    let _ = reply.send(Err(OperationError::new(
                        ErrorType::Publish,
                        request_id,
                        Reason::NetworkFailure,
                        None,
                        None,
                    )));
                } else {
                    tokio::spawn(Self::await_publish_ack(ack_rx, reply));
                }
            }
            Command::Subscribe { uri, reply } => {
                let request_id = self.ids.next();
                self.pending_subscriptions.insert(request_id, PendingSubscription { reply });
                if let Err(e) = send_message(
                    self.transport.as_mut(),
                    &Message::Subscribe(request_id, SubscribeOptions::new(), uri),
                )
                .await
                {
                    warn!("failed to send SUBSCRIBE: {}", e);
                    if let Some(pending) = self.pending_subscriptions.remove(&request_id) {
                        let _ = pending.reply.send(Err(OperationError::new(
                            ErrorType::Subscribe,
                            request_id,
                            Reason::NetworkFailure,
                            None,
                            None,
                        )));
                    }
                }
            }
            Command::Unsubscribe { subscription_id } => {
                self.pending_subs.remove(&subscription_id);
                let request_id = self.ids.next();
                let _ = send_message(
                    self.transport.as_mut(),
                    &Message::Unsubscribe(request_id, subscription_id),
                )
                .await;
            }
            Command::Close { reply } => {
                let _ = send_message(
                    self.transport.as_mut(),
                    &Message::Goodbye(ErrorDetails::new(), Reason::SystemShutdown),
                )
                .await;
                loop {
                    match self.transport.recv().await {
                        Some(Ok(text)) => match serde_json::from_str::<RawFrame>(&text) {
                            Ok(RawFrame::Known(Message::Goodbye(_, _))) => break,
                            Ok(RawFrame::Known(other)) => {
                                warn!("dropping frame while awaiting GOODBYE reply: {:?}", other);
                            }
                            Ok(RawFrame::Unknown(tag)) => {
                                warn!("dropping unrecognized kind tag {} while closing", tag);
                            }
                            Err(_) => break,
                        },
                        _ => break,
                    }
                }
                let _ = reply.send(Ok(()));
                return true;
            }
        }
        false
    }

    async fn await_publish_ack(
        ack_rx: oneshot::Receiver<Message>,
        reply: oneshot::Sender<Result<PublicationId, OperationError>>,
    ) {
        match ack_rx.await {
            Ok(Message::Published(_, publication_id)) => {
                let _ = reply.send(Ok(publication_id));
            }
            Ok(Message::Error(error_type, request_id, _, reason, args, kwargs)) => {
                let _ = reply.send(Err(OperationError::new(error_type, request_id, reason, args, kwargs)));
            }
            _ => {
                let _ = reply.send(Err(OperationError::new(
                    ErrorType::Publish,
                    0,
                    Reason::NetworkFailure,
                    None,
                    None,
                )));
            }
        }
    }

    async fn fail(&mut self, cause: Arc<Error>) {
        warn!("session failing: {}", cause);
        self.pending_calls.fail_all(cause.clone());
        self.pending_subs.fail_all(cause);
        for (_, task) in self.invocation_tasks.drain() {
            task.abort();
        }
        self.invocation_interrupts.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::MockTransport;
    use futures::StreamExt;
    use serde_json::json;

    /// Drives `Driver`'s private command/message handlers directly, bypassing
    /// the `run()` select loop. That loop races the transport against the
    /// command channel on purpose (§5: no cross-operation ordering
    /// guarantee) — exactly what a deterministic test must avoid.
    fn test_driver() -> (Driver, Arc<std::sync::Mutex<Vec<String>>>) {
        let (transport, sent) = MockTransport::new(vec![]);
        let (_commands_tx, commands_rx) = mpsc::unbounded_channel();
        (Driver::new(transport, commands_rx), sent)
    }

    #[tokio::test]
    async fn cancel_suppressed_after_call_already_terminated() {
        let (mut driver, sent) = test_driver();
        let (reply, reply_rx) = oneshot::channel();
        driver
            .handle_command(Command::Call { uri: URI::new("thing"), args: None, kwargs: None, reply })
            .await;
        let (request_id, _stream) = reply_rx.await.unwrap();

        driver.handle_message(Message::Result(request_id, crate::messages::ResultDetails::new(), None, None)).await;
        driver.handle_command(Command::CancelCall { request_id }).await;

        assert!(!sent.lock().unwrap().iter().any(|f| f.starts_with("[49,")));
    }

    #[tokio::test]
    async fn cancel_sent_for_call_not_yet_terminated() {
        let (mut driver, sent) = test_driver();
        let (reply, reply_rx) = oneshot::channel();
        driver
            .handle_command(Command::Call { uri: URI::new("thing"), args: None, kwargs: None, reply })
            .await;
        let (request_id, _stream) = reply_rx.await.unwrap();

        driver.handle_command(Command::CancelCall { request_id }).await;

        assert!(sent.lock().unwrap().iter().any(|f| f.starts_with("[49,")));
    }

    #[tokio::test]
    async fn progressive_call_emits_each_result_then_completes_on_empty_terminal() {
        let (mut driver, _sent) = test_driver();
        let (reply, reply_rx) = oneshot::channel();
        driver
            .handle_command(Command::Call { uri: URI::new("thing"), args: Some(vec![json!("hi")]), kwargs: None, reply })
            .await;
        let (request_id, mut stream) = reply_rx.await.unwrap();

        let mut progress = crate::messages::ResultDetails::new();
        progress.progress = true;
        driver
            .handle_message(Message::Result(request_id, progress, Some(vec![json!(1)]), None))
            .await;
        driver
            .handle_message(Message::Result(request_id, crate::messages::ResultDetails::new(), None, None))
            .await;

        let (args, _) = stream.next().await.unwrap().unwrap();
        assert_eq!(args, Some(vec![json!(1)]));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn subscribe_then_event_is_delivered_in_order() {
        let (mut driver, _sent) = test_driver();
        let (reply, reply_rx) = oneshot::channel();
        driver.handle_command(Command::Subscribe { uri: URI::new("topic"), reply }).await;
        let request_id = *driver.pending_subscriptions.keys().next().unwrap();

        driver.handle_message(Message::Subscribed(request_id, 123)).await;
        let (subscription_id, mut stream) = reply_rx.await.unwrap().unwrap();
        assert_eq!(subscription_id, 123);

        driver
            .handle_message(Message::Event(123, 1, crate::messages::EventDetails::new(), Some(vec![json!(42)]), None))
            .await;
        let (args, _) = stream.next().await.unwrap().unwrap();
        assert_eq!(args, Some(vec![json!(42)]));
    }

    // The following drive scenarios through the real public entry point
    // (`connect_with_transport` + `Channel`) rather than the private
    // `handshake`/`Driver` internals, using `MockTransport` as the factory
    // seam §4.1/§6 call for.

    #[tokio::test]
    async fn handshake_sends_hello_and_resolves_on_welcome() {
        let (transport, sent) = MockTransport::new(vec!["[2,123,{}]".to_string()]);
        let channel = connect_with_transport(transport, "fakeRealm", None).await;

        assert!(channel.is_ok());
        assert_eq!(
            sent.lock().unwrap().as_slice(),
            &["[1,\"fakeRealm\",{\"roles\":{\"publisher\":{},\"subscriber\":{},\"caller\":{\"features\":{\"progressive_call_results\":true,\"call_canceling\":true}},\"callee\":{\"features\":{\"progressive_call_results\":true,\"call_canceling\":true}}}}]".to_string()]
        );
    }

    #[tokio::test]
    async fn handshake_ticket_auth_responds_to_challenge() {
        let (transport, sent) = MockTransport::new(vec![
            "[4,\"ticket\",{\"somethingExtra\":\"extra value\"}]".to_string(),
            "[2,123,{}]".to_string(),
        ]);
        let auth = Auth::new("myId", vec!["ticket".to_string()], |method, extra| {
            assert_eq!(method, "ticket");
            assert_eq!(extra.get("somethingExtra").unwrap().as_str(), Some("extra value"));
            async { "some ticket".to_string() }
        });

        let channel = connect_with_transport(transport, "fakeRealm", Some(auth)).await;

        assert!(channel.is_ok());
        let sent = sent.lock().unwrap();
        assert!(sent[0].contains("\"authid\":\"myId\""));
        assert!(sent[0].contains("\"authmethods\":[\"ticket\"]"));
        assert_eq!(sent[1], "[5,\"some ticket\",{}]");
    }

    #[tokio::test]
    async fn handshake_abort_fails_with_reason() {
        let (transport, _sent) = MockTransport::new(vec![
            "[3,{},\"wamp.error.no_such_realm\"]".to_string(),
        ]);
        let err = connect_with_transport(transport, "noSuchRealm", None).await.unwrap_err();
        assert!(matches!(err.kind, ErrorKind::AbortError(_, Reason::NoSuchRealm)));
    }

    #[tokio::test]
    async fn handshake_unexpected_challenge_without_auth_fails() {
        let (transport, _sent) = MockTransport::new(vec![
            "[4,\"ticket\",{}]".to_string(),
        ]);
        let err = connect_with_transport(transport, "fakeRealm", None).await.unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UnexpectedChallenge));
    }

    #[tokio::test]
    async fn close_sends_goodbye_and_resolves_on_reply() {
        let (transport, sent) = MockTransport::new(vec![
            "[2,123,{}]".to_string(),
            "[6,{},\"wamp.close.normal\"]".to_string(),
        ]);
        let channel = connect_with_transport(transport, "fakeRealm", None).await.unwrap();

        channel.close().await.unwrap();

        assert!(sent
            .lock()
            .unwrap()
            .iter()
            .any(|f| f == "[6,{},\"wamp.error.system_shutdown\"]"));
    }

    #[tokio::test]
    async fn call_after_driver_exit_yields_connection_lost_instead_of_panicking() {
        // A `Channel` whose command receiver has already been dropped
        // reproduces "driver task already gone" without needing to race a
        // real driver shutdown: every `send` fails and drops the reply
        // oneshot along with it, so every `reply_rx.await` sees `RecvError`.
        let (commands, commands_rx) = mpsc::unbounded_channel();
        drop(commands_rx);
        let orphaned = Channel { commands };

        let mut call = orphaned.call("thing", None, None).await;
        match call.next().await {
            Some(Err(PayloadError::Session(e))) => {
                assert!(matches!(e.kind, ErrorKind::ConnectionLost));
            }
            other => panic!("expected a session-failure payload, got {:?}", other),
        }
        assert!(call.next().await.is_none());

        let err = orphaned.publish("thing", None, None).await.unwrap_err();
        assert_eq!(err.reason, Reason::NetworkFailure);

        let err = orphaned
            .register(
                "thing",
                Arc::new(|_, _| {
                    Box::pin(futures::stream::empty::<
                        Result<(Option<List>, Option<Dict>), crate::UserHandlerError>,
                    >())
                }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.reason, Reason::NetworkFailure);

        let err = orphaned.subscribe("thing").await.unwrap_err();
        assert_eq!(err.reason, Reason::NetworkFailure);
    }

    #[tokio::test]
    async fn unknown_message_kind_is_dropped_not_fatal() {
        let (mut driver, _sent) = test_driver();
        driver.handle_text("[99]".to_string()).await;

        // The driver is still usable afterward: an ordinary CALL still works.
        let (reply, reply_rx) = oneshot::channel();
        driver
            .handle_command(Command::Call { uri: URI::new("thing"), args: None, kwargs: None, reply })
            .await;
        let (request_id, mut stream) = reply_rx.await.unwrap();
        driver
            .handle_message(Message::Result(request_id, crate::messages::ResultDetails::new(), Some(vec![json!(1)]), None))
            .await;
        let (args, _) = stream.next().await.unwrap().unwrap();
        assert_eq!(args, Some(vec![json!(1)]));
    }

    #[tokio::test]
    async fn register_binds_handler_under_granted_registration_id() {
        let (mut driver, _sent) = test_driver();
        let handler: Handler = Arc::new(|_, _| {
            Box::pin(futures::stream::empty::<Result<(Option<List>, Option<Dict>), crate::UserHandlerError>>())
        });
        let (reply, reply_rx) = oneshot::channel();
        driver.handle_command(Command::Register { uri: URI::new("proc"), handler, reply }).await;
        let request_id = *driver.pending_registrations.keys().next().unwrap();

        driver.handle_message(Message::Registered(request_id, 55)).await;
        let registration_id = reply_rx.await.unwrap().unwrap();

        assert_eq!(registration_id, 55);
        assert!(driver.registrations.contains_key(&55));
    }
}

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashSet};

use rand::{Rng, SeedableRng};
use rchat_core::{
    ArqConfig, CancelToken, DownloadRequest, DownloadResponse, LinkConfig, Notice, Payload,
    PollRequest, PollResponse, SendRequest, SendResponse, Session, SessionContext, SessionError,
    TimerHandle, TimerService, TimerToken, Transport, TransportError, UploadChunkRequest,
    UploadChunkResponse,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::relay::Relay;
use crate::trace::{ClientReport, ReceivedMessage, SimulationReport};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddClientError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("client `{0}` is already connected")]
    Duplicate(String),
}

/// One relay call issued by a client session.
#[derive(Debug, Clone)]
pub enum Request {
    Send(SendRequest),
    Upload(UploadChunkRequest),
    Poll(PollRequest),
    Download(DownloadRequest),
    ListUsers,
}

impl Request {
    /// Seq of the segment carried, for data-bearing requests.
    pub fn seq(&self) -> Option<u64> {
        match self {
            Request::Send(r) => Some(r.seq),
            Request::Upload(r) => Some(r.seq),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Request::Send(_) => "send",
            Request::Upload(_) => "upload",
            Request::Poll(_) => "poll",
            Request::Download(_) => "download",
            Request::ListUsers => "users",
        }
    }

    fn fail(self, err: TransportError) -> Response {
        match self {
            Request::Send(r) => Response::Send {
                seq: r.seq,
                result: Err(err),
            },
            Request::Upload(r) => Response::Upload {
                seq: r.seq,
                result: Err(err),
            },
            Request::Poll(_) => Response::Poll(Err(err)),
            Request::Download(r) => Response::Download {
                file_name: r.file_name,
                result: Err(err),
            },
            Request::ListUsers => Response::Users(Err(err)),
        }
    }

    /// The relay dropped the segment and answered 200 without an ack.
    fn lost(self) -> Response {
        match self {
            Request::Send(r) => Response::Send {
                seq: r.seq,
                result: Ok(SendResponse::default()),
            },
            Request::Upload(r) => Response::Upload {
                seq: r.seq,
                result: Ok(UploadChunkResponse::default()),
            },
            other => other.fail(TransportError::Unreachable("request lost".into())),
        }
    }
}

#[derive(Debug)]
pub enum Response {
    Send {
        seq: u64,
        result: Result<SendResponse, TransportError>,
    },
    Upload {
        seq: u64,
        result: Result<UploadChunkResponse, TransportError>,
    },
    Poll(Result<PollResponse, TransportError>),
    Download {
        file_name: String,
        result: Result<DownloadResponse, TransportError>,
    },
    Users(Result<Vec<String>, TransportError>),
}

impl Response {
    fn label(&self) -> &'static str {
        match self {
            Response::Send { .. } => "send",
            Response::Upload { .. } => "upload",
            Response::Poll(_) => "poll",
            Response::Download { .. } => "download",
            Response::Users(_) => "users",
        }
    }
}

/// User input injected into a client at a given time.
#[derive(Debug, Clone)]
pub enum Command {
    SendText {
        to: String,
        text: String,
    },
    SendFile {
        to: String,
        file_name: String,
        bytes: Vec<u8>,
    },
    Download {
        file_name: String,
    },
    RefreshUsers,
    Disconnect,
}

#[derive(Debug)]
pub enum EventType {
    Command {
        client: String,
        command: Command,
    },
    RequestArrival {
        client: String,
        request: Request,
    },
    ResponseArrival {
        client: String,
        response: Response,
    },
    TimerExpiry {
        client: String,
        handle: TimerHandle,
        token: TimerToken,
    },
}

#[derive(Debug)]
struct Event {
    time: u64,
    event_type: EventType,
    id: u64, // Unique ID to differentiate events at same time
}

// Custom Ord for Min-Heap (smallest time pops first)
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.id == other.id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// A compact textual summary of important link-layer events.
#[derive(Debug, Clone, Serialize)]
pub struct LinkEventSummary {
    pub time: u64,
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientStats {
    /// Every relay call, polls included.
    pub requests: u32,
    /// Send and upload calls, retransmissions included.
    pub transmissions: u32,
    pub retransmissions: u32,
    pub polls: u32,
    pub permanent_failures: u32,
    pub transport_errors: u32,
    pub rejected_commands: u32,
    pub suppressed_responses: u32,
}

/// Interval during which every request from `client` fails.
#[derive(Debug, Clone)]
struct Blackhole {
    client: String,
    from: u64,
    until: u64,
}

/// Actions buffered during one session callback
#[derive(Default)]
struct ActionBuffer {
    requests: Vec<Request>,
    timers_start: Vec<(TimerHandle, u64, TimerToken)>,
    timers_cancel: Vec<TimerHandle>,
    notices: Vec<Notice>,
}

/// Context handed to the session for the duration of one callback
struct ScopedContext<'a> {
    buffer: &'a mut ActionBuffer,
    now: u64,
    next_handle: &'a mut u64,
}

impl Transport for ScopedContext<'_> {
    fn send(&mut self, request: SendRequest) {
        self.buffer.requests.push(Request::Send(request));
    }

    fn upload_chunk(&mut self, request: UploadChunkRequest) {
        self.buffer.requests.push(Request::Upload(request));
    }

    fn poll(&mut self, request: PollRequest) {
        self.buffer.requests.push(Request::Poll(request));
    }

    fn download_file(&mut self, request: DownloadRequest) {
        self.buffer.requests.push(Request::Download(request));
    }

    fn list_users(&mut self) {
        self.buffer.requests.push(Request::ListUsers);
    }
}

impl TimerService for ScopedContext<'_> {
    fn schedule(&mut self, delay_ms: u64, token: TimerToken) -> TimerHandle {
        let handle = TimerHandle(*self.next_handle);
        *self.next_handle += 1;
        self.buffer.timers_start.push((handle, delay_ms, token));
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.buffer.timers_cancel.push(handle);
    }
}

impl SessionContext for ScopedContext<'_> {
    fn notify(&mut self, notice: Notice) {
        self.buffer.notices.push(notice);
    }

    fn now(&self) -> u64 {
        self.now
    }
}

/// A simulated chat client: its session plus the bookkeeping the engine
/// keeps around it.
pub struct ClientNode {
    pub session: Session,
    cancel: CancelToken,
    /// Timers scheduled and not yet fired or cancelled.
    armed: HashSet<TimerHandle>,
    next_handle: u64,
    transmitted: HashSet<u64>,
    pub notices: Vec<(u64, Notice)>,
    pub stats: ClientStats,
}

impl ClientNode {
    pub fn armed_timers(&self) -> usize {
        self.armed.len()
    }

    /// (sender, text) of every text message in the receive log.
    pub fn received_texts(&self) -> Vec<(&str, &str)> {
        self.session
            .receive_log()
            .history()
            .iter()
            .filter_map(|segment| match &segment.payload {
                Payload::Text(text) => Some((segment.sender.as_str(), text.as_str())),
                Payload::FileChunk(_) => None,
            })
            .collect()
    }

    /// (file name, sender) of every file announced as complete.
    pub fn ready_files(&self) -> Vec<(&str, &str)> {
        self.notices
            .iter()
            .filter_map(|(_, notice)| match notice {
                Notice::FileReady {
                    file_name, sender, ..
                } => Some((file_name.as_str(), sender.as_str())),
                _ => None,
            })
            .collect()
    }

    pub fn failed_seqs(&self) -> Vec<u64> {
        self.notices
            .iter()
            .filter_map(|(_, notice)| match notice {
                Notice::PermanentSendFailure { seq, .. } => Some(*seq),
                _ => None,
            })
            .collect()
    }

    pub fn downloaded(&self, file_name: &str) -> Option<&[u8]> {
        self.notices.iter().rev().find_map(|(_, notice)| match notice {
            Notice::FileDownloaded {
                file_name: name,
                bytes,
            } if name == file_name => Some(bytes.as_slice()),
            _ => None,
        })
    }
}

pub struct Simulator {
    time: u64,
    event_queue: BinaryHeap<Event>,
    event_id_counter: u64,

    arq: ArqConfig,
    link: LinkConfig,
    rng: rand::rngs::StdRng,

    relay: Relay,
    clients: BTreeMap<String, ClientNode>,

    // Deterministic fault injection: drop the first request from a client carrying the given seq
    drop_request_seq_once: Vec<(String, u64)>,
    blackholes: Vec<Blackhole>,

    /// Timeline of link events (drops, sends, failures) for the trace.
    pub link_events: Vec<LinkEventSummary>,
}

impl Simulator {
    pub fn new(arq: ArqConfig, link: LinkConfig) -> Self {
        let rng = rand::rngs::StdRng::seed_from_u64(link.seed);
        let relay = Relay::new(link.receive_window);

        Self {
            time: 0,
            event_queue: BinaryHeap::new(),
            event_id_counter: 0,
            arq,
            link,
            rng,
            relay,
            clients: BTreeMap::new(),
            drop_request_seq_once: Vec::new(),
            blackholes: Vec::new(),
            link_events: Vec::new(),
        }
    }

    /// Connect a new client at the current time.
    ///
    /// A name that is already connected is refused and the existing node is
    /// left untouched.
    pub fn add_client(&mut self, user: &str) -> Result<(), AddClientError> {
        let mut buffer = ActionBuffer::default();
        let mut next_handle = 0;
        let session = {
            let mut ctx = ScopedContext {
                buffer: &mut buffer,
                now: self.time,
                next_handle: &mut next_handle,
            };
            Session::connect(&mut ctx, user, self.arq.clone())?
        };
        let name = session.user().to_string();
        if self.clients.contains_key(&name) {
            return Err(AddClientError::Duplicate(name));
        }
        self.relay.register(&name);
        self.clients.insert(
            name.clone(),
            ClientNode {
                cancel: session.cancel_token(),
                session,
                armed: HashSet::new(),
                next_handle,
                transmitted: HashSet::new(),
                notices: Vec::new(),
                stats: ClientStats::default(),
            },
        );
        self.process_actions(&name, buffer);
        Ok(())
    }

    /// Register a deterministic fault: the first request from `client` carrying `seq` is lost.
    pub fn add_drop_next_request_seq(&mut self, client: &str, seq: u64) {
        self.drop_request_seq_once.push((client.to_string(), seq));
    }

    /// Register a deterministic fault: every request from `client` in `[from, until)` fails.
    pub fn add_blackhole(&mut self, client: &str, from: u64, until: u64) {
        self.blackholes.push(Blackhole {
            client: client.to_string(),
            from,
            until,
        });
    }

    pub fn schedule_command(&mut self, time: u64, client: &str, command: Command) {
        self.push_event(
            time,
            EventType::Command {
                client: client.to_string(),
                command,
            },
        );
    }

    pub fn arq_config(&self) -> &ArqConfig {
        &self.arq
    }

    pub fn link_config(&self) -> &LinkConfig {
        &self.link
    }

    pub fn client(&self, name: &str) -> Option<&ClientNode> {
        self.clients.get(name)
    }

    pub fn clients(&self) -> impl Iterator<Item = (&String, &ClientNode)> {
        self.clients.iter()
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    pub fn peek_next_event_time(&self) -> Option<u64> {
        self.event_queue.peek().map(|e| e.time)
    }

    pub fn current_time(&self) -> u64 {
        self.time
    }

    pub fn remaining_events(&self) -> usize {
        self.event_queue.len()
    }

    fn push_event(&mut self, time: u64, event_type: EventType) {
        self.event_queue.push(Event {
            time,
            event_type,
            id: self.event_id_counter,
        });
        self.event_id_counter += 1;
    }

    /// Process the next event. Returns true if an event was processed, false if queue is empty.
    pub fn step(&mut self) -> bool {
        let event = match self.event_queue.pop() {
            Some(e) => e,
            None => return false,
        };

        self.time = event.time;
        debug!("Processing event at {}: {:?}", self.time, event.event_type);

        match event.event_type {
            EventType::Command { client, command } => self.on_command(&client, command),
            EventType::RequestArrival { client, request } => {
                let response = self.relay_handle(request);
                let latency = self.sample_latency();
                self.push_event(
                    self.time + latency,
                    EventType::ResponseArrival { client, response },
                );
            }
            EventType::ResponseArrival { client, response } => {
                let Some(node) = self.clients.get_mut(&client) else {
                    return true;
                };
                if node.cancel.is_cancelled() {
                    debug!("Suppressing late {} response for {}", response.label(), client);
                    node.stats.suppressed_responses += 1;
                    return true;
                }
                self.dispatch(&client, |session, ctx| match response {
                    Response::Send { seq, result } => session.on_send_response(ctx, seq, result),
                    Response::Upload { seq, result } => {
                        session.on_upload_response(ctx, seq, result)
                    }
                    Response::Poll(result) => session.on_poll_response(ctx, result),
                    Response::Download { file_name, result } => {
                        session.on_download_response(ctx, &file_name, result)
                    }
                    Response::Users(result) => session.on_users_response(ctx, result),
                });
            }
            EventType::TimerExpiry {
                client,
                handle,
                token,
            } => {
                let Some(node) = self.clients.get_mut(&client) else {
                    return true;
                };
                // A cancelled handle is no longer armed; its event is ignored.
                if !node.armed.remove(&handle) {
                    debug!("Skipping cancelled timer {:?} ({:?})", handle, token);
                    return true;
                }
                self.dispatch(&client, |session, ctx| session.on_timer(ctx, token));
            }
        }
        true
    }

    /// Process every event due at or before `end`, then move the clock to `end`.
    pub fn run_until(&mut self, end: u64) {
        while let Some(next) = self.peek_next_event_time() {
            if next > end {
                break;
            }
            self.step();
        }
        self.time = self.time.max(end);
    }

    /// Disconnect every client and let in-flight traffic drain.
    pub fn shutdown(&mut self) {
        let names: Vec<String> = self.clients.keys().cloned().collect();
        for name in names {
            self.dispatch(&name, |session, ctx| session.disconnect(ctx));
        }
        while self.step() {}
    }

    /// Produce a serializable snapshot of the current simulation state.
    pub fn export_report(&self) -> SimulationReport {
        let clients = self
            .clients
            .iter()
            .map(|(user, node)| ClientReport {
                user: user.clone(),
                connected: node.session.is_connected(),
                status: node.session.status(),
                stats: node.stats.clone(),
                received: node
                    .session
                    .receive_log()
                    .history()
                    .iter()
                    .map(ReceivedMessage::from_segment)
                    .collect(),
                files_ready: node
                    .ready_files()
                    .into_iter()
                    .map(|(file_name, sender)| format!("{file_name} from {sender}"))
                    .collect(),
                failed_seqs: node.failed_seqs(),
            })
            .collect();

        SimulationReport {
            arq: self.arq.clone(),
            link: self.link.clone(),
            duration_ms: self.time,
            clients,
            relay: self.relay.stats.clone(),
            link_events: self.link_events.clone(),
        }
    }

    fn on_command(&mut self, client: &str, command: Command) {
        debug!("[{}] command {:?}", client, command);
        let result = self.dispatch(client, |session, ctx| match command {
            Command::SendText { to, text } => {
                session.select_peer(&to);
                session.send_text(ctx, &text).map(|_| ())
            }
            Command::SendFile {
                to,
                file_name,
                bytes,
            } => {
                session.select_peer(&to);
                session.send_file(ctx, &file_name, &bytes).map(|_| ())
            }
            Command::Download { file_name } => session.download(ctx, &file_name),
            Command::RefreshUsers => session.refresh_users(ctx),
            Command::Disconnect => {
                session.disconnect(ctx);
                Ok(())
            }
        });
        if let Some(Err(err)) = result {
            warn!("[{}] command rejected: {}", client, err);
            if let Some(node) = self.clients.get_mut(client) {
                node.stats.rejected_commands += 1;
            }
        }
    }

    /// Run one session callback against a fresh action buffer, then apply
    /// what it buffered.
    fn dispatch<F, R>(&mut self, client: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut Session, &mut ScopedContext<'_>) -> R,
    {
        let Some(node) = self.clients.get_mut(client) else {
            warn!("No such client: {}", client);
            return None;
        };
        let mut buffer = ActionBuffer::default();
        let result = {
            let mut ctx = ScopedContext {
                buffer: &mut buffer,
                now: self.time,
                next_handle: &mut node.next_handle,
            };
            f(&mut node.session, &mut ctx)
        };
        self.process_actions(client, buffer);
        Some(result)
    }

    fn process_actions(&mut self, client: &str, buffer: ActionBuffer) {
        let now = self.time;
        let Some(node) = self.clients.get_mut(client) else {
            return;
        };

        for notice in buffer.notices {
            match &notice {
                Notice::PermanentSendFailure { seq, retries } => {
                    node.stats.permanent_failures += 1;
                    self.link_events.push(LinkEventSummary {
                        time: now,
                        description: format!(
                            "[{client}] FAILED seq={seq} after {retries} retries"
                        ),
                    });
                }
                Notice::TransportError { .. } => node.stats.transport_errors += 1,
                Notice::MessageReceived(segment) => {
                    debug!(
                        "[{}] received seq {} from {}",
                        client, segment.seq, segment.sender
                    );
                }
                Notice::FileReady {
                    file_name, sender, ..
                } => {
                    info!("[{}] file {} from {} is complete", client, file_name, sender);
                }
                _ => {}
            }
            node.notices.push((now, notice));
        }

        // Starts before cancels: a handle scheduled and cancelled in the
        // same callback ends up disarmed.
        let mut timer_events = Vec::new();
        for (handle, delay, token) in buffer.timers_start {
            node.armed.insert(handle);
            timer_events.push((
                now + delay,
                EventType::TimerExpiry {
                    client: client.to_string(),
                    handle,
                    token,
                },
            ));
        }
        for handle in buffer.timers_cancel {
            node.armed.remove(&handle);
        }

        for request in &buffer.requests {
            node.stats.requests += 1;
            match request {
                Request::Send(_) | Request::Upload(_) => node.stats.transmissions += 1,
                Request::Poll(_) => node.stats.polls += 1,
                _ => {}
            }
            if let Some(seq) = request.seq()
                && !node.transmitted.insert(seq)
            {
                node.stats.retransmissions += 1;
            }
        }

        for (time, event) in timer_events {
            self.push_event(time, event);
        }
        for request in buffer.requests {
            self.transmit(client, request);
        }
    }

    /// Channel logic for one request leaving a client.
    fn transmit(&mut self, client: &str, request: Request) {
        let now = self.time;

        if self
            .blackholes
            .iter()
            .any(|b| b.client == client && b.from <= now && now < b.until)
        {
            self.link_events.push(LinkEventSummary {
                time: now,
                description: format!("[{client}] BLACKHOLE {}", request.label()),
            });
            let response = request.fail(TransportError::Unreachable("link down".into()));
            self.push_response(now + self.link.min_latency, client, response);
            return;
        }

        if let Some(seq) = request.seq()
            && let Some(pos) = self
                .drop_request_seq_once
                .iter()
                .position(|(c, s)| c == client && *s == seq)
        {
            self.drop_request_seq_once.remove(pos);
            self.link_events.push(LinkEventSummary {
                time: now,
                description: format!("[{client}->relay] DROP (deterministic seq) seq={seq}"),
            });
            debug!("Deterministically dropping {} seq={}", request.label(), seq);
            let rtt = self.sample_latency() + self.sample_latency();
            self.push_response(now + rtt, client, request.lost());
            return;
        }

        // 1. Relay-side failure
        if self.rng.random::<f64>() < self.link.error_rate {
            self.link_events.push(LinkEventSummary {
                time: now,
                description: format!("[{client}->relay] ERROR {}", request.label()),
            });
            let latency = self.sample_latency();
            self.push_response(now + latency, client, request.fail(TransportError::Status(500)));
            return;
        }

        // 2. Segment loss, answered without an ack
        if request.seq().is_some() && self.rng.random::<f64>() < self.link.loss_rate {
            self.link_events.push(LinkEventSummary {
                time: now,
                description: format!(
                    "[{client}->relay] DROP (random loss) seq={}",
                    request.seq().unwrap_or_default()
                ),
            });
            debug!("Request lost in channel");
            let rtt = self.sample_latency() + self.sample_latency();
            self.push_response(now + rtt, client, request.lost());
            return;
        }

        // 3. Delivery
        let latency = self.sample_latency();
        if let Some(seq) = request.seq() {
            self.link_events.push(LinkEventSummary {
                time: now,
                description: format!(
                    "[{client}->relay] SEND {} seq={seq} (latency={latency}ms)",
                    request.label()
                ),
            });
        }
        self.push_event(
            now + latency,
            EventType::RequestArrival {
                client: client.to_string(),
                request,
            },
        );
    }

    fn relay_handle(&mut self, request: Request) -> Response {
        let now = self.time;
        match request {
            Request::Send(r) => Response::Send {
                seq: r.seq,
                result: Ok(self.relay.handle_send(r, now)),
            },
            Request::Upload(r) => Response::Upload {
                seq: r.seq,
                result: Ok(self.relay.handle_upload(r, now)),
            },
            Request::Poll(r) => Response::Poll(Ok(self.relay.handle_poll(&r))),
            Request::Download(r) => Response::Download {
                result: Ok(self.relay.handle_download(&r)),
                file_name: r.file_name,
            },
            Request::ListUsers => Response::Users(Ok(self.relay.users())),
        }
    }

    fn push_response(&mut self, time: u64, client: &str, response: Response) {
        self.push_event(
            time,
            EventType::ResponseArrival {
                client: client.to_string(),
                response,
            },
        );
    }

    fn sample_latency(&mut self) -> u64 {
        let min = self.link.min_latency;
        let max = self.link.max_latency.max(min);
        self.rng.random_range(min..=max)
    }
}

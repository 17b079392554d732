//! Built-in scenarios with two toy requests.
//!
//! `AnswerToLife` is answered with `42`, `Double` with twice its input. Each
//! scenario builds its endpoints around a `Scripted` actor, runs them with
//! `run_scenario` and returns what happened as a list of `Event`s in the
//! order they were recorded.

use crate::channel::{ChannelHandle, HandlerRegistry, Pumping, Request};
use crate::harness::{run_scenario, Actor, Endpoint, EndpointContext, EndpointOptions};
use crate::transport::{ChannelDirectory, ChannelMode, ChannelName};
use crate::{Result, TandemError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Answered with `42`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AnswerToLife;

impl Request for AnswerToLife {
    const NAME: &'static str = "answer_to_life";
    type Reply = i32;
}

/// Answered with `value * 2`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Double {
    pub value: i32,
}

impl Request for Double {
    const NAME: &'static str = "double";
    type Reply = i32;
}

/// How a send in a scenario ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallResult {
    Value(i32),
    Rejected,
    Closed,
    Shutdown,
}

impl CallResult {
    fn from_result(result: &Result<i32>) -> Self {
        match result {
            Ok(value) => CallResult::Value(*value),
            Err(TandemError::PeerRejected { .. }) => CallResult::Rejected,
            Err(TandemError::Shutdown { .. }) => CallResult::Shutdown,
            Err(_) => CallResult::Closed,
        }
    }

    /// The out-value; `0` unless the peer answered.
    pub fn answer(&self) -> i32 {
        match self {
            CallResult::Value(value) => *value,
            _ => 0,
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self, CallResult::Value(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A handler answered `request`.
    Answered { endpoint: String, request: String },
    /// A send of `request` returned.
    Returned {
        endpoint: String,
        request: String,
        result: CallResult,
    },
}

/// Shared, ordered record of scenario events.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: Event) {
        debug!("{:?}", event);
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    fn answered(&self, endpoint: &str, request: &str) {
        self.record(Event::Answered {
            endpoint: endpoint.to_string(),
            request: request.to_string(),
        });
    }

    fn returned(&self, endpoint: &str, request: &str, result: CallResult) {
        self.record(Event::Returned {
            endpoint: endpoint.to_string(),
            request: request.to_string(),
            result,
        });
    }
}

/// A request a scripted actor sends from `run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outgoing {
    AnswerToLife,
    Double(i32),
}

/// How a scripted actor answers `AnswerToLife`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerMode {
    Immediate,
    /// Park the reply and send it from a task posted to the listener loop.
    Delayed,
    Fail,
}

/// How a scripted actor answers `Double`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoubleMode {
    Immediate,
    /// Call `AnswerToLife` back on the peer (pumping) before answering.
    NestedAnswer,
}

/// When a scripted actor signals done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneWhen {
    AfterRun,
    /// After its handlers have answered this many requests.
    AfterAnswers(usize),
}

/// Configurable actor used by every built-in scenario.
#[derive(Debug, Clone)]
pub struct Scripted {
    log: EventLog,
    answer: Option<AnswerMode>,
    double: Option<DoubleMode>,
    sends: Vec<(Outgoing, Pumping)>,
    done: DoneWhen,
}

impl Scripted {
    pub fn new(log: &EventLog) -> Self {
        Self {
            log: log.clone(),
            answer: None,
            double: None,
            sends: Vec::new(),
            done: DoneWhen::AfterRun,
        }
    }

    pub fn answers(mut self, mode: AnswerMode) -> Self {
        self.answer = Some(mode);
        self
    }

    pub fn doubles(mut self, mode: DoubleMode) -> Self {
        self.double = Some(mode);
        self
    }

    pub fn sends(mut self, request: Outgoing, pumping: Pumping) -> Self {
        self.sends.push((request, pumping));
        self
    }

    pub fn done_when(mut self, done: DoneWhen) -> Self {
        self.done = done;
        self
    }
}

/// Counts answered requests and signals done at the target.
#[derive(Clone)]
struct AnswerCounter {
    answered: Arc<AtomicUsize>,
    target: Option<usize>,
    endpoint: EndpointContext,
}

impl AnswerCounter {
    fn bump(&self) {
        let answered = self.answered.fetch_add(1, Ordering::SeqCst) + 1;
        if self.target == Some(answered) {
            self.endpoint.done();
        }
    }
}

impl Actor for Scripted {
    fn register_handlers(&self, handlers: &mut HandlerRegistry, endpoint: &EndpointContext) {
        let counter = AnswerCounter {
            answered: Arc::new(AtomicUsize::new(0)),
            target: match self.done {
                DoneWhen::AfterAnswers(count) => Some(count),
                DoneWhen::AfterRun => None,
            },
            endpoint: endpoint.clone(),
        };

        if let Some(mode) = self.answer {
            let log = self.log.clone();
            let counter = counter.clone();
            let label = endpoint.label().to_string();
            let listener = endpoint.listener_loop().clone();
            handlers.on_request(AnswerToLife::NAME, move |_, _, reply| match mode {
                AnswerMode::Immediate => {
                    log.answered(&label, AnswerToLife::NAME);
                    if let Err(e) = reply.send(json!(42)) {
                        warn!("{}: answer not delivered: {}", label, e);
                    }
                    counter.bump();
                }
                AnswerMode::Fail => {
                    log.answered(&label, AnswerToLife::NAME);
                    if let Err(e) = reply.send_error("declined") {
                        warn!("{}: failure not delivered: {}", label, e);
                    }
                    counter.bump();
                }
                AnswerMode::Delayed => {
                    let log = log.clone();
                    let counter = counter.clone();
                    let label = label.clone();
                    listener.post_task(move || {
                        log.answered(&label, AnswerToLife::NAME);
                        if let Err(e) = reply.send(json!(42)) {
                            warn!("{}: delayed answer not delivered: {}", label, e);
                        }
                        counter.bump();
                    });
                }
            });
        }

        if let Some(mode) = self.double {
            let log = self.log.clone();
            let label = endpoint.label().to_string();
            handlers.on_request(Double::NAME, move |channel, request, reply| {
                let value = request.payload["value"].as_i64().unwrap_or_default() as i32;
                if mode == DoubleMode::NestedAnswer {
                    let result = channel.call(&AnswerToLife, Pumping::Enabled);
                    log.returned(&label, AnswerToLife::NAME, CallResult::from_result(&result));
                }
                log.answered(&label, Double::NAME);
                if let Err(e) = reply.send(json!(value * 2)) {
                    warn!("{}: double not delivered: {}", label, e);
                }
                counter.bump();
            });
        }
    }

    fn run(&mut self, channel: &ChannelHandle, endpoint: &EndpointContext) {
        for (request, pumping) in &self.sends {
            let (name, result) = match request {
                Outgoing::AnswerToLife => (AnswerToLife::NAME, channel.call(&AnswerToLife, *pumping)),
                Outgoing::Double(value) => (Double::NAME, channel.call(&Double { value: *value }, *pumping)),
            };
            self.log
                .returned(endpoint.label(), name, CallResult::from_result(&result));
        }
        if self.done == DoneWhen::AfterRun {
            endpoint.done();
        }
    }
}

/// A built-in scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// The server calls `AnswerToLife` on the client.
    Simple(Pumping),
    /// The client calls `AnswerToLife`; the server answers `42`.
    Answer,
    /// The server rejects `AnswerToLife`.
    Rejected,
    /// The client's pumped `Double(5)` triggers a nested `AnswerToLife`.
    Nested,
    /// No server; the client's call fails with a closed channel.
    NoServer,
    /// The server answers from a posted task after the handler returned.
    Delayed,
    /// Both endpoints run on one listener loop.
    SharedLoop,
}

impl Scenario {
    pub fn all() -> Vec<Scenario> {
        vec![
            Scenario::Simple(Pumping::Disabled),
            Scenario::Simple(Pumping::Enabled),
            Scenario::Answer,
            Scenario::Rejected,
            Scenario::Nested,
            Scenario::NoServer,
            Scenario::Delayed,
            Scenario::SharedLoop,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Scenario::Simple(Pumping::Disabled) => "simple",
            Scenario::Simple(Pumping::Enabled) => "simple-pumping",
            Scenario::Answer => "answer",
            Scenario::Rejected => "rejected",
            Scenario::Nested => "nested",
            Scenario::NoServer => "no-server",
            Scenario::Delayed => "delayed",
            Scenario::SharedLoop => "shared-loop",
        }
    }

    /// Run the scenario and return its events.
    pub fn run(&self) -> Result<Vec<Event>> {
        match self {
            Scenario::Simple(pumping) => simple(*pumping),
            Scenario::Answer => answer(),
            Scenario::Rejected => rejected(),
            Scenario::Nested => nested(),
            Scenario::NoServer => no_server(),
            Scenario::Delayed => delayed(),
            Scenario::SharedLoop => shared_loop(),
        }
    }
}

fn endpoint(channel: &str, label: &str, mode: ChannelMode, directory: &Arc<ChannelDirectory>, actor: Scripted) -> Endpoint {
    Endpoint::new(
        EndpointOptions::new(ChannelName::new(channel), mode).with_label(label),
        Arc::clone(directory),
        actor,
    )
}

/// Server asks, client answers.
pub fn simple(pumping: Pumping) -> Result<Vec<Event>> {
    let log = EventLog::new();
    let directory = Arc::new(ChannelDirectory::new());
    run_scenario(vec![
        endpoint(
            "simple",
            "simple_server",
            ChannelMode::Server,
            &directory,
            Scripted::new(&log).sends(Outgoing::AnswerToLife, pumping),
        ),
        endpoint(
            "simple",
            "simple_client",
            ChannelMode::Client,
            &directory,
            Scripted::new(&log)
                .answers(AnswerMode::Immediate)
                .done_when(DoneWhen::AfterAnswers(1)),
        ),
    ])?;
    Ok(log.events())
}

fn client_asks(channel: &str, server: Scripted, client: Scripted) -> Result<()> {
    let directory = Arc::new(ChannelDirectory::new());
    run_scenario(vec![
        endpoint(
            channel,
            &format!("{}_server", channel),
            ChannelMode::Server,
            &directory,
            server,
        ),
        endpoint(
            channel,
            &format!("{}_client", channel),
            ChannelMode::Client,
            &directory,
            client,
        ),
    ])
}

/// Client asks `AnswerToLife` without pumping; server answers `42`.
pub fn answer() -> Result<Vec<Event>> {
    let log = EventLog::new();
    client_asks(
        "answer",
        Scripted::new(&log)
            .answers(AnswerMode::Immediate)
            .done_when(DoneWhen::AfterAnswers(1)),
        Scripted::new(&log).sends(Outgoing::AnswerToLife, Pumping::Disabled),
    )?;
    Ok(log.events())
}

/// Server answers `AnswerToLife` with a failure.
pub fn rejected() -> Result<Vec<Event>> {
    let log = EventLog::new();
    client_asks(
        "rejected",
        Scripted::new(&log)
            .answers(AnswerMode::Fail)
            .done_when(DoneWhen::AfterAnswers(1)),
        Scripted::new(&log).sends(Outgoing::AnswerToLife, Pumping::Disabled),
    )?;
    Ok(log.events())
}

/// Client sends `Double(5)` with pumping; the server's handler first calls
/// `AnswerToLife` back on the client.
pub fn nested() -> Result<Vec<Event>> {
    let log = EventLog::new();
    client_asks(
        "nested",
        Scripted::new(&log)
            .doubles(DoubleMode::NestedAnswer)
            .done_when(DoneWhen::AfterAnswers(1)),
        Scripted::new(&log)
            .answers(AnswerMode::Immediate)
            .sends(Outgoing::Double(5), Pumping::Enabled),
    )?;
    Ok(log.events())
}

/// Client with no server behind its channel name.
pub fn no_server() -> Result<Vec<Event>> {
    let log = EventLog::new();
    let directory = Arc::new(ChannelDirectory::new());
    run_scenario(vec![endpoint(
        "no_server",
        "no_server_client",
        ChannelMode::Client,
        &directory,
        Scripted::new(&log).sends(Outgoing::AnswerToLife, Pumping::Disabled),
    )])?;
    Ok(log.events())
}

/// Server parks the reply and answers from a posted task.
pub fn delayed() -> Result<Vec<Event>> {
    let log = EventLog::new();
    client_asks(
        "delayed",
        Scripted::new(&log)
            .answers(AnswerMode::Delayed)
            .done_when(DoneWhen::AfterAnswers(1)),
        Scripted::new(&log).sends(Outgoing::AnswerToLife, Pumping::Disabled),
    )?;
    Ok(log.events())
}

/// Server and client share the server's listener loop. The client has to
/// pump, or the server's handler could never run while it waits.
pub fn shared_loop() -> Result<Vec<Event>> {
    let log = EventLog::new();
    let directory = Arc::new(ChannelDirectory::new());
    let mut server = endpoint(
        "shared_loop",
        "shared_loop_server",
        ChannelMode::Server,
        &directory,
        Scripted::new(&log)
            .answers(AnswerMode::Immediate)
            .done_when(DoneWhen::AfterAnswers(1)),
    );
    let mut client = endpoint(
        "shared_loop",
        "shared_loop_client",
        ChannelMode::Client,
        &directory,
        Scripted::new(&log).sends(Outgoing::AnswerToLife, Pumping::Enabled),
    );

    let started = server
        .start()
        .and_then(|_| server.wait_for_channel_creation())
        .and_then(|_| {
            client.share_listener_loop(&server);
            client.start()
        });
    match &started {
        Ok(()) => {
            client.wait_done();
            server.wait_done();
        }
        Err(_) => {
            client.shutdown_signal().signal();
            server.shutdown_signal().signal();
        }
    }

    // The client runs on the server's loop, so it goes first.
    client.shutdown();
    server.shutdown();
    started?;
    Ok(log.events())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_result_answer_defaults_to_zero() {
        assert_eq!(CallResult::Value(42).answer(), 42);
        assert_eq!(CallResult::Rejected.answer(), 0);
        assert_eq!(CallResult::Closed.answer(), 0);
        assert!(!CallResult::Shutdown.succeeded());
    }

    #[test]
    fn test_call_result_classifies_errors() {
        let rejected: Result<i32> = Err(TandemError::PeerRejected {
            name: "double".into(),
            message: "no".into(),
        });
        assert_eq!(CallResult::from_result(&rejected), CallResult::Rejected);
        let closed: Result<i32> = Err(TandemError::channel_closed("x"));
        assert_eq!(CallResult::from_result(&closed), CallResult::Closed);
    }

    #[test]
    fn test_scenario_names_are_unique() {
        let mut names: Vec<_> = Scenario::all().iter().map(Scenario::name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Scenario::all().len());
    }

    #[test]
    fn test_unit_request_serializes() {
        assert_eq!(serde_json::to_value(AnswerToLife).unwrap(), serde_json::Value::Null);
        assert_eq!(
            serde_json::to_value(Double { value: 5 }).unwrap(),
            json!({ "value": 5 })
        );
    }
}

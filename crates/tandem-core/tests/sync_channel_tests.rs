//! Integration tests for blocking sends, pumping, close and shutdown.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tandem_core::{
    run_scenario, Actor, ChannelDirectory, ChannelHandle, ChannelMode, ChannelName, DelayedReply,
    Endpoint, EndpointContext, EndpointOptions, EndpointState, HandlerRegistry, Pumping,
    TandemError,
};

type Log = Arc<Mutex<Vec<String>>>;

fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn push(log: &Log, entry: impl Into<String>) {
    log.lock().push(entry.into());
}

fn describe(result: &Result<Value, TandemError>) -> String {
    match result {
        Ok(value) => format!("ok {}", value),
        Err(TandemError::ChannelClosed { .. }) => "closed".to_string(),
        Err(TandemError::PeerRejected { .. }) => "rejected".to_string(),
        Err(TandemError::Shutdown { .. }) => "shutdown".to_string(),
        Err(other) => format!("error {}", other),
    }
}

fn pair(
    name: &str,
    server: impl Actor,
    client: impl Actor,
) -> Vec<Endpoint> {
    let directory = Arc::new(ChannelDirectory::new());
    vec![
        Endpoint::new(
            EndpointOptions::new(ChannelName::new(name), ChannelMode::Server)
                .with_label(format!("{}_server", name)),
            Arc::clone(&directory),
            server,
        ),
        Endpoint::new(
            EndpointOptions::new(ChannelName::new(name), ChannelMode::Client)
                .with_label(format!("{}_client", name)),
            directory,
            client,
        ),
    ]
}

/// Runs `run` from `Actor::run` and installs `register` as its handlers.
struct FnActor<R, H> {
    run: R,
    register: H,
}

impl<R, H> Actor for FnActor<R, H>
where
    R: FnMut(&ChannelHandle, &EndpointContext) + Send + 'static,
    H: Fn(&mut HandlerRegistry, &EndpointContext) + Send + 'static,
{
    fn register_handlers(&self, handlers: &mut HandlerRegistry, endpoint: &EndpointContext) {
        (self.register)(handlers, endpoint);
    }

    fn run(&mut self, channel: &ChannelHandle, endpoint: &EndpointContext) {
        (self.run)(channel, endpoint);
    }
}

fn actor<R, H>(run: R, register: H) -> FnActor<R, H>
where
    R: FnMut(&ChannelHandle, &EndpointContext) + Send + 'static,
    H: Fn(&mut HandlerRegistry, &EndpointContext) + Send + 'static,
{
    FnActor { run, register }
}

fn no_handlers(_: &mut HandlerRegistry, _: &EndpointContext) {}

#[test]
fn test_single_send_returns() {
    let results = log();
    let recorded = Arc::clone(&results);

    let server = actor(
        |_: &ChannelHandle, _: &EndpointContext| {},
        |handlers: &mut HandlerRegistry, endpoint: &EndpointContext| {
            let endpoint = endpoint.clone();
            handlers.on_call("echo", move |_, payload| {
                endpoint.done();
                Ok(payload)
            });
        },
    );
    let client = actor(
        move |channel: &ChannelHandle, endpoint: &EndpointContext| {
            let result = channel.send("echo", json!({"n": 1}), Pumping::Disabled);
            push(&recorded, describe(&result));
            endpoint.done();
        },
        no_handlers,
    );

    run_scenario(pair("p1_echo", server, client)).unwrap();

    assert_eq!(*results.lock(), vec![r#"ok {"n":1}"#.to_string()]);
}

#[test]
fn test_close_resolves_every_nested_call() {
    let results = log();

    // client: double (pumping) -> server: answer (pumping) -> client: hold (pumping)
    // -> server closes its channel while all three calls are outstanding.
    let server_log = Arc::clone(&results);
    let server = actor(
        |_: &ChannelHandle, _: &EndpointContext| {},
        move |handlers: &mut HandlerRegistry, endpoint: &EndpointContext| {
            let log = Arc::clone(&server_log);
            let done = endpoint.clone();
            handlers.on_request("double", move |channel, _, reply| {
                let result = channel.send("answer", Value::Null, Pumping::Enabled);
                push(&log, format!("server answer {}", describe(&result)));
                drop(reply);
                done.done();
            });
            let closer = endpoint.clone();
            handlers.on_request("hold", move |_, _, reply| {
                closer.close_channel();
                drop(reply);
            });
        },
    );

    let client_log = Arc::clone(&results);
    let client_handler_log = Arc::clone(&results);
    let client = actor(
        move |channel: &ChannelHandle, endpoint: &EndpointContext| {
            let result = channel.send("double", json!(5), Pumping::Enabled);
            push(&client_log, format!("client double {}", describe(&result)));
            push(&client_log, format!("client pending {}", channel.pending_calls()));
            endpoint.done();
        },
        move |handlers: &mut HandlerRegistry, _: &EndpointContext| {
            let log = Arc::clone(&client_handler_log);
            handlers.on_request("answer", move |channel, _, reply| {
                let result = channel.send("hold", Value::Null, Pumping::Enabled);
                push(&log, format!("client hold {}", describe(&result)));
                let _ = reply.send(json!(42));
            });
        },
    );

    run_scenario(pair("p2_nested_close", server, client)).unwrap();

    let results = results.lock().clone();
    assert!(results.contains(&"server answer closed".to_string()));
    let client_only: Vec<_> = results
        .iter()
        .filter(|entry| entry.starts_with("client"))
        .cloned()
        .collect();
    assert_eq!(
        client_only,
        vec![
            "client hold closed".to_string(),
            "client double closed".to_string(),
            "client pending 0".to_string(),
        ]
    );
}

#[test]
fn test_nested_call_inside_pumped_send() {
    let results = log();
    let recorded = Arc::clone(&results);

    let server = actor(
        |_: &ChannelHandle, _: &EndpointContext| {},
        |handlers: &mut HandlerRegistry, endpoint: &EndpointContext| {
            let endpoint = endpoint.clone();
            handlers.on_request("outer", move |channel, _, reply| {
                let inner = channel.send("inner", json!(1), Pumping::Enabled).unwrap();
                let _ = reply.send(json!(inner.as_i64().unwrap_or_default() + 100));
                endpoint.done();
            });
        },
    );
    let client = actor(
        move |channel: &ChannelHandle, endpoint: &EndpointContext| {
            let result = channel.send("outer", Value::Null, Pumping::Enabled);
            push(&recorded, describe(&result));
            endpoint.done();
        },
        |handlers: &mut HandlerRegistry, _: &EndpointContext| {
            handlers.on_call("inner", |_, payload| {
                Ok(json!(payload.as_i64().unwrap_or_default() + 1))
            });
        },
    );

    run_scenario(pair("p3_reentrant", server, client)).unwrap();

    assert_eq!(*results.lock(), vec!["ok 102".to_string()]);
}

#[test]
fn test_blocking_send_defers_other_work() {
    let results = log();

    let server_log = Arc::clone(&results);
    let note_log = Arc::clone(&results);
    let server = actor(
        move |channel: &ChannelHandle, endpoint: &EndpointContext| {
            let log = Arc::clone(&server_log);
            endpoint
                .listener_loop()
                .post_task(move || push(&log, "queued task"));
            let result = channel.send("answer", Value::Null, Pumping::Disabled);
            push(&server_log, format!("returned {}", describe(&result)));
        },
        move |handlers: &mut HandlerRegistry, endpoint: &EndpointContext| {
            let log = Arc::clone(&note_log);
            let endpoint = endpoint.clone();
            handlers.on_message("note", move |_, message| {
                push(&log, format!("note {}", message.payload));
                if message.payload == json!(3) {
                    endpoint.done();
                }
            });
        },
    );
    let client = actor(
        |_: &ChannelHandle, _: &EndpointContext| {},
        |handlers: &mut HandlerRegistry, endpoint: &EndpointContext| {
            let endpoint = endpoint.clone();
            handlers.on_request("answer", move |channel, _, reply| {
                for n in 1..=3 {
                    channel.post("note", json!(n)).unwrap();
                }
                reply.send(json!(42)).unwrap();
                endpoint.done();
            });
        },
    );

    run_scenario(pair("p4_blocking", server, client)).unwrap();

    assert_eq!(
        *results.lock(),
        vec![
            "returned ok 42".to_string(),
            "queued task".to_string(),
            "note 1".to_string(),
            "note 2".to_string(),
            "note 3".to_string(),
        ]
    );
}

#[test]
fn test_pumping_send_runs_queued_work() {
    let results = log();

    // The client only answers once the server's queued task has run, which
    // can only happen while the server pumps.
    let server_log = Arc::clone(&results);
    let server = actor(
        move |channel: &ChannelHandle, endpoint: &EndpointContext| {
            let log = Arc::clone(&server_log);
            let release = channel.clone();
            endpoint.listener_loop().post_task(move || {
                push(&log, "queued task");
                release.post("release", Value::Null).unwrap();
            });
            let result = channel.send("answer", Value::Null, Pumping::Enabled);
            push(&server_log, format!("returned {}", describe(&result)));
            endpoint.done();
        },
        no_handlers,
    );
    let client = actor(
        |_: &ChannelHandle, _: &EndpointContext| {},
        |handlers: &mut HandlerRegistry, endpoint: &EndpointContext| {
            let parked: Arc<Mutex<Option<DelayedReply>>> = Arc::new(Mutex::new(None));
            let park = Arc::clone(&parked);
            handlers.on_request("answer", move |_, _, reply| {
                *park.lock() = Some(reply);
            });
            let endpoint = endpoint.clone();
            handlers.on_message("release", move |_, _| {
                if let Some(reply) = parked.lock().take() {
                    reply.send(json!(42)).unwrap();
                }
                endpoint.done();
            });
        },
    );

    run_scenario(pair("p4_pumping", server, client)).unwrap();

    assert_eq!(
        *results.lock(),
        vec!["queued task".to_string(), "returned ok 42".to_string()]
    );
}

#[test]
fn test_delayed_reply_after_channel_reset_is_reported() {
    let results = log();
    let parked: Arc<Mutex<Option<DelayedReply>>> = Arc::new(Mutex::new(None));

    let server_log = Arc::clone(&results);
    let server_parked = Arc::clone(&parked);
    let server = actor(
        |_: &ChannelHandle, _: &EndpointContext| {},
        move |handlers: &mut HandlerRegistry, endpoint: &EndpointContext| {
            let parked = Arc::clone(&server_parked);
            let log = Arc::clone(&server_log);
            let endpoint = endpoint.clone();
            handlers.on_request("slow", move |_, _, reply| {
                *parked.lock() = Some(reply);
                let parked = Arc::clone(&parked);
                let log = Arc::clone(&log);
                let later = endpoint.clone();
                endpoint.listener_loop().post_task(move || {
                    later.reset_channel();
                    let reply = parked.lock().take().unwrap();
                    match reply.send(json!("late")) {
                        Err(TandemError::ProtocolViolation { .. }) => push(&log, "reported"),
                        other => push(&log, format!("unexpected {:?}", other)),
                    }
                    later.done();
                });
            });
        },
    );

    let client_log = Arc::clone(&results);
    let client = actor(
        move |channel: &ChannelHandle, endpoint: &EndpointContext| {
            let result = channel.send("slow", Value::Null, Pumping::Disabled);
            push(&client_log, format!("client {}", describe(&result)));
            endpoint.done();
        },
        no_handlers,
    );

    run_scenario(pair("delayed_after_reset", server, client)).unwrap();

    let mut results = results.lock().clone();
    results.sort();
    assert_eq!(
        results,
        vec!["client closed".to_string(), "reported".to_string()]
    );
}

#[test]
fn test_anonymous_channel() {
    let results = log();
    let recorded = Arc::clone(&results);
    let name = ChannelName::anonymous();
    let directory = Arc::new(ChannelDirectory::new());

    let server = actor(
        |_: &ChannelHandle, _: &EndpointContext| {},
        |handlers: &mut HandlerRegistry, endpoint: &EndpointContext| {
            let endpoint = endpoint.clone();
            handlers.on_call("ping", move |_, _| {
                endpoint.done();
                Ok(json!("pong"))
            });
        },
    );
    let client = actor(
        move |channel: &ChannelHandle, endpoint: &EndpointContext| {
            push(&recorded, describe(&channel.send("ping", Value::Null, Pumping::Disabled)));
            endpoint.done();
        },
        no_handlers,
    );

    run_scenario(vec![
        Endpoint::new(
            EndpointOptions::new(name.clone(), ChannelMode::Server).with_label("anon_server"),
            Arc::clone(&directory),
            server,
        ),
        Endpoint::new(
            EndpointOptions::new(name, ChannelMode::Client).with_label("anon_client"),
            Arc::clone(&directory),
            client,
        ),
    ])
    .unwrap();

    assert_eq!(*results.lock(), vec![r#"ok "pong""#.to_string()]);
    assert!(directory.is_empty());
}

/// Posts a task from its destructor, which runs during shutdown phase one.
struct DrainProbe {
    log: Log,
    listener: Option<tandem_core::LoopHandle>,
}

impl Actor for DrainProbe {
    fn run(&mut self, _channel: &ChannelHandle, endpoint: &EndpointContext) {
        self.listener = Some(endpoint.listener_loop().clone());
        endpoint.done();
    }
}

impl Drop for DrainProbe {
    fn drop(&mut self) {
        push(&self.log, "actor dropped");
        if let Some(listener) = &self.listener {
            let log = Arc::clone(&self.log);
            listener.post_task(move || push(&log, "drained"));
        }
    }
}

#[test]
fn test_shutdown_drains_listener_loop() {
    let results = log();
    let mut endpoint = Endpoint::new(
        EndpointOptions::new(ChannelName::new("p5_drain"), ChannelMode::Server),
        Arc::new(ChannelDirectory::new()),
        DrainProbe {
            log: Arc::clone(&results),
            listener: None,
        },
    );

    endpoint.start().unwrap();
    endpoint.wait_for_channel_creation().unwrap();
    endpoint.wait_done();
    let listener = endpoint.listener_handle().unwrap();
    endpoint.shutdown();

    assert_eq!(endpoint.state(), EndpointState::Stopped);
    assert_eq!(
        *results.lock(),
        vec!["actor dropped".to_string(), "drained".to_string()]
    );
    assert!(!listener.post_task(|| {}));
}

#[test]
#[should_panic(expected = "cannot move from Stopped")]
fn test_second_shutdown_is_fatal() {
    let mut endpoints = pair(
        "p5_double",
        actor(
            |_: &ChannelHandle, endpoint: &EndpointContext| endpoint.done(),
            no_handlers,
        ),
        actor(
            |_: &ChannelHandle, endpoint: &EndpointContext| endpoint.done(),
            no_handlers,
        ),
    );
    let mut client = endpoints.pop().unwrap();
    let mut server = endpoints.pop().unwrap();
    server.start().unwrap();
    server.wait_for_channel_creation().unwrap();
    client.start().unwrap();
    client.wait_done();
    server.wait_done();
    client.shutdown();
    server.shutdown();

    server.shutdown();
}

#[test]
fn test_shutdown_signal_releases_blocked_send() {
    let results = log();
    let recorded = Arc::clone(&results);

    // Server never answers; the test fires the client's shutdown signal.
    let server = actor(
        |_: &ChannelHandle, endpoint: &EndpointContext| endpoint.done(),
        |handlers: &mut HandlerRegistry, _: &EndpointContext| {
            handlers.on_request("never", |_, _, reply| std::mem::forget(reply));
        },
    );
    let client = actor(
        move |channel: &ChannelHandle, endpoint: &EndpointContext| {
            let result = channel.send("never", Value::Null, Pumping::Enabled);
            push(&recorded, describe(&result));
            endpoint.done();
        },
        no_handlers,
    );

    let mut endpoints = pair("shutdown_signal", server, client);
    let mut client = endpoints.pop().unwrap();
    let mut server = endpoints.pop().unwrap();
    server.start().unwrap();
    server.wait_for_channel_creation().unwrap();
    client.start().unwrap();
    server.wait_done();

    client.shutdown_signal().signal();
    client.wait_done();

    client.shutdown();
    server.shutdown();
    assert_eq!(*results.lock(), vec!["shutdown".to_string()]);
}

//! Graph lifecycle: predefined graphs, timers, graceful stop with path
//! draining, connection-scoped teardown, and foreign-thread hand-off.

use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use plexus::{
    AddonRegistry, App, AppConfig, Destination, Extension, ExtensionContext, GraphDefinition,
    Message, StatusCode,
};

const WAIT: Duration = Duration::from_secs(5);

struct Greeter;

impl Extension for Greeter {
    fn on_cmd(&mut self, ctx: &mut ExtensionContext, cmd: Message) -> anyhow::Result<()> {
        let mut reply = Message::result_for(&cmd, StatusCode::Ok);
        reply.set_detail("hello world, too");
        ctx.return_result(reply)?;
        Ok(())
    }
}

/// Sends one last command from its stop hook and reports the answer.
struct Farewell {
    answers: Sender<String>,
}

impl Extension for Farewell {
    fn on_cmd(&mut self, _ctx: &mut ExtensionContext, _cmd: Message) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_stop(&mut self, ctx: &mut ExtensionContext) -> anyhow::Result<()> {
        let answers = self.answers.clone();
        ctx.send_cmd(Message::cmd("goodbye"), move |_ctx, result| {
            let detail = result.detail().unwrap_or("<none>").to_string();
            let _ = answers.send(detail);
        })?;
        Ok(())
    }
}

/// Arms a bounded timer at start and emits a data message per firing.
struct Ticker;

impl Extension for Ticker {
    fn on_start(&mut self, ctx: &mut ExtensionContext) -> anyhow::Result<()> {
        ctx.start_timer("tick", Duration::from_millis(50), Some(2))?;
        Ok(())
    }

    fn on_cmd(&mut self, _ctx: &mut ExtensionContext, _cmd: Message) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_timer(&mut self, ctx: &mut ExtensionContext, _timeout: Message) -> anyhow::Result<()> {
        ctx.send_data(Message::data("tick_evt"))?;
        Ok(())
    }
}

/// Reports every data message it sees onto a channel.
struct Probe {
    events: Sender<String>,
}

impl Extension for Probe {
    fn on_cmd(&mut self, _ctx: &mut ExtensionContext, _cmd: Message) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_data(&mut self, _ctx: &mut ExtensionContext, data: Message) -> anyhow::Result<()> {
        self.events.send(data.name.clone())?;
        Ok(())
    }
}

/// Answers from a foreign thread, exercising lock mode and the notify
/// queue instead of replying inline.
struct Offloader;

impl Extension for Offloader {
    fn on_cmd(&mut self, ctx: &mut ExtensionContext, cmd: Message) -> anyhow::Result<()> {
        let handle = ctx.foreign_handle()?;
        let me = ctx.extension_name().to_string();
        std::thread::spawn(move || {
            let group = {
                let mut guard = handle.lock_mode().expect("lock mode");
                let name = guard
                    .with(|core| core.group_name().to_string())
                    .expect("core access");
                guard.release().expect("release");
                name
            };
            let result = handle.post(move |core| {
                let delivered = core.with_extension(&me, |_ext, ctx| {
                    let reply = Message::result_for(&cmd, StatusCode::Ok)
                        .with_property("group", json!(group));
                    if let Err(err) = ctx.return_result(reply) {
                        eprintln!("offloader could not answer: {err}");
                    }
                });
                assert!(delivered.is_some());
            });
            if let Err(err) = result {
                eprintln!("offloader post failed: {err}");
            }
        });
        Ok(())
    }
}

fn registry(answers: Sender<String>, events: Sender<String>) -> Arc<AddonRegistry> {
    let registry = AddonRegistry::new();
    registry.register("greeter", |_, _| Ok(Box::new(Greeter)));
    registry.register("ticker", |_, _| Ok(Box::new(Ticker)));
    registry.register("offloader", |_, _| Ok(Box::new(Offloader)));
    registry.register("farewell", move |_, _| {
        Ok(Box::new(Farewell {
            answers: answers.clone(),
        }))
    });
    registry.register("probe", move |_, _| {
        Ok(Box::new(Probe {
            events: events.clone(),
        }))
    });
    Arc::new(registry)
}

fn app() -> (App, mpsc::Receiver<String>, mpsc::Receiver<String>) {
    let (answers_tx, answers_rx) = mpsc::channel();
    let (events_tx, events_rx) = mpsc::channel();
    let app = App::new(AppConfig::default(), registry(answers_tx, events_tx))
        .expect("app should start");
    (app, answers_rx, events_rx)
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let until = Instant::now() + deadline;
    while Instant::now() < until {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    check()
}

#[test]
fn test_predefined_singleton_answers_under_reserved_id() {
    let yaml = r#"
predefined_graphs:
  - name: main
    auto_start: true
    singleton: true
    graph:
      nodes:
        - name: hello
          addon: greeter
"#;
    let config = AppConfig::from_yaml(yaml).expect("config parses");
    let (answers_tx, _answers_rx) = mpsc::channel();
    let (events_tx, _events_rx) = mpsc::channel();
    let app = App::new(config, registry(answers_tx, events_tx)).expect("app should start");
    assert_eq!(app.running_graphs().len(), 1);

    let conn = app.connect();
    let cmd = Message::cmd("hello").with_dest(Destination::extension("hello").in_graph("default"));
    let reply = conn.request(cmd, WAIT).expect("hello should answer");
    assert_eq!(reply.status_code, Some(StatusCode::Ok));
    assert_eq!(reply.properties["detail"], json!("hello world, too"));
}

#[test]
fn test_stop_drains_commands_sent_from_stop_hooks() {
    let (app, answers_rx, _events) = app();
    let definition = GraphDefinition::from_yaml(
        r#"
nodes:
  - name: last_word
    addon: farewell
  - name: hello
    addon: greeter
connections:
  - extension: last_word
    cmd:
      - name: goodbye
        dest:
          - extension: hello
"#,
    )
    .expect("definition parses");
    let graph_id = app.start_graph(definition, false).expect("graph starts");

    app.stop_graph(&graph_id).expect("graph stops");
    // The farewell command completed before the engine went away.
    let answer = answers_rx
        .recv_timeout(Duration::from_secs(1))
        .expect("stop hook got its reply");
    assert_eq!(answer, "hello world, too");
    assert!(app.running_graphs().is_empty());
}

#[test]
fn test_second_stop_reports_graph_not_found() {
    let (app, _answers, _events) = app();
    let definition = GraphDefinition::from_yaml("nodes:\n  - name: hello\n    addon: greeter\n")
        .expect("definition parses");
    let graph_id = app.start_graph(definition, false).expect("graph starts");

    app.stop_graph(&graph_id).expect("first stop succeeds");
    let err = app.stop_graph(&graph_id).expect_err("second stop fails");
    assert_eq!(err.to_string(), "Graph not found.");
}

#[test]
fn test_bounded_timer_fires_exactly_n_times() {
    let (app, _answers, events_rx) = app();
    let definition = GraphDefinition::from_yaml(
        r#"
nodes:
  - name: clock
    addon: ticker
  - name: watcher
    addon: probe
connections:
  - extension: clock
    data:
      - name: tick_evt
        dest:
          - extension: watcher
"#,
    )
    .expect("definition parses");
    app.start_graph(definition, false).expect("graph starts");

    for _ in 0..2 {
        let event = events_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("timer fired");
        assert_eq!(event, "tick_evt");
    }
    // repeat = 2: no third firing.
    assert!(events_rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn test_connection_scoped_graph_stops_with_its_owner() {
    let (app, _answers, _events) = app();
    let conn = app.connect();
    let reply = conn
        .request(
            Message::cmd("start_graph").with_property(
                "nodes",
                json!([{"name": "hello", "addon": "greeter"}]),
            ),
            WAIT,
        )
        .expect("start_graph should answer");
    assert_eq!(reply.status_code, Some(StatusCode::Ok));
    assert_eq!(app.running_graphs().len(), 1);

    drop(conn);
    assert!(
        wait_until(Duration::from_secs(3), || app.running_graphs().is_empty()),
        "graph should stop once its owning connection closes"
    );
}

#[test]
fn test_long_running_graph_survives_its_starter() {
    let (app, _answers, _events) = app();
    let conn = app.connect();
    let reply = conn
        .request(
            Message::cmd("start_graph")
                .with_property(
                    "nodes",
                    json!([{"name": "hello", "addon": "greeter"}]),
                )
                .with_property("long_running_mode", json!(true)),
            WAIT,
        )
        .expect("start_graph should answer");
    assert_eq!(reply.status_code, Some(StatusCode::Ok));
    let graph_id = reply.properties["graph_id"].as_str().unwrap().to_string();

    drop(conn);
    std::thread::sleep(Duration::from_millis(200));
    assert!(app.running_graphs().contains(&graph_id));

    // A second client can still use it.
    let conn2 = app.connect();
    let cmd =
        Message::cmd("hello").with_dest(Destination::extension("hello").in_graph(&graph_id));
    let reply = conn2.request(cmd, WAIT).expect("hello should answer");
    assert_eq!(reply.status_code, Some(StatusCode::Ok));
}

#[test]
fn test_foreign_thread_hand_off_answers_a_command() {
    let (app, _answers, _events) = app();
    let definition = GraphDefinition::from_yaml("nodes:\n  - name: off\n    addon: offloader\n")
        .expect("definition parses");
    let graph_id = app.start_graph(definition, false).expect("graph starts");

    let conn = app.connect();
    let cmd = Message::cmd("work").with_dest(Destination::extension("off").in_graph(&graph_id));
    let reply = conn.request(cmd, WAIT).expect("work should answer");
    assert_eq!(reply.status_code, Some(StatusCode::Ok));
    assert_eq!(reply.properties["group"], json!("default"));
}

#[test]
fn test_unknown_addon_fails_the_start() {
    let (app, _answers, _events) = app();
    let definition = GraphDefinition::from_yaml("nodes:\n  - name: x\n    addon: missing\n")
        .expect("definition parses");
    assert!(app.start_graph(definition, false).is_err());
    assert!(app.running_graphs().is_empty());
}

#[test]
fn test_callback_panic_is_scoped_to_one_invocation() {
    struct Crasher;
    impl Extension for Crasher {
        fn on_cmd(&mut self, ctx: &mut ExtensionContext, cmd: Message) -> anyhow::Result<()> {
            if cmd.name == "boom" {
                panic!("induced");
            }
            let reply = Message::result_for(&cmd, StatusCode::Ok);
            ctx.return_result(reply)?;
            Ok(())
        }
    }
    let registry = AddonRegistry::new();
    registry.register("crasher", |_, _| Ok(Box::new(Crasher)));
    let app = App::new(AppConfig::default(), Arc::new(registry)).expect("app should start");
    let definition = GraphDefinition::from_yaml("nodes:\n  - name: c\n    addon: crasher\n")
        .expect("definition parses");
    let graph_id = app.start_graph(definition, false).expect("graph starts");

    let conn = app.connect();
    let boom = Message::cmd("boom").with_dest(Destination::extension("c").in_graph(&graph_id));
    let reply = conn.request(boom, WAIT).expect("boom should answer");
    assert_eq!(reply.status_code, Some(StatusCode::Error));

    // The group thread survived the panic.
    let ok = Message::cmd("fine").with_dest(Destination::extension("c").in_graph(&graph_id));
    let reply = conn.request(ok, WAIT).expect("fine should answer");
    assert_eq!(reply.status_code, Some(StatusCode::Ok));
}

#[test]
fn test_stop_reply_over_a_connection_is_correlated() {
    let (app, _answers, _events) = app();
    let conn = app.connect();

    let mut start = Message::cmd("start_graph");
    if let serde_json::Value::Object(map) = json!({
        "nodes": [{"name": "hello", "addon": "greeter"}],
    }) {
        start.properties = map;
    }
    let reply = conn.request(start, WAIT).expect("start_graph answers");
    assert_eq!(reply.status_code, Some(StatusCode::Ok));
    let graph_id = reply.properties["graph_id"]
        .as_str()
        .expect("reply carries graph_id")
        .to_string();

    // The stop result is synthesized by the engine itself; it must still
    // come back under the request's seq id or the requester hangs.
    let stop = Message::cmd("stop_graph").with_dest(Destination::default().in_graph(&graph_id));
    let reply = conn
        .request(stop, WAIT)
        .expect("stop reply is matched by its seq id");
    assert_eq!(reply.status_code, Some(StatusCode::Ok));
    assert_eq!(reply.properties["detail"], json!("graph stopped"));
    assert!(!app.running_graphs().contains(&graph_id));
}

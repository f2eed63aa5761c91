//! End-to-end routing through a running app: forwarding, fan-out, per-edge
//! conversion, and addressing failures.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use plexus::{
    AddonRegistry, App, AppConfig, Destination, Extension, ExtensionContext, Message, StatusCode,
};

const WAIT: Duration = Duration::from_secs(5);

/// Replies to any command with a fixed greeting.
struct Greeter;

impl Extension for Greeter {
    fn on_cmd(&mut self, ctx: &mut ExtensionContext, cmd: Message) -> anyhow::Result<()> {
        let mut reply = Message::result_for(&cmd, StatusCode::Ok);
        reply.set_detail("hello world, too");
        ctx.return_result(reply)?;
        Ok(())
    }
}

/// Forwards every command along its declared edges and hands the first
/// reply back to the original requester.
struct Relay;

impl Extension for Relay {
    fn on_cmd(&mut self, ctx: &mut ExtensionContext, cmd: Message) -> anyhow::Result<()> {
        let origin_path = cmd.origin_path_id;
        let name = cmd.name.clone();
        let mut forwarded = cmd.duplicate();
        forwarded.destinations.clear();
        forwarded.origin_path_id = None;
        ctx.send_cmd(forwarded, move |ctx, mut result| {
            result.origin_path_id = origin_path;
            result.name = name;
            if let Err(err) = ctx.return_result(result) {
                eprintln!("relay could not answer: {err}");
            }
        })?;
        Ok(())
    }
}

/// Fans a command out to every declared destination and replies with the
/// numeric total of their `value` properties.
struct Summer;

impl Extension for Summer {
    fn on_cmd(&mut self, ctx: &mut ExtensionContext, cmd: Message) -> anyhow::Result<()> {
        let origin_path = cmd.origin_path_id;
        let name = cmd.name.clone();
        ctx.send_cmd_all(Message::cmd(&name), move |ctx, results| {
            let total: i64 = results
                .iter()
                .filter_map(|r| r.properties.get("value"))
                .filter_map(Value::as_i64)
                .sum();
            let mut proto = Message::cmd(&name);
            proto.origin_path_id = origin_path;
            let reply = Message::result_for(&proto, StatusCode::Ok)
                .with_property("total", json!(total));
            if let Err(err) = ctx.return_result(reply) {
                eprintln!("summer could not answer: {err}");
            }
        })?;
        Ok(())
    }
}

/// Answers with its configured value.
struct Adder {
    value: i64,
}

impl Extension for Adder {
    fn on_cmd(&mut self, ctx: &mut ExtensionContext, cmd: Message) -> anyhow::Result<()> {
        let reply = Message::result_for(&cmd, StatusCode::Ok)
            .with_property("value", json!(self.value));
        ctx.return_result(reply)?;
        Ok(())
    }
}

/// Accepts commands and never answers them.
struct Sink;

impl Extension for Sink {
    fn on_cmd(&mut self, _ctx: &mut ExtensionContext, _cmd: Message) -> anyhow::Result<()> {
        Ok(())
    }
}

fn registry() -> Arc<AddonRegistry> {
    let registry = AddonRegistry::new();
    registry.register("greeter", |_, _| Ok(Box::new(Greeter)));
    registry.register("sink", |_, _| Ok(Box::new(Sink)));
    registry.register("relay", |_, _| Ok(Box::new(Relay)));
    registry.register("summer", |_, _| Ok(Box::new(Summer)));
    registry.register("adder", |_, property| {
        let value = property
            .and_then(|p| p.get("value"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        Ok(Box::new(Adder { value }))
    });
    Arc::new(registry)
}

fn app() -> App {
    App::new(AppConfig::default(), registry()).expect("app should start")
}

/// Sends `start_graph` over a fresh connection and returns the granted id.
fn start_graph_over(conn: &plexus::ConnectionHandle, properties: Value) -> String {
    let mut cmd = Message::cmd("start_graph");
    if let Value::Object(map) = properties {
        cmd.properties = map;
    }
    let reply = conn.request(cmd, WAIT).expect("start_graph should answer");
    assert_eq!(reply.status_code, Some(StatusCode::Ok), "{:?}", reply);
    reply.properties["graph_id"]
        .as_str()
        .expect("reply carries graph_id")
        .to_string()
}

#[test]
fn test_hello_world_round_trip() {
    let app = app();
    let conn = app.connect();
    start_graph_over(
        &conn,
        json!({
            "nodes": [{"name": "hello", "addon": "greeter"}],
        }),
    );

    let cmd = Message::cmd("hello").with_dest(Destination::extension("hello"));
    let reply = conn.request(cmd, WAIT).expect("hello should answer");
    assert_eq!(reply.status_code, Some(StatusCode::Ok));
    assert_eq!(reply.properties["detail"], json!("hello world, too"));
}

#[test]
fn test_forwarding_chain_through_relay() {
    let app = app();
    let conn = app.connect();
    start_graph_over(
        &conn,
        json!({
            "nodes": [
                {"name": "front", "addon": "relay"},
                {"name": "back", "addon": "greeter"},
            ],
            "connections": [
                {
                    "extension": "front",
                    "cmd": [{"name": "greet", "dest": [{"extension": "back"}]}],
                },
            ],
        }),
    );

    let cmd = Message::cmd("greet").with_dest(Destination::extension("front"));
    let reply = conn.request(cmd, WAIT).expect("greet should answer");
    assert_eq!(reply.status_code, Some(StatusCode::Ok));
    assert_eq!(reply.properties["detail"], json!("hello world, too"));
}

#[test]
fn test_fan_out_aggregates_all_replies() {
    let app = app();
    let conn = app.connect();
    start_graph_over(
        &conn,
        json!({
            "nodes": [
                {"name": "gate", "addon": "summer"},
                {"name": "b", "addon": "adder", "property": {"value": 1}},
                {"name": "c", "addon": "adder", "property": {"value": 2}},
                {"name": "d", "addon": "adder", "property": {"value": 3}},
            ],
            "connections": [
                {
                    "extension": "gate",
                    "cmd": [{
                        "name": "sum",
                        "dest": [
                            {"extension": "b"},
                            {"extension": "c"},
                            {"extension": "d"},
                        ],
                    }],
                },
            ],
        }),
    );

    let cmd = Message::cmd("sum").with_dest(Destination::extension("gate"));
    let reply = conn.request(cmd, WAIT).expect("sum should answer");
    assert_eq!(reply.status_code, Some(StatusCode::Ok));
    assert_eq!(reply.properties["total"], json!(6));
}

#[test]
fn test_external_multi_dest_wraps_every_result() {
    let app = app();
    let conn = app.connect();
    start_graph_over(
        &conn,
        json!({
            "nodes": [
                {"name": "b", "addon": "adder", "property": {"value": 10}},
                {"name": "c", "addon": "adder", "property": {"value": 20}},
            ],
        }),
    );

    let cmd = Message::cmd("probe")
        .with_dest(Destination::extension("b"))
        .with_dest(Destination::extension("c"));
    let reply = conn.request(cmd, WAIT).expect("probe should answer");
    assert_eq!(reply.status_code, Some(StatusCode::Ok));
    let wrapped = reply.properties["results"]
        .as_array()
        .expect("fan-out reply wraps results");
    assert_eq!(wrapped.len(), 2);
}

#[test]
fn test_edge_conversion_rewrites_name_and_properties() {
    let app = app();
    let conn = app.connect();
    start_graph_over(
        &conn,
        json!({
            "nodes": [
                {"name": "front", "addon": "relay"},
                {"name": "back", "addon": "greeter"},
            ],
            "connections": [
                {
                    "extension": "front",
                    "cmd": [{
                        "name": "salute",
                        "dest": [{
                            "extension": "back",
                            "msg_conversion": {
                                "type": "per_property",
                                "rules": [
                                    {
                                        "conversion_mode": "fixed_value",
                                        "path": "msg.name",
                                        "value": "hello",
                                    },
                                    {
                                        "conversion_mode": "from_original",
                                        "path": "who",
                                        "original_path": "caller",
                                    },
                                ],
                            },
                        }],
                    }],
                },
            ],
        }),
    );

    let cmd = Message::cmd("salute")
        .with_property("caller", json!("tester"))
        .with_dest(Destination::extension("front"));
    let reply = conn.request(cmd, WAIT).expect("salute should answer");
    // The greeter only ever answers; reaching it proves the rename took.
    assert_eq!(reply.status_code, Some(StatusCode::Ok));
    assert_eq!(reply.properties["detail"], json!("hello world, too"));
}

#[test]
fn test_unknown_extension_is_reported() {
    let app = app();
    let conn = app.connect();
    start_graph_over(
        &conn,
        json!({
            "nodes": [{"name": "hello", "addon": "greeter"}],
        }),
    );

    let cmd = Message::cmd("ping").with_dest(Destination::extension("test"));
    let reply = conn.request(cmd, WAIT).expect("ping should answer");
    assert_eq!(reply.status_code, Some(StatusCode::Error));
    assert_eq!(
        reply.properties["detail"],
        json!("The extension[test] is invalid.")
    );
}

#[test]
fn test_unknown_graph_is_reported() {
    let app = app();
    let conn = app.connect();

    let cmd = Message::cmd("ping")
        .with_dest(Destination::extension("hello").in_graph("no-such-graph"));
    let reply = conn.request(cmd, WAIT).expect("ping should answer");
    assert_eq!(reply.status_code, Some(StatusCode::Error));
    assert_eq!(reply.properties["detail"], json!("Graph not found."));
}

#[test]
fn test_graph_id_is_stable_while_running() {
    let app = app();
    let conn = app.connect();
    let graph_id = start_graph_over(
        &conn,
        json!({
            "nodes": [{"name": "hello", "addon": "greeter"}],
        }),
    );

    assert!(app.running_graphs().contains(&graph_id));
    for _ in 0..3 {
        let cmd = Message::cmd("hello").with_dest(Destination::extension("hello"));
        let reply = conn.request(cmd, WAIT).expect("hello should answer");
        assert_eq!(reply.status_code, Some(StatusCode::Ok));
    }
    assert!(app.running_graphs().contains(&graph_id));
}

#[test]
fn test_start_graph_rejects_malformed_payload() {
    let app = app();
    let conn = app.connect();

    let cmd = Message::cmd("start_graph").with_property("nodes", json!("not-a-list"));
    let reply = conn.request(cmd, WAIT).expect("start_graph should answer");
    assert_eq!(reply.status_code, Some(StatusCode::Error));
}

#[test]
fn test_unrouted_command_reply_is_correlated() {
    let app = app();
    let conn = app.connect();
    start_graph_over(
        &conn,
        json!({
            "nodes": [{"name": "hello", "addon": "greeter"}],
        }),
    );

    // No destinations and no declared route: the engine answers the refusal
    // itself, and the reply must still match the request's seq id.
    let reply = conn
        .request(Message::cmd("nothing"), WAIT)
        .expect("refusal should answer under the request id");
    assert_eq!(reply.status_code, Some(StatusCode::Error));
    assert_eq!(
        reply.properties["detail"],
        json!("no destination for command \"nothing\"")
    );
}

#[test]
fn test_failed_resolution_leaves_connection_migratable() {
    let app = app();
    let conn = app.connect();

    let cmd =
        Message::cmd("ping").with_dest(Destination::extension("hello").in_graph("no-such-graph"));
    let reply = conn.request(cmd, WAIT).expect("ping should answer");
    assert_eq!(reply.properties["detail"], json!("Graph not found."));

    // The refused resolution must not have consumed the single migration.
    let graph_id = start_graph_over(
        &conn,
        json!({
            "nodes": [{"name": "hello", "addon": "greeter"}],
        }),
    );
    let cmd = Message::cmd("ping").with_dest(Destination::extension("hello").in_graph(&graph_id));
    let reply = conn.request(cmd, WAIT).expect("ping should answer");
    assert_eq!(reply.status_code, Some(StatusCode::Ok));
    assert_eq!(reply.properties["detail"], json!("hello world, too"));
}

#[test]
fn test_wrong_group_in_address_is_rejected() {
    let app = app();
    let conn = app.connect();
    let graph_id = start_graph_over(
        &conn,
        json!({
            "nodes": [{"name": "hello", "addon": "greeter"}],
        }),
    );

    let cmd = Message::cmd("ping").with_dest(
        Destination::extension("hello")
            .in_group("workers")
            .in_graph(&graph_id),
    );
    let reply = conn.request(cmd, WAIT).expect("ping should answer");
    assert_eq!(reply.status_code, Some(StatusCode::Error));
    assert_eq!(
        reply.properties["detail"],
        json!("The extension[workers::hello] is invalid.")
    );
}

#[test]
fn test_silent_destination_times_out() {
    let app = app();
    let conn = app.connect();
    let graph_id = start_graph_over(
        &conn,
        json!({
            "nodes": [{"name": "void", "addon": "sink"}],
        }),
    );

    let started = std::time::Instant::now();
    let cmd = Message::cmd("ping")
        .with_property("timeout_ms", json!(200))
        .with_dest(Destination::extension("void").in_graph(&graph_id));
    let reply = conn.request(cmd, WAIT).expect("deadline should answer");
    assert_eq!(reply.status_code, Some(StatusCode::Error));
    assert_eq!(reply.properties["detail"], json!("Operation timed out."));
    assert!(started.elapsed() >= Duration::from_millis(200));
}

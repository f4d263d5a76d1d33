use echo_service::{EchoServiceServer, FILE_DESCRIPTOR_SET};
use echo_service_impl::{EchoServiceImpl, SLOW, SLOW_REPLY, STALL};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;
use tonic::Code;
use wisp_core::{
    config::Settings,
    decode::EMPTY_RESPONSE,
    grpc::client::GrpcClient,
    schema::{Method, SchemaLoader},
    session::{QueryController, QueryResponse, SessionKey},
    value::record_from_json,
};


type Controller = QueryController<EchoServiceServer<EchoServiceImpl>>;

fn setup() -> (Controller, Receiver<QueryResponse>) {
    setup_with(Settings::default())
}

fn setup_with(settings: Settings) -> (Controller, Receiver<QueryResponse>) {
    let (mut controller, responses) = QueryController::new(&settings);
    controller.attach(GrpcClient::new(EchoServiceServer::new(EchoServiceImpl)));
    (controller, responses)
}

fn method(name: &str) -> Method {
    SchemaLoader::new(10, true)
        .from_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .unwrap()
        .iter()
        .find(|s| s.name == "echo.EchoService")
        .and_then(|s| s.method(name))
        .cloned()
        .unwrap()
}

async fn query(controller: &mut Controller, name: &str, data: serde_json::Value) {
    let key = SessionKey::new(1, "echo.EchoService", name);
    let data = record_from_json(data).unwrap();
    controller
        .query(key, &method(name), &data, &[])
        .await
        .expect("query failed");
}

async fn next(responses: &mut Receiver<QueryResponse>) -> QueryResponse {
    tokio::time::timeout(Duration::from_secs(5), responses.recv())
        .await
        .expect("timed out waiting for a response")
        .expect("response channel closed")
}

async fn assert_quiet(responses: &mut Receiver<QueryResponse>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(responses.try_recv().is_err(), "unexpected extra event");
}

fn payload(event: &QueryResponse) -> serde_json::Value {
    serde_json::from_str(&event.payload_json).expect("payload is not JSON")
}

#[tokio::test]
async fn test_unary_call() {
    let (mut controller, mut responses) = setup();

    query(&mut controller, "Echo", json!({ "text": "hi" })).await;

    let event = next(&mut responses).await;
    assert!(!event.is_error());
    assert!(event.payload_json.contains("\"text\": \"hi\""));
    assert!(event.elapsed.is_some());
    assert_eq!((event.sent, event.received), (1, 1));
    assert!(event.is_terminal(false));
    assert_quiet(&mut responses).await;
}

#[tokio::test]
async fn test_empty_reply_sentinel() {
    let (mut controller, mut responses) = setup();

    query(&mut controller, "Plant", json!({ "label": "root" })).await;

    let event = next(&mut responses).await;
    assert_eq!(event.payload_json, EMPTY_RESPONSE);
}

#[tokio::test]
async fn test_mirror_round_trip() {
    let (mut controller, mut responses) = setup();

    query(
        &mut controller,
        "Mirror",
        json!({
            "text": "all",
            "small": "-5",
            "big": "9007199254740993",
            "count": "4000000000",
            "huge": "18446744073709551615",
            "delta": "-17",
            "stamp": "42",
            "ratio": "0.5",
            "precise": "2.25",
            "flag": "true",
            "blob": "raw",
            "color": "COLOR_GREEN",
            "labels": ["a", "b"],
            "samples": ["1", "-2"],
            "tags": { "env": "prod" },
            "points": { "1": { "x": "10", "y": "20" } },
            "palette": { "sky": "COLOR_RED" },
            "origin": { "x": "1", "y": "2" },
            "path": [{ "x": "1", "y": "2" }, { "x": "3", "y": "4" }],
            "id": "7"
        }),
    )
    .await;

    let event = next(&mut responses).await;
    assert!(!event.is_error(), "{:?}", event.error);
    assert_eq!(
        payload(&event),
        json!({
            "text": "all",
            "small": -5,
            "big": "9007199254740993",
            "count": 4000000000u32,
            "huge": "18446744073709551615",
            "delta": -17,
            "stamp": "42",
            "ratio": 0.5,
            "precise": 2.25,
            "flag": true,
            "blob": "cmF3",
            "color": "COLOR_GREEN",
            "labels": ["a", "b"],
            "samples": ["1", "-2"],
            "tags": { "env": "prod" },
            "points": { "1": { "x": 10, "y": 20 } },
            "palette": { "sky": "COLOR_RED" },
            "origin": { "x": 1, "y": 2 },
            "path": [{ "x": 1, "y": 2 }, { "x": 3, "y": 4 }],
            "id": 7
        })
    );
}

#[tokio::test]
async fn test_invalid_input_is_reported_as_an_event() {
    let (mut controller, mut responses) = setup();

    query(&mut controller, "Mirror", json!({ "small": "99999999999" })).await;

    let event = next(&mut responses).await;
    let error = event.error.expect("expected an error");
    assert_eq!(error.code, Code::InvalidArgument);
    assert!(error.message.contains("99999999999"));
    assert_eq!(controller.sent_count(), 0);
}

#[tokio::test]
async fn test_invalid_unary_input_reports_reset_counters() {
    let (mut controller, mut responses) = setup();

    query(&mut controller, "Echo", json!({ "text": "first" })).await;
    let first = next(&mut responses).await;
    assert_eq!((first.sent, first.received), (1, 1));

    query(&mut controller, "Echo", json!({ "text": ["x", "y"] })).await;
    let event = next(&mut responses).await;
    assert!(event.is_error());
    assert_eq!((event.sent, event.received), (0, 0));
}

#[tokio::test]
async fn test_unary_deadline_exceeded() {
    let settings = Settings {
        request_timeout_secs: 1,
        ..Settings::default()
    };
    let (mut controller, mut responses) = setup_with(settings);

    query(&mut controller, "UnaryEcho", json!({ "message": SLOW })).await;

    let event = tokio::time::timeout(SLOW_REPLY, responses.recv())
        .await
        .expect("the deadline did not fire before the server replied")
        .unwrap();
    let error = event.error.expect("expected a deadline error");
    assert_eq!(error.code, Code::DeadlineExceeded);
    assert!(event.elapsed.is_some());
}

#[tokio::test]
async fn test_streams_ignore_request_timeout() {
    let settings = Settings {
        request_timeout_secs: 1,
        ..Settings::default()
    };
    let (mut controller, mut responses) = setup_with(settings);

    query(&mut controller, "EndlessEcho", json!({ "message": "tick" })).await;

    let started = std::time::Instant::now();
    while started.elapsed() < Duration::from_millis(1500) {
        let event = next(&mut responses).await;
        assert!(!event.is_error(), "stream failed: {:?}", event.error);
    }
    controller.cancel_query();
}

#[tokio::test]
async fn test_client_stream_replies_after_close() {
    let (mut controller, mut responses) = setup();

    for part in ["a", "b", "c"] {
        query(&mut controller, "ClientStreamingEcho", json!({ "message": part })).await;
    }

    assert_eq!(controller.sent_count(), 3);
    assert_eq!(controller.received_count(), 0);
    assert_quiet(&mut responses).await;

    assert!(controller.close_stream());

    let event = next(&mut responses).await;
    assert!(!event.is_error());
    assert_eq!(payload(&event)["message"], "abc");
    assert_eq!((event.sent, event.received), (3, 1));
    assert_quiet(&mut responses).await;
}

#[tokio::test]
async fn test_close_without_stream() {
    let (mut controller, _responses) = setup();
    assert!(!controller.close_stream());
}

#[tokio::test]
async fn test_server_stream_ends_with_trailers_event() {
    let (mut controller, mut responses) = setup();

    query(&mut controller, "ServerStreamingEcho", json!({ "message": "s" })).await;

    for i in 0..3 {
        let event = next(&mut responses).await;
        assert!(!event.is_terminal(true));
        assert_eq!(payload(&event)["message"], format!("s - seq {i}"));
    }

    let end = next(&mut responses).await;
    assert!(end.end_of_stream);
    assert!(end.payload_json.is_empty());
    assert_eq!(end.received, 3);
    assert_quiet(&mut responses).await;
}

#[tokio::test]
async fn test_bidi_stream() {
    let (mut controller, mut responses) = setup();

    query(&mut controller, "BidirectionalEcho", json!({ "message": "x" })).await;
    let first = next(&mut responses).await;
    assert_eq!(payload(&first)["message"], "echo: x");

    query(&mut controller, "BidirectionalEcho", json!({ "message": "y" })).await;
    let second = next(&mut responses).await;
    assert_eq!(payload(&second)["message"], "echo: y");
    assert_eq!(controller.sent_count(), 2);
    assert_eq!(controller.received_count(), 2);

    assert!(controller.close_stream());
    let end = next(&mut responses).await;
    assert!(end.end_of_stream);
    assert_quiet(&mut responses).await;
}

#[tokio::test]
async fn test_cancel_reports_exactly_once() {
    let (mut controller, mut responses) = setup();

    query(&mut controller, "EndlessEcho", json!({ "message": "tick" })).await;
    next(&mut responses).await;
    next(&mut responses).await;

    controller.cancel_query();

    let canceled = loop {
        let event = next(&mut responses).await;
        if event.is_error() {
            break event;
        }
    };
    let error = canceled.error.as_ref().unwrap();
    assert_eq!(error.code, Code::Cancelled);
    assert_eq!(error.message, "context canceled");
    assert!(canceled.elapsed.is_some());
    assert_quiet(&mut responses).await;
}

#[tokio::test]
async fn test_cancel_client_stream_while_server_stops_reading() {
    let (mut controller, mut responses) = setup();

    for part in [STALL, "a", "b", "c"] {
        query(&mut controller, "ClientStreamingEcho", json!({ "message": part })).await;
    }
    controller.cancel_query();

    let event = next(&mut responses).await;
    assert_eq!(event.error.as_ref().map(|e| e.code), Some(Code::Cancelled));
    assert_quiet(&mut responses).await;
}

#[tokio::test]
async fn test_cancel_bidi_stream_while_server_stops_reading() {
    let (mut controller, mut responses) = setup();

    for part in [STALL, "a", "b", "c"] {
        query(&mut controller, "BidirectionalEcho", json!({ "message": part })).await;
    }
    controller.cancel_query();

    let event = next(&mut responses).await;
    assert_eq!(event.error.as_ref().map(|e| e.code), Some(Code::Cancelled));
    assert_quiet(&mut responses).await;

    // Both halves are gone, so the same key opens a fresh stream.
    query(&mut controller, "BidirectionalEcho", json!({ "message": "again" })).await;
    let reply = next(&mut responses).await;
    assert_eq!(payload(&reply)["message"], "echo: again");
    controller.cancel_query();
}

#[tokio::test]
async fn test_server_stream_is_not_restarted_while_running() {
    let (mut controller, mut responses) = setup();

    query(&mut controller, "EndlessEcho", json!({ "message": "one" })).await;
    next(&mut responses).await;
    query(&mut controller, "EndlessEcho", json!({ "message": "two" })).await;

    for _ in 0..5 {
        let event = next(&mut responses).await;
        assert!(payload(&event)["message"].as_str().unwrap().starts_with("one"));
    }
    controller.cancel_query();
}

#[tokio::test]
async fn test_switching_method_cancels_running_stream() {
    let (mut controller, mut responses) = setup();

    query(&mut controller, "EndlessEcho", json!({ "message": "tick" })).await;
    next(&mut responses).await;

    query(&mut controller, "Echo", json!({ "text": "next" })).await;
    assert_eq!(
        controller.current_key(),
        Some(&SessionKey::new(1, "echo.EchoService", "Echo"))
    );

    let mut canceled = 0;
    let reply = loop {
        let event = next(&mut responses).await;
        match &event.error {
            Some(error) if error.code == Code::Cancelled => canceled += 1,
            _ if event.payload_json.contains("next") => break event,
            _ => {}
        }
    };
    assert_eq!(canceled, 1);
    assert!(!reply.is_error());
}

#[tokio::test]
async fn test_detached_controller_is_not_connected() {
    let (mut controller, _responses) = setup();
    controller.detach();

    let data = record_from_json(json!({ "text": "hi" })).unwrap();
    let result = controller
        .query(
            SessionKey::new(1, "echo.EchoService", "Echo"),
            &method("Echo"),
            &data,
            &[],
        )
        .await;

    assert!(result.is_err());
    assert!(!controller.is_attached());
}

//! Unit tests for RPC dispatch

use super::*;
use minion_proto::{FrameCodec, Side};
use std::time::Instant;

fn server_table() -> CommandTable {
    let mut table = CommandTable::new();
    table
        .register("ping", |args: Args| async move { Ok(args.get(0, "value")?.clone()) })
        .register("add", |args: Args| async move {
            let a = args.get(0, "a")?.as_i64().unwrap_or_default();
            let b = args.get(1, "b")?.as_i64().unwrap_or_default();
            Ok(Value::Int(a + b))
        })
        .register("fail", |_args: Args| async move {
            Err(ErrorDetails::new(ErrorCode::HandlerFailed, "division by zero"))
        })
        .register("explode", |_args: Args| async move {
            if true {
                panic!("handler bug");
            }
            Ok(Value::Nil)
        })
        .register("slow", |_args: Args| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(Value::from("done"))
        })
        .register_blocking("length", |args: Args| {
            std::thread::sleep(Duration::from_millis(10));
            let text = args.get(0, "text")?.as_str().unwrap_or_default().to_string();
            Ok(Value::Int(text.len() as i64))
        });
    table
}

fn client_table() -> CommandTable {
    let mut table = CommandTable::new();
    table.register("whoami", |_args: Args| async move { Ok(Value::from("client")) });
    table
}

/// Returns (dialer's client, acceptor's client) over an in-memory stream
fn session_pair() -> (RpcClient, RpcClient) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let pool = BlockingPool::new(8);

    let (dialer, _) = Multiplexer::spawn(
        a,
        Side::Dialer,
        FrameCodec::new(),
        Arc::new(RpcHandler::new(Capabilities::Client(client_table()), pool.clone())),
    );
    let (acceptor, _) = Multiplexer::spawn(
        b,
        Side::Acceptor,
        FrameCodec::new(),
        Arc::new(RpcHandler::new(Capabilities::Server(server_table()), pool)),
    );

    (RpcClient::new("test", dialer), RpcClient::new("test", acceptor))
}

#[tokio::test]
async fn test_ping_round_trip() {
    let (client, _server) = session_pair();

    assert_eq!(client.ping("hello").await.unwrap(), Value::from("hello"));

    let nested = Value::Map(BTreeMap::from([
        ("ids".to_string(), Value::from(vec![1, 2, 3])),
        ("ok".to_string(), Value::Bool(true)),
    ]));
    assert_eq!(client.ping(nested.clone()).await.unwrap(), nested);
}

#[tokio::test]
async fn test_positional_and_keyword_arguments() {
    let (client, _server) = session_pair();

    let sum = client
        .call(
            "add",
            vec![Value::Int(2)],
            BTreeMap::from([("b".to_string(), Value::Int(3))]),
        )
        .await
        .unwrap();
    assert_eq!(sum, Value::Int(5));
}

#[tokio::test]
async fn test_unknown_method_keeps_session_usable() {
    let (client, _server) = session_pair();

    let err = client.invoke(Call::new("frobnicate")).await.unwrap_err();
    assert!(matches!(err, MinionError::MethodNotFound(ref m) if m == "frobnicate"));

    assert_eq!(client.ping(7).await.unwrap(), Value::Int(7));
    assert!(!client.is_closed());
}

#[tokio::test]
async fn test_handler_error_is_reraised() {
    let (client, _server) = session_pair();

    match client.invoke(Call::new("fail")).await.unwrap_err() {
        MinionError::Remote(details) => {
            assert_eq!(details.code, ErrorCode::HandlerFailed);
            assert_eq!(details.message, "division by zero");
            assert_eq!(details.context.get("method"), Some(&"fail".to_string()));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_missing_argument() {
    let (client, _server) = session_pair();

    match client.invoke(Call::new("ping")).await.unwrap_err() {
        MinionError::Remote(details) => assert_eq!(details.code, ErrorCode::InvalidArguments),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_panicking_method_answers_with_error() {
    let (client, _server) = session_pair();

    let err = client.invoke(Call::new("explode")).await.unwrap_err();
    assert!(matches!(err, MinionError::Remote(ref d) if d.code == ErrorCode::HandlerFailed));
    assert_eq!(client.ping("still here").await.unwrap(), Value::from("still here"));
}

#[tokio::test]
async fn test_blocking_method_runs_on_pool() {
    let (client, _server) = session_pair();

    let length = client
        .invoke(Call::new("length").kwarg("text", "minion"))
        .await
        .unwrap();
    assert_eq!(length, Value::Int(6));
}

#[tokio::test]
async fn test_roles_answer_with_their_own_tables() {
    let (dialer, acceptor) = session_pair();

    // The accepting side reaches the dialer's client-role table
    assert_eq!(
        acceptor.invoke(Call::new("whoami")).await.unwrap(),
        Value::from("client")
    );

    // ...and the dialer cannot reach it through the server-role table
    let err = dialer.invoke(Call::new("whoami")).await.unwrap_err();
    assert!(matches!(err, MinionError::MethodNotFound(_)));
}

#[tokio::test]
async fn test_slow_call_does_not_block_others() {
    let (client, _server) = session_pair();

    let slow_client = client.clone();
    let slow = tokio::spawn(async move { slow_client.invoke(Call::new("slow")).await });

    let started = Instant::now();
    assert_eq!(client.ping(1).await.unwrap(), Value::Int(1));
    assert!(started.elapsed() < Duration::from_millis(250));
    assert!(!slow.is_finished());

    assert_eq!(slow.await.unwrap().unwrap(), Value::from("done"));
}

#[tokio::test]
async fn test_timeout_gives_up_on_slow_call() {
    let (client, _server) = session_pair();
    let client = client.with_timeout(Duration::from_millis(50));

    let err = client.invoke(Call::new("slow")).await.unwrap_err();
    assert!(matches!(err, MinionError::Timeout { .. }));

    // The abandoned channel does not linger
    assert_eq!(client.ping("after").await.unwrap(), Value::from("after"));
}

#[tokio::test]
async fn test_pending_call_fails_when_connection_closes() {
    let (client, server) = session_pair();

    let pending_client = client.clone();
    let pending = tokio::spawn(async move { pending_client.invoke(Call::new("slow")).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    server.close();
    let err = pending.await.unwrap().unwrap_err();
    assert!(err.is_connection(), "unexpected error: {err:?}");

    let err = client.ping(1).await.unwrap_err();
    assert!(err.is_connection());
}

#[tokio::test]
async fn test_dispatch_without_session() {
    let table = server_table();
    let pool = BlockingPool::new(1);

    let reply = table.dispatch(Call::new("ping").arg(3), &pool).await;
    assert_eq!(reply, Reply::Value(Value::Int(3)));

    match table.dispatch(Call::new("missing"), &pool).await {
        Reply::Error(details) => assert_eq!(details.code, ErrorCode::MethodNotFound),
        other => panic!("unexpected reply: {other:?}"),
    }
}

#[tokio::test]
async fn test_blocking_method_after_pool_closed() {
    let table = server_table();
    let pool = BlockingPool::new(1);
    pool.close();

    match table.dispatch(Call::new("length").arg("x"), &pool).await {
        Reply::Error(details) => assert_eq!(details.code, ErrorCode::ResourceExhausted),
        other => panic!("unexpected reply: {other:?}"),
    }
}

#[tokio::test]
async fn test_handler_rejects_replies() {
    let handler = RpcHandler::new(Capabilities::Server(server_table()), BlockingPool::new(1));
    let request = Message::Reply(Reply::Value(Value::Nil)).to_bytes().unwrap();

    let err = handler.handle(3, request).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidRequest);
}

#[test]
fn test_capabilities_follow_run_mode() {
    let server = Capabilities::select(RunMode::Server, server_table(), client_table());
    assert_eq!(server.mode(), RunMode::Server);
    assert!(server.commands().contains("ping"));

    let client = Capabilities::select(RunMode::Client, server_table(), client_table());
    assert_eq!(client.commands().names(), vec!["whoami"]);
}

#[test]
fn test_args_lookup() {
    let args = Args {
        args: vec![Value::Int(1)],
        kwargs: BTreeMap::from([("name".to_string(), Value::from("x"))]),
    };

    assert_eq!(args.get(0, "first").unwrap(), &Value::Int(1));
    assert_eq!(args.get(1, "name").unwrap(), &Value::from("x"));
    assert!(args.optional(2, "missing").is_none());
    assert_eq!(
        args.get(2, "missing").unwrap_err().code,
        ErrorCode::InvalidArguments
    );
}

proptest::proptest! {
    #![proptest_config(proptest::prelude::ProptestConfig::with_cases(32))]

    #[test]
    fn test_dispatch_matches_direct_call(a in -1_000_000i64..1_000_000, b in -1_000_000i64..1_000_000) {
        let table = server_table();
        let pool = BlockingPool::new(1);

        let reply = tokio_test::block_on(table.dispatch(Call::new("add").arg(a).arg(b), &pool));
        proptest::prop_assert_eq!(reply, Reply::Value(Value::Int(a + b)));
    }
}

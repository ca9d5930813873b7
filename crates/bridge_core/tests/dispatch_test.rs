use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use anyhow::anyhow;
use bridge_core::{
    BaseContext, Client, CommandConfig, Dispatcher, EventFilter, EventKind, HandleMap,
    Participant, Registration, Scene, SessionOptions, Stage, UnifiedConverter, UnifiedEvent,
    handler_fn,
};
use serde_json::json;

async fn client() -> (Client, Client) {
    Client::pair(
        (SessionOptions::named("onebot11"), HandleMap::new()),
        (SessionOptions::named("manager"), HandleMap::new()),
    )
    .await
    .unwrap()
}

fn text(body: &str) -> UnifiedEvent {
    UnifiedEvent::text_message(Scene::Group, "onebot11", body)
        .with_sender(Participant::new("10001", Some("alice".into())))
}

/// Callback appending `label` to `log` and answering `consumed`.
fn recorder(log: &Arc<Mutex<Vec<String>>>, label: &str, consumed: bool) -> Registration {
    let log = log.clone();
    let label = label.to_string();
    Registration::new(handler_fn(move |_ctx| {
        let log = log.clone();
        let label = label.clone();
        Box::pin(async move {
            log.lock().unwrap().push(label);
            Ok(consumed)
        })
    }))
}

#[tokio::test]
async fn middleware_short_circuits_later_stages() {
    let (client, _peer) = client().await;
    let dispatcher = Dispatcher::default();
    let log = Arc::new(Mutex::new(Vec::new()));
    let event_ran = Arc::new(AtomicBool::new(false));

    dispatcher.hook(recorder(&log, "hook", true));
    dispatcher.middleware(recorder(&log, "gate", true));
    let flag = event_ran.clone();
    dispatcher.on_event(
        EventFilter::any(),
        handler_fn(move |_ctx| {
            let flag = flag.clone();
            Box::pin(async move {
                flag.store(true, Ordering::SeqCst);
                Ok(true)
            })
        }),
    );
    dispatcher.command(["ping"], recorder(&log, "ping", true));

    assert!(dispatcher.handle(text("/ping"), &client).await);
    assert!(!event_ran.load(Ordering::SeqCst), "event handler must not run");
    // hooks never halt the pass even when they return true
    assert_eq!(*log.lock().unwrap(), vec!["hook", "gate"]);
}

#[tokio::test]
async fn priority_then_registration_order() {
    let (client, _peer) = client().await;
    let dispatcher = Dispatcher::default();
    let log = Arc::new(Mutex::new(Vec::new()));

    dispatcher.hook(recorder(&log, "low", false).priority(-1));
    dispatcher.hook(recorder(&log, "first", false));
    dispatcher.hook(recorder(&log, "high", false).priority(10));
    dispatcher.hook(recorder(&log, "second", false));

    assert!(!dispatcher.handle(text("hello"), &client).await);
    assert_eq!(*log.lock().unwrap(), vec!["high", "first", "second", "low"]);
}

#[tokio::test]
async fn command_stage_parses_prefix_and_arguments() {
    let (client, _peer) = client().await;
    let dispatcher = Dispatcher::new(CommandConfig {
        prefix: "/".into(),
        split: " ".into(),
    });
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    dispatcher.command(
        ["ping", "p"],
        handler_fn(move |ctx| {
            let sink = sink.clone();
            Box::pin(async move {
                let cmd = ctx.command.clone().ok_or_else(|| anyhow!("no command"))?;
                sink.lock().unwrap().push((cmd.name, cmd.args));
                Ok(true)
            })
        }),
    );

    assert!(dispatcher.handle(text("/ping a b"), &client).await);
    assert!(!dispatcher.handle(text("ping a b"), &client).await);
    assert!(!dispatcher.handle(text("/pong a b"), &client).await);

    let mut notice = text("/ping");
    notice.kind = EventKind::Notice;
    assert!(!dispatcher.handle(notice, &client).await);

    assert_eq!(
        *seen.lock().unwrap(),
        vec![("ping".to_string(), vec!["a".to_string(), "b".to_string()])]
    );
}

#[tokio::test]
async fn failing_callbacks_do_not_consume() {
    let (client, _peer) = client().await;
    let dispatcher = Dispatcher::default();
    let log = Arc::new(Mutex::new(Vec::new()));

    dispatcher.on_event(
        EventFilter::kind(EventKind::Message),
        Registration::new(handler_fn(|_ctx| Box::pin(async { Err(anyhow!("plugin crashed")) })))
            .priority(5),
    );
    dispatcher.on_event(EventFilter::kind(EventKind::Message), recorder(&log, "fallback", true));

    assert!(dispatcher.handle(text("hi"), &client).await);
    assert_eq!(*log.lock().unwrap(), vec!["fallback"]);
}

#[tokio::test]
async fn filters_and_predicates_select_callbacks() {
    let (client, _peer) = client().await;
    let dispatcher = Dispatcher::default();
    let log = Arc::new(Mutex::new(Vec::new()));

    dispatcher.on_event(
        EventFilter::kind(EventKind::Message).in_scene(Scene::User),
        recorder(&log, "private", true),
    );
    dispatcher.on_event(
        EventFilter::any(),
        recorder(&log, "admin", true)
            .when(|ctx| ctx.event.sender.as_ref().is_some_and(|s| s.id == "admin")),
    );
    dispatcher.on_event(EventFilter::kind(EventKind::Message), recorder(&log, "group", true));

    assert!(dispatcher.handle(text("hi"), &client).await);
    assert_eq!(*log.lock().unwrap(), vec!["group"]);
}

#[tokio::test]
async fn registration_during_dispatch_waits_for_the_next_pass() {
    let (client, _peer) = client().await;
    let dispatcher = Dispatcher::default();
    let late_calls = Arc::new(AtomicUsize::new(0));

    let registrar = dispatcher.clone();
    let calls = late_calls.clone();
    dispatcher.hook(handler_fn(move |_ctx| {
        let registrar = registrar.clone();
        let calls = calls.clone();
        Box::pin(async move {
            registrar.on_event(
                EventFilter::any(),
                handler_fn(move |_ctx| {
                    let calls = calls.clone();
                    Box::pin(async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(false)
                    })
                }),
            );
            Ok(false)
        })
    }));

    dispatcher.handle(text("one"), &client).await;
    assert_eq!(late_calls.load(Ordering::SeqCst), 0);
    assert_eq!(dispatcher.len(Stage::Event), 1);

    dispatcher.handle(text("two"), &client).await;
    assert_eq!(late_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn hooks_share_state_with_later_stages() {
    let (client, _peer) = client().await;
    let dispatcher = Dispatcher::default();
    dispatcher.hook(handler_fn(|ctx| {
        Box::pin(async move {
            ctx.state.insert("lang".into(), json!("en"));
            Ok(false)
        })
    }));
    dispatcher.command(
        ["lang"],
        handler_fn(|ctx: &mut BaseContext| {
            Box::pin(async move { Ok(ctx.state.get("lang") == Some(&json!("en"))) })
        }),
    );

    assert!(dispatcher.handle(text("/lang"), &client).await);
}

#[tokio::test]
async fn plugin_scope_unload_removes_everything() {
    let (client, _peer) = client().await;
    let dispatcher = Dispatcher::default();
    let log = Arc::new(Mutex::new(Vec::new()));

    let scope = dispatcher.scope("greeter");
    scope.hook(recorder(&log, "hook", false));
    scope.on_event(EventFilter::any(), recorder(&log, "event", false));
    scope.command(["hi"], recorder(&log, "cmd", true));
    let kept = dispatcher.middleware(recorder(&log, "kept", false));

    assert!(dispatcher.handle(text("/hi"), &client).await);
    assert_eq!(scope.unload(), 3);
    assert_eq!(scope.unload(), 0);

    log.lock().unwrap().clear();
    assert!(!dispatcher.handle(text("/hi"), &client).await);
    assert_eq!(*log.lock().unwrap(), vec!["kept"]);
    assert!(dispatcher.unregister(kept));
    assert!(!dispatcher.unregister(kept));
}

#[tokio::test]
async fn callbacks_can_answer_through_the_session() {
    let replies = Arc::new(Mutex::new(Vec::new()));
    let sink = replies.clone();
    let handles = HandleMap::new().with("sendMessage", move |args, _client| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(args);
            Ok(json!({"message_id": 1}))
        }
    });
    let (client, _peer) = Client::pair(
        (SessionOptions::named("manager"), HandleMap::new()),
        (SessionOptions::named("onebot11"), handles),
    )
    .await
    .unwrap();

    let dispatcher = Dispatcher::default();
    dispatcher.command(
        ["echo"],
        handler_fn(|ctx| {
            Box::pin(async move {
                let args = ctx.command.as_ref().map(|c| c.args.join(" ")).unwrap_or_default();
                ctx.client.request("sendMessage", json!({"text": args})).await?;
                Ok(true)
            })
        }),
    );

    assert!(dispatcher.handle(text("/echo hello world"), &client).await);
    assert_eq!(*replies.lock().unwrap(), vec![json!({"text": "hello world"})]);
}

#[tokio::test]
async fn native_events_go_through_the_converter() {
    let (client, _peer) = client().await;
    let dispatcher = Dispatcher::default();
    let log = Arc::new(Mutex::new(Vec::new()));
    dispatcher.on_event(EventFilter::kind(EventKind::Notice), recorder(&log, "notice", true));

    let converter = UnifiedConverter::new("console");
    let native = json!({
        "id": "n1",
        "type": "notice",
        "scene": "system",
        "platform": "console",
        "detail": "startup",
        "time": "2024-05-01T10:00:00Z"
    });
    assert!(dispatcher.dispatch_native(&converter, native, &client).await);
    assert!(!dispatcher.dispatch_native(&converter, json!([1, 2]), &client).await);
    assert_eq!(*log.lock().unwrap(), vec!["notice"]);
}

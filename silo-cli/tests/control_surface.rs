use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use silo_cli::api::{ApiState, create_control_routes};
use silo_cli::build_daemon;
use silo_core::ClusterConfig;
use silo_core::client::HDR_CALLER_ID;
use silo_core::node::{NodeDescriptor, NodeRole};
use tower::ServiceExt;

fn primary_state() -> (ApiState, Router) {
    let si = NodeDescriptor::new("p1", NodeRole::Proxy, "127.0.0.1", 18080);
    let state = build_daemon(si, ClusterConfig::default());
    state.core.bootstrap_primary();
    let router = create_control_routes().with_state(state.clone());
    (state, router)
}

async fn request(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
    caller: Option<&str>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(caller) = caller {
        builder = builder.header(HDR_CALLER_ID, caller);
    }
    let request = match body {
        Some(value) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(value.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(
            String::from_utf8_lossy(&bytes).into_owned(),
        ))
    };
    (status, value)
}

fn target_join_body(idx: u16) -> Value {
    let si = NodeDescriptor::new(
        format!("t{idx}"),
        NodeRole::Target,
        "127.0.0.1",
        19000 + idx * 10,
    );
    json!({ "si": si })
}

#[tokio::test]
async fn smap_is_served() {
    let (_state, router) = primary_state();
    let (status, smap) = request(&router, "GET", "/v1/cluster?what=smap", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(smap["version"], json!(1));
    assert_eq!(smap["primary_id"], json!("p1"));
    assert!(smap["proxies"]["p1"].is_object());
}

#[tokio::test]
async fn target_join_triggers_rebalance() {
    let (state, router) = primary_state();

    // First target: nothing to move yet.
    let (status, body) = request(
        &router,
        "POST",
        "/v1/cluster/self-join",
        Some(target_join_body(1)),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rebalance_id"], Value::Null);
    // The reply carries cluster metadata but never the map itself.
    assert!(body["meta"].is_object());
    assert!(body["meta"].get("smap").is_none() || body["meta"]["smap"].is_null());

    // Second target: the active set grows, an epoch opens.
    let (status, body) = request(
        &router,
        "POST",
        "/v1/cluster/self-join",
        Some(target_join_body(2)),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rebalance_id"], json!("1"));

    let (_, status_body) = request(&router, "GET", "/v1/cluster?what=status", None, None).await;
    let listeners = status_body.as_array().unwrap();
    assert_eq!(listeners.len(), 1);
    assert_eq!(listeners[0]["uuid"], json!("1"));
    assert_eq!(listeners[0]["notifiers"], json!(2));

    assert_eq!(state.core.smap().version, 3);
}

#[tokio::test]
async fn duplicate_daemon_id_is_rejected_while_original_lives() {
    let (_state, router) = primary_state();

    // A live "original": a minimal daemon answering health probes.
    let health_router =
        Router::new().route("/v1/health", axum::routing::get(|| async { StatusCode::OK }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, health_router).await.unwrap();
    });

    let mut original = NodeDescriptor::new("t7", NodeRole::Target, "127.0.0.1", 19700);
    original.control_net.port = port;
    let (status, _) = request(
        &router,
        "POST",
        "/v1/cluster/self-join",
        Some(json!({ "si": original })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Another process claims the same id from a different endpoint while
    // the original still answers at its old address.
    let imposter = NodeDescriptor::new("t7", NodeRole::Target, "127.0.0.1", 19990);
    let (status, body) = request(
        &router,
        "POST",
        "/v1/cluster/self-join",
        Some(json!({ "si": imposter })),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], json!("duplicate-daemon-id"));
}

#[tokio::test]
async fn keepalive_from_unknown_node_hints_rejoin() {
    let (_state, router) = primary_state();
    let (status, body) = request(
        &router,
        "POST",
        "/v1/cluster/keepalive",
        Some(target_join_body(9)),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rejoin"], json!(true));
}

#[tokio::test]
async fn notifications_drive_listener_to_completion() {
    let (state, router) = primary_state();
    for idx in 1..=2 {
        request(
            &router,
            "POST",
            "/v1/cluster/self-join",
            Some(target_join_body(idx)),
            None,
        )
        .await;
    }
    // Epoch "1" is open with notifiers {t1, t2}.
    let progress = json!({ "uuid": "1", "data": { "objects": 4 } });
    let (status, _) = request(
        &router,
        "POST",
        "/v1/notifs/progress",
        Some(progress),
        Some("t1"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let finished = json!({ "uuid": "1", "data": { "objects": 9 } });
    request(&router, "POST", "/v1/notifs/finished", Some(finished.clone()), Some("t1")).await;
    let nl = state.core.notifs.entry("1").expect("listener still live");
    assert!(!nl.finished());

    request(&router, "POST", "/v1/notifs/finished", Some(finished), Some("t2")).await;
    assert!(nl.finished());
    assert!(!nl.aborted());

    // Late arrival for an archived action is acknowledged and dropped.
    let late = json!({ "uuid": "1", "data": {} });
    let (status, _) = request(&router, "POST", "/v1/notifs/finished", Some(late), Some("t2")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn metasync_receiver_is_idempotent_and_lineage_checked() {
    let (state, router) = primary_state();
    let lineage = state.core.smap().uuid.clone();

    let newer = json!([{
        "kind": "bmd",
        "version": 5,
        "uuid": lineage,
        "msg": { "action": "set-config" },
        "payload": { "version": 5, "uuid": lineage }
    }]);
    let (status, _) = request(&router, "PUT", "/v1/metasync", Some(newer.clone()), Some("p0")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(state.core.owners.bmd.get().version, 5);

    // Re-delivery of the same version: silently dropped.
    let (status, _) = request(&router, "PUT", "/v1/metasync", Some(newer), Some("p0")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(state.core.owners.bmd.get().version, 5);

    let foreign = json!([{
        "kind": "bmd",
        "version": 9,
        "uuid": "foreign-lineage",
        "msg": { "action": "set-config" },
        "payload": { "version": 9, "uuid": "foreign-lineage" }
    }]);
    let (status, body) = request(&router, "PUT", "/v1/metasync", Some(foreign), Some("p0")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], json!("cluster-integrity"));
    assert_eq!(state.core.owners.bmd.get().version, 5);
}

#[tokio::test]
async fn set_config_updates_cluster_config() {
    let (state, router) = primary_state();
    let msg = json!({
        "action": "set-config",
        "value": { "rebalance_enabled": false }
    });
    let (status, _) = request(&router, "PUT", "/v1/cluster", Some(msg), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!state.core.config().rebalance.enabled);
    let config = state.core.owners.config.get();
    assert_eq!(config.version, 2, "persistent update bumps the revision");
}

#[tokio::test]
async fn mutations_on_non_primary_fail_without_forward_target() {
    let si = NodeDescriptor::new("p2", NodeRole::Proxy, "127.0.0.1", 18090);
    let state = build_daemon(si, ClusterConfig::default());
    // No map yet: no primary to forward to.
    let router = create_control_routes().with_state(state);
    let (status, body) = request(
        &router,
        "POST",
        "/v1/cluster/self-join",
        Some(target_join_body(1)),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], json!("not-primary"));
}

#[tokio::test]
async fn health_reflects_startup() {
    let si = NodeDescriptor::new("p3", NodeRole::Proxy, "127.0.0.1", 18100);
    let state = build_daemon(si, ClusterConfig::default());
    let router = create_control_routes().with_state(state.clone());

    let (status, _) = request(&router, "GET", "/v1/health", None, None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    state.core.mark_node_started();
    let (status, _) = request(&router, "GET", "/v1/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
}

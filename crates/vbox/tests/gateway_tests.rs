//! Editor socket tests against a real listener.

use serde_json::{Value, json};
use tokio_tungstenite::tungstenite;
use vbox::identity::StaticIdentity;
use vbox::storage::MemoryStore;
use vbox_protocol::{FileNode, find_node};

mod common;
use common::{
    connect, eventually, next_event, next_of_type, request, socket_url, spawn_server,
    test_app_with, test_config,
};

fn seeded_store() -> MemoryStore {
    MemoryStore::with_objects([
        ("projects/p1/index.html", "<h1>hi</h1>"),
        ("projects/p1/a.txt", "alpha"),
        ("projects/p1/src/", ""),
        ("projects/p1/src/main.js", "console.log(1)"),
    ])
}

fn identity() -> StaticIdentity {
    StaticIdentity::new()
        .owner("alice", "p1")
        .shared("bob", "p1")
}

fn files(value: &Value) -> Vec<FileNode> {
    serde_json::from_value(value.clone()).unwrap()
}

async fn handshake_status(url: String) -> u16 {
    match tokio_tungstenite::connect_async(url).await {
        Err(tungstenite::Error::Http(response)) => response.status().as_u16(),
        Err(other) => panic!("unexpected handshake error: {other}"),
        Ok(_) => panic!("handshake unexpectedly succeeded"),
    }
}

#[tokio::test]
async fn owner_receives_hydrated_tree() {
    let app = test_app_with(test_config(), seeded_store(), identity()).await;
    let addr = spawn_server(&app).await;

    let mut owner = connect(addr, "alice", "p1").await;
    let loaded = next_of_type(&mut owner, "loaded").await;
    let tree = files(&loaded["files"]);
    assert!(find_node(&tree, "projects/p1/index.html").is_some());
    assert!(find_node(&tree, "projects/p1/src").is_some_and(FileNode::is_folder));
    assert!(find_node(&tree, "projects/p1/src/main.js").is_some());

    // Hydration mirrors every file to disk before `loaded`.
    let mirrored = app.workspace.path().join("projects/p1/src/main.js");
    assert_eq!(std::fs::read_to_string(mirrored).unwrap(), "console.log(1)");
}

#[tokio::test]
async fn move_file_updates_tree_and_mirrors() {
    let app = test_app_with(test_config(), seeded_store(), identity()).await;
    let addr = spawn_server(&app).await;
    let mut owner = connect(addr, "alice", "p1").await;
    next_of_type(&mut owner, "loaded").await;

    let result = request(
        &mut owner,
        json!({
            "type": "moveFile",
            "fileId": "projects/p1/a.txt",
            "folderId": "projects/p1/src",
        }),
        1,
    )
    .await;
    assert_eq!(result["kind"], "ack");
    assert_eq!(result["success"], true);
    let tree = files(&result["files"]);
    assert!(find_node(&tree, "projects/p1/src/a.txt").is_some());
    assert!(find_node(&tree, "projects/p1/a.txt").is_none());

    let result = request(
        &mut owner,
        json!({ "type": "getFile", "fileId": "projects/p1/src/a.txt" }),
        2,
    )
    .await;
    assert_eq!(result, json!({ "kind": "content", "content": "alpha" }));

    let store = app.store.clone();
    assert!(
        eventually(|| store.get("projects/p1/src/a.txt").as_deref() == Some("alpha")
            && store.get("projects/p1/a.txt").is_none())
        .await
    );
    let moved = app.workspace.path().join("projects/p1/src/a.txt");
    assert!(eventually(|| moved.exists()).await);
    assert!(!app.workspace.path().join("projects/p1/a.txt").exists());
}

#[tokio::test]
async fn second_save_in_window_is_rate_limited() {
    let app = test_app_with(test_config(), seeded_store(), identity()).await;
    let addr = spawn_server(&app).await;
    let mut owner = connect(addr, "alice", "p1").await;
    next_of_type(&mut owner, "loaded").await;

    let save = |body: &str| {
        json!({ "type": "saveFile", "fileId": "projects/p1/a.txt", "body": body })
    };
    let first = request(&mut owner, save("beta"), 1).await;
    assert_eq!(first["success"], true);

    let second = request(&mut owner, save("gamma"), 2).await;
    assert_eq!(second["kind"], "rejected");
    assert_eq!(second["reason"], "rateLimited");

    let store = app.store.clone();
    assert!(eventually(|| store.get("projects/p1/a.txt").as_deref() == Some("beta")).await);
}

#[tokio::test]
async fn duplicate_connection_force_disconnects_previous() {
    let app = test_app_with(test_config(), seeded_store(), identity()).await;
    let addr = spawn_server(&app).await;

    let mut first = connect(addr, "alice", "p1").await;
    next_of_type(&mut first, "loaded").await;
    let mut second = connect(addr, "alice", "p1").await;
    next_of_type(&mut second, "loaded").await;

    let notice = next_of_type(&mut first, "forceDisconnect").await;
    assert!(notice["message"].is_string());
    assert!(next_event(&mut first).await.is_none());

    let snapshot: Value = reqwest::get(format!("http://{addr}/debug/connections"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(snapshot["totalConnections"], 1);
    assert_eq!(snapshot["connections"][0]["userKey"], "alice:p1");
    assert_eq!(snapshot["connections"][0]["isOwner"], true);
}

#[tokio::test]
async fn handshake_rejections_use_http_statuses() {
    let mut config = test_config();
    config.gateway.reconnect_cooldown_ms = 60_000;
    let app = test_app_with(config, seeded_store(), identity()).await;
    let addr = spawn_server(&app).await;

    assert_eq!(
        handshake_status(format!("ws://{addr}/socket?userId=alice")).await,
        400
    );
    assert_eq!(handshake_status(socket_url(addr, "mallory", "p1")).await, 403);

    let mut owner = connect(addr, "alice", "p1").await;
    next_of_type(&mut owner, "loaded").await;
    assert_eq!(handshake_status(socket_url(addr, "alice", "p1")).await, 429);
}

#[tokio::test]
async fn shared_user_without_owner_is_read_only() {
    let app = test_app_with(test_config(), seeded_store(), identity()).await;
    let addr = spawn_server(&app).await;

    let mut guest = connect(addr, "bob", "p1").await;
    let notice = next_of_type(&mut guest, "disableAccess").await;
    assert!(notice["message"].as_str().unwrap().contains("owner"));

    let result = request(
        &mut guest,
        json!({ "type": "saveFile", "fileId": "projects/p1/a.txt", "body": "x" }),
        1,
    )
    .await;
    assert_eq!(result["reason"], "accessDisabled");
    assert_eq!(app.store.get("projects/p1/a.txt").as_deref(), Some("alpha"));
}

#[tokio::test]
async fn owner_leaving_disables_shared_users() {
    let app = test_app_with(test_config(), seeded_store(), identity()).await;
    let addr = spawn_server(&app).await;

    let mut owner = connect(addr, "alice", "p1").await;
    next_of_type(&mut owner, "loaded").await;
    let mut guest = connect(addr, "bob", "p1").await;
    next_of_type(&mut guest, "loaded").await;

    let result = request(
        &mut guest,
        json!({ "type": "getFile", "fileId": "projects/p1/index.html" }),
        1,
    )
    .await;
    assert_eq!(result["content"], "<h1>hi</h1>");

    owner.close(None).await.unwrap();
    next_of_type(&mut guest, "ownerDisconnected").await;
    next_of_type(&mut guest, "disableAccess").await;

    let result = request(
        &mut guest,
        json!({ "type": "createFile", "name": "late.txt" }),
        2,
    )
    .await;
    assert_eq!(result["reason"], "accessDisabled");
}

#[tokio::test]
async fn malformed_frames_get_error_events() {
    let app = test_app_with(test_config(), seeded_store(), identity()).await;
    let addr = spawn_server(&app).await;
    let mut owner = connect(addr, "alice", "p1").await;
    next_of_type(&mut owner, "loaded").await;

    common::send(&mut owner, json!({ "type": "noSuchOperation" })).await;
    let error = next_of_type(&mut owner, "error").await;
    assert!(error["message"].as_str().unwrap().starts_with("Invalid message"));

    // The connection stays usable.
    let result = request(
        &mut owner,
        json!({ "type": "getFolder", "folderId": "projects/p1/src" }),
        1,
    )
    .await;
    assert_eq!(result, json!({ "kind": "ids", "ids": ["projects/p1/src/main.js"] }));
}

#[tokio::test]
async fn owner_leaving_kills_only_that_projects_terminals() {
    let identity = identity().owner("carol", "p2");
    let app = test_app_with(test_config(), seeded_store(), identity).await;
    let addr = spawn_server(&app).await;

    let mut owner = connect(addr, "alice", "p1").await;
    next_of_type(&mut owner, "loaded").await;
    let mut other = connect(addr, "carol", "p2").await;
    next_of_type(&mut other, "loaded").await;

    let created = request(&mut owner, json!({ "type": "createTerminal", "id": "t1" }), 1).await;
    assert_eq!(created, json!({ "kind": "terminal", "created": true }));
    let created = request(&mut other, json!({ "type": "createTerminal", "id": "t2" }), 1).await;
    assert_eq!(created["created"], true);

    let terminals = app.state.gateway.terminals.clone();
    assert!(terminals.info("t1").is_some());

    owner.close(None).await.unwrap();
    assert!(eventually(|| terminals.info("t1").is_none()).await);
    assert_eq!(
        terminals.info("t2").map(|info| info.project_id),
        Some("p2".to_string())
    );
}

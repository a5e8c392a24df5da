//! Integration tests over real WebSocket connections.
//!
//! These tests start a real server and connect real clients, verifying the
//! JSON protocol, room fan-out and disconnect cleanup.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use logos_collab::session::ACTION_LAYER_UPDATE;
use logos_collab::{
    ClientEvent, DocumentId, MemoryDocumentStore, ServerConfig, ServerEvent, SyncServer, UserId,
};
use logos_core::{DocumentState, Layer, Transform};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a server on a free port with one seeded document.
async fn start_test_server() -> (String, DocumentId, Arc<SyncServer>) {
    let documents = Arc::new(MemoryDocumentStore::new());
    let doc = Uuid::new_v4();
    documents.insert(
        doc,
        DocumentState::new("Jacket").with_layer(Layer::new("sleeve-1", "Left sleeve")),
    );

    let server = Arc::new(SyncServer::open(ServerConfig::for_testing(), documents).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (url, doc, server)
}

async fn connect(url: &str) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

async fn send(ws: &mut Client, event: ClientEvent) {
    ws.send(Message::Text(event.encode().unwrap().into()))
        .await
        .unwrap();
}

async fn recv(ws: &mut Client) -> ServerEvent {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for server event")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = msg {
            return ServerEvent::decode(text.as_str()).unwrap();
        }
    }
}

async fn join(ws: &mut Client, doc: DocumentId, user: UserId) {
    send(
        ws,
        ClientEvent::Join {
            document_id: doc,
            user_id: user,
        },
    )
    .await;
    match recv(ws).await {
        ServerEvent::Joined { session, .. } => assert_eq!(session.user_id, user),
        other => panic!("expected joined, got {other:?}"),
    }
}

#[tokio::test]
async fn test_ping_pong() {
    let (url, _, _server) = start_test_server().await;
    let mut ws = connect(&url).await;
    send(&mut ws, ClientEvent::Ping).await;
    assert_eq!(recv(&mut ws).await, ServerEvent::Pong);
}

#[tokio::test]
async fn test_malformed_frame_gets_error_and_connection_survives() {
    let (url, _, server) = start_test_server().await;
    let mut ws = connect(&url).await;

    ws.send(Message::Text(r#"{"type":"nope"}"#.to_string().into()))
        .await
        .unwrap();
    assert!(matches!(
        recv(&mut ws).await,
        ServerEvent::Error { code, .. } if code == "protocol_error"
    ));

    send(&mut ws, ClientEvent::Ping).await;
    assert_eq!(recv(&mut ws).await, ServerEvent::Pong);
    assert_eq!(server.stats().rejected_frames, 1);
}

#[tokio::test]
async fn test_join_unknown_document_is_rejected() {
    let (url, _, _server) = start_test_server().await;
    let mut ws = connect(&url).await;
    send(
        &mut ws,
        ClientEvent::Join {
            document_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
        },
    )
    .await;
    assert!(matches!(
        recv(&mut ws).await,
        ServerEvent::Error { code, .. } if code == "document_not_found"
    ));
}

#[tokio::test]
async fn test_two_clients_lock_edit_and_leave() {
    let (url, doc, server) = start_test_server().await;
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

    let mut a = connect(&url).await;
    join(&mut a, doc, alice).await;
    let mut b = connect(&url).await;
    join(&mut b, doc, bob).await;

    // Alice hears Bob arrive.
    assert!(matches!(
        recv(&mut a).await,
        ServerEvent::UserJoined { user_id, .. } if user_id == bob
    ));

    // Alice locks; the reply goes to her and the notification to Bob.
    send(&mut a, ClientEvent::Lock { layer_id: "sleeve-1".into() }).await;
    assert!(matches!(recv(&mut a).await, ServerEvent::LayerLocked { user_id, .. } if user_id == alice));
    assert!(matches!(recv(&mut b).await, ServerEvent::LayerLocked { user_id, .. } if user_id == alice));

    send(&mut b, ClientEvent::Lock { layer_id: "sleeve-1".into() }).await;
    assert_eq!(
        recv(&mut b).await,
        ServerEvent::LockRejected {
            layer_id: "sleeve-1".into(),
            holder: alice
        }
    );

    // Alice edits; Bob sees it, Alice only gets her reply.
    let layer = Layer::new("sleeve-1", "Left sleeve").with_transform(Transform::at(12.0, 4.0));
    send(
        &mut a,
        ClientEvent::Edit {
            layer_id: Some("sleeve-1".into()),
            action: ACTION_LAYER_UPDATE.into(),
            payload: serde_json::to_value(&layer).unwrap(),
        },
    )
    .await;
    let reply = recv(&mut a).await;
    assert!(matches!(&reply, ServerEvent::Edited { event } if event.sequence == 1));
    assert_eq!(recv(&mut b).await, reply);

    send(&mut a, ClientEvent::Ping).await;
    assert_eq!(recv(&mut a).await, ServerEvent::Pong);

    // Alice disconnects; Bob is told she left and the layer is free.
    a.close(None).await.unwrap();
    assert!(matches!(recv(&mut b).await, ServerEvent::UserLeft { user_id, .. } if user_id == alice));
    assert!(matches!(
        recv(&mut b).await,
        ServerEvent::LayerUnlocked { layer_id, .. } if layer_id == "sleeve-1"
    ));

    send(&mut b, ClientEvent::Lock { layer_id: "sleeve-1".into() }).await;
    assert!(matches!(recv(&mut b).await, ServerEvent::LayerLocked { user_id, .. } if user_id == bob));

    assert_eq!(server.stats().total_connections, 2);
}

#[tokio::test]
async fn test_versions_over_the_wire() {
    let (url, doc, _server) = start_test_server().await;
    let mut ws = connect(&url).await;
    join(&mut ws, doc, Uuid::new_v4()).await;

    for message in ["first", "second"] {
        send(
            &mut ws,
            ClientEvent::CreateVersion {
                message: Some(message.into()),
            },
        )
        .await;
        assert!(matches!(recv(&mut ws).await, ServerEvent::VersionCreated { .. }));
    }

    send(&mut ws, ClientEvent::ListVersions { limit: None }).await;
    match recv(&mut ws).await {
        ServerEvent::Versions { versions } => {
            let numbers: Vec<u64> = versions.iter().map(|v| v.version_number).collect();
            assert_eq!(numbers, vec![2, 1]);
        }
        other => panic!("expected versions, got {other:?}"),
    }

    send(&mut ws, ClientEvent::RestoreVersion { version: 1 }).await;
    assert!(matches!(
        recv(&mut ws).await,
        ServerEvent::VersionRestored { version, .. } if version.version_number == 3
    ));
}

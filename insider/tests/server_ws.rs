//! Socket-level smoke tests: a real client over a real WebSocket.

use std::path::Path;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use insider::{
    ClientEvent, ClientFrame, JoinRequest, RoomInfo, RoomServer, ServerEvent, ServerFrame,
    SessionConfig,
};

fn config(root: &Path) -> SessionConfig {
    SessionConfig {
        bind_addr: "127.0.0.1:0".into(),
        work_dir: root.join("workspace"),
        start_file: "main.txt".into(),
        shell: "sh".into(),
        persistence_dir: root.join("recordings"),
        jwt_public_key_path: None,
        platform_version: "test".into(),
        recovery_window: Duration::from_secs(120),
        room: RoomInfo {
            id: "room-ws".into(),
            name: "Socket test".into(),
            room_type: "interview".into(),
            created_at: "2026-08-01T00:00:00Z".into(),
        },
    }
}

async fn expect_event<S>(ws: &mut S, mut pred: impl FnMut(&ServerEvent) -> bool) -> ServerEvent
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let message = tokio::time::timeout(remaining, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Binary(data) = message {
            let frame = ServerFrame::decode(&data).expect("undecodable server frame");
            if pred(&frame.event) {
                return frame.event;
            }
        }
    }
}

#[tokio::test]
async fn test_join_over_websocket_syncs_state() {
    let dir = tempfile::tempdir().unwrap();
    let server = RoomServer::bind(config(dir.path())).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .unwrap();
    let join = ClientFrame::new(ClientEvent::Join(JoinRequest::default()));
    ws.send(Message::Binary(join.encode().unwrap().into()))
        .await
        .unwrap();

    expect_event(&mut ws, |e| {
        matches!(e, ServerEvent::ActiveFileContentRewritten(_))
    })
    .await;
    expect_event(&mut ws, |e| {
        matches!(e, ServerEvent::ActiveFilePathChanged(p) if p == "main.txt")
    })
    .await;
    let users = expect_event(&mut ws, |e| matches!(e, ServerEvent::UsersChanged(_))).await;
    match users {
        // Tokenless remote join lands in the candidate seat.
        ServerEvent::UsersChanged(users) => {
            assert_eq!(users.len(), 1);
            assert_eq!(users[0].role, insider::Role::Candidate);
        }
        _ => unreachable!(),
    }

    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn test_loopback_recorder_gets_privileged_stream() {
    let dir = tempfile::tempdir().unwrap();
    let server = RoomServer::bind(config(dir.path())).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .unwrap();
    let join = ClientFrame::new(ClientEvent::Join(JoinRequest {
        recorder_mode: true,
        ..JoinRequest::default()
    }));
    ws.send(Message::Binary(join.encode().unwrap().into()))
        .await
        .unwrap();

    // A recorder is invisible in every presence view, so its own join
    // produces an empty user list; a candidate would see itself.
    let users = expect_event(&mut ws, |e| matches!(e, ServerEvent::UsersChanged(_))).await;
    match users {
        ServerEvent::UsersChanged(users) => assert!(users.is_empty()),
        _ => unreachable!(),
    }

    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn test_non_join_first_frame_drops_connection() {
    let dir = tempfile::tempdir().unwrap();
    let server = RoomServer::bind(config(dir.path())).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .unwrap();
    let frame = ClientFrame::new(ClientEvent::Copy);
    ws.send(Message::Binary(frame.encode().unwrap().into()))
        .await
        .unwrap();

    // The server hangs up without ever sending a frame.
    let closed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Binary(_))) => panic!("server answered a bad handshake"),
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }
    })
    .await;
    assert!(closed.is_ok());
}

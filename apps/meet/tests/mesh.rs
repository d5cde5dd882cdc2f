use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use meet_client_core::chat::Delivery;
use meet_client_core::media::synthetic::{DeviceBehavior, SyntheticDevices};
use meet_client_core::media::TrackKind;
use meet_client_core::notice::NoticeKind;
use meet_client_core::peer::mock::MockConnector;
use meet_client_core::{ClientConfig, Meeting, MeetingOptions};
use meet_road::{registry::RoomRegistry, router, AppState};
use tokio::net::TcpListener;
use tokio::time::Instant;

async fn spawn_server() -> String {
    let registry = Arc::new(RoomRegistry::new());
    let app = router(AppState::with_registry(registry));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    format!("ws://{addr}/ws")
}

struct Member {
    meeting: Meeting,
    connector: Arc<MockConnector>,
}

async fn join_with(url: &str, name: &str, devices: SyntheticDevices) -> Member {
    let config = ClientConfig {
        server_url: url.to_string(),
        stun_urls: Vec::new(),
        negotiation_timeout: Duration::from_secs(2),
        ..ClientConfig::default()
    };
    let connector = Arc::new(MockConnector::new());
    let meeting = Meeting::join(
        &config,
        MeetingOptions {
            room: "standup".into(),
            display_name: name.into(),
            audio: true,
            video: true,
        },
        connector.clone(),
        Arc::new(devices),
    )
    .await
    .unwrap();
    Member { meeting, connector }
}

async fn join(url: &str, name: &str) -> Member {
    join_with(url, name, SyntheticDevices::new()).await
}

/// Step every member round-robin until `done` holds.
async fn drive_until<F>(members: &mut [Member], mut done: F)
where
    F: FnMut(&[Member]) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done(&*members) {
        assert!(Instant::now() < deadline, "meetings did not converge");
        for member in members.iter_mut() {
            member.meeting.step_for(Duration::from_millis(5)).await;
        }
    }
}

fn meshed(members: &[Member], expected_peers: usize) -> bool {
    members.iter().all(|m| {
        let peers = m.meeting.peers();
        peers.session_count() == expected_peers
            && peers.is_settled()
            && peers.sessions().all(|s| s.remote_tracks().len() >= 2)
    })
}

#[test_timeout::tokio_timeout_test]
async fn three_members_form_a_full_mesh() {
    let url = spawn_server().await;
    let mut members = vec![
        join(&url, "Ada").await,
        join(&url, "Bob").await,
        join(&url, "Cy").await,
    ];

    drive_until(&mut members, |m| meshed(m, 2)).await;

    for member in &members {
        let participants = member.meeting.presence().participants();
        assert_eq!(participants.len(), 3);
        for other in &members {
            if other.meeting.local_id() == member.meeting.local_id() {
                continue;
            }
            let session = member.meeting.peers().session(other.meeting.local_id()).unwrap();
            let kinds: Vec<TrackKind> = session.remote_tracks().iter().map(|t| t.kind).collect();
            assert!(kinds.contains(&TrackKind::Audio));
            assert!(kinds.contains(&TrackKind::Video));
            assert!(member
                .meeting
                .presence()
                .get(other.meeting.local_id())
                .is_some_and(|p| p.media_connected));
        }
        // exactly one connection per remote, no duplicates from glare
        assert_eq!(member.connector.connection_count(), 2);
    }
}

#[test_timeout::tokio_timeout_test]
async fn screen_share_swaps_video_and_restores_camera() {
    let url = spawn_server().await;
    let mut members = vec![join(&url, "Ada").await, join(&url, "Bob").await];
    drive_until(&mut members, |m| meshed(m, 1)).await;

    let ada_id = members[0].meeting.local_id().to_string();
    let bob_id = members[1].meeting.local_id().to_string();
    let camera_id = members[0]
        .meeting
        .media()
        .camera_stream()
        .and_then(|s| s.first_live(TrackKind::Video))
        .map(|t| t.id().to_string())
        .unwrap();

    members[0].meeting.start_screen_share().await;
    assert!(members[0].meeting.media().is_sharing_screen());
    let screen_id = members[0]
        .meeting
        .media()
        .screen_stream()
        .and_then(|s| s.first_live(TrackKind::Video))
        .map(|t| t.id().to_string())
        .unwrap();

    drive_until(&mut members, |m| {
        meshed(m, 1)
            && m[1]
                .meeting
                .peers()
                .session(&ada_id)
                .is_some_and(|s| s.remote_tracks().iter().any(|t| t.id == screen_id))
    })
    .await;
    let sent = members[0].connector.latest(&bob_id).unwrap().local_track_ids();
    assert!(sent.contains(&screen_id));
    assert!(!sent.contains(&camera_id));
    assert!(members[0].meeting.media().audio_enabled());

    members[0].meeting.stop_screen_share().await;
    assert!(!members[0].meeting.media().is_sharing_screen());
    drive_until(&mut members, |m| meshed(m, 1)).await;

    let sent = members[0].connector.latest(&bob_id).unwrap().local_track_ids();
    assert!(!sent.contains(&screen_id));
    assert!(sent.iter().any(|id| {
        members[0]
            .meeting
            .media()
            .camera_stream()
            .is_some_and(|s| s.tracks().iter().any(|t| t.id() == id))
    }));
    assert!(members[0].meeting.media().audio_enabled());
    assert!(members[0].meeting.media().video_enabled());
}

#[test_timeout::tokio_timeout_test]
async fn leaving_member_is_dropped_from_every_peer() {
    let url = spawn_server().await;
    let mut members = vec![
        join(&url, "Ada").await,
        join(&url, "Bob").await,
        join(&url, "Cy").await,
    ];
    drive_until(&mut members, |m| meshed(m, 2)).await;

    let mut leaver = members.pop().unwrap();
    let leaver_id = leaver.meeting.local_id().to_string();
    leaver.meeting.leave().await;
    assert!(leaver.meeting.peers().session_count() == 0);
    assert!(leaver.meeting.media().camera_stream().is_none());

    drive_until(&mut members, |m| {
        m.iter().all(|member| {
            member.meeting.peers().session(&leaver_id).is_none()
                && member.meeting.presence().get(&leaver_id).is_none()
        })
    })
    .await;

    for member in &members {
        assert!(member.connector.latest(&leaver_id).unwrap().is_closed());
        assert_eq!(member.meeting.presence().participants().len(), 2);
        assert_eq!(member.meeting.peers().session_count(), 1);
    }
}

#[test_timeout::tokio_timeout_test]
async fn chat_reaches_peers_and_confirms_locally() {
    let url = spawn_server().await;
    let mut members = vec![join(&url, "Ada").await, join(&url, "Bob").await];
    drive_until(&mut members, |m| {
        m.iter().all(|member| member.meeting.presence().participants().len() == 2)
    })
    .await;

    let message_id = members[0].meeting.send_chat("hello there").unwrap();
    drive_until(&mut members, |m| {
        m[0].meeting.chat().entries().iter().any(|e| e.delivery == Delivery::Confirmed)
            && !m[1].meeting.chat().entries().is_empty()
    })
    .await;

    let ada = members[0].meeting.chat().entries();
    assert_eq!(ada.len(), 1);
    assert_eq!(ada[0].message_id.as_deref(), Some(message_id.as_str()));
    let bob = members[1].meeting.chat().entries();
    assert_eq!(bob.len(), 1);
    assert_eq!(bob[0].text, "hello there");
    assert_eq!(bob[0].display_name, "Ada");
    assert_eq!(bob[0].delivery, Delivery::Received);
}

#[test_timeout::tokio_timeout_test]
async fn denied_camera_still_joins_with_audio() {
    let url = spawn_server().await;
    let mut members = vec![
        join_with(
            &url,
            "Ada",
            SyntheticDevices::new().with_camera(DeviceBehavior::Deny),
        )
        .await,
        join(&url, "Bob").await,
    ];

    let ada = &members[0].meeting;
    assert!(ada.media().audio_enabled());
    assert!(!ada.media().video_enabled());
    assert!(ada.notices().iter().any(|n| n.kind == NoticeKind::Permission));

    drive_until(&mut members, |m| {
        m.iter().all(|member| {
            let peers = member.meeting.peers();
            peers.session_count() == 1 && peers.is_settled()
        }) && m[1]
            .meeting
            .presence()
            .participants()
            .iter()
            .any(|p| p.display_name == "Ada" && p.has_audio && !p.has_video)
    })
    .await;

    let bob_view = members[1]
        .meeting
        .peers()
        .session(members[0].meeting.local_id())
        .unwrap();
    assert!(bob_view
        .remote_tracks()
        .iter()
        .all(|t| t.kind == TrackKind::Audio));
}

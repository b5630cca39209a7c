//! # Immersive Protocol Verification
//!
//! End-to-end checks across the four crates: frame resolution, focus
//! arbitration, recentering, request/response, the version handshake,
//! commit cancellation and the degenerate FIXED position.
//!
//! Run with: cargo test -p periscope --test immersive_protocol

use async_trait::async_trait;
use parking_lot::Mutex;
use periscope::core::{
    frames, Cartesian3, Cartographic, Ellipsoid, Entity, EntityCollection, FrameError, Quaternion, ReferenceFrame,
    Timestamp,
};
use periscope::headless::{HeadlessSandbox, InProcessFrame, StaticLoader};
use periscope::messaging::{Channel, ChannelManager, HandlerError, ManagerPort, MessagingError};
use periscope::reality_view::frame_state_for;
use periscope::shared::{
    FrameOrientation, FramePosition, FrameRef, FrameState, Frustum, ProtocolVersion, RealityId, RealityRef,
    UNHANDLED_REQUEST,
};
use periscope::{
    CommitOutcome, Context, ImmersiveManager, PeriscopeConfig, RealityError, RealityKind, RealityRegistry,
    RealityView, ResourceError, ResourceLoader, Sandbox, SandboxDocument, SandboxKey,
};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Notify;

const URL: &str = "https://content.example/";

// ============================================================================
// HELPERS
// ============================================================================

fn manager() -> ImmersiveManager {
    let config = PeriscopeConfig::default();
    let entities = EntityCollection::new();
    let (view, _sandbox) = HeadlessSandbox::view(Arc::new(StaticLoader::new()), config.view.default_fov);
    ImmersiveManager::new(
        Context::new(entities.clone(), view, &config),
        ChannelManager::new(ProtocolVersion::default()),
        Arc::new(RealityRegistry::new(entities)),
        &config,
    )
}

fn connect(
    manager: &ImmersiveManager,
    version: ProtocolVersion,
) -> (Arc<Channel>, ManagerPort, Result<(), MessagingError>) {
    let port = ManagerPort::new(version);
    let channel = manager.channels().create_channel(InProcessFrame::new(port.clone()));
    channel.set_url(Some(URL));
    channel.on_load();
    let accepted = channel.handle_announcement(port.announcement(URL));
    (channel, port, accepted)
}

fn fixed_state(position: Cartesian3) -> FrameState {
    FrameState {
        reference_frame: FrameRef::Fixed,
        position: FramePosition {
            cartesian: position,
            cartographic_degrees: None,
        },
        orientation: FrameOrientation {
            unit_quaternion: Quaternion::IDENTITY,
            unit_quaternion_relative: Quaternion::IDENTITY,
        },
        reality: RealityRef {
            id: RealityId::new("external"),
        },
        ..FrameState::default()
    }
}

// ============================================================================
// FRAME RESOLUTION
// ============================================================================

#[test]
fn verify_position_round_trips_through_frames() {
    let base = Entity::named("base")
        .with_position(Cartesian3::new(6_378_137.0, 0.0, 0.0), Some(ReferenceFrame::Fixed))
        .with_orientation(Quaternion::from_axis_angle(Cartesian3::UNIT_Z, 0.7))
        .into_shared();
    let arm = Entity::named("arm")
        .with_position(Cartesian3::new(2.0, -1.0, 0.5), Some(base.clone().into()))
        .with_orientation(Quaternion::from_axis_angle(Cartesian3::UNIT_X, -1.1))
        .into_shared();
    let tip = Entity::named("tip")
        .with_position(Cartesian3::new(0.25, 0.0, 3.0), Some(arm.clone().into()))
        .into_shared();

    for time in [0.0, 1.5, 60.0] {
        let time = Timestamp::from_seconds(time);
        let native = frames::native_frame(&tip).unwrap();
        let original = frames::position_in_frame(&tip, time, &native).unwrap();
        for target in [ReferenceFrame::Fixed, base.clone().into(), arm.clone().into()] {
            let there = frames::position_in_frame(&tip, time, &target).unwrap();
            let back = frames::convert_point(there, &target, &native, time).unwrap();
            assert!(back.equals_epsilon(original, 1e-6), "{back:?} != {original:?}");
        }
    }
}

#[test]
fn verify_zero_fixed_position_is_fatal() {
    let eye = Entity::named("eye")
        .with_position(Cartesian3::ZERO, Some(ReferenceFrame::Fixed))
        .into_shared();
    let result = frame_state_for(&eye, Timestamp::EPOCH, Frustum::default(), &RealityId::new("r"));
    assert!(matches!(
        result,
        Err(RealityError::Frame(FrameError::DegeneratePosition(_)))
    ));

    let orientation = frames::orientation_in_frame(&eye, Timestamp::EPOCH, &ReferenceFrame::Fixed);
    assert!(matches!(orientation, Err(FrameError::DegeneratePosition(_))));

    let config = PeriscopeConfig::default();
    let (view, _sandbox) = HeadlessSandbox::view(Arc::new(StaticLoader::new()), config.view.default_fov);
    let context = Context::new(EntityCollection::new(), view, &config);
    assert!(context.update(&fixed_state(Cartesian3::ZERO)).is_err());
}

// ============================================================================
// RECENTERING
// ============================================================================

#[test]
fn verify_origin_change_threshold() {
    let config = PeriscopeConfig::default();
    let (view, _sandbox) = HeadlessSandbox::view(Arc::new(StaticLoader::new()), config.view.default_fov);
    let context = Context::new(EntityCollection::new(), view, &config);
    let changes = Arc::new(Mutex::new(0));
    let c = Arc::clone(&changes);
    context.events().origin_change.on(move |()| *c.lock() += 1);

    let start = Cartographic::from_degrees(2.35, 48.85, 35.0);
    let at = |meters_north: f64| {
        let mut position = start;
        position.latitude += meters_north / 6_371_000.0;
        Ellipsoid::WGS84.cartographic_to_cartesian(position)
    };

    context.update(&fixed_state(at(0.0))).unwrap();
    assert_eq!(*changes.lock(), 1);

    // Small steps that stay within 5 km of the origin never recenter.
    for step in 1..=40 {
        context.update(&fixed_state(at(f64::from(step) * 100.0))).unwrap();
    }
    assert_eq!(*changes.lock(), 1);

    // One step past the threshold recenters exactly once.
    context.update(&fixed_state(at(5_200.0))).unwrap();
    assert_eq!(*changes.lock(), 2);
    context.update(&fixed_state(at(5_250.0))).unwrap();
    assert_eq!(*changes.lock(), 2);
}

// ============================================================================
// FOCUS
// ============================================================================

#[tokio::test]
async fn verify_focus_is_exclusive_and_idempotent() {
    let manager = manager();
    let channels: Vec<_> = (0..3).map(|_| connect(&manager, ProtocolVersion::default()).0).collect();
    let blurs: Vec<_> = channels
        .iter()
        .map(|channel| {
            let count = Arc::new(Mutex::new(0));
            let c = Arc::clone(&count);
            channel.events().blur.on(move |()| *c.lock() += 1);
            count
        })
        .collect();

    for index in [0, 2, 1, 1, 0, 2, 2] {
        manager.channels().focus(channels[index].id());
        let focused: Vec<_> = channels.iter().filter(|c| c.has_focus()).map(|c| c.id()).collect();
        assert_eq!(focused, vec![channels[index].id()]);
    }

    let before = *blurs[2].lock();
    manager.channels().focus(channels[2].id());
    assert_eq!(*blurs[2].lock(), before);
}

// ============================================================================
// REQUEST / RESPONSE
// ============================================================================

#[tokio::test]
async fn verify_echo_and_unhandled_requests() {
    let manager = manager();
    manager
        .channels()
        .handlers()
        .register("echo", |_channel, payload| Ok::<_, HandlerError>(payload));
    manager
        .channels()
        .handlers()
        .register("fail", |_channel, _payload| Err(HandlerError::new("no such place")));
    let (_channel, port, accepted) = connect(&manager, ProtocolVersion::default());
    accepted.unwrap();

    let echo = port.request("echo", json!({"x": 1}));
    let unhandled = port.request("teleport", json!({}));
    let failed = port.request("fail", json!({}));
    manager.pump();
    port.pump();

    assert_eq!(echo.await.unwrap(), json!({"x": 1}));
    match unhandled.await {
        Err(MessagingError::Remote(error)) => assert_eq!(error.message, UNHANDLED_REQUEST),
        other => panic!("expected a rejection, got {other:?}"),
    }
    match failed.await {
        Err(MessagingError::Remote(error)) => assert_eq!(error.message, "no such place"),
        other => panic!("expected a rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn verify_unload_rejects_in_flight_requests() {
    let manager = manager();
    let (channel, _port, _) = connect(&manager, ProtocolVersion::default());

    let pending = channel.request("slow", json!({})).unwrap();
    channel.unload();
    assert_eq!(pending.await, Err(MessagingError::ChannelUnloaded));
}

// ============================================================================
// VERSION HANDSHAKE
// ============================================================================

#[tokio::test]
async fn verify_version_check() {
    let manager = manager();

    let (newer, _, refused) = connect(&manager, ProtocolVersion::new(1, 3, 0));
    assert!(matches!(refused, Err(MessagingError::ProtocolVersionMismatch { .. })));
    assert!(!newer.is_connected());

    let (older, _, accepted) = connect(&manager, ProtocolVersion::new(1, 1, 0));
    assert!(accepted.is_ok());
    assert!(older.is_connected());

    let (same, _, accepted) = connect(&manager, ProtocolVersion::new(1, 2, 0));
    assert!(accepted.is_ok());
    assert!(same.is_connected());
}

// ============================================================================
// COMMIT CANCELLATION
// ============================================================================

struct GatedLoader {
    gate: Notify,
}

#[async_trait]
impl ResourceLoader for GatedLoader {
    async fn load(&self, _url: &str) -> Result<String, ResourceError> {
        self.gate.notified().await;
        Ok(String::new())
    }
}

#[derive(Default)]
struct CountingSandbox {
    documents: Mutex<Vec<SandboxKey>>,
    posted: Mutex<Vec<(SandboxKey, String)>>,
}

impl Sandbox for CountingSandbox {
    fn materialize(&self, document: SandboxDocument) -> Result<(), ResourceError> {
        self.documents.lock().push(document.key);
        Ok(())
    }

    fn post(&self, key: &SandboxKey, message: periscope::shared::WireMessage) {
        self.posted.lock().push((key.clone(), message.message_type));
    }

    fn detach(&self) {}
}

#[tokio::test]
async fn verify_cancelled_commit_never_reaches_sandbox() {
    let loader = Arc::new(GatedLoader { gate: Notify::new() });
    let sandbox = Arc::new(CountingSandbox::default());
    let view = RealityView::new(sandbox.clone(), loader.clone(), 1.0);
    let realities = RealityRegistry::new(EntityCollection::new());
    let panorama = realities.create(RealityKind::Panorama);

    let commit = tokio::spawn(view.set_reality(Some(Arc::clone(&panorama))));
    tokio::task::yield_now().await;
    view.disable();
    loader.gate.notify_waiters();

    assert_eq!(commit.await.unwrap().unwrap(), CommitOutcome::Cancelled);
    assert!(panorama.tick(Timestamp::from_seconds(1.0)));
    panorama.options().set("panorama", json!("https://content.example/pano.jpg"));

    assert!(sandbox.documents.lock().is_empty());
    assert!(sandbox.posted.lock().is_empty());
    assert!(!view.is_ready());
}

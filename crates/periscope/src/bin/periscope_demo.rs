//! # Periscope Demo
//!
//! A headless manager and one content context wired together in a single
//! process. The content asks for a panorama reality; the manager focuses
//! it, commits the reality into a headless sandbox and relays its frame
//! states back.
//!
//! ```bash
//! # Defaults
//! periscope_demo
//!
//! # With a configuration file and verbose logs
//! RUST_LOG=periscope=debug periscope_demo periscope.toml
//! ```

use periscope::core::{frames, EntityCollection, ReferenceFrame};
use periscope::headless::{HeadlessSandbox, InProcessFrame, StaticLoader};
use periscope::messaging::{ChannelManager, Connection, ManagerPort};
use periscope::shared::PresentationMode;
use periscope::{ContentSession, Context, ImmersiveManager, PeriscopeConfig, RealityKind, RealityRegistry};
use serde_json::json;
use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const CONTENT_URL: &str = "https://content.example/tour";
const PANORAMA_URL: &str = "https://content.example/pano/atrium.jpg";
const DISPLAY_REFRESH: Duration = Duration::from_millis(16);
const FRAMES: usize = 5;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => match PeriscopeConfig::load(&path) {
            Ok(config) => config,
            Err(error) => {
                tracing::error!(%path, %error, "configuration rejected");
                return ExitCode::FAILURE;
            }
        },
        None => PeriscopeConfig::default(),
    };

    println!("═══════════════════════════════════════════════════════════════════");
    println!("                    PERISCOPE DEMO v{}", env!("CARGO_PKG_VERSION"));
    println!("                 protocol {} · headless", config.protocol.version);
    println!("═══════════════════════════════════════════════════════════════════");

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "demo failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: PeriscopeConfig) -> Result<(), Box<dyn Error>> {
    // === CONTENT ===
    let content_entities = EntityCollection::new();
    let content_realities = Arc::new(RealityRegistry::new(content_entities.clone()));
    let (content_view, _content_sandbox) =
        HeadlessSandbox::view(Arc::new(StaticLoader::new()), config.view.default_fov);
    let content_context = Context::new(content_entities, content_view, &config);
    let port = ManagerPort::new(config.protocol.version);
    let session = ContentSession::new(Arc::clone(&content_context), port.clone(), Arc::clone(&content_realities));

    let panorama = content_realities.create(RealityKind::Panorama);
    panorama.options().set("panorama", json!(PANORAMA_URL));

    // === MANAGER ===
    let loader = panorama
        .js_deps()
        .iter()
        .fold(StaticLoader::new(), |loader, url| loader.with(url.clone(), "/* vendored */"));
    let manager_entities = EntityCollection::new();
    let manager_realities = Arc::new(RealityRegistry::with_frame_rate(
        manager_entities.clone(),
        config.reality.target_frame_rate,
    ));
    let (manager_view, manager_sandbox) = HeadlessSandbox::view(Arc::new(loader), config.view.default_fov);
    let manager_context = Context::new(manager_entities, manager_view, &config);
    let channels = ChannelManager::new(config.protocol.version);
    channels.capabilities().set_ready("geolocation");
    let manager = ImmersiveManager::new(manager_context, channels, Arc::clone(&manager_realities), &config);

    // === HANDSHAKE ===
    let channel = manager.channels().create_channel(InProcessFrame::new(port.clone()));
    channel.set_url(Some(CONTENT_URL));
    channel.on_load();
    channel.handle_announcement(port.announcement(CONTENT_URL))?;

    match session.start(config.connect_timeout()).await {
        Connection::Managed(payload) => println!("   ✓ content connected (capabilities: {:?})", payload.capabilities),
        Connection::Standalone => println!("   ✗ content running standalone"),
    }
    match port
        .capabilities()
        .when_ready("geolocation", config.capability_timeout())
        .await
    {
        Ok(()) => println!("   ✓ geolocation ready"),
        Err(error) => println!("   ✗ geolocation: {error}"),
    }

    // === REQUIREMENTS ===
    if let Some(commit) = content_context.set_required_reality(Some(Arc::clone(&panorama))) {
        commit.detach();
    }
    content_context.set_required_capabilities(vec!["geolocation".into()]);
    content_context.set_required_reference_frames(vec!["DEVICE".into()]);
    manager.pump();
    manager.channels().focus(channel.id());
    manager.channels().hide_blurred();

    let Some(rendered) = manager.context().required_reality() else {
        return Err("manager chose no reality".into());
    };
    for _ in 0..64 {
        if manager.context().reality_view().is_ready() {
            break;
        }
        tokio::task::yield_now().await;
    }
    println!(
        "   ✓ rendering {} ({:?}, {} documents built)",
        rendered.id(),
        rendered.kind(),
        manager_sandbox.documents_built()
    );

    // === FRAMES ===
    let driver = {
        let rendered = Arc::clone(&rendered);
        tokio::spawn(async move { rendered.run_loop(DISPLAY_REFRESH).await })
    };
    manager.set_presentation_mode(PresentationMode::Immersive);

    let local_origin = ReferenceFrame::Entity(Arc::clone(content_context.local_origin()));
    let mut seen = 0;
    let mut last_frame = None;
    for _ in 0..FRAMES * 20 {
        if seen == FRAMES {
            break;
        }
        tokio::time::sleep(DISPLAY_REFRESH).await;
        manager.pump();
        if session.pump() == 0 {
            continue;
        }
        let Some(frame_state) = content_context.frame_state() else {
            continue;
        };
        if last_frame.replace(frame_state.frame_number) == Some(frame_state.frame_number) {
            continue;
        }
        seen += 1;
        let eye = frames::position_in_frame(content_context.eye(), frame_state.time, &local_origin);
        println!(
            "   frame {:>3} from {} · eye in local origin {:?}",
            frame_state.frame_number, frame_state.reality.id, eye
        );
    }

    if seen < FRAMES {
        return Err(format!("only {seen} of {FRAMES} frames arrived").into());
    }

    let stats = rendered.tick_stats();
    println!();
    println!("   presentation: {:?}", session.presentation_mode());
    println!(
        "   ticks: gap min {}µs max {}µs avg {}µs, late {}",
        stats.min_gap_us, stats.max_gap_us, stats.avg_gap_us, stats.late_ticks
    );

    // === TEARDOWN ===
    port.unload();
    manager.pump();
    for reality in manager_realities.query() {
        manager_realities.destroy(reality.id());
    }
    driver.await?;
    content_context.destroy();
    manager.context().destroy();
    println!("   ✓ shut down cleanly");
    Ok(())
}

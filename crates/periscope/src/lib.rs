//! # Periscope
//!
//! Realities, reality views, presentation contexts and the immersive
//! manager that arbitrates them between content channels.
//!
//! ```text
//!   ┌──────────────────────── manager ────────────────────────┐
//!   │ Reality ──tick──> RealityView ──update──> Context       │
//!   │    ^                   │ sandbox             │          │
//!   │    │ RealityPolicy     v                     v          │
//!   │ ImmersiveManager <── ChannelManager ──broadcast update──┼──┐
//!   └─────────────────────────────────────────────────────────┘  │ MessagePort
//!   ┌──────────────────────── content ────────────────────────┐  │
//!   │ ContentSession <── ManagerPort <────────────────────────┼──┘
//!   │      └──> Context (eye, localOrigin, ...)               │
//!   └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`reality`]: tick sources, their kinds, pacing and registry
//! - [`reality_view`]: commits a reality into a sandbox and relays its ticks
//! - [`context`]: frame states to a recenterable local coordinate system
//! - [`manager`]: per-channel requirements and reality selection
//! - [`session`]: the content side of the manager protocol
//! - [`headless`]: in-process sandbox, loader and content frame
//! - [`config`]: TOML configuration
//!
//! The library logs through `tracing` and never installs a subscriber.

#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod context;
pub mod error;
pub mod headless;
pub mod manager;
pub mod options;
pub mod reality;
pub mod reality_view;
pub mod session;

pub use config::PeriscopeConfig;
pub use context::{Context, ContextEvents, RealityChange, RequiredRealityChange, ViewportSize};
pub use error::{CommitError, CommitResult, ConfigError, ConfigResult, RealityError, RealityResult, ResourceError};
pub use manager::{DefaultPolicy, ImmersiveManager, PolicyRequest, RealityPolicy};
pub use options::{OptionChange, Options};
pub use reality::{FramePacer, Reality, RealityKind, RealityRegistry, RealityTick, TickStats};
pub use reality_view::{
    CancelToken, Commit, CommitOutcome, RealityView, ResourceLoader, Sandbox, SandboxDocument, SandboxKey,
};
pub use session::ContentSession;

pub use periscope_core as core;
pub use periscope_messaging as messaging;
pub use periscope_shared as shared;

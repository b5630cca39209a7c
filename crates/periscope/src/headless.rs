//! In-process seams for hosts without a browser: a sandbox that answers
//! the render handshake itself, a loader backed by a URL map, and a content
//! frame that hands its port to a [`ManagerPort`] in the same process.

use crate::error::ResourceError;
use crate::reality_view::{messages, RealityView, ResourceLoader, Sandbox, SandboxDocument, SandboxKey, WeakRealityView};
use async_trait::async_trait;
use parking_lot::Mutex;
use periscope_messaging::{ContentFrame, ManagerPort, MessagePort};
use periscope_shared::{ConnectPayload, WireMessage};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct SandboxState {
    document: Option<SandboxDocument>,
    posted: Vec<WireMessage>,
    documents: usize,
}

/// A sandbox with no renderer. Every render routine "attaches" successfully.
#[derive(Debug, Default)]
pub struct HeadlessSandbox {
    view: Mutex<Option<WeakRealityView>>,
    state: Mutex<SandboxState>,
}

impl HeadlessSandbox {
    /// Creates a sandbox; [`HeadlessSandbox::bind`] it to its view.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Builds a view rendering into a fresh headless sandbox.
    #[must_use]
    pub fn view(loader: Arc<dyn ResourceLoader>, default_fov: f64) -> (RealityView, Arc<Self>) {
        let sandbox = Self::new();
        let view = RealityView::new(Arc::clone(&sandbox) as Arc<dyn Sandbox>, loader, default_fov);
        sandbox.bind(&view);
        (view, sandbox)
    }

    /// Routes replies to `view`.
    pub fn bind(&self, view: &RealityView) {
        *self.view.lock() = Some(view.downgrade());
    }

    /// The current document, if one is materialized.
    #[must_use]
    pub fn document(&self) -> Option<SandboxDocument> {
        self.state.lock().document.clone()
    }

    /// Number of documents materialized so far.
    #[must_use]
    pub fn documents_built(&self) -> usize {
        self.state.lock().documents
    }

    /// Messages posted into the sandbox, oldest first.
    #[must_use]
    pub fn posted(&self) -> Vec<WireMessage> {
        self.state.lock().posted.clone()
    }

    /// The latest posted message of `message_type`.
    #[must_use]
    pub fn last(&self, message_type: &str) -> Option<WireMessage> {
        self.state
            .lock()
            .posted
            .iter()
            .rev()
            .find(|m| m.message_type == message_type)
            .cloned()
    }

    fn reply(&self, key: &SandboxKey, message_type: &str) {
        let view = self.view.lock().as_ref().and_then(WeakRealityView::upgrade);
        match view {
            Some(view) => view.receive(key, WireMessage::new(message_type, Value::Null)),
            None => tracing::debug!(%key, "headless sandbox is not bound to a view"),
        }
    }
}

impl Sandbox for HeadlessSandbox {
    fn materialize(&self, document: SandboxDocument) -> Result<(), ResourceError> {
        let key = document.key.clone();
        {
            let mut state = self.state.lock();
            state.document = Some(document);
            state.posted.clear();
            state.documents += 1;
        }
        self.reply(&key, messages::CONNECT);
        Ok(())
    }

    fn post(&self, key: &SandboxKey, message: WireMessage) {
        let start = message.message_type == messages::START_RENDER_SCRIPT;
        {
            let mut state = self.state.lock();
            if state.document.as_ref().map(|d| &d.key) != Some(key) {
                return;
            }
            state.posted.push(message);
        }
        if start {
            self.reply(key, messages::READY);
        }
    }

    fn detach(&self) {
        self.state.lock().document = None;
    }
}

/// Serves resources from an in-memory URL map.
#[derive(Debug, Default)]
pub struct StaticLoader {
    resources: HashMap<String, String>,
}

impl StaticLoader {
    /// An empty loader: every load fails.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a resource.
    #[must_use]
    pub fn with(mut self, url: impl Into<String>, body: impl Into<String>) -> Self {
        self.resources.insert(url.into(), body.into());
        self
    }
}

#[async_trait]
impl ResourceLoader for StaticLoader {
    async fn load(&self, url: &str) -> Result<String, ResourceError> {
        self.resources
            .get(url)
            .cloned()
            .ok_or_else(|| ResourceError::new(format!("no resource at {url}")))
    }
}

/// A content frame whose content runs in this process behind `port`.
///
/// Navigation is recorded; the host is expected to call
/// [`periscope_messaging::Channel::on_load`] and forward
/// [`ManagerPort::announcement`] itself.
#[derive(Debug)]
pub struct InProcessFrame {
    port: ManagerPort,
    url: Mutex<Option<String>>,
    visible: Mutex<bool>,
}

impl InProcessFrame {
    /// Wraps the content's port.
    #[must_use]
    pub fn new(port: ManagerPort) -> Arc<Self> {
        Arc::new(Self {
            port,
            url: Mutex::new(None),
            visible: Mutex::new(true),
        })
    }

    /// Last URL the frame was asked to load.
    #[must_use]
    pub fn url(&self) -> Option<String> {
        self.url.lock().clone()
    }

    /// Whether the host currently shows the frame.
    #[must_use]
    pub fn is_visible(&self) -> bool {
        *self.visible.lock()
    }
}

impl ContentFrame for InProcessFrame {
    fn load_url(&self, url: Option<&str>) {
        *self.url.lock() = url.map(str::to_string);
    }

    fn load_document(&self, _document: &str) {
        *self.url.lock() = None;
    }

    fn connect(&self, payload: ConnectPayload, port: MessagePort) {
        self.port.connect(payload, port);
    }

    fn set_visible(&self, visible: bool) {
        *self.visible.lock() = visible;
    }
}

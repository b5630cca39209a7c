//! Built-in reality kinds and their declared sandbox resources.

use serde_json::{json, Map, Value};

/// Paints the sandbox background from the `color` option.
const COLOR_RENDER_SCRIPT: &str = r"
port.on('options', function (options) {
  document.documentElement.style.backgroundColor = options.color;
});
";

/// Draws an equirectangular panorama around the eye.
const PANORAMA_RENDER_SCRIPT: &str = r"
var stage = THREE.Bootstrap({ plugins: ['core'] });
var sphere = new THREE.Mesh(
  new THREE.SphereGeometry(100, 64, 32),
  new THREE.MeshBasicMaterial({ side: THREE.BackSide })
);
stage.scene.add(sphere);
port.on('options', function (options) {
  if (options.panorama) {
    sphere.material.map = new THREE.TextureLoader().load(options.panorama);
    sphere.material.needsUpdate = true;
  }
});
port.on('update', function (state) {
  var q = state.orientation.unitQuaternionRelative;
  stage.camera.quaternion.set(q.x, q.y, q.z, q.w);
});
";

const PANORAMA_SCRIPTS: [&str; 2] = [
    "https://cdnjs.cloudflare.com/ajax/libs/three.js/r71/three.min.js",
    "https://cdn.rawgit.com/unconed/threestrap/0.0.10/build/threestrap.min.js",
];

/// What a reality is, by its wire `type` tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RealityKind {
    /// No tag: a plain reality with caller-supplied resources.
    Generic,
    /// A solid background color.
    Color,
    /// A 360° panorama.
    Panorama,
    /// A tag this build does not know. Rebuilt as a generic, untrusted reality.
    Unknown(String),
}

/// Resources and options a kind starts with.
#[derive(Clone, Debug, Default)]
pub(crate) struct KindDefaults {
    pub css_deps: Vec<String>,
    pub js_deps: Vec<String>,
    pub render_script: String,
    pub options: Map<String, Value>,
    pub auto_tick: bool,
}

impl RealityKind {
    /// Resolves a wire tag.
    #[must_use]
    pub fn from_tag(tag: Option<&str>) -> Self {
        match tag {
            None => Self::Generic,
            Some("Color") => Self::Color,
            Some("Panorama") => Self::Panorama,
            Some(other) => Self::Unknown(other.to_string()),
        }
    }

    /// The wire tag.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        match self {
            Self::Generic => None,
            Self::Color => Some("Color"),
            Self::Panorama => Some("Panorama"),
            Self::Unknown(tag) => Some(tag),
        }
    }

    /// False for kinds rebuilt from an unrecognized descriptor.
    #[must_use]
    pub fn is_trusted(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }

    pub(crate) fn defaults(&self) -> KindDefaults {
        match self {
            Self::Generic | Self::Unknown(_) => KindDefaults::default(),
            Self::Color => KindDefaults {
                render_script: COLOR_RENDER_SCRIPT.to_string(),
                options: object(json!({ "color": "white" })),
                auto_tick: true,
                ..KindDefaults::default()
            },
            Self::Panorama => KindDefaults {
                js_deps: PANORAMA_SCRIPTS.iter().map(ToString::to_string).collect(),
                render_script: PANORAMA_RENDER_SCRIPT.to_string(),
                options: object(json!({ "panorama": null })),
                auto_tick: true,
                ..KindDefaults::default()
            },
        }
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ops::Operation;

/// A hierarchical `/`-separated naming path, e.g. `scope2/scope1`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NameScope(Vec<String>);

impl NameScope {
    pub fn root() -> Self {
        Self::default()
    }

    /// Returns a nested scope. A segment containing `/` nests once per part.
    pub fn child(&self, segment: &str) -> Self {
        let mut segments = self.0.clone();
        segments.extend(
            segment
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        );
        Self(segments)
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Qualifies `name` with this scope.
    pub fn join(&self, name: &str) -> String {
        if self.is_root() {
            name.to_string()
        } else {
            format!("{}/{}", self, name)
        }
    }
}

impl fmt::Display for NameScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// A placement target such as `/job:worker/task:0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device(String);

impl Device {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The context a registration call runs under: the naming path, the ambient
/// device, and any operations that must run before work built in this scope.
///
/// Scopes are values. Nesting a scope never mutates the parent, so a tracker
/// can store the scope it was registered under and reuse it later.
#[derive(Clone, Default)]
pub struct Scope {
    names: NameScope,
    device: Option<Device>,
    control_dependencies: Vec<Arc<dyn Operation>>,
}

impl Scope {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn child(&self, segment: &str) -> Self {
        Self {
            names: self.names.child(segment),
            ..self.clone()
        }
    }

    pub fn on_device(&self, device: Device) -> Self {
        Self {
            device: Some(device),
            ..self.clone()
        }
    }

    /// Appends `ops` to the dependencies inherited from this scope.
    pub fn with_control_dependencies(
        &self,
        ops: impl IntoIterator<Item = Arc<dyn Operation>>,
    ) -> Self {
        let mut control_dependencies = self.control_dependencies.clone();
        control_dependencies.extend(ops);
        Self {
            control_dependencies,
            ..self.clone()
        }
    }

    pub fn names(&self) -> &NameScope {
        &self.names
    }

    pub fn device(&self) -> Option<&Device> {
        self.device.as_ref()
    }

    pub fn control_dependencies(&self) -> &[Arc<dyn Operation>] {
        &self.control_dependencies
    }

    pub fn join(&self, name: &str) -> String {
        self.names.join(name)
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("names", &self.names.to_string())
            .field("device", &self.device)
            .field(
                "control_dependencies",
                &self
                    .control_dependencies
                    .iter()
                    .map(|op| op.name())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

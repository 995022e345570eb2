//! Individual lights.

use std::sync::{Arc, Weak};

use serde_json::Value;

use crate::coalescer::Coalescer;
use crate::errors::Error;
use crate::target::{Flushable, Lightset, TargetCore, TargetKey, TargetKind, TargetWrite};

type Result<T> = std::result::Result<T, Error>;

/// A light known to a bridge.
///
/// Lights are created by [`crate::Bridge::refresh`] and handed out as
/// `Arc<Light>`. A handle stays valid across refreshes for as long as the
/// bridge keeps reporting the light. State is read and changed through the
/// [`Lightset`] trait.
pub struct Light {
    core: TargetCore,
}

impl Light {
    pub(crate) fn new(id: u32, info: Value, coalescer: Coalescer) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Light>| {
            let me: Weak<dyn Flushable> = me.clone();
            Light {
                core: TargetCore::new(TargetKind::Light, id, info, coalescer, me),
            }
        })
    }

    /// Manufacturer model id, e.g. "LCT001".
    pub fn model_id(&self) -> Option<String> {
        self.to_value()
            .get("modelid")
            .and_then(Value::as_str)
            .map(String::from)
    }

    /// Whether the bridge can currently reach the light.
    pub fn is_reachable(&self) -> bool {
        self.state().is_reachable()
    }
}

impl Lightset for Light {
    fn core(&self) -> &TargetCore {
        &self.core
    }
}

impl Flushable for Light {
    fn key(&self) -> TargetKey {
        self.core.key()
    }

    fn take_write(&self) -> TargetWrite {
        self.core.take_write()
    }

    fn complete(&self, outcome: &Result<Value>) {
        self.core.complete(outcome);
    }
}

impl std::fmt::Display for Light {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Light: {}: {}", self.id(), self.name())?;
        if let Some(kind) = self.kind() {
            write!(f, " ({kind})")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Light {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Light")
            .field("id", &self.id())
            .field("name", &self.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::tests::light;
    use serde_json::json;

    #[test]
    fn test_light_info() {
        let (light, _) = light(
            2,
            json!({"name": "Desk", "type": "Dimmable light", "modelid": "LWB004",
                   "state": {"on": true, "bri": 254, "reachable": false}}),
        );
        assert_eq!(light.to_string(), "Light: 2: Desk (Dimmable light)");
        assert_eq!(light.model_id().as_deref(), Some("LWB004"));
        assert!(!light.is_reachable());
        assert_eq!(light.key(), TargetKey::Light(2));
    }
}

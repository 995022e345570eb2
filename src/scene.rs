//! Preset scenes stored on a bridge.

use std::sync::{Arc, Mutex, Weak};

use log::trace;
use serde_json::{Value, json};

use crate::callbacks::lock;
use crate::coalescer::Coalescer;
use crate::errors::Error;
use crate::group::light_ids;
use crate::runtime::BoxFuture;
use crate::target::{Flushable, TargetKey, TargetWrite};

type Result<T> = std::result::Result<T, Error>;

/// A scene defined on a bridge.
///
/// Only the scene's name and member lights are known; the values it recalls
/// live on the bridge.
pub struct Scene {
    id: String,
    info: Mutex<Value>,
    coalescer: Coalescer,
    me: Weak<dyn Flushable>,
}

impl Scene {
    pub(crate) fn new(id: &str, info: Value, coalescer: Coalescer) -> Arc<Self> {
        let scene = Arc::new_cyclic(|me: &Weak<Scene>| {
            let me: Weak<dyn Flushable> = me.clone();
            Scene {
                id: id.to_string(),
                info: Mutex::new(json!({})),
                coalescer,
                me,
            }
        });
        scene.handle_json(info);
        scene
    }

    pub(crate) fn handle_json(&self, mut info: Value) {
        if !info.is_object() {
            trace!("Ignoring non-object info for scene {}", self.id);
            return;
        }
        info["id"] = json!(self.id);

        let mut current = lock(&self.info);
        // keep the previous name and members if the bridge omits them
        if info.get("name").is_none() {
            if let Some(name) = current.get("name").cloned() {
                info["name"] = name;
            }
        }
        if light_ids(&info).is_empty() {
            if let Some(lights) = current.get("lights").cloned() {
                info["lights"] = lights;
            }
        }
        *current = info;
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> String {
        lock(&self.info)
            .get("name")
            .and_then(Value::as_str)
            .map_or_else(|| self.id.clone(), String::from)
    }

    pub fn light_ids(&self) -> Vec<u32> {
        light_ids(&lock(&self.info))
    }

    /// A copy of the info last received from the bridge.
    pub fn to_value(&self) -> Value {
        lock(&self.info).clone()
    }

    /// Recall the scene on all lights through the bridge's coalescer.
    pub fn recall(&self) -> BoxFuture<'static, Result<Value>> {
        match self.me.upgrade() {
            Some(me) => self.coalescer.submit(me),
            None => Box::pin(async { Err(Error::Cancelled) }),
        }
    }

    /// Like [`Scene::recall`], reporting the outcome to `on_complete`.
    pub fn recall_with<F>(&self, on_complete: F)
    where
        F: FnOnce(&Result<Value>) + Send + 'static,
    {
        if let Some(me) = self.me.upgrade() {
            self.coalescer.add_target(me, Some(Box::new(on_complete)));
        }
    }
}

impl Flushable for Scene {
    fn key(&self) -> TargetKey {
        TargetKey::Scene(self.id.clone())
    }

    fn take_write(&self) -> TargetWrite {
        TargetWrite {
            path: "/groups/0/action".to_string(),
            body: json!({"scene": self.id}),
            category: "groups",
        }
    }

    fn complete(&self, _outcome: &Result<Value>) {}
}

impl std::fmt::Display for Scene {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Scene {}: {} ({} lights)",
            self.id,
            self.name(),
            self.light_ids().len()
        )
    }
}

impl std::fmt::Debug for Scene {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scene")
            .field("id", &self.id)
            .field("name", &self.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::coalescer::tests::RecordingSink;

    #[test]
    fn test_recall_write() {
        let sink = Arc::new(RecordingSink::default());
        let scene = Scene::new(
            "ab12cd34",
            json!({"name": "Relax", "lights": ["1", "2"]}),
            Coalescer::new(sink, Duration::from_millis(20)),
        );
        let write = scene.take_write();
        assert_eq!(write.path, "/groups/0/action");
        assert_eq!(write.body, json!({"scene": "ab12cd34"}));
        assert_eq!(write.category, "groups");
        assert_eq!(scene.to_string(), "Scene ab12cd34: Relax (2 lights)");
    }

    #[test]
    fn test_update_keeps_name_and_lights() {
        let sink = Arc::new(RecordingSink::default());
        let scene = Scene::new(
            "s1",
            json!({"name": "Relax", "lights": ["1"]}),
            Coalescer::new(sink, Duration::from_millis(20)),
        );
        scene.handle_json(json!({"lights": []}));
        assert_eq!(scene.name(), "Relax");
        assert_eq!(scene.light_ids(), vec![1]);
    }
}

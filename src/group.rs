//! Light groups.

use std::sync::{Arc, Weak};

use serde_json::Value;

use crate::coalescer::Coalescer;
use crate::errors::Error;
use crate::target::{Flushable, Lightset, TargetCore, TargetKey, TargetKind, TargetWrite};

type Result<T> = std::result::Result<T, Error>;

/// A group of lights defined on a bridge.
///
/// Group 0 is the bridge's implicit group of all lights. Changes made to a
/// group are sent to its `action` resource and apply to every member; the
/// members' own state is only updated by the next refresh.
pub struct Group {
    core: TargetCore,
}

impl Group {
    pub(crate) fn new(id: u32, info: Value, coalescer: Coalescer) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Group>| {
            let me: Weak<dyn Flushable> = me.clone();
            Group {
                core: TargetCore::new(TargetKind::Group, id, info, coalescer, me),
            }
        })
    }

    /// Ids of the lights in this group.
    pub fn light_ids(&self) -> Vec<u32> {
        light_ids(&self.to_value())
    }
}

/// Parse a `lights` array of string ids; entries that are not ids are skipped.
pub(crate) fn light_ids(info: &Value) -> Vec<u32> {
    let mut ids: Vec<u32> = info
        .get("lights")
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(|id| match id {
                    Value::String(s) => s.parse().ok(),
                    Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    ids.sort_unstable();
    ids.dedup();
    ids
}

impl Lightset for Group {
    fn core(&self) -> &TargetCore {
        &self.core
    }
}

impl Flushable for Group {
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

impl std::fmt::Display for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Group: {}: {} ({} lights)",
            self.id(),
            self.name(),
            self.light_ids().len()
        )
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("lights", &self.light_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use crate::coalescer::tests::RecordingSink;

    fn group(info: Value) -> Arc<Group> {
        let sink = Arc::new(RecordingSink::default());
        Group::new(1, info, Coalescer::new(sink, Duration::from_millis(20)))
    }

    #[test]
    fn test_group_members_and_path() {
        let group = group(json!({"name": "Living room", "lights": ["3", "1", "x", 2],
                                 "action": {"on": true}}));
        assert_eq!(group.light_ids(), vec![1, 2, 3]);
        assert_eq!(group.to_string(), "Group: 1: Living room (3 lights)");

        group.defer();
        group.turn_off();
        let write = group.take_write();
        assert_eq!(write.path, "/groups/1/action");
        assert_eq!(write.category, "groups");
        assert_eq!(write.body, json!({"on": false}));
    }

    #[tokio::test]
    async fn test_update_reads_group_resource() {
        let sink = Arc::new(RecordingSink::default());
        *crate::callbacks::lock(&sink.info) =
            Some(json!({"name": "Kitchen", "lights": ["4"], "action": {"on": false}}));
        let coalescer = Coalescer::new(sink.clone(), Duration::from_millis(20));
        let group = Group::new(2, json!({"name": "Old"}), coalescer);

        group.update().await.unwrap();
        assert_eq!(
            *crate::callbacks::lock(&sink.reads),
            vec![("/groups/2".to_string(), "groups")]
        );
        assert_eq!(group.name(), "Kitchen");
        assert_eq!(group.light_ids(), vec![4]);
    }

    #[test]
    fn test_new_group_without_action() {
        let group = group(json!({"name": "Fresh", "lights": []}));
        assert!(!group.is_on());
        assert_eq!(group.light_ids(), Vec::<u32>::new());
    }
}

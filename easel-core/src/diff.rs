//! Diffing a proposed object set against the current one.

use std::collections::{HashMap, HashSet};

use crate::object::{CanvasObject, ObjectId};

/// Result of comparing the current object map with a proposed next set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectDiff {
    /// Objects present only in the next set, in input order.
    pub created: Vec<CanvasObject>,
    /// Objects whose comparable fields changed, in input order.
    pub updated: Vec<CanvasObject>,
    /// Ids present only in the current map, sorted for deterministic stamping.
    pub deleted: Vec<ObjectId>,
}

impl ObjectDiff {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }
}

/// Compute creates, updates and deletes that turn `current` into `next`.
///
/// When `next` contains the same id more than once, the last occurrence wins
/// but keeps the position of the first.
pub fn diff_objects(current: &HashMap<ObjectId, CanvasObject>, next: Vec<CanvasObject>) -> ObjectDiff {
    let mut order: Vec<ObjectId> = Vec::with_capacity(next.len());
    let mut latest: HashMap<ObjectId, CanvasObject> = HashMap::with_capacity(next.len());
    for obj in next {
        let id = obj.id;
        if latest.insert(id, obj).is_none() {
            order.push(id);
        }
    }

    let mut diff = ObjectDiff::default();
    let next_ids: HashSet<ObjectId> = order.iter().copied().collect();

    for id in order {
        let Some(obj) = latest.remove(&id) else { continue };
        match current.get(&id) {
            None => diff.created.push(obj),
            Some(existing) if !existing.same_content(&obj) => diff.updated.push(obj),
            Some(_) => {}
        }
    }

    let mut deleted: Vec<ObjectId> = current
        .keys()
        .filter(|id| !next_ids.contains(id))
        .copied()
        .collect();
    deleted.sort();
    diff.deleted = deleted;

    diff
}

//! Walking the live entity tree without holding locks across callbacks.
//!
//! The cursor is the key of the last visited node. Each step takes the
//! parent's lock only to find the successor of the cursor and pin it, then
//! releases the lock before handing the pinned node out. Nodes inserted behind
//! the cursor are missed, nodes deleted concurrently fail to pin and are
//! skipped.
//!
//! 在不跨回调持锁的情况下遍历存活实体树。游标是上一个访问节点的键。
//! 每一步只在查找游标的后继并 pin 它时持有父节点的锁，然后在交出已 pin 的
//! 节点前释放锁。

use crate::entity::{Entity, EntityKind, InstanceId};
use crate::handle::{HandleTable, Pinned};
use crate::registry::DomainRegistry;
use crate::sync::{Arc, Mutex};
use std::collections::BTreeMap;
use std::ops::Bound;

/// Iterator over the children in `map` that can still be pinned.
///
/// Each item is a pin guard; dropping it unpins the child.
pub struct LiveChildren<'a> {
    handles: &'a HandleTable<Entity>,
    map: &'a Mutex<BTreeMap<InstanceId, Arc<Entity>>>,
    cursor: Option<InstanceId>,
}

impl<'a> LiveChildren<'a> {
    pub(crate) fn new(
        handles: &'a HandleTable<Entity>,
        map: &'a Mutex<BTreeMap<InstanceId, Arc<Entity>>>,
    ) -> Self {
        Self {
            handles,
            map,
            cursor: None,
        }
    }
}

impl<'a> Iterator for LiveChildren<'a> {
    type Item = Pinned<'a, Entity>;

    fn next(&mut self) -> Option<Self::Item> {
        let map = self.map.lock();
        loop {
            let lower = self.cursor.map_or(Bound::Unbounded, Bound::Excluded);
            let (iid, child) = map.range((lower, Bound::Unbounded)).next()?;
            self.cursor = Some(*iid);
            if let Ok(pinned) = self.handles.pin(child.handle()) {
                return Some(pinned);
            }
        }
    }
}

/// Visit every pinnable entity below `map` depth-first, calling `op` on the
/// ones whose kind satisfies `pred`.
pub(crate) fn walk_entities<P, F>(
    handles: &HandleTable<Entity>,
    map: &Mutex<BTreeMap<InstanceId, Arc<Entity>>>,
    pred: &P,
    op: &mut F,
) where
    P: Fn(EntityKind) -> bool,
    F: FnMut(&Entity),
{
    for entity in LiveChildren::new(handles, map) {
        if pred(entity.kind()) {
            op(&entity);
        }
        walk_entities(handles, &entity.children, pred, op);
    }
}

/// Visit every pinnable entity of every live domain.
///
/// Domains are held by reference count while their entities are visited; the
/// registry lock is never held across `op`.
///
/// 访问所有存活域中每个可 pin 的实体。访问域内实体期间通过引用计数持有域；
/// 调用 `op` 时从不持有注册表锁。
pub(crate) fn broadcast<P, F>(
    registry: &DomainRegistry,
    handles: &HandleTable<Entity>,
    pred: P,
    mut op: F,
) where
    P: Fn(EntityKind) -> bool,
    F: FnMut(&Entity),
{
    let mut cursor = None;
    while let Some(domain) = registry.pin_next(cursor) {
        cursor = Some(domain.id());
        walk_entities(handles, &domain.participants, &pred, &mut op);
    }
}

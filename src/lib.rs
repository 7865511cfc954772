//! Entity lifecycle core for a publish-subscribe runtime.
//!
//! ```text
//! Runtime
//! +-- HandleTable<Entity>   handle -> object, pin counts, single-winner delete
//! +-- DomainRegistry        refcounted domains, start-up/teardown stacks
//! +-- GcQueue               deferred frees released by thread quiescence
//! +-- ThreadStates          per-thread virtual clocks (odd = awake)
//! ```
//!
//! Entities form a tree (participant → publisher/subscriber/topic →
//! writer/reader) owned top-down. Deleting a node deletes its subtree; the
//! node is closed only once no caller holds a pin on it. Writers and readers
//! are additionally kept alive until every thread that was awake at close time
//! has passed a quiescent point.
//!
//! 发布订阅运行时的实体生命周期核心。实体构成一棵自顶向下拥有的树；
//! 删除节点会删除其子树，且只有在没有调用者 pin 住它时才会关闭。
//! 写入者和读取者还会一直存活，直到关闭时所有处于唤醒状态的线程都经过静止点。

mod sync;

pub mod collab;
pub mod config;
pub mod entity;
pub mod error;
pub mod gc;
pub mod handle;
mod lifecycle;
pub mod registry;
pub mod runtime;
pub mod vtime;
pub mod walk;

pub use collab::{
    BuiltinTopics, Collaborators, EngineFactory, LivelinessMonitor, MonitorFactory,
    ParticipantDefaults, ProtocolEngine,
};
pub use config::{Config, ConfigBuilder, ConfigLoader, StaticConfigLoader, ThreadProperties};
pub use entity::{Entity, EntityKind, InstanceId};
pub use error::{Error, Result};
pub use gc::{GcCallback, GcQueue, GcRequest};
pub use handle::{Handle, HandleTable, Managed, Pinned};
pub use registry::{Domain, DomainPin, DomainRegistry, DomainRequest, MAX_DOMAIN_ID};
pub use runtime::{Runtime, RuntimeBuilder};
pub use vtime::{AwakeGuard, ThreadState, ThreadStates, VTime};
pub use walk::LiveChildren;

#[cfg(all(test, not(feature = "loom")))]
mod tests;

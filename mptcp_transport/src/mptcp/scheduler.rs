//! MPTCP Scheduler
//!
//! A scheduler picks the subflow that carries the next chunk of
//! connection-level data. Policies are registered by name in a
//! [`SchedulerRegistry`] and bound to connections when they are created.
//! A policy only sees a read-only view of the subflows; the one value it
//! may write back is the last-used marker.

use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use super::subflow::SubflowId;

/// Names are at most this many bytes minus one
pub const SCHED_NAME_MAX: usize = 16;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("scheduler {0:?} is already registered")]
    AlreadyExists(String),

    #[error("invalid scheduler name {0:?}")]
    InvalidName(String),

    #[error("scheduler {0:?} has no select operation")]
    MissingSelect(String),

    #[error("scheduler {0:?} is not registered")]
    NotFound(String),
}

/// Names are 1 to 15 bytes of ASCII letters, digits, `_` or `.`
pub fn validate_scheduler_name(name: &str) -> Result<(), SchedulerError> {
    let valid = !name.is_empty()
        && name.len() < SCHED_NAME_MAX
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.');
    if valid {
        Ok(())
    } else {
        Err(SchedulerError::InvalidName(name.to_string()))
    }
}

/// What a policy may know about a subflow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubflowView {
    pub id: SubflowId,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub backup: bool,
    /// Eligible to carry data
    pub fully_established: bool,
    pub rtt: Duration,
}

/// Per-connection private data of a policy
pub type SchedulerState = Box<dyn Any + Send>;

/// Read-only connection view handed to a policy
pub struct SchedulerContext<'a> {
    token: u32,
    subflows: &'a [SubflowView],
    first: Option<SubflowId>,
    last_used: Option<SubflowId>,
    state: Option<&'a mut SchedulerState>,
}

impl<'a> SchedulerContext<'a> {
    pub fn new(
        token: u32,
        subflows: &'a [SubflowView],
        first: Option<SubflowId>,
        last_used: Option<SubflowId>,
        state: Option<&'a mut SchedulerState>,
    ) -> Self {
        Self { token, subflows, first, last_used, state }
    }

    pub fn token(&self) -> u32 {
        self.token
    }

    /// All subflows in registry order
    pub fn subflows(&self) -> &'a [SubflowView] {
        self.subflows
    }

    /// Subflows that may carry data, in registry order
    pub fn eligible(&self) -> impl Iterator<Item = &'a SubflowView> + 'a {
        let subflows: &'a [SubflowView] = self.subflows;
        subflows.iter().filter(|s| s.fully_established)
    }

    /// The connection's primary subflow, if it is still open
    pub fn first(&self) -> Option<SubflowId> {
        self.first
    }

    pub fn last_used(&self) -> Option<SubflowId> {
        self.last_used
    }

    pub fn set_last_used(&mut self, id: SubflowId) {
        self.last_used = Some(id);
    }

    pub fn state<T: Any>(&self) -> Option<&T> {
        match self.state.as_ref() {
            Some(state) => (***state).downcast_ref::<T>(),
            None => None,
        }
    }

    pub fn state_mut<T: Any>(&mut self) -> Option<&mut T> {
        match self.state.as_mut() {
            Some(state) => (***state).downcast_mut::<T>(),
            None => None,
        }
    }
}

pub trait Scheduler: Send + Sync {
    fn name(&self) -> &str;

    /// Called once when bound to a connection
    fn init(&self, _ctx: &SchedulerContext<'_>) -> Option<SchedulerState> {
        None
    }

    /// Called once when unbound or when the connection closes
    fn release(&self, _ctx: &mut SchedulerContext<'_>) {}

    /// `None` defers transmission until the subflow set changes
    fn select(&self, ctx: &mut SchedulerContext<'_>, retransmission: bool) -> Option<SubflowId>;
}

/// Always the primary subflow
pub struct FirstScheduler;

impl Scheduler for FirstScheduler {
    fn name(&self) -> &str {
        "first"
    }

    fn select(&self, ctx: &mut SchedulerContext<'_>, _retransmission: bool) -> Option<SubflowId> {
        let first = ctx.first()?;
        ctx.set_last_used(first);
        Some(first)
    }
}

/// First non-backup subflow; a backup subflow only when nothing else is left
pub struct BackupScheduler;

impl Scheduler for BackupScheduler {
    fn name(&self) -> &str {
        "backup"
    }

    fn select(&self, ctx: &mut SchedulerContext<'_>, _retransmission: bool) -> Option<SubflowId> {
        let id = ctx
            .eligible()
            .find(|s| !s.backup)
            .or_else(|| ctx.eligible().next())?
            .id;
        ctx.set_last_used(id);
        Some(id)
    }
}

/// Lowest RTT among regular subflows, backups as a last resort
pub struct MinRttScheduler;

impl Scheduler for MinRttScheduler {
    fn name(&self) -> &str {
        "default"
    }

    fn select(&self, ctx: &mut SchedulerContext<'_>, _retransmission: bool) -> Option<SubflowId> {
        let id = ctx
            .eligible()
            .filter(|s| !s.backup)
            .min_by_key(|s| s.rtt)
            .or_else(|| ctx.eligible().min_by_key(|s| s.rtt))?
            .id;
        ctx.set_last_used(id);
        Some(id)
    }
}

/// Rotates over regular subflows, starting after the last one used
pub struct RoundRobinScheduler;

impl Scheduler for RoundRobinScheduler {
    fn name(&self) -> &str {
        "roundrobin"
    }

    fn select(&self, ctx: &mut SchedulerContext<'_>, retransmission: bool) -> Option<SubflowId> {
        let candidates: Vec<SubflowId> = {
            let regular: Vec<_> = ctx.eligible().filter(|s| !s.backup).map(|s| s.id).collect();
            if regular.is_empty() {
                ctx.eligible().map(|s| s.id).collect()
            } else {
                regular
            }
        };
        if candidates.is_empty() {
            return None;
        }

        let last = ctx.last_used();
        let id = match last.and_then(|l| candidates.iter().position(|&c| c == l)) {
            // retransmissions go out on a different path when one exists
            Some(pos) if !retransmission || candidates.len() > 1 => {
                candidates[(pos + 1) % candidates.len()]
            }
            Some(pos) => candidates[pos],
            None => candidates[0],
        };
        ctx.set_last_used(id);
        Some(id)
    }
}

pub type InitOp = fn(&SchedulerContext<'_>) -> Option<SchedulerState>;
pub type ReleaseOp = fn(&mut SchedulerContext<'_>);
pub type SelectOp = fn(&mut SchedulerContext<'_>, bool) -> Option<SubflowId>;

/// Table-of-operations form of a policy. `init` and `release` are
/// optional; `select` is required.
#[derive(Clone, Default)]
pub struct SchedulerOps {
    pub name: String,
    pub init: Option<InitOp>,
    pub release: Option<ReleaseOp>,
    pub select: Option<SelectOp>,
}

impl fmt::Debug for SchedulerOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerOps")
            .field("name", &self.name)
            .field("init", &self.init.is_some())
            .field("release", &self.release.is_some())
            .field("select", &self.select.is_some())
            .finish()
    }
}

struct OpsScheduler {
    name: String,
    init: Option<InitOp>,
    release: Option<ReleaseOp>,
    select: SelectOp,
}

impl Scheduler for OpsScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self, ctx: &SchedulerContext<'_>) -> Option<SchedulerState> {
        self.init.and_then(|init| init(ctx))
    }

    fn release(&self, ctx: &mut SchedulerContext<'_>) {
        if let Some(release) = self.release {
            release(ctx);
        }
    }

    fn select(&self, ctx: &mut SchedulerContext<'_>, retransmission: bool) -> Option<SubflowId> {
        (self.select)(ctx, retransmission)
    }
}

/// Named policies available to new connections
pub struct SchedulerRegistry {
    schedulers: RwLock<HashMap<String, Arc<dyn Scheduler>>>,
}

impl SchedulerRegistry {
    pub fn new() -> Self {
        Self {
            schedulers: RwLock::new(HashMap::new()),
        }
    }

    /// Registry holding the built-in policies
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        let builtins: [Arc<dyn Scheduler>; 4] = [
            Arc::new(MinRttScheduler),
            Arc::new(FirstScheduler),
            Arc::new(BackupScheduler),
            Arc::new(RoundRobinScheduler),
        ];
        {
            let mut schedulers = registry.schedulers.write();
            for scheduler in builtins {
                schedulers.insert(scheduler.name().to_string(), scheduler);
            }
        }
        registry
    }

    pub fn register(&self, scheduler: Arc<dyn Scheduler>) -> Result<(), SchedulerError> {
        let name = scheduler.name().to_string();
        validate_scheduler_name(&name)?;

        let mut schedulers = self.schedulers.write();
        if schedulers.contains_key(&name) {
            return Err(SchedulerError::AlreadyExists(name));
        }
        tracing::info!(scheduler = %name, "scheduler registered");
        schedulers.insert(name, scheduler);
        Ok(())
    }

    pub fn register_ops(&self, ops: SchedulerOps) -> Result<(), SchedulerError> {
        validate_scheduler_name(&ops.name)?;
        let select = ops.select.ok_or_else(|| SchedulerError::MissingSelect(ops.name.clone()))?;

        self.register(Arc::new(OpsScheduler {
            name: ops.name,
            init: ops.init,
            release: ops.release,
            select,
        }))
    }

    /// Connections already bound to the policy keep using it
    pub fn unregister(&self, name: &str) -> Result<Arc<dyn Scheduler>, SchedulerError> {
        let removed = self
            .schedulers
            .write()
            .remove(name)
            .ok_or_else(|| SchedulerError::NotFound(name.to_string()))?;
        tracing::info!(scheduler = %name, "scheduler unregistered");
        Ok(removed)
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Scheduler>> {
        self.schedulers.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.schedulers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.schedulers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SchedulerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for SchedulerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerRegistry").field("names", &self.names()).finish()
    }
}

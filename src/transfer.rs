//! Transfer policy — what may cross into a worker's isolated context.
//!
//! Every value handed to a worker passes through [`validate`] (job inputs)
//! or [`copy`] (captured globals). Both report, per call, which kind of
//! transfer happened:
//!
//! - [`TransferKind::Moved`]: the caller gave up the value; the graph was
//!   walked and nothing outside it still points into it.
//! - [`TransferKind::Copied`]: the destination got an independent deep copy;
//!   mutations on either side are invisible to the other.
//! - [`TransferKind::Unchecked`]: no walk; the caller promises that no
//!   concurrent access happens from the source side.
//!
//! The graph walk only has to look at shared ownership (`Arc`): plain owned
//! data is moved by the type system already. An `Arc` whose strong count is
//! higher than the number of references found inside the graph is still held
//! by someone outside, which is an [`TransferError::UnownedReference`].

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, RwLock, TryLockError};

use serde::{Deserialize, Serialize};

use crate::error::TransferError;

/// How a scheduled value is validated before it crosses the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    /// Walk the value graph and fail fast on shared or cyclic references.
    Checked,
    /// Skip validation.
    Unsafe,
}

/// Which transfer actually took place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Moved,
    Copied,
    Unchecked,
}

impl std::fmt::Display for TransferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Moved => "moved",
            Self::Copied => "copied",
            Self::Unchecked => "unchecked",
        };
        write!(f, "{s}")
    }
}

/// A value that has passed the transfer policy.
#[derive(Debug)]
pub struct Transferred<T> {
    value: T,
    kind: TransferKind,
}

impl<T> Transferred<T> {
    /// Which transfer took place.
    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

/// A value that can cross the isolation boundary.
///
/// `walk` must report every `Arc` it owns to the [`GraphWalk`] (recursing
/// into fields that may contain one), and `deep_copy` must produce a value
/// that shares no allocation with `self`. Plain data types can use
/// [`impl_transfer_by_clone!`](crate::impl_transfer_by_clone).
pub trait Transfer: Send + Sized + 'static {
    fn walk(&self, graph: &mut GraphWalk) -> Result<(), TransferError>;

    fn deep_copy(&self) -> Self;
}

#[derive(Debug)]
struct Node {
    type_name: &'static str,
    strong: usize,
    weak: usize,
    owned: usize,
}

/// State of one graph walk.
#[derive(Debug)]
pub struct GraphWalk {
    check_ownership: bool,
    path: HashSet<usize>,
    nodes: HashMap<usize, Node>,
}

impl GraphWalk {
    fn new(check_ownership: bool) -> Self {
        Self {
            check_ownership,
            path: HashSet::new(),
            nodes: HashMap::new(),
        }
    }

    /// Record a reference to `arc` and walk its contents the first time it
    /// is seen.
    pub fn enter_arc<T: Transfer>(&mut self, arc: &Arc<T>) -> Result<(), TransferError> {
        let addr = Arc::as_ptr(arc) as usize;
        let type_name = std::any::type_name::<T>();

        if self.path.contains(&addr) {
            return Err(TransferError::CyclicUnsupported { type_name });
        }

        let node = self.nodes.entry(addr).or_insert(Node {
            type_name,
            strong: Arc::strong_count(arc),
            weak: Arc::weak_count(arc),
            owned: 0,
        });
        node.owned += 1;
        if node.owned > 1 {
            return Ok(());
        }

        self.path.insert(addr);
        let result = arc.as_ref().walk(self);
        self.path.remove(&addr);
        result
    }

    fn finish(self) -> Result<(), TransferError> {
        if !self.check_ownership {
            return Ok(());
        }
        match self
            .nodes
            .values()
            .find(|n| n.strong > n.owned || n.weak > 0)
        {
            Some(node) => Err(TransferError::UnownedReference {
                type_name: node.type_name,
                strong: node.strong,
                owned: node.owned,
            }),
            None => Ok(()),
        }
    }
}

/// Run the transfer policy on a job input.
pub fn validate<T: Transfer>(
    value: T,
    mode: TransferMode,
) -> Result<Transferred<T>, TransferError> {
    match mode {
        TransferMode::Checked => {
            let mut graph = GraphWalk::new(true);
            value.walk(&mut graph)?;
            graph.finish()?;
            Ok(Transferred {
                value,
                kind: TransferKind::Moved,
            })
        }
        TransferMode::Unsafe => Ok(Transferred {
            value,
            kind: TransferKind::Unchecked,
        }),
    }
}

/// Produce an independent deep copy of `value`.
///
/// Cyclic graphs are rejected before copying. Sharing inside the graph is
/// not preserved: an `Arc` reached twice is copied twice.
pub fn copy<T: Transfer>(value: &T) -> Result<Transferred<T>, TransferError> {
    let mut graph = GraphWalk::new(false);
    value.walk(&mut graph)?;
    Ok(Transferred {
        value: value.deep_copy(),
        kind: TransferKind::Copied,
    })
}

/// Implement [`Transfer`] for types that own no shared references, by `Clone`.
#[macro_export]
macro_rules! impl_transfer_by_clone {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $crate::transfer::Transfer for $ty {
                fn walk(
                    &self,
                    _graph: &mut $crate::transfer::GraphWalk,
                ) -> ::std::result::Result<(), $crate::error::TransferError> {
                    Ok(())
                }

                fn deep_copy(&self) -> Self {
                    ::std::clone::Clone::clone(self)
                }
            }
        )*
    };
}

impl_transfer_by_clone!(
    (),
    bool,
    char,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    f32,
    f64,
    String,
    &'static str,
    std::time::Duration,
    uuid::Uuid,
);

impl<T: Transfer + Sync> Transfer for Arc<T> {
    fn walk(&self, graph: &mut GraphWalk) -> Result<(), TransferError> {
        graph.enter_arc(self)
    }

    fn deep_copy(&self) -> Self {
        Arc::new(self.as_ref().deep_copy())
    }
}

/// A lock held while walking counts as a reference from outside the graph.
/// Walks never wait on it.
fn held_elsewhere<L>() -> TransferError {
    TransferError::UnownedReference {
        type_name: std::any::type_name::<L>(),
        strong: 1,
        owned: 0,
    }
}

impl<T: Transfer> Transfer for Mutex<T> {
    fn walk(&self, graph: &mut GraphWalk) -> Result<(), TransferError> {
        match self.try_lock() {
            Ok(inner) => inner.walk(graph),
            Err(TryLockError::Poisoned(e)) => e.into_inner().walk(graph),
            Err(TryLockError::WouldBlock) => Err(held_elsewhere::<Self>()),
        }
    }

    fn deep_copy(&self) -> Self {
        Mutex::new(self.lock().unwrap_or_else(|e| e.into_inner()).deep_copy())
    }
}

impl<T: Transfer + Sync> Transfer for RwLock<T> {
    fn walk(&self, graph: &mut GraphWalk) -> Result<(), TransferError> {
        match self.try_read() {
            Ok(inner) => inner.walk(graph),
            Err(TryLockError::Poisoned(e)) => e.into_inner().walk(graph),
            Err(TryLockError::WouldBlock) => Err(held_elsewhere::<Self>()),
        }
    }

    fn deep_copy(&self) -> Self {
        RwLock::new(self.read().unwrap_or_else(|e| e.into_inner()).deep_copy())
    }
}

impl<T: Transfer> Transfer for Box<T> {
    fn walk(&self, graph: &mut GraphWalk) -> Result<(), TransferError> {
        self.as_ref().walk(graph)
    }

    fn deep_copy(&self) -> Self {
        Box::new(self.as_ref().deep_copy())
    }
}

impl<T: Transfer> Transfer for Option<T> {
    fn walk(&self, graph: &mut GraphWalk) -> Result<(), TransferError> {
        match self {
            Some(v) => v.walk(graph),
            None => Ok(()),
        }
    }

    fn deep_copy(&self) -> Self {
        self.as_ref().map(Transfer::deep_copy)
    }
}

impl<T: Transfer> Transfer for Vec<T> {
    fn walk(&self, graph: &mut GraphWalk) -> Result<(), TransferError> {
        self.iter().try_for_each(|v| v.walk(graph))
    }

    fn deep_copy(&self) -> Self {
        self.iter().map(Transfer::deep_copy).collect()
    }
}

impl<T: Transfer> Transfer for VecDeque<T> {
    fn walk(&self, graph: &mut GraphWalk) -> Result<(), TransferError> {
        self.iter().try_for_each(|v| v.walk(graph))
    }

    fn deep_copy(&self) -> Self {
        self.iter().map(Transfer::deep_copy).collect()
    }
}

impl<K, V> Transfer for HashMap<K, V>
where
    K: Transfer + Eq + Hash,
    V: Transfer,
{
    fn walk(&self, graph: &mut GraphWalk) -> Result<(), TransferError> {
        for (k, v) in self {
            k.walk(graph)?;
            v.walk(graph)?;
        }
        Ok(())
    }

    fn deep_copy(&self) -> Self {
        self.iter()
            .map(|(k, v)| (k.deep_copy(), v.deep_copy()))
            .collect()
    }
}

impl<K, V> Transfer for BTreeMap<K, V>
where
    K: Transfer + Ord,
    V: Transfer,
{
    fn walk(&self, graph: &mut GraphWalk) -> Result<(), TransferError> {
        for (k, v) in self {
            k.walk(graph)?;
            v.walk(graph)?;
        }
        Ok(())
    }

    fn deep_copy(&self) -> Self {
        self.iter()
            .map(|(k, v)| (k.deep_copy(), v.deep_copy()))
            .collect()
    }
}

macro_rules! impl_transfer_for_tuple {
    ($($name:ident),+) => {
        impl<$($name: Transfer),+> Transfer for ($($name,)+) {
            #[allow(non_snake_case)]
            fn walk(&self, graph: &mut GraphWalk) -> Result<(), TransferError> {
                let ($($name,)+) = self;
                $($name.walk(graph)?;)+
                Ok(())
            }

            #[allow(non_snake_case)]
            fn deep_copy(&self) -> Self {
                let ($($name,)+) = self;
                ($($name.deep_copy(),)+)
            }
        }
    };
}

impl_transfer_for_tuple!(A);
impl_transfer_for_tuple!(A, B);
impl_transfer_for_tuple!(A, B, C);
impl_transfer_for_tuple!(A, B, C, D);

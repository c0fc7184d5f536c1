use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, warn};

use crate::transport::{ObserveRelation, TransportError};

/// Which namespace a [`RelationRegistry`] holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// Relations of long-lived subscription sources.
    Static,
    /// Relations created and destroyed through start/stop observe.
    Dynamic,
}

/// What [`RelationRegistry::recover`] did about a failed relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// No relation is registered for the URI any more.
    Absent,
    /// The failed relation has already been replaced; the current one was left alone.
    Stale,
    Reregistered,
    Replaced,
    /// The relation was canceled and could not be replaced; it has been removed.
    Failed,
}

/// Observe relations keyed by canonical URI, at most one per URI.  Every check-then-act
/// sequence on a key runs inside a single critical section.
#[derive(Debug)]
pub struct RelationRegistry {
    kind: RelationKind,
    relations: Mutex<BTreeMap<String, Arc<dyn ObserveRelation>>>,
}

impl RelationRegistry {
    pub fn new(kind: RelationKind) -> Self {
        Self {
            kind,
            relations: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn kind(&self) -> RelationKind {
        self.kind
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Arc<dyn ObserveRelation>>> {
        self.relations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert `relation`, proactively canceling any relation it replaces.
    pub fn put(&self, uri: &str, relation: Arc<dyn ObserveRelation>) {
        if let Some(old) = self.lock().insert(uri.to_string(), relation) {
            debug!("Replacing {:?} relation on {uri}", self.kind);
            old.proactive_cancel();
        }
    }

    /// Cancel and remove the relation on `uri`, then insert the one produced by `create`.  No
    /// other operation on the registry can interleave, so two concurrent installs on the same
    /// URI leave exactly one live relation behind.
    pub fn install<F>(&self, uri: &str, create: F) -> Result<(), TransportError>
    where
        F: FnOnce() -> Result<Arc<dyn ObserveRelation>, TransportError>,
    {
        let mut relations = self.lock();
        if let Some(old) = relations.remove(uri) {
            debug!("Canceling previous {:?} relation on {uri}", self.kind);
            old.proactive_cancel();
        }
        let relation = create()?;
        relations.insert(uri.to_string(), relation);
        Ok(())
    }

    /// Remove the relation on `uri`, canceling it first if asked to.  Returns whether there was
    /// one.
    pub fn remove(&self, uri: &str, cancel: bool) -> bool {
        match self.lock().remove(uri) {
            Some(relation) => {
                if cancel {
                    relation.proactive_cancel();
                }
                true
            }
            None => false,
        }
    }

    pub fn get(&self, uri: &str) -> Option<Arc<dyn ObserveRelation>> {
        self.lock().get(uri).cloned()
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.lock().contains_key(uri)
    }

    /// Snapshot of the registered URIs in sorted order.
    pub fn list(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Proactively cancel every relation, then forget them all.
    pub fn clear(&self) {
        let mut relations = self.lock();
        for (uri, relation) in relations.iter() {
            debug!("Canceling {:?} relation on {uri}", self.kind);
            relation.proactive_cancel();
        }
        relations.clear();
    }

    /// Remove the relation on `uri` without canceling it, provided `is_failed` recognizes it.
    pub fn remove_if<P>(&self, uri: &str, is_failed: P) -> bool
    where
        P: FnOnce(&Arc<dyn ObserveRelation>) -> bool,
    {
        let mut relations = self.lock();
        match relations.get(uri) {
            Some(current) if is_failed(current) => {
                relations.remove(uri);
                true
            }
            _ => false,
        }
    }

    /// React to a transport error on the relation for `uri`: a relation that is still active is
    /// re-registered, a canceled one is replaced by the one `reobserve` creates.  Nothing happens
    /// unless `is_failed` recognizes the current relation as the one that reported the error.
    pub fn recover<P, F>(&self, uri: &str, is_failed: P, reobserve: F) -> Recovery
    where
        P: FnOnce(&Arc<dyn ObserveRelation>) -> bool,
        F: FnOnce() -> Result<Arc<dyn ObserveRelation>, TransportError>,
    {
        let mut relations = self.lock();
        let current = match relations.get(uri) {
            Some(current) => current.clone(),
            None => return Recovery::Absent,
        };
        if !is_failed(&current) {
            return Recovery::Stale;
        }
        if !current.is_canceled() {
            current.reregister();
            return Recovery::Reregistered;
        }
        match reobserve() {
            Ok(fresh) => {
                relations.insert(uri.to_string(), fresh);
                Recovery::Replaced
            }
            Err(e) => {
                warn!("Unable to replace canceled relation on {uri}: {e}");
                relations.remove(uri);
                Recovery::Failed
            }
        }
    }
}

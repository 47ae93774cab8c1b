//! Client-side mirror of a server list.
//!
//! A [`ListStore`] keeps records in server order with an id index, lets a
//! caller apply an edit optimistically and roll it back if the request
//! fails, and folds change-feed events into the list.

use std::collections::{HashMap, HashSet};

use crate::app::models::{Lead, OsStatus, Progress, Project, ServiceOrder, Task, TaskStatus};
use crate::app::ws::WsMessage;

/// Effect of a change-feed event on one store.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<T> {
    Upsert(T),
    Remove(i64),
}

/// A record that can live in a [`ListStore`].
pub trait Record: Clone {
    fn id(&self) -> i64;

    /// The change `msg` implies for stores of this record type, if any.
    fn change_from(msg: &WsMessage) -> Option<Change<Self>>;
}

/// A record with a terminal "done" state, for progress metrics.
pub trait Completable {
    fn is_done(&self) -> bool;
}

impl Record for Lead {
    fn id(&self) -> i64 {
        self.id
    }

    fn change_from(msg: &WsMessage) -> Option<Change<Self>> {
        match msg {
            WsMessage::LeadCreated { lead }
            | WsMessage::LeadUpdated { lead }
            | WsMessage::LeadMoved { lead, .. } => Some(Change::Upsert(lead.clone())),
            WsMessage::LeadDeleted { lead_id } => Some(Change::Remove(*lead_id)),
            _ => None,
        }
    }
}

impl Record for Task {
    fn id(&self) -> i64 {
        self.id
    }

    fn change_from(msg: &WsMessage) -> Option<Change<Self>> {
        match msg {
            WsMessage::TaskCreated { task }
            | WsMessage::TaskUpdated { task }
            | WsMessage::TaskMoved { task, .. } => Some(Change::Upsert(task.clone())),
            WsMessage::TaskDeleted { task_id } => Some(Change::Remove(*task_id)),
            _ => None,
        }
    }
}

impl Record for ServiceOrder {
    fn id(&self) -> i64 {
        self.id
    }

    fn change_from(msg: &WsMessage) -> Option<Change<Self>> {
        match msg {
            WsMessage::ServiceOrderCreated { service_order }
            | WsMessage::ServiceOrderUpdated { service_order }
            | WsMessage::ServiceOrderMoved { service_order, .. } => {
                Some(Change::Upsert(service_order.clone()))
            }
            WsMessage::ServiceOrderDeleted { service_order_id } => {
                Some(Change::Remove(*service_order_id))
            }
            _ => None,
        }
    }
}

impl Record for Project {
    fn id(&self) -> i64 {
        self.id
    }

    fn change_from(msg: &WsMessage) -> Option<Change<Self>> {
        match msg {
            WsMessage::ProjectCreated { project } | WsMessage::ProjectUpdated { project } => {
                Some(Change::Upsert(project.clone()))
            }
            WsMessage::ProjectDeleted { project_id } => Some(Change::Remove(*project_id)),
            _ => None,
        }
    }
}

impl Completable for Task {
    fn is_done(&self) -> bool {
        self.status == TaskStatus::Done
    }
}

impl Completable for ServiceOrder {
    fn is_done(&self) -> bool {
        self.status == OsStatus::Done
    }
}

/// State captured before an optimistic edit.
#[derive(Debug, Clone)]
#[must_use = "a snapshot must be rolled back or committed"]
pub struct Snapshot<T> {
    index: usize,
    previous: T,
}

#[derive(Debug, Clone)]
pub struct ListStore<T: Record> {
    items: Vec<T>,
    index: HashMap<i64, usize>,
}

impl<T: Record> Default for ListStore<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T: Record> ListStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_items(items: Vec<T>) -> Self {
        let mut store = Self::new();
        store.replace_all(items);
        store
    }

    /// Replace the whole list, e.g. after a fresh fetch. When an id
    /// appears more than once only its last copy is kept.
    pub fn replace_all(&mut self, items: Vec<T>) {
        let mut seen = HashSet::new();
        let mut unique: Vec<T> = items
            .into_iter()
            .rev()
            .filter(|item| seen.insert(item.id()))
            .collect();
        unique.reverse();
        self.items = unique;
        self.reindex();
    }

    /// Replace the record in place, or append it when unknown.
    pub fn upsert(&mut self, item: T) {
        match self.index.get(&item.id()) {
            Some(&i) => self.items[i] = item,
            None => {
                self.index.insert(item.id(), self.items.len());
                self.items.push(item);
            }
        }
    }

    pub fn remove(&mut self, id: i64) -> Option<T> {
        let i = self.index.remove(&id)?;
        let removed = self.items.remove(i);
        self.reindex();
        Some(removed)
    }

    pub fn get(&self, id: i64) -> Option<&T> {
        self.index.get(&id).map(|&i| &self.items[i])
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Edit a record ahead of the server's answer. Returns `None` when the
    /// record is not in the store.
    pub fn apply_optimistic<F>(&mut self, id: i64, edit: F) -> Option<Snapshot<T>>
    where
        F: FnOnce(&mut T),
    {
        let &i = self.index.get(&id)?;
        let previous = self.items[i].clone();
        edit(&mut self.items[i]);
        Some(Snapshot { index: i, previous })
    }

    /// Undo an optimistic edit. A record removed in the meantime is put
    /// back at its old position.
    pub fn rollback(&mut self, snapshot: Snapshot<T>) {
        let id = snapshot.previous.id();
        match self.index.get(&id) {
            Some(&i) => self.items[i] = snapshot.previous,
            None => {
                let at = snapshot.index.min(self.items.len());
                self.items.insert(at, snapshot.previous);
                self.reindex();
            }
        }
    }

    /// Accept an optimistic edit once the server confirmed it.
    pub fn commit(&mut self, snapshot: Snapshot<T>) {
        drop(snapshot);
    }

    /// Fold a change-feed event into the list. Returns whether it applied.
    pub fn apply_event(&mut self, msg: &WsMessage) -> bool {
        match T::change_from(msg) {
            Some(Change::Upsert(item)) => {
                self.upsert(item);
                true
            }
            Some(Change::Remove(id)) => self.remove(id).is_some(),
            None => false,
        }
    }

    fn reindex(&mut self) {
        self.index = self
            .items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.id(), i))
            .collect();
    }
}

impl<T: Record + Completable> ListStore<T> {
    pub fn progress(&self) -> Progress {
        let done = self.items.iter().filter(|item| item.is_done()).count();
        Progress::new(self.items.len() as i64, done as i64)
    }
}

use super::subflow::{Subflow, SubflowId};

/// Established subflows of one connection, in the order they were
/// established. Schedulers iterate in this order.
#[derive(Debug, Default)]
pub struct SubflowRegistry {
    subflows: Vec<Subflow>,
}

impl SubflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, subflow: Subflow) {
        self.subflows.push(subflow);
    }

    /// Removal keeps the relative order of the remaining subflows
    pub fn remove(&mut self, id: SubflowId) -> Option<Subflow> {
        let index = self.subflows.iter().position(|s| s.id == id)?;
        Some(self.subflows.remove(index))
    }

    pub fn get(&self, id: SubflowId) -> Option<&Subflow> {
        self.subflows.iter().find(|s| s.id == id)
    }

    pub fn get_mut(&mut self, id: SubflowId) -> Option<&mut Subflow> {
        self.subflows.iter_mut().find(|s| s.id == id)
    }

    pub fn contains(&self, id: SubflowId) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subflow> {
        self.subflows.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Subflow> {
        self.subflows.iter_mut()
    }

    pub fn ids(&self) -> Vec<SubflowId> {
        self.subflows.iter().map(|s| s.id).collect()
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, Subflow> {
        self.subflows.drain(..)
    }

    pub fn len(&self) -> usize {
        self.subflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subflows.is_empty()
    }
}

//! Generation-checked slot map
//!
//! A `slab::Slab` for storage plus a generation counter per slot index.
//! Removing an entry bumps the generation of its slot, so stale idents are
//! rejected by every lookup.

use crate::ident::Ident;
use slab::Slab;

pub struct SlotMap<T> {
    entries: Slab<T>,
    /// Current generation for every slot index ever handed out.
    generations: Vec<u32>,
}

impl<T> Default for SlotMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SlotMap<T> {
    pub fn new() -> Self {
        Self {
            entries: Slab::new(),
            generations: Vec::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Slab::with_capacity(capacity),
            generations: Vec::with_capacity(capacity),
        }
    }

    /// Insert a value and return its ident.
    pub fn insert(&mut self, value: T) -> Ident {
        self.insert_with(|_| value)
    }

    /// Insert a value that needs to know its own ident.
    pub fn insert_with(&mut self, make: impl FnOnce(Ident) -> T) -> Ident {
        let vacant = self.entries.vacant_entry();
        let index = vacant.key();
        if index >= self.generations.len() {
            self.generations.resize(index + 1, 0);
        }
        let id = Ident::new(index as u32, self.generations[index]);
        vacant.insert(make(id));
        id
    }

    #[inline]
    fn live_index(&self, id: Ident) -> Option<usize> {
        if id.is_none() {
            return None;
        }
        let index = id.index() as usize;
        match self.generations.get(index) {
            Some(&generation) if generation == id.generation() && self.entries.contains(index) => {
                Some(index)
            }
            _ => None,
        }
    }

    pub fn contains(&self, id: Ident) -> bool {
        self.live_index(id).is_some()
    }

    /// `id` named an entry that has since been removed.
    pub fn is_retired(&self, id: Ident) -> bool {
        if id.is_none() {
            return false;
        }
        match self.generations.get(id.index() as usize) {
            Some(&generation) => generation != id.generation() && !self.contains(id),
            None => false,
        }
    }

    pub fn get(&self, id: Ident) -> Option<&T> {
        let index = self.live_index(id)?;
        self.entries.get(index)
    }

    pub fn get_mut(&mut self, id: Ident) -> Option<&mut T> {
        let index = self.live_index(id)?;
        self.entries.get_mut(index)
    }

    /// Remove and return the value. The slot's generation is bumped.
    pub fn remove(&mut self, id: Ident) -> Option<T> {
        let index = self.live_index(id)?;
        self.generations[index] = self.generations[index].wrapping_add(1);
        Some(self.entries.remove(index))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Ident, &T)> + '_ {
        let generations = &self.generations;
        self.entries
            .iter()
            .map(move |(index, value)| (Ident::new(index as u32, generations[index]), value))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Ident, &mut T)> + '_ {
        let generations = &self.generations;
        self.entries
            .iter_mut()
            .map(move |(index, value)| (Ident::new(index as u32, generations[index]), value))
    }

    /// Snapshot of all live idents.
    pub fn idents(&self) -> Vec<Ident> {
        self.iter().map(|(id, _)| id).collect()
    }

    /// Remove every entry, bumping all generations.
    pub fn drain(&mut self) -> Vec<(Ident, T)> {
        let ids = self.idents();
        ids.into_iter()
            .filter_map(|id| self.remove(id).map(|value| (id, value)))
            .collect()
    }
}

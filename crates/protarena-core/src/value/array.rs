//! Storage of repeated fields.

use super::Elem;
use crate::error::{Error, Result};

/// Ordered elements of one repeated field
#[derive(Debug, Clone, Default)]
pub(crate) struct ArrayData {
    elems: Vec<Elem>,
}

impl ArrayData {
    pub(crate) fn len(&self) -> usize {
        self.elems.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    pub(crate) fn get(&self, index: usize) -> Result<Elem> {
        self.elems
            .get(index)
            .copied()
            .ok_or(Error::IndexOutOfBounds {
                index,
                len: self.elems.len(),
            })
    }

    pub(crate) fn set(&mut self, index: usize, elem: Elem) -> Result<()> {
        let len = self.elems.len();
        let slot = self
            .elems
            .get_mut(index)
            .ok_or(Error::IndexOutOfBounds { index, len })?;
        *slot = elem;
        Ok(())
    }

    pub(crate) fn push(&mut self, elem: Elem) -> Result<()> {
        self.elems.try_reserve(1).map_err(|_| Error::AllocationExhausted {
            requested: std::mem::size_of::<Elem>(),
            limit: None,
        })?;
        self.elems.push(elem);
        Ok(())
    }

    pub(crate) fn clear(&mut self) {
        self.elems.clear();
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = Elem> + '_ {
        self.elems.iter().copied()
    }
}

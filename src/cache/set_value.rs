//! C3: Set-version model.
//!
//! An ordered history of versions for one entity id, each tagged with the
//! block-range height over which it was live. Used directly by C5 in
//! historical mode and degenerately (only the latest version matters) in
//! non-historical mode.

use crate::error::{IndexerError, Result};

/// One version of an entity's data, valid over `[start_height, end_height)`.
/// `end_height = None` means "live at tip".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version<E> {
    pub data: E,
    pub start_height: u64,
    pub end_height: Option<u64>,
}

impl<E> Version<E> {
    pub fn is_open(&self) -> bool {
        self.end_height.is_none()
    }
}

/// Ordered, non-overlapping, contiguous history of versions for one id.
#[derive(Debug, Clone)]
pub struct SetValueModel<E> {
    versions: Vec<Version<E>>,
}

impl<E: Clone> SetValueModel<E> {
    pub fn new() -> Self {
        Self { versions: Vec::new() }
    }

    /// Seed a model from a version already materialised in storage (e.g.
    /// the DB's current live row), so `set`/`remove` on top of it continue
    /// to respect monotone-height invariants.
    pub fn from_existing(data: E, start_height: u64, end_height: Option<u64>) -> Self {
        Self {
            versions: vec![Version {
                data,
                start_height,
                end_height,
            }],
        }
    }

    /// Close the currently open version at `height` (if any) and open a new
    /// one starting at `height`. If the existing open version already
    /// starts exactly at `height`, it is replaced in place rather than
    /// producing a zero-width interval (§4.3 edge case).
    pub fn set(&mut self, data: E, height: u64) -> Result<()> {
        if let Some(last) = self.versions.last_mut() {
            if last.is_open() {
                if height == last.start_height {
                    last.data = data;
                    return Ok(());
                }
                if height < last.start_height {
                    return Err(IndexerError::programmer(format!(
                        "set() at height {} precedes open version's start {}",
                        height, last.start_height
                    )));
                }
                last.end_height = Some(height);
            } else if let Some(end) = last.end_height {
                if height < end {
                    return Err(IndexerError::programmer(format!(
                        "set() at height {} precedes last closed version's end {}",
                        height, end
                    )));
                }
            }
        }
        self.versions.push(Version {
            data,
            start_height: height,
            end_height: None,
        });
        Ok(())
    }

    /// Close the open version (if any) at `height`, without opening a new
    /// one.
    pub fn mark_as_removed(&mut self, height: u64) -> Result<()> {
        if let Some(last) = self.versions.last_mut() {
            if last.is_open() {
                if height < last.start_height {
                    return Err(IndexerError::programmer(format!(
                        "mark_as_removed() at height {} precedes open version's start {}",
                        height, last.start_height
                    )));
                }
                last.end_height = Some(height);
            }
        }
        Ok(())
    }

    pub fn get_latest(&self) -> Option<&E> {
        self.versions.last().map(|v| &v.data)
    }

    pub fn get_first(&self) -> Option<&E> {
        self.versions.first().map(|v| &v.data)
    }

    pub fn get_values(&self) -> &[Version<E>] {
        &self.versions
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// True iff the latest version satisfies `predicate` - the generic
    /// stand-in for a dynamic `isMatchData(field, value)` over an
    /// opaque payload (§9 re-architecture guidance: reflective field access
    /// becomes a caller-supplied projection in a typed implementation).
    pub fn is_match_data(&self, predicate: impl FnOnce(&E) -> bool) -> bool {
        self.get_latest().map(predicate).unwrap_or(false)
    }

    pub fn first_start_height(&self) -> Option<u64> {
        self.versions.first().map(|v| v.start_height)
    }
}

impl<E: Clone> Default for SetValueModel<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_closes_previous_and_opens_new() {
        let mut m = SetValueModel::new();
        m.set(1, 5).unwrap();
        m.set(2, 8).unwrap();

        let values = m.get_values();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0], Version { data: 1, start_height: 5, end_height: Some(8) });
        assert_eq!(values[1], Version { data: 2, start_height: 8, end_height: None });
        assert_eq!(m.get_latest(), Some(&2));
    }

    #[test]
    fn set_at_same_start_height_replaces_in_place() {
        let mut m = SetValueModel::new();
        m.set("a", 5).unwrap();
        m.set("b", 5).unwrap();

        let values = m.get_values();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].data, "b");
        assert_eq!(values[0].start_height, 5);
    }

    #[test]
    fn set_before_last_start_is_programmer_error() {
        let mut m = SetValueModel::new();
        m.set(1, 10).unwrap();
        assert!(m.set(2, 5).is_err());
    }

    #[test]
    fn mark_as_removed_closes_without_opening() {
        let mut m = SetValueModel::from_existing("v0", 1, None);
        m.mark_as_removed(7).unwrap();

        let values = m.get_values();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].end_height, Some(7));
        assert_eq!(m.get_latest(), Some(&"v0"));
    }

    #[test]
    fn is_match_data_checks_latest_only() {
        let mut m = SetValueModel::new();
        m.set(1, 1).unwrap();
        m.set(2, 2).unwrap();
        assert!(m.is_match_data(|v| *v == 2));
        assert!(!m.is_match_data(|v| *v == 1));
    }

    #[test]
    fn historical_ranges_are_contiguous_and_gapless() {
        let mut m = SetValueModel::new();
        m.set("a", 5).unwrap();
        m.set("b", 8).unwrap();
        m.set("c", 12).unwrap();

        let values = m.get_values();
        for window in values.windows(2) {
            assert_eq!(window[0].end_height, Some(window[1].start_height));
        }
        assert!(values.last().unwrap().end_height.is_none());
    }
}

//! Display tracking: where each `display_id` has been rendered.
//!
//! A kernel may tag rich output with a `display_id` and later send
//! `update_display_data` to patch every rendered copy in place, wherever it
//! appeared. The registry records locations as outputs land and answers the
//! fan-out question on update.

use std::collections::HashMap;

use parking_lot::RwLock;

use suzuri_types::{CellId, DisplayLocation};

/// Maps `display_id` to every `(cell, output index)` where it was rendered.
#[derive(Debug, Default)]
pub struct DisplayRegistry {
    locations: RwLock<HashMap<String, Vec<DisplayLocation>>>,
}

impl DisplayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `display_id` was rendered at `location`.
    pub fn record(&self, display_id: &str, location: DisplayLocation) {
        self.locations
            .write()
            .entry(display_id.to_string())
            .or_default()
            .push(location);
    }

    /// Everywhere `display_id` has been rendered, or `None` if the id has
    /// never been seen. An update for an unseen id is a no-op.
    pub fn targets(&self, display_id: &str) -> Option<Vec<DisplayLocation>> {
        self.locations.read().get(display_id).cloned()
    }

    /// Drop all locations inside `cell`. Ids rendered only there are
    /// forgotten entirely.
    pub fn forget_cell(&self, cell: CellId) {
        let mut locations = self.locations.write();
        locations.retain(|_, places| {
            places.retain(|place| place.cell != cell);
            !places.is_empty()
        });
    }

    /// Forget everything. Used when a restart clears outputs.
    pub fn clear(&self) {
        self.locations.write().clear();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn at(cell: CellId, index: usize) -> DisplayLocation {
        DisplayLocation { cell, index }
    }

    #[test]
    fn test_update_fans_out_to_all_locations() {
        let registry = DisplayRegistry::new();
        let (a, b) = (CellId::new(), CellId::new());
        registry.record("plot", at(a, 0));
        registry.record("plot", at(a, 2));
        registry.record("plot", at(b, 1));

        let targets = registry.targets("plot").unwrap();
        assert_eq!(targets.len(), 3);
        assert!(targets.contains(&at(b, 1)));
    }

    #[test]
    fn test_unseen_id_has_no_targets() {
        let registry = DisplayRegistry::new();
        assert!(registry.targets("never-rendered").is_none());
    }

    #[test]
    fn test_forget_cell_drops_only_that_cell() {
        let registry = DisplayRegistry::new();
        let (a, b) = (CellId::new(), CellId::new());
        registry.record("plot", at(a, 0));
        registry.record("plot", at(b, 0));
        registry.record("table", at(a, 1));

        registry.forget_cell(a);

        assert_eq!(registry.targets("plot").unwrap(), vec![at(b, 0)]);
        assert!(registry.targets("table").is_none());
    }
}

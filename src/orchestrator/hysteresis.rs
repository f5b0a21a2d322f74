// =============================================================================
// Granularity selection with hysteresis
// =============================================================================
//
// Each granularity owns a `[min_hours, max_hours]` band of visible span, and
// neighbouring bands overlap. The current granularity is kept for as long as
// the span stays inside its own band; only when it leaves that band is the
// finest granularity whose band contains the span chosen. A span hovering
// around one threshold therefore never flips the choice back and forth.
// =============================================================================

use std::collections::BTreeMap;

use crate::granularity::{Granularity, HOUR};

#[derive(Debug, Clone)]
pub struct GranularityBands {
    bands: BTreeMap<Granularity, [f64; 2]>,
}

impl GranularityBands {
    pub fn new(bands: BTreeMap<Granularity, [f64; 2]>) -> Self {
        Self { bands }
    }

    pub fn contains(&self, granularity: Granularity, span_hours: f64) -> bool {
        self.bands
            .get(&granularity)
            .is_some_and(|[min, max]| span_hours >= *min && span_hours <= *max)
    }

    /// Granularity for a visible span of `span_secs`, given the one currently
    /// shown.
    pub fn select(&self, current: Option<Granularity>, span_secs: i64) -> Granularity {
        let hours = span_secs.max(0) as f64 / HOUR as f64;
        if let Some(current) = current.filter(|g| self.contains(*g, hours)) {
            return current;
        }
        if let Some(g) = self.bands.keys().copied().find(|g| self.contains(*g, hours)) {
            return g;
        }
        // Outside every band: the first band that still lies above the span,
        // else the coarsest configured.
        self.bands
            .iter()
            .find(|(_, [min, _])| hours < *min)
            .or_else(|| self.bands.iter().next_back())
            .map(|(g, _)| *g)
            .unwrap_or(Granularity::BASE)
    }
}

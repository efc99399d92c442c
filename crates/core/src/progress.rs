//! Node-completion progress for a single submitted workflow.
//!
//! Overall progress is the share of workflow nodes the server has
//! reported as finished (executed or served from cache). Step counters
//! from long-running nodes are informational only and never feed into
//! the overall percentage.

use std::collections::{BTreeSet, HashSet};

/// Tracks which nodes of a workflow have finished.
#[derive(Debug, Clone)]
pub struct NodeProgress {
    total: BTreeSet<String>,
    finished: HashSet<String>,
}

impl NodeProgress {
    /// Start tracking against the full set of node ids in the workflow.
    pub fn new<I, S>(node_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            total: node_ids.into_iter().map(Into::into).collect(),
            finished: HashSet::new(),
        }
    }

    /// Record a node as finished. Returns `true` if the node had not been
    /// seen before; repeated names never double-count.
    pub fn mark_finished(&mut self, node_id: &str) -> bool {
        self.finished.insert(node_id.to_string())
    }

    pub fn finished_count(&self) -> usize {
        self.finished.len()
    }

    pub fn total_count(&self) -> usize {
        self.total.len()
    }

    /// Fraction of finished nodes, clamped to `0.0..=1.0`.
    ///
    /// Node ids outside the workflow still count toward `finished` (the
    /// server can report helper nodes) but the ratio never exceeds 1.
    pub fn fraction(&self) -> f64 {
        if self.total.is_empty() {
            return 0.0;
        }
        (self.finished.len() as f64 / self.total.len() as f64).min(1.0)
    }

    /// Overall completion percentage (0-100, rounded down).
    pub fn percent(&self) -> u8 {
        if self.total.is_empty() {
            return 0;
        }
        let pct = self.finished.len().min(self.total.len()) * 100 / self.total.len();
        pct as u8
    }
}

/// Step-level progress within one node, as a percentage.
///
/// Returns 0 when `max` is not positive.
pub fn step_percent(value: i64, max: i64) -> u8 {
    if max <= 0 {
        return 0;
    }
    let pct = (value.clamp(0, max) * 100) / max;
    pct as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_counts_each_node_once() {
        let mut p = NodeProgress::new(["A", "B", "C"]);

        assert!(p.mark_finished("A"));
        assert!((p.fraction() - 1.0 / 3.0).abs() < 1e-9);

        assert!(p.mark_finished("B"));
        assert!((p.fraction() - 2.0 / 3.0).abs() < 1e-9);

        // Re-naming a seen node must not double count.
        assert!(!p.mark_finished("A"));
        assert!((p.fraction() - 2.0 / 3.0).abs() < 1e-9);

        assert!(p.mark_finished("C"));
        assert_eq!(p.fraction(), 1.0);
        assert_eq!(p.percent(), 100);
    }

    #[test]
    fn percent_rounds_down() {
        let mut p = NodeProgress::new(["1", "2", "3"]);
        p.mark_finished("1");
        assert_eq!(p.percent(), 33);
        p.mark_finished("2");
        assert_eq!(p.percent(), 66);
    }

    #[test]
    fn order_does_not_matter() {
        let mut a = NodeProgress::new(["A", "B", "C"]);
        let mut b = NodeProgress::new(["A", "B", "C"]);
        for n in ["C", "A", "B"] {
            a.mark_finished(n);
        }
        for n in ["A", "B", "B", "C"] {
            b.mark_finished(n);
        }
        assert_eq!(a.percent(), b.percent());
        assert_eq!(a.finished_count(), 3);
    }

    #[test]
    fn empty_workflow_reports_zero() {
        let mut p = NodeProgress::new(Vec::<String>::new());
        p.mark_finished("x");
        assert_eq!(p.percent(), 0);
        assert_eq!(p.fraction(), 0.0);
    }

    #[test]
    fn unknown_nodes_never_exceed_full() {
        let mut p = NodeProgress::new(["A"]);
        p.mark_finished("A");
        p.mark_finished("helper");
        assert_eq!(p.percent(), 100);
        assert_eq!(p.fraction(), 1.0);
    }

    #[test]
    fn step_percent_basic() {
        assert_eq!(step_percent(50, 100), 50);
        assert_eq!(step_percent(5, 20), 25);
    }

    #[test]
    fn step_percent_handles_bad_max() {
        assert_eq!(step_percent(3, 0), 0);
        assert_eq!(step_percent(3, -1), 0);
        assert_eq!(step_percent(30, 20), 100);
    }
}

//! Cycle-breaking strategies.

use crate::config::SubsetConfig;
use crate::schema::{AssociationGraph, AssociationId, TableId};
use ahash::AHashMap;

/// Picks the association to defer inside a dependency cycle.
pub trait CycleBreaker: Send + Sync {
    /// Choose one of `candidates` (all inside the same cycle), or `None` when
    /// none can be deferred
    fn choose(
        &self,
        graph: &AssociationGraph,
        candidates: &[AssociationId],
        row_counts: &AHashMap<TableId, u64>,
    ) -> Option<AssociationId>;
}

/// Defers associations whose foreign key columns are all nullable, or that
/// are listed as deferrable in the configuration.
///
/// Preference: configured associations first, then the fewest rows in the
/// dependent table, then the association name.
#[derive(Debug, Clone, Default)]
pub struct NullableEdgeBreaker {
    deferrable: Vec<String>,
}

impl NullableEdgeBreaker {
    pub fn new(deferrable: Vec<String>) -> Self {
        Self { deferrable }
    }

    pub fn from_config(config: &SubsetConfig) -> Self {
        Self::new(config.deferrable.clone())
    }

    fn is_configured(&self, name: &str) -> bool {
        self.deferrable.iter().any(|d| d.eq_ignore_ascii_case(name))
    }

    /// Whether deferring the association leaves every row insertable
    pub fn is_viable(&self, graph: &AssociationGraph, id: AssociationId) -> bool {
        let assoc = graph.association(id);
        if self.is_configured(&assoc.name) {
            return true;
        }
        let dependent = graph.table(assoc.dependent);
        assoc.fk_columns.iter().all(|c| {
            dependent
                .column(c)
                .map(|col| col.nullable)
                .unwrap_or(false)
        })
    }
}

impl CycleBreaker for NullableEdgeBreaker {
    fn choose(
        &self,
        graph: &AssociationGraph,
        candidates: &[AssociationId],
        row_counts: &AHashMap<TableId, u64>,
    ) -> Option<AssociationId> {
        candidates
            .iter()
            .copied()
            .filter(|id| self.is_viable(graph, *id))
            .min_by(|a, b| {
                let a = graph.association(*a);
                let b = graph.association(*b);
                let key = |x: &crate::schema::Association| {
                    (
                        !self.is_configured(&x.name),
                        row_counts.get(&x.dependent).copied().unwrap_or(0),
                    )
                };
                key(a).cmp(&key(b)).then_with(|| a.name.cmp(&b.name))
            })
    }
}

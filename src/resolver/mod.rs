//! Dependency resolution: statement-safe table order for the export.
//!
//! Dependency edges come from associations whose source rows must be inserted
//! first. Cycles are found with Tarjan's SCC algorithm and broken by deferring
//! one association per cycle (its FK columns are written as NULL on insert and
//! patched afterwards). The remaining acyclic graph gives:
//! - the insert order (topological) and the delete order (its exact reverse)
//! - insert waves (topological levels) that may be exported concurrently

mod breaker;
mod scc;

pub use breaker::{CycleBreaker, NullableEdgeBreaker};
pub use scc::{cyclic_components, strongly_connected};

use crate::config::SubsetConfig;
use crate::error::{Result, SubsetError};
use crate::schema::{AssociationGraph, AssociationId, TableId};
use ahash::AHashMap;
use std::fmt;

/// When a deferred column is written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeferredPass {
    /// Set the real values once every insert has run
    UpdateAfterInsert,
    /// Reset to NULL before any delete runs
    ResetBeforeDelete,
}

impl fmt::Display for DeferredPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferredPass::UpdateAfterInsert => write!(f, "update-after-insert"),
            DeferredPass::ResetBeforeDelete => write!(f, "reset-before-delete"),
        }
    }
}

/// FK columns of a table whose values are deferred to break a cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredColumn {
    pub table: TableId,
    pub columns: Vec<String>,
    pub association: AssociationId,
    pub pass: DeferredPass,
}

/// All deferrals needed to export a cyclic subset
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CyclePlan {
    pub entries: Vec<DeferredColumn>,
}

impl CyclePlan {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pass(&self, pass: DeferredPass) -> impl Iterator<Item = &DeferredColumn> {
        self.entries.iter().filter(move |e| e.pass == pass)
    }

    /// Columns written as NULL when inserting rows of `table`
    pub fn nulled_on_insert(&self, table: TableId) -> Vec<&str> {
        let mut cols: Vec<&str> = Vec::new();
        for entry in self.pass(DeferredPass::UpdateAfterInsert) {
            if entry.table == table {
                for c in &entry.columns {
                    if !cols.iter().any(|x| x.eq_ignore_ascii_case(c)) {
                        cols.push(c);
                    }
                }
            }
        }
        cols
    }
}

/// Order in which tables are exported
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportPlan {
    pub insert_order: Vec<TableId>,
    pub delete_order: Vec<TableId>,
    pub insert_waves: Vec<Vec<TableId>>,
    pub delete_waves: Vec<Vec<TableId>>,
    pub cycle_plan: CyclePlan,
}

/// A dependency edge: rows of `from` must exist before rows of `to`
#[derive(Debug, Clone, Copy)]
struct DepEdge {
    from: usize,
    to: usize,
    association: AssociationId,
    active: bool,
}

/// Computes [`ExportPlan`]s for sets of touched tables.
pub struct DependencyResolver<'g> {
    graph: &'g AssociationGraph,
    no_sorting: bool,
    breaker: Box<dyn CycleBreaker>,
}

impl<'g> DependencyResolver<'g> {
    pub fn new(graph: &'g AssociationGraph, config: &SubsetConfig) -> Self {
        Self {
            graph,
            no_sorting: config.no_sorting,
            breaker: Box::new(NullableEdgeBreaker::from_config(config)),
        }
    }

    /// Use a different cycle-breaking strategy
    pub fn with_breaker(mut self, breaker: Box<dyn CycleBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    /// Plan the export of `touched` tables.
    ///
    /// `row_counts` feeds the cycle breaker; missing tables count as empty.
    pub fn order(
        &self,
        touched: &[TableId],
        row_counts: &AHashMap<TableId, u64>,
    ) -> Result<ExportPlan> {
        // Nodes in graph order
        let mut nodes: Vec<TableId> = touched.to_vec();
        nodes.sort_unstable();
        nodes.dedup();

        if self.no_sorting {
            let delete_order: Vec<TableId> = nodes.iter().rev().copied().collect();
            return Ok(ExportPlan {
                insert_waves: vec![nodes.clone()],
                delete_waves: vec![delete_order.clone()],
                insert_order: nodes,
                delete_order,
                cycle_plan: CyclePlan::default(),
            });
        }

        let position: AHashMap<TableId, usize> =
            nodes.iter().enumerate().map(|(i, t)| (*t, i)).collect();

        // Disabled associations still produce edges: the target keeps the FK
        let mut edges: Vec<DepEdge> = self
            .graph
            .associations()
            .iter()
            .filter(|a| a.insert_source_first)
            .filter_map(|a| {
                Some(DepEdge {
                    from: *position.get(&a.source)?,
                    to: *position.get(&a.destination)?,
                    association: a.id,
                    active: true,
                })
            })
            .collect();

        let cycle_plan = self.break_cycles(&nodes, &mut edges, row_counts)?;

        let adjacency = adjacency(nodes.len(), &edges);
        let topo = topological_order(&adjacency);
        let insert_order: Vec<TableId> = topo.iter().map(|&i| nodes[i]).collect();
        let delete_order: Vec<TableId> = insert_order.iter().rev().copied().collect();

        let insert_waves = waves(&topo, &edges, nodes.len())
            .into_iter()
            .map(|wave| wave.into_iter().map(|i| nodes[i]).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        let delete_waves = insert_waves
            .iter()
            .rev()
            .map(|w| w.iter().rev().copied().collect())
            .collect();

        tracing::debug!(
            tables = nodes.len(),
            waves = insert_waves.len(),
            deferred = cycle_plan.entries.len() / 2,
            "export plan resolved"
        );

        Ok(ExportPlan {
            insert_order,
            delete_order,
            insert_waves,
            delete_waves,
            cycle_plan,
        })
    }

    fn break_cycles(
        &self,
        nodes: &[TableId],
        edges: &mut [DepEdge],
        row_counts: &AHashMap<TableId, u64>,
    ) -> Result<CyclePlan> {
        let mut plan = CyclePlan::default();

        loop {
            let components = cyclic_components(&adjacency(nodes.len(), edges));
            if components.is_empty() {
                return Ok(plan);
            }

            for scc in components {
                let candidates: Vec<AssociationId> = edges
                    .iter()
                    .filter(|e| e.active && scc.contains(&e.from) && scc.contains(&e.to))
                    .map(|e| e.association)
                    .collect();

                let chosen = self
                    .breaker
                    .choose(self.graph, &candidates, row_counts)
                    .ok_or_else(|| SubsetError::UnresolvableCycle {
                        tables: scc
                            .iter()
                            .map(|&i| self.graph.table(nodes[i]).name.clone())
                            .collect(),
                    })?;

                for edge in edges.iter_mut().filter(|e| e.association == chosen) {
                    edge.active = false;
                }

                let assoc = self.graph.association(chosen);
                tracing::warn!(
                    association = %assoc.name,
                    table = %self.graph.table(assoc.dependent).name,
                    columns = %assoc.fk_columns.join(", "),
                    "deferring foreign key to break dependency cycle"
                );

                for pass in [DeferredPass::UpdateAfterInsert, DeferredPass::ResetBeforeDelete] {
                    plan.entries.push(DeferredColumn {
                        table: assoc.dependent,
                        columns: assoc.fk_columns.clone(),
                        association: chosen,
                        pass,
                    });
                }
            }
        }
    }
}

fn adjacency(n: usize, edges: &[DepEdge]) -> Vec<Vec<usize>> {
    let mut adjacency = vec![Vec::new(); n];
    for e in edges.iter().filter(|e| e.active) {
        if !adjacency[e.from].contains(&e.to) {
            adjacency[e.from].push(e.to);
        }
    }
    adjacency
}

/// Reverse DFS postorder.
///
/// Roots and successors are visited last-to-first so that unconstrained
/// tables keep their graph order in the result.
fn topological_order(adjacency: &[Vec<usize>]) -> Vec<usize> {
    fn visit(v: usize, adjacency: &[Vec<usize>], visited: &mut [bool], post: &mut Vec<usize>) {
        visited[v] = true;
        for &w in adjacency[v].iter().rev() {
            if !visited[w] {
                visit(w, adjacency, visited, post);
            }
        }
        post.push(v);
    }

    let n = adjacency.len();
    let mut visited = vec![false; n];
    let mut post = Vec::with_capacity(n);
    for v in (0..n).rev() {
        if !visited[v] {
            visit(v, adjacency, &mut visited, &mut post);
        }
    }
    post.reverse();
    post
}

/// Topological levels, members ordered by topological position
fn waves(topo: &[usize], edges: &[DepEdge], n: usize) -> Vec<Vec<usize>> {
    let mut incoming: Vec<Vec<usize>> = vec![Vec::new(); n];
    for e in edges.iter().filter(|e| e.active && e.from != e.to) {
        incoming[e.to].push(e.from);
    }

    let mut level = vec![0usize; n];
    for &v in topo {
        level[v] = incoming[v]
            .iter()
            .map(|&u| level[u] + 1)
            .max()
            .unwrap_or(0);
    }

    let depth = level.iter().copied().max().map_or(0, |d| d + 1);
    let mut waves: Vec<Vec<usize>> = vec![Vec::new(); if n == 0 { 0 } else { depth }];
    for &v in topo {
        waves[level[v]].push(v);
    }
    waves
}

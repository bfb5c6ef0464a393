//! Fixed-point traversal of the association graph.
//!
//! Round `r` applies every enabled association to the entries born in round
//! `r - 1`, so each entry is expanded exactly once per association. The first
//! round that adds nothing closes the traversal.

use crate::cancel::CancellationToken;
use crate::entity::{EntityGraph, Side};
use crate::error::{Result, SubsetError};
use crate::schema::AssociationId;
use std::fmt;

/// Lifecycle of a traversal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalState {
    Seeded,
    Expanding,
    Closed,
    Aborted,
}

impl fmt::Display for TraversalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraversalState::Seeded => write!(f, "seeded"),
            TraversalState::Expanding => write!(f, "expanding"),
            TraversalState::Closed => write!(f, "closed"),
            TraversalState::Aborted => write!(f, "aborted"),
        }
    }
}

/// Reported after every round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundProgress {
    pub round: u32,
    pub added: u64,
    pub total: u64,
}

/// Statistics from a closed traversal
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct TraversalStats {
    /// Seed entries (round 0)
    pub seeds: u64,
    /// Rounds executed, including the final empty round
    pub rounds: u32,
    /// New entries per round, round 1 first
    pub growth: Vec<u64>,
    /// INSERT-side entries at close
    pub total_entries: u64,
}

/// Drives an [`EntityGraph`] to its fixed point.
pub struct TraversalEngine<'g> {
    entities: &'g EntityGraph<'g>,
    order: Vec<AssociationId>,
    max_rounds: u32,
    max_entities: Option<u64>,
    cancel: CancellationToken,
    progress_fn: Option<Box<dyn Fn(&RoundProgress)>>,
    state: TraversalState,
}

impl<'g> TraversalEngine<'g> {
    /// Engine over the seeded entity graph, following enabled associations
    /// in stable graph order
    pub fn new(entities: &'g EntityGraph<'g>) -> Self {
        let config = entities.config();
        Self {
            entities,
            order: entities.graph().enabled_associations().map(|a| a.id).collect(),
            max_rounds: config.max_rounds,
            max_entities: config.max_entities,
            cancel: CancellationToken::new(),
            progress_fn: None,
            state: TraversalState::Seeded,
        }
    }

    /// Apply associations in this order instead; disabled ones are skipped
    pub fn with_order(mut self, order: Vec<AssociationId>) -> Self {
        let graph = self.entities.graph();
        self.order = order
            .into_iter()
            .filter(|id| graph.association(*id).is_enabled())
            .collect();
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    pub fn with_progress<F: Fn(&RoundProgress) + 'static>(mut self, f: F) -> Self {
        self.progress_fn = Some(Box::new(f));
        self
    }

    pub fn state(&self) -> TraversalState {
        self.state
    }

    /// Expand until a round adds no entries.
    ///
    /// Fails with `TraversalDiverged` when `max_rounds` rounds all added
    /// entries, or when the entity count exceeds `max_entities`. On any
    /// error, cancellation included, the state becomes `Aborted` and entries
    /// found so far stay in the entity graph.
    pub fn run(&mut self) -> Result<TraversalStats> {
        let result = self.expand_to_fixpoint();
        if let Err(ref e) = result {
            self.state = TraversalState::Aborted;
            tracing::warn!(error = %e, code = e.code(), "traversal aborted");
        }
        result
    }

    fn expand_to_fixpoint(&mut self) -> Result<TraversalStats> {
        let mut stats = TraversalStats {
            seeds: self.entities.total(Side::Insert)?,
            ..Default::default()
        };
        let mut total = stats.seeds;

        tracing::info!(
            seeds = stats.seeds,
            associations = self.order.len(),
            "traversal started"
        );
        self.state = TraversalState::Expanding;

        for round in 1..=self.max_rounds {
            let added = self.run_round(round)?;

            total += added;
            stats.rounds = round;
            stats.growth.push(added);
            tracing::debug!(round, added, total, "round finished");

            if let Some(ref f) = self.progress_fn {
                f(&RoundProgress {
                    round,
                    added,
                    total,
                });
            }

            if added == 0 {
                self.state = TraversalState::Closed;
                stats.total_entries = total;
                tracing::info!(rounds = round, entries = total, "traversal closed");
                return Ok(stats);
            }

            if let Some(max) = self.max_entities {
                if total > max {
                    return Err(SubsetError::TraversalDiverged {
                        rounds: round,
                        growth: stats.growth,
                    });
                }
            }
        }

        Err(SubsetError::TraversalDiverged {
            rounds: self.max_rounds,
            growth: stats.growth,
        })
    }

    fn run_round(&self, round: u32) -> Result<u64> {
        let graph = self.entities.graph();
        let mut added = 0u64;

        for &assoc_id in &self.order {
            if self.cancel.is_cancelled() {
                return Err(SubsetError::Cancelled {
                    stage: format!("traversal round {}", round),
                });
            }

            let assoc = graph.association(assoc_id);
            let mut cursor = self.entities.entries_born(assoc.source, round - 1);
            loop {
                let sources = cursor.next_page()?;
                if sources.is_empty() {
                    break;
                }
                added += self.entities.expand(assoc_id, &sources, round)?;
            }
        }

        Ok(added)
    }
}

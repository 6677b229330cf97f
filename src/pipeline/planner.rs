//! Catch-up planning: window bounds and per-entity resume points

use super::config::WindowConfig;
use super::error::PipelineError;
use super::schema::SchemaManager;
use super::source::SourceReader;
use super::types::{align_to_grid, EntityId, GRID_STEP};
use std::collections::HashMap;

/// Global `[t0, t1)` bounds of the rows the analytics store should hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchUpWindow {
    pub t0: i64,
    pub t1: i64,
}

impl CatchUpWindow {
    /// Derive bounds from the newest 5-minute timestamp.
    ///
    /// `t1` is floored to `round_t1_secs`; `t0` is `retention_days` before the
    /// `round_t0_secs` boundary at or below `t1`.
    pub fn from_latest(latest: i64, config: &WindowConfig) -> Self {
        let t1 = latest - latest.rem_euclid(config.round_t1_secs);
        let t0 = t1 - t1.rem_euclid(config.round_t0_secs) - config.retention_days * 86_400;
        Self { t0, t1 }
    }

    /// Grid timestamps from `from` (aligned down) up to but excluding `t1`
    pub fn grid_from(&self, from: i64) -> impl Iterator<Item = i64> {
        let t1 = self.t1;
        let mut ts = align_to_grid(from.max(self.t0));
        std::iter::from_fn(move || {
            if ts >= t1 {
                return None;
            }
            let current = ts;
            ts += GRID_STEP;
            Some(current)
        })
    }
}

/// Newest 5-minute timestamp across the liquid subset, falling back to the
/// tracked entities when none of the liquid ones has data.
pub fn resolve_window(
    reader: &SourceReader,
    liquid: &[EntityId],
    tracked: &[EntityId],
    config: &WindowConfig,
) -> Result<CatchUpWindow, PipelineError> {
    let latest = match reader.latest_five_minute_across(liquid)? {
        Some(ts) => ts,
        None => {
            log::warn!("⚠️  No 5-minute data for liquid entities, anchoring on tracked entities");
            reader
                .latest_five_minute_across(tracked)?
                .ok_or(PipelineError::NoSourceData)?
        }
    };

    Ok(CatchUpWindow::from_latest(latest, config))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanDecision {
    /// Coverage already reaches the last grid step before `t1`
    Skip,
    ToDo { resume_from: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub entity: EntityId,
    pub decision: PlanDecision,
    /// Table did not exist and was created during planning
    pub created: bool,
    pub evicted: u64,
}

#[derive(Debug, Clone)]
pub struct CatchUpPlan {
    pub window: CatchUpWindow,
    entries: Vec<PlanEntry>,
    index: HashMap<EntityId, usize>,
}

impl CatchUpPlan {
    pub fn new(window: CatchUpWindow, entries: Vec<PlanEntry>) -> Self {
        let index = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.entity, i))
            .collect();
        Self { window, entries, index }
    }

    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    pub fn entry(&self, entity: EntityId) -> Option<&PlanEntry> {
        self.index.get(&entity).map(|&i| &self.entries[i])
    }

    /// Where computation for an entity starts, `None` for skipped or unknown entities
    pub fn resume_point(&self, entity: EntityId) -> Option<i64> {
        match self.entry(entity)?.decision {
            PlanDecision::ToDo { resume_from } => Some(resume_from),
            PlanDecision::Skip => None,
        }
    }

    pub fn to_do(&self) -> Vec<EntityId> {
        self.entries
            .iter()
            .filter(|e| matches!(e.decision, PlanDecision::ToDo { .. }))
            .map(|e| e.entity)
            .collect()
    }

    pub fn skipped(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.decision == PlanDecision::Skip)
            .count()
    }

    pub fn created(&self) -> usize {
        self.entries.iter().filter(|e| e.created).count()
    }

    pub fn evicted(&self) -> u64 {
        self.entries.iter().map(|e| e.evicted).sum()
    }

    /// Grid rows still to compute across all to-do entities
    pub fn pending_rows(&self) -> usize {
        self.entries
            .iter()
            .filter_map(|e| match e.decision {
                PlanDecision::ToDo { resume_from } => Some(self.window.grid_from(resume_from).count()),
                PlanDecision::Skip => None,
            })
            .sum()
    }
}

/// Decides per entity what is left to compute, creating missing tables and
/// evicting rows that fell out of the retention window along the way.
pub struct CatchUpPlanner<'a> {
    schema: &'a SchemaManager,
    eviction_min_rows: u64,
}

impl<'a> CatchUpPlanner<'a> {
    pub fn new(schema: &'a SchemaManager, eviction_min_rows: u64) -> Self {
        Self {
            schema,
            eviction_min_rows: eviction_min_rows.max(1),
        }
    }

    pub fn plan(&self, window: CatchUpWindow, entities: &[EntityId]) -> Result<CatchUpPlan, PipelineError> {
        let mut entries = Vec::with_capacity(entities.len());
        for &entity in entities {
            entries.push(self.plan_entity(window, entity)?);
        }

        let plan = CatchUpPlan::new(window, entries);
        log::info!("📋 Catch-up plan for [{}, {})", window.t0, window.t1);
        log::info!("   ├─ To do: {}", plan.to_do().len());
        log::info!("   ├─ Skipped: {}", plan.skipped());
        log::info!("   ├─ Tables created: {}", plan.created());
        log::info!("   └─ Rows evicted: {}", plan.evicted());

        Ok(plan)
    }

    pub fn plan_entity(&self, window: CatchUpWindow, entity: EntityId) -> Result<PlanEntry, PipelineError> {
        let coverage = match self.schema.coverage(entity)? {
            Some(coverage) => coverage,
            None => {
                self.schema.ensure_table(entity)?;
                return Ok(PlanEntry {
                    entity,
                    decision: PlanDecision::ToDo { resume_from: window.t0 },
                    created: true,
                    evicted: 0,
                });
            }
        };

        let mut evicted = 0;
        if let Some(mark) = coverage {
            if mark.min_timestamp < window.t0
                && self.schema.expired_count(entity, window.t0)? >= self.eviction_min_rows
            {
                evicted = self.schema.evict(entity, window.t0)?;
                log::debug!("🧹 Evicted {} rows of entity {} before {}", evicted, entity, window.t0);
            }
        }

        let decision = match coverage {
            Some(mark) if mark.max_timestamp >= window.t1 - GRID_STEP => PlanDecision::Skip,
            Some(mark) if mark.max_timestamp > window.t0 => PlanDecision::ToDo {
                resume_from: align_to_grid(mark.max_timestamp),
            },
            _ => PlanDecision::ToDo { resume_from: window.t0 },
        };

        Ok(PlanEntry {
            entity,
            decision,
            created: false,
            evicted,
        })
    }
}

//! Evolution Engine: reinforces or penalizes skills on task outcome and
//! synthesizes quota-aware meta-skills. Closes the feedback loop the
//! Executor and Router leave open.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use store::Db;

use crate::domain::{Skill, TierOverride};

const QUOTA_SKILL_NAME: &str = "quota-aware-routing";
const BOOST_DELTA: f64 = 0.1;

#[derive(Clone, Copy)]
struct AntiPatternEntry {
    needed_skill: &'static str,
    principle: &'static str,
}

fn anti_pattern_table() -> HashMap<&'static str, AntiPatternEntry> {
    let mut m = HashMap::new();
    m.insert(
        "missing-validation",
        AntiPatternEntry {
            needed_skill: "validate-inputs-early",
            principle: "Check preconditions before side effects, not after a failure surfaces downstream",
        },
    );
    m.insert(
        "premature-optimization",
        AntiPatternEntry {
            needed_skill: "measure-before-optimizing",
            principle: "Profile the actual bottleneck before restructuring for performance",
        },
    );
    m.insert(
        "silent-failure",
        AntiPatternEntry {
            needed_skill: "surface-errors-explicitly",
            principle: "Propagate failures to a visible boundary instead of swallowing them",
        },
    );
    m.insert(
        "scope-creep",
        AntiPatternEntry {
            needed_skill: "match-change-to-request",
            principle: "Implement exactly what was asked before reaching for adjacent improvements",
        },
    );
    m
}

fn fallback_entry() -> AntiPatternEntry {
    AntiPatternEntry {
        needed_skill: "systematic-debugging",
        principle: "Form a hypothesis and verify it before making further changes",
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TierFeedback {
    pub promotions: usize,
    pub demotions: usize,
}

/// Updates the Skill Bank from task outcomes and periodically summarizes
/// tier promotions/demotions for the Tier Resolver.
pub struct EvolutionEngine {
    db: Arc<Db>,
    anti_patterns: HashMap<&'static str, AntiPatternEntry>,
    tasks_seen: AtomicU32,
    tier_feedback_every: u32,
}

impl EvolutionEngine {
    pub fn new(db: Arc<Db>, tier_feedback_every: u32) -> Self {
        Self {
            db,
            anti_patterns: anti_pattern_table(),
            tasks_seen: AtomicU32::new(0),
            tier_feedback_every: tier_feedback_every.max(1),
        }
    }

    fn lookup_skill(&self, task_type: &str, name: &str) -> store::Result<Option<Skill>> {
        if let Some(skill) = self.db.get::<Skill>(&format!("{task_type}::{name}"))? {
            return Ok(Some(skill));
        }
        self.db.get::<Skill>(name)
    }

    fn boost_or_create(&self, task_type: &str, name: &str, principle: &str) -> store::Result<()> {
        match self.lookup_skill(task_type, name)? {
            Some(mut skill) => {
                skill.boost(BOOST_DELTA);
                self.db.put(&skill)
            }
            None => {
                let skill = Skill::task_specific(task_type, name, principle);
                self.db.put(&skill)
            }
        }
    }

    fn penalize_used(&self, task_type: &str, skills_used: &[String]) -> store::Result<()> {
        for name in skills_used {
            if let Some(mut skill) = self.lookup_skill(task_type, name)? {
                skill.apply_outcome(0.0);
                self.db.put(&skill)?;
            }
        }
        Ok(())
    }

    fn reinforce_used(&self, task_type: &str, skills_used: &[String]) -> store::Result<()> {
        for name in skills_used {
            if let Some(mut skill) = self.lookup_skill(task_type, name)? {
                skill.apply_outcome(1.0);
                self.db.put(&skill)?;
            }
        }
        Ok(())
    }

    /// Records a failure entry, distills the anti-pattern tag into a
    /// (cause, needed-skill, principle) triple, penalizes skills actually
    /// used, and boosts or creates the needed skill.
    pub fn record_failure(
        &self,
        task_type: &str,
        skills_used: &[String],
        anti_pattern_tag: &str,
        quota_signal: Option<&str>,
    ) -> store::Result<()> {
        let entry = self.anti_patterns.get(anti_pattern_tag).copied().unwrap_or_else(fallback_entry);
        debug!(task_type, anti_pattern_tag, needed_skill = entry.needed_skill, "distilled failure root cause");

        self.penalize_used(task_type, skills_used)?;
        self.boost_or_create(task_type, entry.needed_skill, entry.principle)?;

        if let Some(signal) = quota_signal {
            info!(task_type, signal, "quota pressure on failed task, reinforcing quota-aware-routing skill");
            self.boost_or_create(task_type, QUOTA_SKILL_NAME, "Prefer the non-exhausted provider when quota pressure is signaled")?;
        }

        self.note_task_completed();
        Ok(())
    }

    /// Reinforces every skill used on a successful outcome.
    pub fn record_success(&self, task_type: &str, skills_used: &[String], quota_signal: Option<&str>) -> store::Result<()> {
        self.reinforce_used(task_type, skills_used)?;
        if let Some(signal) = quota_signal {
            debug!(task_type, signal, "quota pressure on successful task, reinforcing quota-aware-routing skill");
            self.boost_or_create(task_type, QUOTA_SKILL_NAME, "Prefer the non-exhausted provider when quota pressure is signaled")?;
        }
        self.note_task_completed();
        Ok(())
    }

    fn note_task_completed(&self) {
        self.tasks_seen.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns `Some` every `tier_feedback_every` tasks; `None` otherwise.
    /// The caller forwards the summary to the Tier Resolver (which already
    /// reads the same override collection, so this is an observability
    /// signal rather than the only path promotions take effect).
    pub fn maybe_tier_feedback(&self) -> store::Result<Option<TierFeedback>> {
        let seen = self.tasks_seen.load(Ordering::SeqCst);
        if seen == 0 || seen % self.tier_feedback_every != 0 {
            return Ok(None);
        }
        let overrides: Vec<TierOverride> = self.db.all()?;
        let promotions = overrides.iter().filter(|o| o.tier == 1).count();
        let demotions = overrides.iter().filter(|o| o.tier == 2).count();
        Ok(Some(TierFeedback { promotions, demotions }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> (EvolutionEngine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path().join("test.db")).unwrap();
        (EvolutionEngine::new(db, 2), dir)
    }

    #[test]
    fn failure_penalizes_used_skill_and_creates_needed_skill() {
        let (engine, _dir) = engine();
        let used = Skill::task_specific("coding", "rush-to-code", "Start writing before understanding the task");
        engine.db.put(&used).unwrap();

        engine
            .record_failure("coding", &["rush-to-code".to_string()], "missing-validation", None)
            .unwrap();

        let penalized: Skill = engine.db.get("coding::rush-to-code").unwrap().unwrap();
        assert!(penalized.success_rate < 0.6);

        let created: Skill = engine.db.get("coding::validate-inputs-early").unwrap().unwrap();
        assert_eq!(created.success_rate, 0.6);
    }

    #[test]
    fn failure_with_quota_signal_upserts_quota_skill() {
        let (engine, _dir) = engine();
        engine
            .record_failure("coding", &[], "missing-validation", Some("anthropic at 97%"))
            .unwrap();
        let skill: Skill = engine.db.get("coding::quota-aware-routing").unwrap().unwrap();
        assert_eq!(skill.success_rate, 0.6);
    }

    #[test]
    fn success_boosts_used_skill() {
        let (engine, _dir) = engine();
        let used = Skill::general("systematic-debugging", "Form hypothesis before making changes");
        engine.db.put(&used).unwrap();
        engine.record_success("coding", &["systematic-debugging".to_string()], None).unwrap();
        let boosted: Skill = engine.db.get("systematic-debugging").unwrap().unwrap();
        assert!(boosted.success_rate > 0.6);
    }

    #[test]
    fn tier_feedback_emits_every_n_tasks() {
        let (engine, _dir) = engine();
        assert!(engine.maybe_tier_feedback().unwrap().is_none());
        engine.record_success("coding", &[], None).unwrap();
        assert!(engine.maybe_tier_feedback().unwrap().is_none());
        engine.record_success("coding", &[], None).unwrap();
        assert!(engine.maybe_tier_feedback().unwrap().is_some());
    }
}

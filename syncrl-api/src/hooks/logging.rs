use anyhow::Result;
use std::sync::{Arc, Mutex, PoisonError};
use syncrl_core::sync_trainer::{TrainerHooks, UpdateReport, ValidationReport};
use syncrl_core::trajectory::Trajectory;

/// `(update, mean score)` of every validation that finished at least one episode.
pub type ScoreHistory = Arc<Mutex<Vec<(usize, f32)>>>;

/// Logs rollouts and validations, keeps the validation scores and optionally stops training once
/// a target score is reached.
#[derive(Debug, Default)]
pub struct LoggingHooks {
    rollout_idx: usize,
    target_score: Option<f32>,
    history: ScoreHistory,
}

impl LoggingHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target_score(mut self, target: f32) -> Self {
        self.target_score = Some(target);
        self
    }

    /// Shared handle to the score history, readable while training runs.
    pub fn history(&self) -> ScoreHistory {
        self.history.clone()
    }

    pub fn scores(&self) -> Vec<(usize, f32)> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<M> TrainerHooks<M> for LoggingHooks {
    fn post_rollout_hook(&mut self, trajectory: &Trajectory) -> bool {
        let episodes = trajectory.finished_episodes();
        let total_reward = trajectory.total_reward();
        tracing::info!(
            rollout = self.rollout_idx,
            episodes,
            total_reward,
            reward_per_episode = total_reward / episodes.max(1) as f32,
            "rollout"
        );
        self.rollout_idx += 1;
        false
    }

    fn post_training_hook(&mut self, _model: &mut M, report: &UpdateReport) -> bool {
        tracing::debug!(update = report.update, loss = report.loss, "update");
        !report.loss.is_finite()
    }

    fn validation_hook(&mut self, report: &ValidationReport) -> bool {
        if report.summary.failed_workers > 0 {
            tracing::warn!(
                failed_workers = report.summary.failed_workers,
                "validation finished with failed workers"
            );
        }
        let Some(score) = report.score else {
            return false;
        };
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((report.update, score));
        match self.target_score {
            Some(target) if score >= target => {
                tracing::info!(score, target, "target score reached, stopping");
                true
            }
            _ => false,
        }
    }

    fn checkpoint_hook(&mut self, _model: &M, checkpoint: usize) -> Result<()> {
        tracing::info!(checkpoint, "checkpoint");
        Ok(())
    }

    fn shutdown_hook(&mut self) -> Result<()> {
        tracing::info!(rollouts = self.rollout_idx, "training finished");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::LoggingHooks;
    use std::time::Duration;
    use syncrl_core::sync_trainer::{TrainerHooks, UpdateReport, ValidationReport};
    use syncrl_core::validation::ValidationSummary;

    fn report(update: usize, score: Option<f32>) -> ValidationReport {
        ValidationReport {
            update,
            total_steps: update * 10,
            loss: 0.,
            score,
            elapsed: Duration::from_millis(5),
            fps: 0.,
            summary: ValidationSummary::default(),
        }
    }

    #[test]
    fn stops_once_the_target_score_is_reached() {
        let mut hooks = LoggingHooks::new().with_target_score(10.);
        assert!(!TrainerHooks::<()>::validation_hook(&mut hooks, &report(1, Some(4.))));
        assert!(!TrainerHooks::<()>::validation_hook(&mut hooks, &report(2, None)));
        assert!(TrainerHooks::<()>::validation_hook(&mut hooks, &report(3, Some(12.))));
        assert_eq!(hooks.scores(), vec![(1, 4.), (3, 12.)]);
    }

    #[test]
    fn diverging_loss_stops_training() {
        let mut hooks = LoggingHooks::new();
        let mut update = UpdateReport {
            update: 1,
            total_steps: 10,
            loss: 0.3,
            episodes: 0,
            rollout_reward: 0.,
        };
        assert!(!hooks.post_training_hook(&mut (), &update));
        update.loss = f32::NAN;
        assert!(hooks.post_training_hook(&mut (), &update));
    }
}

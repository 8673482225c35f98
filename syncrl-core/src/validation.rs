//! Concurrent evaluation of the current model on held-out environments.

use crate::distributions::sample_actions;
use crate::env::Env;
use crate::error::SyncRlError;
use crate::model::ActorCritic;
use anyhow::Result;
use rand::{Rng, SeedableRng, rngs::StdRng};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Episodes longer than this are cut and scored as they stand.
pub const DEFAULT_MAX_STEPS: usize = 10_000;

/// Cooperative cancellation shared between the caller and the validation workers. Once cancelled
/// the token stays cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationSummary {
    /// Episode totals per validation environment, in completion order.
    pub scores: BTreeMap<usize, Vec<f32>>,
    pub mean_score: Option<f32>,
    pub episodes: usize,
    pub cancelled: bool,
    pub failed_workers: usize,
}

#[derive(Default)]
struct ValidationState {
    scores: BTreeMap<usize, Vec<f32>>,
}

/// Splits `total` episodes over `workers` as evenly as possible. The first `total % workers`
/// workers run one extra episode.
pub fn partition_episodes(total: usize, workers: usize) -> Vec<usize> {
    if workers == 0 {
        return vec![];
    }
    let (base, remainder) = (total / workers, total % workers);
    (0..workers)
        .map(|idx| base + usize::from(idx < remainder))
        .collect()
}

/// Runs validation episodes with one scoped worker thread per held-out environment.
pub struct ValidationScheduler<E: Env + Send> {
    envs: Vec<E>,
    partition: Vec<usize>,
    max_steps: usize,
    cancel: CancelToken,
}

impl<E: Env + Send> ValidationScheduler<E> {
    pub fn new(envs: Vec<E>, num_episodes: usize) -> Result<Self, SyncRlError> {
        if envs.is_empty() {
            return Err(SyncRlError::config("validation needs at least one environment"));
        }
        if num_episodes < envs.len() {
            return Err(SyncRlError::config(format!(
                "number of validation episodes {num_episodes} must be greater than or equal to \
                 the number of validation envs {}",
                envs.len()
            )));
        }
        Ok(Self {
            partition: partition_episodes(num_episodes, envs.len()),
            envs,
            max_steps: DEFAULT_MAX_STEPS,
            cancel: CancelToken::new(),
        })
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn partition(&self) -> &[usize] {
        &self.partition
    }

    pub fn num_episodes(&self) -> usize {
        self.partition.iter().sum()
    }

    /// Runs every episode of the partition and blocks until every worker has been joined.
    ///
    /// Worker 0 renders when `render` is set. Failing or panicking workers are logged and
    /// counted in the summary; the remaining workers run to completion.
    pub fn run<M, R>(&mut self, model: &M, render: bool, rng: &mut R) -> Result<ValidationSummary>
    where
        M: ActorCritic + Sync + ?Sized,
        R: Rng,
    {
        let state = Mutex::new(ValidationState::default());
        let seeds: Vec<u64> = (0..self.envs.len()).map(|_| rng.random()).collect();
        let (partition, cancel, max_steps) = (&self.partition, &self.cancel, self.max_steps);

        let failed_workers = std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .envs
                .iter_mut()
                .zip(partition)
                .zip(seeds)
                .enumerate()
                .map(|(idx, ((env, episodes), seed))| {
                    let worker = ValidationWorker {
                        idx,
                        episodes: *episodes,
                        max_steps,
                        render: render && idx == 0,
                        state: &state,
                        cancel,
                    };
                    std::thread::Builder::new()
                        .name(format!("validation-worker-{idx}"))
                        .spawn_scoped(scope, move || worker.run(env, model, seed))
                })
                .collect();

            let mut failed = 0;
            for (idx, handle) in handles.into_iter().enumerate() {
                let outcome = match handle {
                    Ok(handle) => handle.join(),
                    Err(err) => Ok(Err(err.into())),
                };
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::error!(worker = idx, %err, "validation worker failed");
                        failed += 1;
                    }
                    Err(_) => {
                        tracing::error!(worker = idx, "validation worker panicked");
                        failed += 1;
                    }
                }
            }
            failed
        });

        let ValidationState { scores } = state.into_inner().unwrap_or_else(PoisonError::into_inner);
        let episodes = scores.values().map(Vec::len).sum::<usize>();
        let mean_score = (episodes > 0)
            .then(|| scores.values().flatten().sum::<f32>() / episodes as f32);
        Ok(ValidationSummary {
            scores,
            mean_score,
            episodes,
            cancelled: cancel.is_cancelled(),
            failed_workers,
        })
    }

    pub fn close(&mut self) -> Result<()> {
        for env in self.envs.iter_mut() {
            env.close()?;
        }
        Ok(())
    }
}

struct ValidationWorker<'a> {
    idx: usize,
    episodes: usize,
    max_steps: usize,
    render: bool,
    state: &'a Mutex<ValidationState>,
    cancel: &'a CancelToken,
}

impl ValidationWorker<'_> {
    fn run<E, M>(self, env: &mut E, model: &M, seed: u64) -> Result<()>
    where
        E: Env,
        M: ActorCritic + ?Sized,
    {
        let mut rng = StdRng::seed_from_u64(seed);
        for _ in 0..self.episodes {
            let mut state = env.reset(rng.random())?;
            let mut score = 0.;
            for t in 0..self.max_steps {
                if self.cancel.is_cancelled() {
                    return Ok(());
                }
                let output = model.forward(&state.unsqueeze(0)?)?;
                let Some(action) = sample_actions(&output.probs, &mut rng)?.first().copied() else {
                    anyhow::bail!("model returned no action distribution");
                };
                let snapshot = env.step(action)?;
                score += snapshot.reward;
                if self.render {
                    let _guard = self.lock();
                    env.render()?;
                }
                if snapshot.done() || t == self.max_steps - 1 {
                    self.lock().scores.entry(self.idx).or_default().push(score);
                    break;
                }
                state = snapshot.state;
            }
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ValidationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod test {
    use super::{ValidationScheduler, partition_episodes};
    use crate::env::{Env, EnvironmentDescription, SnapShot, Space};
    use crate::model::{ActorCritic, PolicyOutput, TrainingBatch};
    use anyhow::Result;
    use candle_core::{Device, Tensor};
    use rand::{SeedableRng, rngs::StdRng};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    // pays 1 per step and ends after `length` steps; never ends when `length` is 0
    struct Walk {
        length: u32,
        t: u32,
        fail: bool,
        panic_on_render: bool,
        steps: Arc<AtomicUsize>,
    }

    impl Walk {
        fn new(length: u32) -> Self {
            Self {
                length,
                t: 0,
                fail: false,
                panic_on_render: false,
                steps: Arc::default(),
            }
        }
    }

    impl Env for Walk {
        fn reset(&mut self, _seed: u64) -> Result<Tensor> {
            self.t = 0;
            Ok(Tensor::zeros(2, candle_core::DType::F32, &Device::Cpu)?)
        }

        fn step(&mut self, _action: u32) -> Result<SnapShot> {
            if self.fail {
                anyhow::bail!("broken env");
            }
            self.t += 1;
            self.steps.fetch_add(1, Ordering::SeqCst);
            Ok(SnapShot {
                state: Tensor::ones(2, candle_core::DType::F32, &Device::Cpu)?,
                reward: 1.,
                terminated: self.t == self.length,
                truncated: false,
            })
        }

        fn render(&mut self) -> Result<()> {
            if self.panic_on_render {
                panic!("renderer crashed");
            }
            Ok(())
        }

        fn env_description(&self) -> EnvironmentDescription {
            EnvironmentDescription::new(Space::continous_from_dims(vec![2]), Space::Discrete(2))
        }
    }

    struct Uniform;

    impl ActorCritic for Uniform {
        fn forward(&self, states: &Tensor) -> Result<PolicyOutput> {
            let batch = states.dim(0)?;
            Ok(PolicyOutput {
                probs: Tensor::full(0.5f32, (batch, 2), &Device::Cpu)?,
                values: vec![Tensor::zeros(batch, candle_core::DType::F32, &Device::Cpu)?],
            })
        }

        fn backprop(&mut self, _batch: &TrainingBatch) -> Result<f32> {
            Ok(0.)
        }
    }

    #[test]
    fn remainder_goes_to_the_leading_workers() {
        assert_eq!(partition_episodes(10, 4), vec![3, 3, 2, 2]);
        assert_eq!(partition_episodes(8, 4), vec![2, 2, 2, 2]);
        assert_eq!(partition_episodes(5, 1), vec![5]);
    }

    #[test]
    fn fewer_episodes_than_envs_is_rejected() {
        let envs = (0..4).map(|_| Walk::new(3)).collect();
        assert!(ValidationScheduler::new(envs, 3).is_err());
    }

    #[test]
    fn every_episode_is_scored_once() -> Result<()> {
        let envs = (1..=4).map(Walk::new).collect();
        let mut scheduler = ValidationScheduler::new(envs, 10)?;
        let summary = scheduler.run(&Uniform, true, &mut StdRng::seed_from_u64(0))?;
        assert_eq!(summary.episodes, 10);
        assert_eq!(summary.failed_workers, 0);
        assert!(!summary.cancelled);
        let per_worker: Vec<usize> = summary.scores.values().map(Vec::len).collect();
        assert_eq!(per_worker, vec![3, 3, 2, 2]);
        assert_eq!(summary.scores[&2], vec![3., 3.]);
        // (3 * 1 + 3 * 2 + 2 * 3 + 2 * 4) / 10
        assert_eq!(summary.mean_score, Some(2.3));
        Ok(())
    }

    #[test]
    fn long_episodes_are_cut_at_max_steps() -> Result<()> {
        let mut scheduler = ValidationScheduler::new(vec![Walk::new(0)], 2)?.with_max_steps(7);
        let summary = scheduler.run(&Uniform, false, &mut StdRng::seed_from_u64(0))?;
        assert_eq!(summary.scores[&0], vec![7., 7.]);
        Ok(())
    }

    #[test]
    fn failing_worker_is_counted_and_others_finish() -> Result<()> {
        let mut envs: Vec<Walk> = (0..3).map(|_| Walk::new(2)).collect();
        envs[1].fail = true;
        let mut scheduler = ValidationScheduler::new(envs, 6)?;
        let summary = scheduler.run(&Uniform, false, &mut StdRng::seed_from_u64(0))?;
        assert_eq!(summary.failed_workers, 1);
        assert_eq!(summary.episodes, 4);
        assert!(!summary.scores.contains_key(&1));
        Ok(())
    }

    #[test]
    fn panicking_worker_is_counted_and_others_finish() -> Result<()> {
        let mut envs: Vec<Walk> = (0..3).map(|_| Walk::new(2)).collect();
        envs[0].panic_on_render = true;
        let mut scheduler = ValidationScheduler::new(envs, 6)?;
        let summary = scheduler.run(&Uniform, true, &mut StdRng::seed_from_u64(0))?;
        assert_eq!(summary.failed_workers, 1);
        assert_eq!(summary.episodes, 4);
        assert_eq!(summary.mean_score, Some(2.));
        assert!(!summary.scores.contains_key(&0));
        Ok(())
    }

    #[test]
    fn cancellation_joins_every_worker() -> Result<()> {
        let envs: Vec<Walk> = (0..4).map(|_| Walk::new(0)).collect();
        let counters: Vec<Arc<AtomicUsize>> = envs.iter().map(|env| env.steps.clone()).collect();
        let mut scheduler = ValidationScheduler::new(envs, 4)?.with_max_steps(usize::MAX);
        let cancel = scheduler.cancel_token();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            cancel.cancel();
        });
        let summary = scheduler.run(&Uniform, false, &mut StdRng::seed_from_u64(0))?;
        canceller.join().expect("canceller thread");
        assert!(summary.cancelled);
        assert_eq!(summary.episodes, 0);
        assert_eq!(summary.mean_score, None);

        // every worker stepped, and none is still stepping once `run` has returned
        let read = || -> Vec<usize> { counters.iter().map(|c| c.load(Ordering::SeqCst)).collect() };
        let after_run = read();
        assert!(after_run.iter().all(|steps| *steps > 0));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(read(), after_run);
        Ok(())
    }
}

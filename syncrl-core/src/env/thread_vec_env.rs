use super::{
    BatchStep, Env, EnvironmentDescription, Transition, VecEnv, collect_batch,
    step_with_autoreset,
};
use crate::error::SyncRlError;
use anyhow::Result;
use candle_core::Tensor;
use crossbeam::channel::{Receiver, Sender};
use std::thread::JoinHandle;

enum WorkerCommand {
    Reset { seed: u64 },
    Step { action: u32 },
    Close,
}

enum WorkerResult {
    Reset(Result<Tensor>),
    Step(Result<Transition>),
    Closed(Result<()>),
}

struct EnvWorker<E: Env> {
    env: E,
    tx: Sender<WorkerResult>,
    rx: Receiver<WorkerCommand>,
    reset_seed: u64,
    seed_stride: u64,
}

impl<E: Env> EnvWorker<E> {
    fn work(mut self) {
        while let Ok(command) = self.rx.recv() {
            let result = match command {
                WorkerCommand::Reset { seed } => {
                    self.reset_seed = seed.wrapping_add(self.seed_stride);
                    WorkerResult::Reset(self.env.reset(seed))
                }
                WorkerCommand::Step { action } => {
                    let transition = step_with_autoreset(&mut self.env, action, self.reset_seed);
                    if matches!(&transition, Ok(t) if t.done) {
                        self.reset_seed = self.reset_seed.wrapping_add(self.seed_stride);
                    }
                    WorkerResult::Step(transition)
                }
                WorkerCommand::Close => {
                    let _ = self.tx.send(WorkerResult::Closed(self.env.close()));
                    return;
                }
            };
            if self.tx.send(result).is_err() {
                return;
            }
        }
    }
}

struct WorkerHandle {
    tx: Sender<WorkerCommand>,
    rx: Receiver<WorkerResult>,
    handle: Option<JoinHandle<()>>,
}

/// Runs every environment on its own thread. Each call is a barrier: a command is sent to every
/// worker and the call only returns once every worker has answered.
pub struct ThreadVecEnv {
    workers: Vec<WorkerHandle>,
    env_description: EnvironmentDescription,
}

impl ThreadVecEnv {
    pub fn new<E: Env + Send + 'static>(envs: Vec<E>) -> Result<Self> {
        let Some(first) = envs.first() else {
            return Err(SyncRlError::config("an environment batch needs at least one env").into());
        };
        let env_description = first.env_description();
        let seed_stride = envs.len() as u64;
        let workers = envs
            .into_iter()
            .enumerate()
            .map(|(idx, env)| {
                let (command_tx, command_rx) = crossbeam::channel::unbounded();
                let (result_tx, result_rx) = crossbeam::channel::unbounded();
                let worker = EnvWorker {
                    env,
                    tx: result_tx,
                    rx: command_rx,
                    reset_seed: idx as u64,
                    seed_stride,
                };
                let handle = std::thread::Builder::new()
                    .name(format!("env-worker-{idx}"))
                    .spawn(move || worker.work())?;
                Ok(WorkerHandle {
                    tx: command_tx,
                    rx: result_rx,
                    handle: Some(handle),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            workers,
            env_description,
        })
    }

    fn broadcast(&self, commands: impl Iterator<Item = WorkerCommand>) -> Result<()> {
        for (idx, (worker, command)) in self.workers.iter().zip(commands).enumerate() {
            worker
                .tx
                .send(command)
                .map_err(|_| SyncRlError::Environment(format!("env worker {idx} is gone")))?;
        }
        Ok(())
    }

    fn gather(&self) -> Result<Vec<WorkerResult>> {
        self.workers
            .iter()
            .enumerate()
            .map(|(idx, worker)| {
                worker.rx.recv().map_err(|_| {
                    SyncRlError::Environment(format!("env worker {idx} hung up")).into()
                })
            })
            .collect()
    }

    fn join_all(&mut self) {
        for worker in self.workers.iter_mut() {
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    tracing::warn!("env worker panicked before shutdown");
                }
            }
        }
    }
}

impl VecEnv for ThreadVecEnv {
    fn num_envs(&self) -> usize {
        self.workers.len()
    }

    fn reset(&mut self, seed: u64) -> Result<Tensor> {
        self.broadcast((0..self.workers.len() as u64).map(|idx| WorkerCommand::Reset {
            seed: seed.wrapping_add(idx),
        }))?;
        let states = self
            .gather()?
            .into_iter()
            .map(|result| match result {
                WorkerResult::Reset(state) => state,
                _ => Err(SyncRlError::Environment("unexpected reply to reset".into()).into()),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::stack(&states, 0)?)
    }

    fn step(&mut self, actions: &[u32]) -> Result<BatchStep> {
        if actions.len() != self.workers.len() {
            return Err(SyncRlError::Environment(format!(
                "expected {} actions, got {}",
                self.workers.len(),
                actions.len()
            ))
            .into());
        }
        self.broadcast(actions.iter().map(|action| WorkerCommand::Step { action: *action }))?;
        // every reply is received before an error is surfaced so that no worker is left with an
        // unread answer on its channel
        let transitions = self
            .gather()?
            .into_iter()
            .map(|result| match result {
                WorkerResult::Step(transition) => transition,
                _ => Err(SyncRlError::Environment("unexpected reply to step".into()).into()),
            })
            .collect::<Result<Vec<_>>>()?;
        collect_batch(transitions)
    }

    fn close(&mut self) -> Result<()> {
        if self.workers.iter().all(|w| w.handle.is_none()) {
            return Ok(());
        }
        self.broadcast((0..self.workers.len()).map(|_| WorkerCommand::Close))?;
        let results = self.gather();
        self.join_all();
        for result in results? {
            if let WorkerResult::Closed(closed) = result {
                closed?;
            }
        }
        Ok(())
    }

    fn env_description(&self) -> EnvironmentDescription {
        self.env_description.clone()
    }
}

impl Drop for ThreadVecEnv {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(%err, "failed to close threaded environment batch");
        }
    }
}

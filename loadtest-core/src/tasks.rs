//! Weighted random task selection for simulated users.
//!
//! A [`User`] exposes a set of tasks. [`run_user`] repeatedly picks one of them according to a
//! [`WeightedChoice`], runs it and pauses for a random [`WaitTime`], until a task asks to stop or
//! the deadline passes.

use std::fmt;
use std::time::Duration;

use rand::Rng;
use rand::rngs::SmallRng;
use rand_distr::Distribution;
use rand_distr::weighted::WeightedIndex;
use tokio::time::Instant;

use crate::error::{ConfigError, WorkerResult};

/// What a user should do after a task finished.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Flow {
    /// Keep picking tasks.
    Continue,
    /// Terminate this user.
    Stop,
}

/// A simulated user with a fixed set of tasks.
#[async_trait::async_trait]
pub trait User: Send {
    /// Identifies one of the user's tasks.
    type Task: Copy + fmt::Debug + Send + Sync;

    /// Called once before the first task.
    async fn on_start(&mut self) -> WorkerResult<()>;

    /// Runs one task.
    async fn run_task(&mut self, task: Self::Task) -> WorkerResult<Flow>;
}

/// Picks tasks at random, proportionally to their weights.
#[derive(Clone, Debug)]
pub struct WeightedChoice<T> {
    tasks: Vec<T>,
    distribution: WeightedIndex<u32>,
}

impl<T: Copy> WeightedChoice<T> {
    /// Creates a choice over `(task, weight)` pairs.
    ///
    /// Tasks with weight `0` are never picked. At least one weight must be positive.
    pub fn new(weights: impl IntoIterator<Item = (T, u32)>) -> Result<Self, ConfigError> {
        let (tasks, weights): (Vec<T>, Vec<u32>) = weights.into_iter().unzip();
        let distribution = WeightedIndex::new(&weights)
            .map_err(|err| ConfigError::InvalidWeights(err.to_string()))?;

        Ok(Self {
            tasks,
            distribution,
        })
    }

    /// Picks the next task.
    pub fn sample(&self, rng: &mut impl Rng) -> T {
        self.tasks[self.distribution.sample(rng)]
    }
}

/// Bounds of the random pause between two tasks.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct WaitTime {
    /// Shortest pause.
    pub min: Duration,
    /// Longest pause.
    pub max: Duration,
}

impl WaitTime {
    /// Creates wait time bounds. `max` is raised to `min` if it is smaller.
    pub fn between(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
        }
    }

    /// Picks a pause uniformly between `min` and `max`.
    pub fn sample(&self, rng: &mut impl Rng) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let secs = rng.random_range(self.min.as_secs_f64()..=self.max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Runs `user` until a task returns [`Flow::Stop`] or `deadline` passes.
///
/// A failing `on_start` ends the user. Errors from individual tasks are logged and the user keeps
/// going, the same way a failed request does not end a real user's session.
pub async fn run_user<U: User>(
    mut user: U,
    tasks: &WeightedChoice<U::Task>,
    wait_time: WaitTime,
    deadline: Option<Instant>,
    mut rng: SmallRng,
) -> WorkerResult<()> {
    user.on_start().await?;

    loop {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            tracing::debug!("deadline reached, stopping user");
            return Ok(());
        }

        let task = tasks.sample(&mut rng);
        match user.run_task(task).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Stop) => {
                tracing::info!(?task, "task requested stop");
                return Ok(());
            }
            Err(err) => {
                tracing::error!(?task, error = &err as &dyn std::error::Error, "task failed");
            }
        }

        let pause = wait_time.sample(&mut rng);
        match deadline {
            Some(deadline) => tokio::time::sleep_until((Instant::now() + pause).min(deadline)).await,
            None => tokio::time::sleep(pause).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rand::SeedableRng;

    use super::*;
    use crate::client::ClientError;

    #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
    enum Task {
        Read,
        Write,
        Never,
    }

    #[test]
    fn zero_weights_are_never_picked() {
        let choice =
            WeightedChoice::new([(Task::Read, 10), (Task::Write, 2), (Task::Never, 0)]).unwrap();
        let mut rng = SmallRng::seed_from_u64(3);

        let mut counts = HashMap::new();
        for _ in 0..1200 {
            *counts.entry(choice.sample(&mut rng)).or_insert(0) += 1;
        }

        assert!(!counts.contains_key(&Task::Never));
        assert!(counts[&Task::Read] > counts[&Task::Write]);
    }

    #[test]
    fn invalid_weights() {
        assert!(matches!(
            WeightedChoice::new([(Task::Read, 0), (Task::Write, 0)]),
            Err(ConfigError::InvalidWeights(_))
        ));
        assert!(matches!(
            WeightedChoice::<Task>::new([]),
            Err(ConfigError::InvalidWeights(_))
        ));
    }

    #[test]
    fn wait_time_within_bounds() {
        let wait = WaitTime::between(Duration::from_millis(100), Duration::from_millis(200));
        let mut rng = SmallRng::seed_from_u64(1);
        for _ in 0..100 {
            let pause = wait.sample(&mut rng);
            assert!(pause >= wait.min && pause <= wait.max);
        }

        let fixed = WaitTime::between(Duration::from_secs(1), Duration::ZERO);
        assert_eq!(fixed.sample(&mut rng), Duration::from_secs(1));
    }

    #[derive(Debug, Default)]
    struct CountingUser {
        started: bool,
        runs: usize,
        stop_after: Option<usize>,
    }

    #[async_trait::async_trait]
    impl User for CountingUser {
        type Task = Task;

        async fn on_start(&mut self) -> WorkerResult<()> {
            self.started = true;
            Ok(())
        }

        async fn run_task(&mut self, _task: Task) -> WorkerResult<Flow> {
            assert!(self.started);
            self.runs += 1;
            if self.runs % 2 == 0 {
                return Err(ClientError::Query("every other task fails".into()).into());
            }
            match self.stop_after {
                Some(limit) if self.runs >= limit => Ok(Flow::Stop),
                _ => Ok(Flow::Continue),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_user_despite_errors() {
        let tasks = WeightedChoice::new([(Task::Read, 1)]).unwrap();
        let user = CountingUser {
            stop_after: Some(5),
            ..Default::default()
        };

        run_user(
            user,
            &tasks,
            WaitTime::between(Duration::from_secs(1), Duration::from_secs(2)),
            None,
            SmallRng::seed_from_u64(0),
        )
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_ends_user() {
        let tasks = WeightedChoice::new([(Task::Read, 1), (Task::Write, 1)]).unwrap();
        let start = Instant::now();

        run_user(
            CountingUser::default(),
            &tasks,
            WaitTime::between(Duration::from_secs(1), Duration::from_secs(1)),
            Some(start + Duration::from_secs(10)),
            SmallRng::seed_from_u64(0),
        )
        .await
        .unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }
}

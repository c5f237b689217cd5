//! ---
//! courier_section: "04-scheduling"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Cooperative scheduling of message-driven components."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use anyhow::Result;
use tracing::{debug, error, info};

/// What a microthread asks of the scheduler after one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Keep the thread in rotation.
    Yield,
    /// Remove this thread from rotation; the others keep running.
    Terminate,
    /// Remove this thread, finish the current round, then stop the whole
    /// scheduler.
    Shutdown,
}

/// A unit the scheduler advances one step at a time.
///
/// A step may block, typically on one consume cycle of the component's own
/// channel. Nothing else runs while it blocks.
pub trait MicroThread {
    /// Name used in ticks and logs.
    fn name(&self) -> &str;

    /// Run once when the thread is added to a scheduler.
    fn create(&mut self) -> Result<()> {
        Ok(())
    }

    /// Advance the thread by one step.
    fn step(&mut self) -> Result<StepOutcome>;
}

/// State of a thread right after the step reported by a [`Tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Still scheduled.
    Running,
    /// Left the rotation on its own request.
    Terminated,
    /// Left the rotation because its step failed.
    Failed,
}

/// Marker yielded after every single step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tick {
    /// Round the step belongs to, starting at zero.
    pub round: u64,
    /// Name of the stepped thread.
    pub thread: String,
    /// State of the thread after the step.
    pub state: ThreadState,
}

/// Single-threaded round-robin scheduler.
///
/// Threads are added before running; every round steps each remaining
/// thread once in the order they were added.
#[derive(Default)]
pub struct MicroScheduler {
    threads: Vec<Box<dyn MicroThread>>,
    round: u64,
    cursor: usize,
    shutdown: bool,
}

impl MicroScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a thread, running its `create` hook first. A thread whose hook
    /// fails is not scheduled.
    pub fn add<T>(&mut self, mut thread: T) -> Result<()>
    where
        T: MicroThread + 'static,
    {
        thread.create()?;
        debug!(thread = thread.name(), "microthread added");
        self.threads.push(Box::new(thread));
        Ok(())
    }

    /// Threads still in rotation.
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Names of the threads still in rotation, in scheduling order.
    pub fn names(&self) -> Vec<String> {
        self.threads.iter().map(|t| t.name().to_owned()).collect()
    }

    /// Lazy sequence of ticks. Dropping the iterator pauses the loop; the
    /// next call resumes where it stopped.
    pub fn run(&mut self) -> Ticks<'_> {
        Ticks { scheduler: self }
    }

    /// Drain the loop until no thread remains, returning the number of steps.
    pub fn run_to_completion(&mut self) -> usize {
        self.run().count()
    }

    fn next_tick(&mut self) -> Option<Tick> {
        if self.cursor >= self.threads.len() {
            if self.shutdown {
                info!(remaining = self.threads.len(), "scheduler shut down");
                self.threads.clear();
            }
            if self.threads.is_empty() {
                return None;
            }
            self.round += 1;
            self.cursor = 0;
        }

        let round = self.round;
        let thread = &mut self.threads[self.cursor];
        let name = thread.name().to_owned();
        let state = match thread.step() {
            Ok(StepOutcome::Yield) => {
                self.cursor += 1;
                ThreadState::Running
            }
            Ok(StepOutcome::Terminate) => {
                info!(thread = %name, round, "microthread terminated");
                self.threads.remove(self.cursor);
                ThreadState::Terminated
            }
            Ok(StepOutcome::Shutdown) => {
                info!(thread = %name, round, "microthread requested scheduler shutdown");
                self.threads.remove(self.cursor);
                self.shutdown = true;
                ThreadState::Terminated
            }
            Err(err) => {
                error!(thread = %name, round, error = ?err, "microthread step failed");
                self.threads.remove(self.cursor);
                ThreadState::Failed
            }
        };

        Some(Tick {
            round,
            thread: name,
            state,
        })
    }
}

/// Iterator returned by [`MicroScheduler::run`].
pub struct Ticks<'a> {
    scheduler: &'a mut MicroScheduler,
}

impl Iterator for Ticks<'_> {
    type Item = Tick;

    fn next(&mut self) -> Option<Tick> {
        self.scheduler.next_tick()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    type Journal = Rc<RefCell<Vec<String>>>;

    struct Counter {
        name: String,
        steps: usize,
        limit: usize,
        finish: StepOutcome,
        journal: Journal,
    }

    impl Counter {
        fn new(name: &str, limit: usize, journal: &Journal) -> Self {
            Self {
                name: name.to_owned(),
                steps: 0,
                limit,
                finish: StepOutcome::Terminate,
                journal: Rc::clone(journal),
            }
        }
    }

    impl MicroThread for Counter {
        fn name(&self) -> &str {
            &self.name
        }

        fn step(&mut self) -> Result<StepOutcome> {
            self.steps += 1;
            self.journal.borrow_mut().push(format!("{}{}", self.name, self.steps));
            if self.steps >= self.limit {
                Ok(self.finish)
            } else {
                Ok(StepOutcome::Yield)
            }
        }
    }

    struct Broken;

    impl MicroThread for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn step(&mut self) -> Result<StepOutcome> {
            anyhow::bail!("transport gone")
        }
    }

    struct Unborn;

    impl MicroThread for Unborn {
        fn name(&self) -> &str {
            "unborn"
        }

        fn create(&mut self) -> Result<()> {
            anyhow::bail!("cannot connect")
        }

        fn step(&mut self) -> Result<StepOutcome> {
            Ok(StepOutcome::Yield)
        }
    }

    #[test]
    fn steps_interleave_in_registration_order() {
        let journal = Journal::default();
        let mut scheduler = MicroScheduler::new();
        scheduler.add(Counter::new("a", 3, &journal)).expect("add a");
        scheduler.add(Counter::new("b", 1, &journal)).expect("add b");
        scheduler.add(Counter::new("c", 2, &journal)).expect("add c");

        let ticks: Vec<Tick> = scheduler.run().collect();
        assert_eq!(
            *journal.borrow(),
            vec!["a1", "b1", "c1", "a2", "c2", "a3"]
        );
        assert_eq!(ticks.len(), 6);
        assert_eq!(ticks[1].state, ThreadState::Terminated);
        assert_eq!(ticks[3].round, 1);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn run_resumes_where_it_stopped() {
        let journal = Journal::default();
        let mut scheduler = MicroScheduler::new();
        scheduler.add(Counter::new("a", 2, &journal)).expect("add a");
        scheduler.add(Counter::new("b", 2, &journal)).expect("add b");

        assert_eq!(scheduler.run().take(3).count(), 3);
        assert_eq!(*journal.borrow(), vec!["a1", "b1", "a2"]);
        assert_eq!(scheduler.run_to_completion(), 1);
        assert_eq!(*journal.borrow(), vec!["a1", "b1", "a2", "b2"]);
        assert!(scheduler.run().next().is_none());
    }

    #[test]
    fn shutdown_finishes_round_then_stops_everything() {
        let journal = Journal::default();
        let mut scheduler = MicroScheduler::new();
        let mut stopper = Counter::new("a", 1, &journal);
        stopper.finish = StepOutcome::Shutdown;
        scheduler.add(stopper).expect("add a");
        scheduler.add(Counter::new("b", 10, &journal)).expect("add b");

        assert_eq!(scheduler.run_to_completion(), 2);
        assert_eq!(*journal.borrow(), vec!["a1", "b1"]);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn failing_thread_leaves_rotation_alone() {
        let journal = Journal::default();
        let mut scheduler = MicroScheduler::new();
        scheduler.add(Broken).expect("add broken");
        scheduler.add(Counter::new("a", 2, &journal)).expect("add a");

        let ticks: Vec<Tick> = scheduler.run().collect();
        assert_eq!(ticks[0].state, ThreadState::Failed);
        assert_eq!(*journal.borrow(), vec!["a1", "a2"]);
    }

    #[test]
    fn thread_failing_creation_is_not_scheduled() {
        let mut scheduler = MicroScheduler::new();
        assert!(scheduler.add(Unborn).is_err());
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.run_to_completion(), 0);
    }
}

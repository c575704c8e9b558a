use std::fmt;

use chrono::{DateTime, Duration, Local, SubsecRound};
use serde::{Serialize, Serializer};
use tokio::sync::mpsc;
use turborepo_ui::{color, ColorConfig, BOLD, BOLD_GREEN, BOLD_RED, MAGENTA};

use crate::task_id::TaskId;

// Just used to make changing the type that gets passed to the state
// management task easy
type Message = Event;

/// Counters folded from task events. `started` is bumped when a task
/// starts and exactly one of the terminal events lands when it finishes.
/// A task interrupted mid-run reports `Canceled`, which backs it out of
/// the attempted accounting: [`SummaryState::attempted`] only counts
/// tasks that ran to a real verdict, so
/// `attempted() == success + failed + cached` holds at every point where
/// all started tasks have reported.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct SummaryState {
    pub started: usize,
    pub failed: usize,
    pub cached: usize,
    pub success: usize,
    pub canceled: usize,
}

impl SummaryState {
    /// Tasks that reached a terminal verdict (built, cached, or failed);
    /// canceled tasks never count as attempted.
    pub fn attempted(&self) -> usize {
        self.started - self.canceled
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Building => self.started += 1,
            Event::BuildFailed => self.failed += 1,
            Event::Cached => self.cached += 1,
            Event::Built => self.success += 1,
            Event::Canceled => self.canceled += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
enum Event {
    Building,
    BuildFailed,
    Cached,
    Built,
    Canceled,
}

/// The terminal state of one task execution.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ExecutionState {
    Canceled,
    #[serde(rename_all = "camelCase")]
    Built { exit_code: i32 },
    Cached,
    #[serde(rename_all = "camelCase")]
    BuildFailed {
        exit_code: Option<i32>,
        err: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskExecutionSummary {
    #[serde(rename = "startTime", serialize_with = "serialize_millis")]
    pub started_at: DateTime<Local>,
    #[serde(rename = "endTime", serialize_with = "serialize_millis")]
    pub ended_at: DateTime<Local>,
    #[serde(flatten)]
    pub state: ExecutionState,
}

fn serialize_millis<S: Serializer>(
    date_time: &DateTime<Local>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_i64(date_time.timestamp_millis())
}

impl TaskExecutionSummary {
    pub fn exit_code(&self) -> Option<i32> {
        match self.state {
            ExecutionState::BuildFailed { exit_code, .. } => exit_code,
            ExecutionState::Built { exit_code } => Some(exit_code),
            // Cache replays report the original successful exit.
            ExecutionState::Cached => Some(0),
            ExecutionState::Canceled => None,
        }
    }

    pub fn duration(&self) -> Duration {
        self.ended_at.signed_duration_since(self.started_at)
    }
}

/// Collects task events for the run. Trackers are handed to each task and
/// report back through a channel; a single state task folds the counters
/// so the summary mutation is serialized without a lock.
#[derive(Debug)]
pub struct ExecutionTracker {
    state_task: tokio::task::JoinHandle<SummaryState>,
    sender: mpsc::Sender<Message>,
    pub(crate) start_time: DateTime<Local>,
}

impl ExecutionTracker {
    pub fn new(start_time: DateTime<Local>) -> Self {
        // This buffer size is probably overkill, but since messages are
        // tiny we can afford headroom over a filling channel.
        let (sender, mut receiver) = mpsc::channel(128);
        let state_task = tokio::spawn(async move {
            let mut state = SummaryState::default();
            while let Some(event) = receiver.recv().await {
                state.handle_event(event);
            }
            state
        });

        Self {
            state_task,
            sender,
            start_time,
        }
    }

    // Produce a tracker for the task
    pub fn task_tracker(&self, task_id: TaskId<'static>) -> TaskTracker<()> {
        TaskTracker {
            sender: self.sender.clone(),
            started_at: (),
            task_id,
        }
    }

    pub async fn finish(self) -> Result<SummaryState, tokio::task::JoinError> {
        let Self {
            state_task, sender, ..
        } = self;
        // Drop the sender so the channel closes once every outstanding
        // tracker has reported. An explicit close would cut running
        // trackers off.
        drop(sender);

        state_task.await
    }
}

/// Tracks one task through its lifecycle; the type parameter pins the
/// start timestamp once the task actually begins.
pub struct TaskTracker<T> {
    sender: mpsc::Sender<Message>,
    started_at: T,
    task_id: TaskId<'static>,
}

impl TaskTracker<()> {
    // Start the tracker
    pub async fn start(self) -> TaskTracker<DateTime<Local>> {
        let TaskTracker {
            sender, task_id, ..
        } = self;
        let started_at = Local::now();
        sender
            .send(Event::Building)
            .await
            .expect("execution summary state task finished");
        TaskTracker {
            sender,
            started_at,
            task_id,
        }
    }
}

impl TaskTracker<DateTime<Local>> {
    pub fn task_id(&self) -> &TaskId<'static> {
        &self.task_id
    }

    /// The task was stopped before finishing: a bail, or a signal. The
    /// cancel event backs the task out of the attempted counters.
    pub async fn cancel(self) -> TaskExecutionSummary {
        let Self {
            sender, started_at, ..
        } = self;
        sender
            .send(Event::Canceled)
            .await
            .expect("summary state task finished");
        TaskExecutionSummary {
            started_at,
            ended_at: Local::now(),
            state: ExecutionState::Canceled,
        }
    }

    pub async fn cached(self) -> TaskExecutionSummary {
        let Self {
            sender, started_at, ..
        } = self;
        sender
            .send(Event::Cached)
            .await
            .expect("summary state task finished");

        TaskExecutionSummary {
            started_at,
            ended_at: Local::now(),
            state: ExecutionState::Cached,
        }
    }

    pub async fn build_succeeded(self, exit_code: i32) -> TaskExecutionSummary {
        let Self {
            sender, started_at, ..
        } = self;
        sender
            .send(Event::Built)
            .await
            .expect("summary state task finished");
        TaskExecutionSummary {
            started_at,
            ended_at: Local::now(),
            state: ExecutionState::Built { exit_code },
        }
    }

    pub async fn build_failed(
        self,
        exit_code: Option<i32>,
        error: impl fmt::Display,
    ) -> TaskExecutionSummary {
        let Self {
            sender, started_at, ..
        } = self;
        sender
            .send(Event::BuildFailed)
            .await
            .expect("summary state task finished");
        TaskExecutionSummary {
            started_at,
            ended_at: Local::now(),
            state: ExecutionState::BuildFailed {
                exit_code,
                err: error.to_string(),
            },
        }
    }
}

/// The epilogue printed after every run.
pub fn print_summary_line(
    state: &SummaryState,
    start_time: DateTime<Local>,
    end_time: DateTime<Local>,
    color_config: ColorConfig,
    failed_tasks: Vec<String>,
) {
    let duration = render_duration(start_time, end_time);
    let attempted = state.attempted();

    let maybe_full_turbo = if state.cached == attempted && attempted > 0 {
        match std::env::var("TERM_PROGRAM").as_deref() {
            Ok("Apple_Terminal") => color!(color_config, MAGENTA, ">>> FULL TURBO").to_string(),
            _ => color_config.rainbow(">>> FULL TURBO"),
        }
    } else {
        String::new()
    };

    println!();
    println!(
        " {}:    {}, {} total",
        color!(color_config, BOLD, "Tasks"),
        color!(color_config, BOLD_GREEN, "{} successful", state.success),
        attempted
    );
    println!(
        "{}:    {}, {} total",
        color!(color_config, BOLD, "Cached"),
        color!(color_config, BOLD, "{} cached", state.cached),
        attempted
    );
    println!(
        "  {}:    {} {}",
        color!(color_config, BOLD, "Time"),
        color!(color_config, BOLD, "{}", duration),
        maybe_full_turbo
    );
    if !failed_tasks.is_empty() {
        let mut formatted: Vec<_> = failed_tasks
            .iter()
            .map(|task| color!(color_config, BOLD_RED, "{}", task))
            .collect();
        formatted.sort();
        println!("{}:    {}", color!(color_config, BOLD, "Failed"), formatted.join(", "));
    }
    println!();
}

fn render_duration(start_time: DateTime<Local>, end_time: DateTime<Local>) -> String {
    let duration = end_time
        .trunc_subsecs(3)
        .signed_duration_since(start_time.trunc_subsecs(3));

    if duration.num_hours() > 0 {
        format!(
            "{}h{}m{}s",
            duration.num_hours(),
            duration.num_minutes() % 60,
            duration.num_seconds() % 60
        )
    } else if duration.num_minutes() > 0 {
        format!(
            "{}m{}s",
            duration.num_minutes(),
            duration.num_seconds() % 60
        )
    } else if duration.num_seconds() > 0 {
        format!("{}s", duration.num_seconds())
    } else {
        format!("{}ms", duration.num_milliseconds())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_multiple_tasks() {
        let tracker = ExecutionTracker::new(Local::now());
        let mut tasks = Vec::new();
        {
            let task_tracker = tracker.task_tracker(TaskId::new("foo", "build").into_owned());
            tasks.push(tokio::spawn(async move {
                let task_tracker = task_tracker.start().await;
                let summary = task_tracker.build_succeeded(0).await;
                assert_eq!(summary.exit_code(), Some(0));
            }));
        }
        {
            let task_tracker = tracker.task_tracker(TaskId::new("bar", "build").into_owned());
            tasks.push(tokio::spawn(async move {
                let task_tracker = task_tracker.start().await;
                let summary = task_tracker.cached().await;
                assert_eq!(summary.exit_code(), Some(0));
            }));
        }
        {
            let task_tracker = tracker.task_tracker(TaskId::new("baz", "build").into_owned());
            tasks.push(tokio::spawn(async move {
                let task_tracker = task_tracker.start().await;
                let summary = task_tracker.build_failed(Some(1), "big bad error").await;
                assert_eq!(summary.exit_code(), Some(1));
            }));
        }
        {
            let task_tracker = tracker.task_tracker(TaskId::new("boo", "build").into_owned());
            tasks.push(tokio::spawn(async move {
                let task_tracker = task_tracker.start().await;
                let summary = task_tracker.cancel().await;
                assert_eq!(summary.exit_code(), None);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        let state = tracker.finish().await.unwrap();
        assert_eq!(state.started, 4);
        assert_eq!(state.canceled, 1);
        assert_eq!(state.cached, 1);
        assert_eq!(state.failed, 1);
        assert_eq!(state.success, 1);
        // conservation: attempted = success + failed + cached
        assert_eq!(
            state.attempted(),
            state.success + state.failed + state.cached
        );
    }

    #[test]
    fn test_render_duration() {
        let start = Local::now();
        assert_eq!(
            render_duration(start, start + Duration::milliseconds(42)),
            "42ms"
        );
        assert_eq!(render_duration(start, start + Duration::seconds(3)), "3s");
        assert_eq!(
            render_duration(start, start + Duration::seconds(83)),
            "1m23s"
        );
    }
}

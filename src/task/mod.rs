//! Task graph engine
//!
//! A workflow is a tree of [`Task`]s. Each task has a title, an optional
//! predicate over the shared context and an action: either a leaf effect or a
//! nested [`TaskList`]. Lists run strictly in order on one context:
//!
//! - a disabled task is skipped entirely; its children are never looked at
//! - a nested list runs to completion before its parent moves on
//! - the first failing leaf aborts the whole run and its error is returned
//!   unchanged
//!
//! Progress goes to a [`Renderer`], which only observes.
//!
//! # Example
//!
//! ```
//! use chectl::task::{SilentRenderer, Task, TaskList};
//!
//! # tokio_test_block_on(async {
//! let tasks = TaskList::new()
//!     .add(Task::new("count", |n: &mut u32, _title| {
//!         Box::pin(async move {
//!             *n += 1;
//!             Ok(())
//!         })
//!     }))
//!     .add(
//!         Task::new("never", |n: &mut u32, _title| {
//!             Box::pin(async move {
//!                 *n += 100;
//!                 Ok(())
//!             })
//!         })
//!         .enabled(|n: &u32| *n > 10),
//!     );
//!
//! let n = tasks.run(0, &SilentRenderer).await.unwrap();
//! assert_eq!(n, 1);
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Runtime::new().unwrap().block_on(f)
//! # }
//! ```

mod renderer;

pub use renderer::{
    DefaultRenderer, RecordingRenderer, Renderer, RendererKind, SilentRenderer, TaskEvent,
    VerboseRenderer,
};

use futures::future::BoxFuture;

use crate::Error;

/// Predicate deciding whether a task runs
pub type Predicate<C> = Box<dyn Fn(&C) -> bool + Send + Sync>;

/// Leaf effect: may read and write the context and update its own title
pub type LeafFn<C> =
    Box<dyn for<'a> Fn(&'a mut C, &'a mut TaskTitle) -> BoxFuture<'a, Result<(), Error>> + Send + Sync>;

/// Title of a running task, updated by the task as it learns more
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskTitle {
    title: String,
}

impl TaskTitle {
    /// Start from the task's declared title
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
        }
    }

    /// Current title
    pub fn as_str(&self) -> &str {
        &self.title
    }

    /// Append `...suffix` to the title
    pub fn append(&mut self, suffix: impl AsRef<str>) {
        self.title.push_str("...");
        self.title.push_str(suffix.as_ref());
    }

    /// Consume into the final title
    pub fn into_string(self) -> String {
        self.title
    }
}

/// What a task does when enabled
pub enum Action<C> {
    /// A single effect
    Leaf(LeafFn<C>),
    /// A sub-sequence run on the same context
    Nested(TaskList<C>),
}

/// One node of the task tree
pub struct Task<C> {
    title: String,
    enabled: Option<Predicate<C>>,
    action: Action<C>,
}

impl<C> Task<C> {
    /// Leaf task
    ///
    /// The closure receives the context and the task's title. Anything it
    /// captures must be cloned into the returned future:
    ///
    /// ```ignore
    /// Task::new("Scale", move |ctx, title| {
    ///     let probe = probe.clone();
    ///     Box::pin(async move { probe.detect_flavor().await.map(|_| ()) })
    /// })
    /// ```
    pub fn new<F>(title: impl Into<String>, action: F) -> Self
    where
        F: for<'a> Fn(&'a mut C, &'a mut TaskTitle) -> BoxFuture<'a, Result<(), Error>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            title: title.into(),
            enabled: None,
            action: Action::Leaf(Box::new(action)),
        }
    }

    /// Task running a nested list
    pub fn nested(title: impl Into<String>, tasks: TaskList<C>) -> Self {
        Self {
            title: title.into(),
            enabled: None,
            action: Action::Nested(tasks),
        }
    }

    /// Gate the task on a predicate (default: always enabled)
    pub fn enabled<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&C) -> bool + Send + Sync + 'static,
    {
        self.enabled = Some(Box::new(predicate));
        self
    }

    /// Declared title
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Evaluate the predicate against a context
    pub fn is_enabled(&self, ctx: &C) -> bool {
        self.enabled.as_ref().map(|p| p(ctx)).unwrap_or(true)
    }

    /// The task's action
    pub fn action(&self) -> &Action<C> {
        &self.action
    }
}

/// Ordered list of tasks
pub struct TaskList<C> {
    tasks: Vec<Task<C>>,
}

impl<C> Default for TaskList<C> {
    fn default() -> Self {
        Self { tasks: Vec::new() }
    }
}

impl<C> TaskList<C> {
    /// Empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task (builder style)
    pub fn add(mut self, task: Task<C>) -> Self {
        self.tasks.push(task);
        self
    }

    /// Append a task
    pub fn push(&mut self, task: Task<C>) {
        self.tasks.push(task);
    }

    /// Append every task of another list
    pub fn append(mut self, other: TaskList<C>) -> Self {
        self.tasks.extend(other.tasks);
        self
    }

    /// Number of direct children
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the list has no tasks
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Direct children, in execution order
    pub fn tasks(&self) -> &[Task<C>] {
        &self.tasks
    }
}

impl<C: Send> TaskList<C> {
    /// Run the list against a borrowed context
    pub async fn execute(&self, ctx: &mut C, renderer: &dyn Renderer) -> Result<(), Error> {
        run_list(self, ctx, renderer, 0).await
    }

    /// Run the list, taking ownership of the context and handing it back
    pub async fn run(&self, mut ctx: C, renderer: &dyn Renderer) -> Result<C, Error> {
        self.execute(&mut ctx, renderer).await?;
        Ok(ctx)
    }
}

fn run_list<'a, C: Send>(
    list: &'a TaskList<C>,
    ctx: &'a mut C,
    renderer: &'a dyn Renderer,
    depth: usize,
) -> BoxFuture<'a, Result<(), Error>> {
    Box::pin(async move {
        for task in &list.tasks {
            if !task.is_enabled(ctx) {
                renderer.render(&TaskEvent::Skipped {
                    depth,
                    title: &task.title,
                });
                continue;
            }

            renderer.render(&TaskEvent::Started {
                depth,
                title: &task.title,
            });

            let (result, title) = match &task.action {
                Action::Leaf(effect) => {
                    let mut title = TaskTitle::new(task.title.as_str());
                    let result = effect(&mut *ctx, &mut title).await;
                    (result, title.into_string())
                }
                Action::Nested(children) => {
                    let result = run_list(children, &mut *ctx, renderer, depth + 1).await;
                    (result, task.title.clone())
                }
            };

            if let Err(error) = result {
                renderer.render(&TaskEvent::Failed {
                    depth,
                    title: &title,
                    error: &error,
                });
                return Err(error);
            }

            renderer.render(&TaskEvent::Completed {
                depth,
                title: &title,
            });
        }
        Ok(())
    })
}

//! Progress renderers
//!
//! Renderers observe task events and never influence execution.

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::Error;

/// Something that happened to a task
#[derive(Debug)]
pub enum TaskEvent<'a> {
    /// The task's predicate passed and its action is about to run
    Started {
        /// Nesting depth (0 = top level)
        depth: usize,
        /// Declared title
        title: &'a str,
    },
    /// The action finished successfully
    Completed {
        /// Nesting depth
        depth: usize,
        /// Final title, including any updates made by the task
        title: &'a str,
    },
    /// The predicate evaluated to false
    Skipped {
        /// Nesting depth
        depth: usize,
        /// Declared title
        title: &'a str,
    },
    /// The action failed; the run is about to abort
    Failed {
        /// Nesting depth
        depth: usize,
        /// Title at the time of failure
        title: &'a str,
        /// The failure
        error: &'a Error,
    },
}

/// Receives task progress
pub trait Renderer: Send + Sync {
    /// Observe one event
    fn render(&self, event: &TaskEvent<'_>);
}

/// Renders nothing
#[derive(Clone, Copy, Debug, Default)]
pub struct SilentRenderer;

impl Renderer for SilentRenderer {
    fn render(&self, _event: &TaskEvent<'_>) {}
}

/// Indented console tree, one line per finished task
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultRenderer;

impl Renderer for DefaultRenderer {
    fn render(&self, event: &TaskEvent<'_>) {
        match event {
            TaskEvent::Started { .. } | TaskEvent::Skipped { .. } => {}
            TaskEvent::Completed { depth, title } => {
                println!("{}✔ {}", indent(*depth), title);
            }
            TaskEvent::Failed {
                depth,
                title,
                error,
            } => {
                println!("{}✖ {}", indent(*depth), title);
                println!("{}  → {}", indent(*depth), error);
            }
        }
    }
}

fn indent(depth: usize) -> String {
    "  ".repeat(depth)
}

/// Every event as a tracing record
#[derive(Clone, Copy, Debug, Default)]
pub struct VerboseRenderer;

impl Renderer for VerboseRenderer {
    fn render(&self, event: &TaskEvent<'_>) {
        match event {
            TaskEvent::Started { depth, title } => info!(depth, task = %title, "[started]"),
            TaskEvent::Completed { depth, title } => info!(depth, task = %title, "[completed]"),
            TaskEvent::Skipped { depth, title } => debug!(depth, task = %title, "[skipped]"),
            TaskEvent::Failed {
                depth,
                title,
                error,
            } => warn!(depth, task = %title, error = %error, "[failed]"),
        }
    }
}

/// Keeps a compact trace of every event, for assertions
#[derive(Clone, Debug, Default)]
pub struct RecordingRenderer {
    events: Arc<Mutex<Vec<String>>>,
}

impl RecordingRenderer {
    /// Recorded events as `kind:depth:title`
    pub fn events(&self) -> Vec<String> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl Renderer for RecordingRenderer {
    fn render(&self, event: &TaskEvent<'_>) {
        let line = match event {
            TaskEvent::Started { depth, title } => format!("start:{}:{}", depth, title),
            TaskEvent::Completed { depth, title } => format!("done:{}:{}", depth, title),
            TaskEvent::Skipped { depth, title } => format!("skip:{}:{}", depth, title),
            TaskEvent::Failed { depth, title, .. } => format!("fail:{}:{}", depth, title),
        };
        if let Ok(mut events) = self.events.lock() {
            events.push(line);
        }
    }
}

/// Renderer selection (`--listr-renderer`)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum RendererKind {
    /// Console tree
    #[default]
    Default,
    /// No output
    Silent,
    /// Tracing records
    Verbose,
}

impl RendererKind {
    /// Build the selected renderer
    pub fn build(self) -> Arc<dyn Renderer> {
        match self {
            RendererKind::Default => Arc::new(DefaultRenderer),
            RendererKind::Silent => Arc::new(SilentRenderer),
            RendererKind::Verbose => Arc::new(VerboseRenderer),
        }
    }
}

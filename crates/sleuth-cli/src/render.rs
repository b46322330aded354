use std::io::Write;

use sleuth_client::{TaskStatus, TaskUpdate};
use sleuth_protocol::TaskStatusSnapshot;

const BAR_WIDTH: usize = 20;

/// Writes controller updates as terminal lines.
pub struct UpdateRenderer<W> {
    out: W,
}

impl<W: Write> UpdateRenderer<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn render(&mut self, update: &TaskUpdate) -> std::io::Result<()> {
        match update {
            TaskUpdate::Status(status) => writeln!(self.out, "[{}]", status.label()),
            TaskUpdate::Thought(thought) => writeln!(self.out, "  > {thought}"),
            TaskUpdate::Progress(progress) => writeln!(self.out, "  {}", progress_bar(*progress)),
            TaskUpdate::Report(report) => {
                writeln!(self.out)?;
                writeln!(self.out, "{}", report.trim_end())
            }
            TaskUpdate::Failed(message) => writeln!(self.out, "error: {message}"),
            TaskUpdate::Reset => writeln!(self.out, "[{}]", TaskStatus::Idle.label()),
        }?;
        self.out.flush()
    }
}

/// `[#####...............]  25%`, clamped to the bar for display only.
pub fn progress_bar(progress: f64) -> String {
    let clamped = if progress.is_finite() {
        progress.clamp(0.0, 100.0)
    } else {
        0.0
    };
    let filled = ((clamped / 100.0) * BAR_WIDTH as f64).round() as usize;
    format!(
        "[{}{}] {:>3.0}%",
        "#".repeat(filled),
        ".".repeat(BAR_WIDTH - filled),
        clamped
    )
}

pub fn render_snapshot(out: &mut impl Write, snapshot: &TaskStatusSnapshot) -> std::io::Result<()> {
    writeln!(out, "task:     {}", snapshot.task_id)?;
    writeln!(out, "status:   {:?}", snapshot.status)?;
    writeln!(out, "progress: {}", progress_bar(snapshot.progress))?;
    if !snapshot.thoughts.is_empty() {
        writeln!(out, "thoughts:")?;
        for thought in &snapshot.thoughts {
            writeln!(out, "  > {thought}")?;
        }
    }
    if !snapshot.report.is_empty() {
        writeln!(out)?;
        writeln!(out, "{}", snapshot.report.trim_end())?;
    }
    Ok(())
}

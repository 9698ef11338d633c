//! Execution Timeline
//!
//! Tracks when each step of a run started and settled, for the run report
//! and the ASCII Gantt chart printed by the CLI.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Step started executing
    Started,
    /// Step completed successfully
    Completed,
    /// Step failed or was interrupted
    Failed,
    /// Step was disabled and never ran
    Skipped,
}

impl EventType {
    fn is_end(&self) -> bool {
        matches!(self, EventType::Completed | EventType::Failed)
    }
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub step_id: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// Timing of one executed step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSpan {
    pub step_id: String,
    /// Offset from the start of the run
    pub start: Duration,
    pub duration: Duration,
    pub failed: bool,
}

/// Tracks the execution timeline of a run.
///
/// Records when each step starts and settles. Steps are reported in the
/// order they were first seen, which is sequence order.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Records an event for a step.
    pub fn add_event(&mut self, step_id: &str, event_type: EventType) {
        self.events.push(TimelineEvent {
            step_id: step_id.to_string(),
            event_type,
            timestamp: Instant::now(),
        });
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Time from the start of the run to its last recorded event.
    pub fn total(&self) -> Duration {
        self.events
            .last()
            .map(|event| event.timestamp.duration_since(self.start_time))
            .unwrap_or_default()
    }

    /// Spans of every step that started and settled.
    pub fn spans(&self) -> Vec<StepSpan> {
        let mut starts: HashMap<&str, Duration> = HashMap::new();
        let mut spans = Vec::new();

        for event in &self.events {
            let offset = event.timestamp.duration_since(self.start_time);
            match event.event_type {
                EventType::Started => {
                    starts.insert(event.step_id.as_str(), offset);
                }
                end if end.is_end() => {
                    if let Some(start) = starts.remove(event.step_id.as_str()) {
                        spans.push(StepSpan {
                            step_id: event.step_id.clone(),
                            start,
                            duration: offset.saturating_sub(start),
                            failed: end == EventType::Failed,
                        });
                    }
                }
                _ => {}
            }
        }

        spans
    }

    /// Step durations keyed by step ID.
    pub fn durations(&self) -> HashMap<String, Duration> {
        self.spans()
            .into_iter()
            .map(|span| (span.step_id, span.duration))
            .collect()
    }

    /// IDs of steps recorded as skipped.
    pub fn skipped(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter(|event| event.event_type == EventType::Skipped)
            .map(|event| event.step_id.as_str())
            .collect()
    }

    /// Generates an ASCII Gantt chart representation.
    ///
    /// Completed steps are drawn with `#`, failed ones with `x`.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_ms = self.total().as_millis();
        let spans = self.spans();

        if total_ms > 0 {
            // Scale to 50 characters width
            let scale = 50.0 / total_ms as f64;

            for span in &spans {
                let start_pos = (span.start.as_millis() as f64 * scale) as usize;
                let width = (span.duration.as_millis() as f64 * scale).max(1.0) as usize;
                let mark = if span.failed { "x" } else { "#" };

                output.push_str(&format!(
                    "{} |{}{}| ({} ms)\n",
                    truncate(&span.step_id, 16),
                    " ".repeat(start_pos),
                    mark.repeat(width),
                    span.duration.as_millis()
                ));
            }
        }

        for step_id in self.skipped() {
            output.push_str(&format!("{} (skipped)\n", truncate(step_id, 16)));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_ms));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or truncates a string to exactly `width` characters.
fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        format!("{:width$}", s, width = width)
    } else {
        let head: String = s.chars().take(width.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[test]
    fn test_timeline_creation() {
        let timeline = ExecutionTimeline::new();
        assert!(timeline.events().is_empty());
        assert_eq!(timeline.total(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spans_follow_sequence_order() {
        let mut timeline = ExecutionTimeline::new();

        timeline.add_event("set_magnet", EventType::Started);
        advance(Duration::from_millis(200)).await;
        timeline.add_event("set_magnet", EventType::Completed);

        timeline.add_event("beam_ready", EventType::Started);
        advance(Duration::from_millis(300)).await;
        timeline.add_event("beam_ready", EventType::Failed);

        let spans = timeline.spans();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].step_id, "set_magnet");
        assert_eq!(spans[0].duration, Duration::from_millis(200));
        assert!(!spans[0].failed);
        assert_eq!(spans[1].start, Duration::from_millis(200));
        assert!(spans[1].failed);
        assert_eq!(timeline.total(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_durations_ignore_unfinished() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("a", EventType::Started);
        advance(Duration::from_millis(50)).await;
        timeline.add_event("a", EventType::Completed);
        timeline.add_event("b", EventType::Started);

        let durations = timeline.durations();
        assert_eq!(durations.get("a"), Some(&Duration::from_millis(50)));
        assert!(!durations.contains_key("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gantt_chart_generation() {
        let mut timeline = ExecutionTimeline::new();

        timeline.add_event("step1", EventType::Started);
        advance(Duration::from_millis(50)).await;
        timeline.add_event("step1", EventType::Completed);
        timeline.add_event("draft", EventType::Skipped);
        timeline.add_event("step2", EventType::Started);
        advance(Duration::from_millis(50)).await;
        timeline.add_event("step2", EventType::Failed);

        let chart = timeline.gantt_chart();
        assert!(chart.contains("step1"));
        assert!(chart.contains('#'));
        assert!(chart.contains('x'));
        assert!(chart.contains("draft            (skipped)"));
        assert!(chart.contains("Total: 100 ms"));
    }

    #[test]
    fn test_gantt_chart_empty() {
        let timeline = ExecutionTimeline::new();
        let chart = timeline.gantt_chart();
        assert!(chart.contains("Timeline"));
        assert!(chart.contains("Total: 0 ms"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abc", 5), "abc  ");
        assert_eq!(truncate("beam_position_check", 10), "beam_po...");
    }
}

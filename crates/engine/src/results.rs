//! Result views over one run's output queue.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use serde_json::{Value as JsonValue, json};

use batchforge_core::{Args, RecordStatus};

use crate::queue::{DeadLetterEntry, OutputEntry};

#[derive(Debug, Default)]
struct View {
    output: Vec<JsonValue>,
    index: Vec<usize>,
}

/// Output entries and dead letters of a finished run, with per-status views built
/// on first access.
///
/// - completed / duplicate / filtered: one element per payload, so an index repeats
///   once for each payload its invocation produced.
/// - failed: one element per index whose last outcome failed and that was not
///   dead-lettered, with payload `{"index": i, "error": msg}`.
#[derive(Debug, Default)]
pub struct RunResults {
    entries: Vec<OutputEntry>,
    dead_letters: Vec<DeadLetterEntry>,
    views: [OnceLock<View>; 4],
}

fn slot(status: RecordStatus) -> Option<usize> {
    match status {
        RecordStatus::Completed => Some(0),
        RecordStatus::Duplicate => Some(1),
        RecordStatus::Filtered => Some(2),
        RecordStatus::Failed => Some(3),
        RecordStatus::Pending | RecordStatus::Running | RecordStatus::Cancelled => None,
    }
}

impl RunResults {
    pub fn new(entries: Vec<OutputEntry>, dead_letters: Vec<DeadLetterEntry>) -> Self {
        Self {
            entries,
            dead_letters,
            views: Default::default(),
        }
    }

    pub fn entries(&self) -> &[OutputEntry] {
        &self.entries
    }

    pub fn dead_letters(&self) -> &[DeadLetterEntry] {
        &self.dead_letters
    }

    /// Payloads with `status`; empty for non-terminal statuses.
    pub fn output(&self, status: RecordStatus) -> &[JsonValue] {
        self.view(status).map(|v| v.output.as_slice()).unwrap_or(&[])
    }

    /// Input indices aligned with [`RunResults::output`].
    pub fn index(&self, status: RecordStatus) -> &[usize] {
        self.view(status).map(|v| v.index.as_slice()).unwrap_or(&[])
    }

    pub fn dead_letter_input(&self) -> Vec<Args> {
        self.dead_letters.iter().map(|d| d.args.clone()).collect()
    }

    pub fn dead_letter_index(&self) -> Vec<usize> {
        self.dead_letters.iter().map(|d| d.index).collect()
    }

    fn view(&self, status: RecordStatus) -> Option<&View> {
        let slot = slot(status)?;
        Some(self.views[slot].get_or_init(|| self.build(status)))
    }

    fn build(&self, status: RecordStatus) -> View {
        let mut view = View::default();

        if status == RecordStatus::Failed {
            let dead: HashSet<usize> = self.dead_letters.iter().map(|d| d.index).collect();
            let mut last: HashMap<usize, &OutputEntry> = HashMap::new();
            let mut order = Vec::new();
            for entry in &self.entries {
                if last.insert(entry.index, entry).is_none() {
                    order.push(entry.index);
                }
            }
            for index in order {
                let entry = last[&index];
                if entry.status == RecordStatus::Failed && !dead.contains(&index) {
                    view.index.push(index);
                    view.output.push(json!({
                        "index": index,
                        "error": entry.error.clone().unwrap_or_default(),
                    }));
                }
            }
            return view;
        }

        for entry in self.entries.iter().filter(|e| e.status == status) {
            for payload in &entry.payloads {
                view.index.push(entry.index);
                view.output.push(payload.clone());
            }
        }
        view
    }
}

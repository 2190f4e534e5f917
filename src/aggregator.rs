use crate::types::WorkingEntry;

/// Working candidates ranked by latency, fastest first.
///
/// Append-only. Equal latencies keep the order in which they were recorded.
#[derive(Debug, Clone, Default)]
pub struct ResultAggregator {
    entries: Vec<WorkingEntry>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a working candidate and keep the ranking sorted.
    pub fn push(&mut self, link: impl Into<String>, ping_ms: u64) -> &WorkingEntry {
        let at = self.entries.partition_point(|e| e.ping_ms <= ping_ms);
        self.entries.insert(
            at,
            WorkingEntry {
                link: link.into(),
                ping_ms,
            },
        );
        &self.entries[at]
    }

    pub fn entries(&self) -> &[WorkingEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<WorkingEntry> {
        self.entries
    }

    /// Copy-out text: one `link # Ping: Nms` per entry, separated by a blank line.
    pub fn render(&self) -> String {
        render_entries(&self.entries)
    }
}

pub fn render_entries(entries: &[WorkingEntry]) -> String {
    entries
        .iter()
        .map(|e| format!("{} # Ping: {}ms", e.link, e.ping_ms))
        .collect::<Vec<_>>()
        .join("\n\n")
}

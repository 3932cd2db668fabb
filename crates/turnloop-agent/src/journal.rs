//! The branching, append-only journal and its newline-delimited-JSON
//! persistence format.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::Path;

use turnloop_core::{CoreError, EntryIdGenerator, EntryKind, Result, SessionEntry};

/// Append-only store of `SessionEntry` nodes forming a tree. `head` points
/// at the tip of the branch currently fed to the LLM; `reset_head` is the
/// only way to fork onto an older node.
///
/// `append` always parents the new entry on the current head and advances
/// the head to it — a deliberate simplification, since ordinary
/// conversation flow only ever appends to the tip. Forking onto an older
/// node and resuming appends from there is exactly what `reset_head` is
/// for.
pub struct SessionJournal {
    entries: HashMap<String, SessionEntry>,
    order: Vec<String>,
    head: Option<String>,
    id_gen: EntryIdGenerator,
}

impl Default for SessionJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionJournal {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
            head: None,
            id_gen: EntryIdGenerator::new(),
        }
    }

    pub fn head(&self) -> Option<&str> {
        self.head.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Appends a new entry parented on the current head, and advances the
    /// head to it. Returns the assigned id.
    pub fn append(&mut self, kind: EntryKind, timestamp: i64) -> String {
        let id = self.id_gen.next_id();
        let entry = SessionEntry::new(id.clone(), self.head.clone(), timestamp, kind);
        self.entries.insert(id.clone(), entry);
        self.order.push(id.clone());
        self.head = Some(id.clone());
        id
    }

    /// Appends a `summary` entry replacing `[first_id, last_id]`, same
    /// append-at-head semantics as any other entry — the replaced prefix
    /// still lives in storage, it's just no longer part of the head's
    /// effective context (see `compaction::build_effective_context`).
    pub fn apply_compaction(&mut self, summary_text: String, first_id: String, last_id: String, timestamp: i64) -> String {
        self.append(
            EntryKind::Summary {
                summary_text,
                replaced_range: (first_id, last_id),
            },
            timestamp,
        )
    }

    /// Forks the branch onto `entry_id` (or to an empty branch if `None`).
    pub fn reset_head(&mut self, entry_id: Option<String>) -> Result<()> {
        if let Some(id) = &entry_id {
            if !self.entries.contains_key(id) {
                return Err(CoreError::unknown_entry(id.clone()));
            }
        }
        self.head = entry_id;
        Ok(())
    }

    pub fn find(&self, id: &str) -> Option<&SessionEntry> {
        self.entries.get(id)
    }

    /// The ancestor chain from the current head back to the root,
    /// oldest-first.
    pub fn current_branch(&self) -> Vec<&SessionEntry> {
        let mut chain = Vec::new();
        let mut cursor = self.head.clone();
        while let Some(id) = cursor {
            let Some(entry) = self.entries.get(&id) else {
                break;
            };
            chain.push(entry);
            cursor = entry.parent_id.clone();
        }
        chain.reverse();
        chain
    }

    /// Writes every entry, in append order, as newline-delimited JSON.
    /// Fsyncs before returning so a subsequent `save` acknowledgement means
    /// the entries are actually durable.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut file = std::fs::File::create(path)?;
        for id in &self.order {
            let entry = self
                .entries
                .get(id)
                .expect("every id in `order` has a corresponding entry");
            let line = serde_json::to_string(entry)?;
            writeln!(file, "{line}")?;
        }
        file.sync_all()?;
        Ok(())
    }

    /// Reconstructs a journal from its newline-delimited-JSON file. A
    /// truncated trailing line is discarded; an entry referencing a
    /// missing parent is dropped along with everything appended after it
    /// in the file (since nothing can reference a dropped entry as an
    /// ancestor once it never entered the map). The head is the last
    /// surviving entry in file order — the tip of whichever branch was
    /// live when the file was last saved.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut journal = Self::new();
        let lines: Vec<&str> = raw.lines().collect();

        for (i, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: SessionEntry = match serde_json::from_str(line) {
                Ok(entry) => entry,
                Err(err) => {
                    if i == lines.len() - 1 {
                        tracing::warn!(line_index = i, error = %err, "discarding truncated trailing journal line");
                        continue;
                    }
                    return Err(CoreError::Json(err));
                }
            };

            let parent_ok = match &entry.parent_id {
                None => true,
                Some(parent_id) => journal.entries.contains_key(parent_id),
            };
            if !parent_ok {
                tracing::warn!(entry_id = %entry.id, parent_id = ?entry.parent_id, "dropping journal entry with missing parent");
                continue;
            }

            journal.order.push(entry.id.clone());
            journal.entries.insert(entry.id.clone(), entry);
        }

        journal.head = journal.order.last().cloned();
        Ok(journal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnloop_core::Message;

    fn msg_entry(text: &str, ts: i64) -> EntryKind {
        EntryKind::Message {
            message: Message::user(text, ts),
        }
    }

    // =========================================================================
    // append / current_branch
    // =========================================================================

    #[test]
    fn append_advances_head_and_links_parent() {
        let mut j = SessionJournal::new();
        let a = j.append(msg_entry("a", 0), 0);
        let b = j.append(msg_entry("b", 1), 1);
        assert_eq!(j.head(), Some(b.as_str()));
        assert_eq!(j.find(&b).unwrap().parent_id.as_deref(), Some(a.as_str()));
    }

    #[test]
    fn current_branch_is_oldest_first() {
        let mut j = SessionJournal::new();
        let a = j.append(msg_entry("a", 0), 0);
        let b = j.append(msg_entry("b", 1), 1);
        let branch = j.current_branch();
        assert_eq!(branch.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(), vec![a.as_str(), b.as_str()]);
    }

    #[test]
    fn reset_head_forks_branch() {
        let mut j = SessionJournal::new();
        let a = j.append(msg_entry("a", 0), 0);
        let _b = j.append(msg_entry("b", 1), 1);
        j.reset_head(Some(a.clone())).unwrap();
        let c = j.append(msg_entry("c", 2), 2);
        let branch = j.current_branch();
        assert_eq!(branch.len(), 2);
        assert_eq!(branch[1].id, c);
    }

    #[test]
    fn reset_head_rejects_unknown_entry() {
        let mut j = SessionJournal::new();
        let err = j.reset_head(Some("missing".to_string())).unwrap_err();
        assert!(matches!(err, CoreError::UnknownEntry(_)));
    }

    // =========================================================================
    // save / load
    // =========================================================================

    #[test]
    fn load_after_save_round_trips() {
        let mut j = SessionJournal::new();
        j.append(msg_entry("a", 0), 0);
        j.append(msg_entry("b", 1), 1);

        let dir = std::env::temp_dir();
        let path = dir.join(format!("turnloop-journal-test-{}.ndjson", uuid::Uuid::new_v4()));
        j.save(&path).unwrap();
        let loaded = SessionJournal::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.len(), j.len());
        assert_eq!(loaded.head(), j.head());
        assert_eq!(loaded.current_branch().len(), j.current_branch().len());
    }

    #[test]
    fn load_discards_truncated_trailing_line() {
        let mut j = SessionJournal::new();
        j.append(msg_entry("a", 0), 0);
        j.append(msg_entry("b", 1), 1);

        let dir = std::env::temp_dir();
        let path = dir.join(format!("turnloop-journal-trunc-{}.ndjson", uuid::Uuid::new_v4()));
        j.save(&path).unwrap();

        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("{\"id\":\"e_trunc\",\"parentId\":null,\"timestamp\"");
        std::fs::write(&path, raw).unwrap();

        let loaded = SessionJournal::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn load_drops_entry_with_missing_parent() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("turnloop-journal-orphan-{}.ndjson", uuid::Uuid::new_v4()));
        let content = "{\"id\":\"e1\",\"parentId\":null,\"timestamp\":0,\"type\":\"message\",\"message\":{\"role\":\"user\",\"content\":\"hi\",\"timestamp\":0}}\n\
                        {\"id\":\"e2\",\"parentId\":\"missing\",\"timestamp\":1,\"type\":\"message\",\"message\":{\"role\":\"user\",\"content\":\"bye\",\"timestamp\":1}}\n";
        std::fs::write(&path, content).unwrap();

        let loaded = SessionJournal::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.find("e1").is_some());
        assert!(loaded.find("e2").is_none());
    }
}

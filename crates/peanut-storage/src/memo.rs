use crate::{load_json, next_id, now_iso, save_json};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const MEMORY_HEADER: &str = "=== Peanut's tastes and memories ===";
pub const EMPTY_MEMORY_TEXT: &str = "No tastes or memories have been saved yet.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memo {
    pub id: u64,
    pub content: String,
    pub added_by: String,
    pub timestamp: String,
    pub date: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoFile {
    #[serde(default)]
    last_updated: String,
    #[serde(default)]
    total_count: usize,
    #[serde(default)]
    memories: Vec<Memo>,
}

pub struct MemoStore {
    path: PathBuf,
    memories: Vec<Memo>,
}

impl MemoStore {
    /// Loads the file, creating an empty one when it does not exist yet.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let existed = path.exists();
        let file: MemoFile = load_json(&path);
        let store = Self {
            path,
            memories: file.memories,
        };
        if existed {
            tracing::info!("Loaded {} memos", store.memories.len());
        } else {
            store.save()?;
        }
        Ok(store)
    }

    pub fn save(&self) -> Result<()> {
        save_json(
            &self.path,
            &MemoFile {
                last_updated: now_iso(),
                total_count: self.memories.len(),
                memories: self.memories.clone(),
            },
        )
    }

    pub fn add(&mut self, content: &str, author: &str) -> Result<Memo> {
        let now = chrono::Local::now();
        let memo = Memo {
            id: next_id(self.memories.iter().map(|m| m.id)),
            content: content.to_string(),
            added_by: author.to_string(),
            timestamp: now.format("%Y-%m-%dT%H:%M:%S").to_string(),
            date: now.format("%Y-%m-%d %H:%M:%S").to_string(),
        };
        self.memories.push(memo.clone());
        self.save()?;
        Ok(memo)
    }

    pub fn delete_by_id(&mut self, id: u64) -> Result<Option<Memo>> {
        let Some(idx) = self.memories.iter().position(|m| m.id == id) else {
            return Ok(None);
        };
        let removed = self.memories.remove(idx);
        self.save()?;
        Ok(Some(removed))
    }

    /// Removes the first memo whose content equals or contains `content`.
    pub fn delete_matching(&mut self, content: &str) -> Result<Option<Memo>> {
        let Some(idx) = self
            .memories
            .iter()
            .position(|m| m.content == content || m.content.contains(content))
        else {
            return Ok(None);
        };
        let removed = self.memories.remove(idx);
        self.save()?;
        Ok(Some(removed))
    }

    pub fn search(&self, keyword: &str) -> Vec<Memo> {
        let needle = keyword.to_lowercase();
        self.memories
            .iter()
            .filter(|m| m.content.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }

    pub fn list(&self) -> &[Memo] {
        &self.memories
    }

    pub fn count(&self) -> usize {
        self.memories.len()
    }

    pub fn clear(&mut self) -> Result<usize> {
        let count = self.memories.len();
        self.memories.clear();
        self.save()?;
        Ok(count)
    }

    /// Memory block appended to the system instruction.
    pub fn as_memory_text(&self) -> String {
        if self.memories.is_empty() {
            return EMPTY_MEMORY_TEXT.to_string();
        }
        let lines: Vec<String> = self
            .memories
            .iter()
            .map(|m| format!("- {}", m.content))
            .collect();
        format!("{}\n{}", MEMORY_HEADER, lines.join("\n"))
    }
}

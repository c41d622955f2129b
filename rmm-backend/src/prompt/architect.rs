//! Block-based prompt builder.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::render_blocks;
use crate::error::{Error, Result};

/// One block of an architect prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptBlock {
    pub id: String,
    #[serde(rename = "type")]
    pub block_type: String,
    pub content: String,
    /// Declared variable names. Informational only.
    #[serde(default)]
    pub variables: Vec<String>,
    #[serde(default)]
    pub order: usize,
}

/// Ordered blocks plus the variables substituted into them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptArchitect {
    #[serde(default)]
    blocks: Vec<PromptBlock>,
    #[serde(default)]
    variables: BTreeMap<String, String>,
    /// Next block number. Never decreases, so ids are never reused.
    #[serde(default, skip_serializing)]
    next_id: u64,
}

impl PromptArchitect {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocks(&self) -> &[PromptBlock] {
        &self.blocks
    }

    pub fn variables(&self) -> &BTreeMap<String, String> {
        &self.variables
    }

    /// Append a block and return its id.
    pub fn add_block(&mut self, block_type: &str, content: &str, variables: Vec<String>) -> String {
        let id = format!("block_{}", self.next_id);
        self.next_id += 1;

        self.blocks.push(PromptBlock {
            id: id.clone(),
            block_type: block_type.to_string(),
            content: content.to_string(),
            variables,
            order: self.blocks.len(),
        });
        id
    }

    /// Remove block `id`. Returns whether a block was removed.
    pub fn remove_block(&mut self, id: &str) -> bool {
        let before = self.blocks.len();
        self.blocks.retain(|b| b.id != id);
        self.renumber();
        self.blocks.len() != before
    }

    /// Replace the content of block `id`. Returns false if it does not exist.
    pub fn update_block(&mut self, id: &str, content: &str) -> bool {
        match self.blocks.iter_mut().find(|b| b.id == id) {
            Some(block) => {
                block.content = content.to_string();
                true
            }
            None => false,
        }
    }

    /// Move the listed blocks to the front, in the given order.
    ///
    /// Unknown ids are ignored; blocks not listed keep their relative order
    /// after the listed ones.
    pub fn reorder(&mut self, ids: &[String]) {
        let mut remaining = std::mem::take(&mut self.blocks);
        remaining.sort_by_key(|b| b.order);
        let mut ordered = Vec::with_capacity(remaining.len());

        for id in ids {
            if let Some(pos) = remaining.iter().position(|b| &b.id == id) {
                ordered.push(remaining.remove(pos));
            }
        }
        ordered.append(&mut remaining);

        self.blocks = ordered;
        self.renumber();
    }

    pub fn set_variable(&mut self, name: &str, value: &str) {
        self.variables.insert(name.to_string(), value.to_string());
    }

    /// Render the blocks in order with variables substituted.
    pub fn build(&self) -> String {
        let mut sorted: Vec<&PromptBlock> = self.blocks.iter().collect();
        sorted.sort_by_key(|b| b.order);
        render_blocks(
            sorted
                .into_iter()
                .map(|b| (b.block_type.as_str(), b.content.as_str())),
            &self.variables,
        )
    }

    /// Serialize to the JSON export format (`{"blocks": [...], "variables": {...}}`).
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::Internal(format!("Failed to serialize prompt: {}", e)))
    }

    /// Parse the JSON export format.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut architect: PromptArchitect = serde_json::from_str(json)
            .map_err(|e| Error::InvalidRequest(format!("Invalid prompt file: {}", e)))?;
        architect.next_id = architect.next_free_id();
        Ok(architect)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    fn renumber(&mut self) {
        for (i, block) in self.blocks.iter_mut().enumerate() {
            block.order = i;
        }
    }

    /// First counter value past every `block_<n>` id present.
    fn next_free_id(&self) -> u64 {
        self.blocks
            .iter()
            .filter_map(|b| b.id.strip_prefix("block_")?.parse::<u64>().ok())
            .map(|n| n + 1)
            .max()
            .unwrap_or(0)
    }
}

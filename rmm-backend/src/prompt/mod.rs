//! Prompt construction: built-in and custom templates, the block-based
//! prompt architect and its session store.

mod architect;
mod sessions;
mod templates;

pub use architect::{PromptArchitect, PromptBlock};
pub use sessions::SessionStore;
pub use templates::{PromptTemplate, TemplateBlock, TemplateCatalog, TemplateSummary};

use std::collections::BTreeMap;

/// Separator placed between rendered blocks.
const BLOCK_SEPARATOR: &str = "\n\n";

/// Render `(type, content)` blocks into a single prompt.
///
/// Every `{name}` in a block is replaced with its value, then the block is
/// prefixed with the label for its type. Unknown types render as raw text.
pub fn render_blocks<'a, I>(blocks: I, variables: &BTreeMap<String, String>) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    blocks
        .into_iter()
        .map(|(block_type, content)| {
            let content = substitute(content, variables);
            match label(block_type) {
                Some(label) => format!("{}: {}", label, content),
                None => content,
            }
        })
        .collect::<Vec<_>>()
        .join(BLOCK_SEPARATOR)
}

fn substitute(content: &str, variables: &BTreeMap<String, String>) -> String {
    variables
        .iter()
        .fold(content.to_string(), |acc, (name, value)| {
            acc.replace(&format!("{{{}}}", name), value)
        })
}

fn label(block_type: &str) -> Option<&'static str> {
    match block_type {
        "system" => Some("System"),
        "user" => Some("User"),
        "context" => Some("Context"),
        "instruction" => Some("Instruction"),
        "output_format" => Some("Output Format"),
        _ => None,
    }
}

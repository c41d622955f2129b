//! Prompt template catalog.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::render_blocks;
use crate::error::{Error, Result};

/// File holding user-created templates, inside the prompts directory.
pub const CUSTOM_TEMPLATES_FILE: &str = "custom_templates.json";

/// One block of a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateBlock {
    #[serde(rename = "type", default = "default_block_type")]
    pub block_type: String,
    #[serde(default)]
    pub content: String,
}

fn default_block_type() -> String {
    "text".to_string()
}

impl TemplateBlock {
    fn new(block_type: &str, content: &str) -> Self {
        Self {
            block_type: block_type.to_string(),
            content: content.to_string(),
        }
    }
}

/// A named, categorized sequence of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub name: String,
    pub description: String,
    pub category: String,
    pub blocks: Vec<TemplateBlock>,
}

impl PromptTemplate {
    /// Identifier derived from the name: lower-cased, spaces as `_`.
    pub fn id(&self) -> String {
        self.name.to_lowercase().replace(' ', "_")
    }

    /// Render the template with `variables` substituted.
    pub fn build(&self, variables: &BTreeMap<String, String>) -> String {
        render_blocks(
            self.blocks
                .iter()
                .map(|b| (b.block_type.as_str(), b.content.as_str())),
            variables,
        )
    }
}

/// Listing entry for a template.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CustomTemplatesFile {
    #[serde(default)]
    templates: Vec<PromptTemplate>,
}

/// Built-in templates plus the user's custom ones.
pub struct TemplateCatalog {
    prompts_dir: PathBuf,
    templates: HashMap<String, PromptTemplate>,
}

impl TemplateCatalog {
    /// Catalog with the built-in templates and any custom templates found in
    /// `prompts_dir`. A corrupt custom file is logged and skipped.
    pub fn load(prompts_dir: impl Into<PathBuf>) -> Self {
        let prompts_dir = prompts_dir.into();
        let mut templates: HashMap<String, PromptTemplate> = builtin_templates()
            .into_iter()
            .map(|(id, template)| (id.to_string(), template))
            .collect();

        let path = prompts_dir.join(CUSTOM_TEMPLATES_FILE);
        if path.exists() {
            match read_custom_file(&path) {
                Ok(file) => {
                    let count = file.templates.len();
                    for template in file.templates {
                        templates.insert(template.id(), template);
                    }
                    tracing::info!("Loaded {} custom prompt templates", count);
                }
                Err(e) => {
                    tracing::warn!("Failed to load custom templates from {}: {}", path.display(), e);
                }
            }
        }

        Self {
            prompts_dir,
            templates,
        }
    }

    pub fn get(&self, id: &str) -> Option<&PromptTemplate> {
        self.templates.get(id)
    }

    /// Templates in `category` (all when `None`), ordered by id.
    pub fn list(&self, category: Option<&str>) -> Vec<TemplateSummary> {
        let mut summaries: Vec<TemplateSummary> = self
            .templates
            .iter()
            .filter(|(_, t)| category.map_or(true, |c| t.category == c))
            .map(|(id, t)| TemplateSummary {
                id: id.clone(),
                name: t.name.clone(),
                description: t.description.clone(),
                category: t.category.clone(),
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    /// Distinct categories, sorted.
    pub fn categories(&self) -> Vec<String> {
        self.templates
            .values()
            .map(|t| t.category.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Render template `id`, or `None` if it does not exist.
    pub fn build(&self, id: &str, variables: &BTreeMap<String, String>) -> Option<String> {
        self.get(id).map(|t| t.build(variables))
    }

    /// Append `template` to the custom templates file and register it.
    ///
    /// Returns the template's id. A template with the same id replaces the
    /// in-memory entry.
    pub fn save_custom(&mut self, template: PromptTemplate) -> Result<String> {
        if template.name.trim().is_empty() {
            return Err(Error::InvalidRequest("template name is required".to_string()));
        }

        std::fs::create_dir_all(&self.prompts_dir)?;
        let path = self.prompts_dir.join(CUSTOM_TEMPLATES_FILE);

        let mut file = if path.exists() {
            read_custom_file(&path)?
        } else {
            CustomTemplatesFile::default()
        };
        file.templates.push(template.clone());

        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| Error::Internal(format!("Failed to serialize templates: {}", e)))?;
        std::fs::write(&path, json)?;

        let id = template.id();
        tracing::info!("Saved custom prompt template {}", id);
        self.templates.insert(id.clone(), template);
        Ok(id)
    }
}

fn read_custom_file(path: &Path) -> Result<CustomTemplatesFile> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| Error::Internal(format!("Corrupt custom templates file: {}", e)))
}

fn builtin_templates() -> Vec<(&'static str, PromptTemplate)> {
    let template = |name: &str, description: &str, category: &str, blocks: &[(&str, &str)]| {
        PromptTemplate {
            name: name.to_string(),
            description: description.to_string(),
            category: category.to_string(),
            blocks: blocks
                .iter()
                .map(|(block_type, content)| TemplateBlock::new(block_type, content))
                .collect(),
        }
    };

    vec![
        (
            "coding_assistant",
            template(
                "Coding Assistant",
                "Help with coding tasks, debugging, and code review",
                "Coding",
                &[
                    (
                        "system",
                        "You are an expert software engineer specializing in {language}. \
                         You write clean, efficient, and well-documented code.",
                    ),
                    (
                        "context",
                        "Programming Language: {language}\nTask Type: {task_type}\nCode Style: {code_style}",
                    ),
                    ("user", "{user_request}"),
                    (
                        "instruction",
                        "Provide code with inline comments. \
                         Explain your approach and any important decisions.",
                    ),
                ],
            ),
        ),
        (
            "writing_assistant",
            template(
                "Writing Assistant",
                "Help with creative writing, essays, and content creation",
                "Writing",
                &[
                    (
                        "system",
                        "You are a professional writer specializing in {writing_type}. \
                         Your writing is {tone} and engaging.",
                    ),
                    (
                        "context",
                        "Writing Type: {writing_type}\nTarget Audience: {audience}\nTone: {tone}\nLength: {length}",
                    ),
                    ("user", "{user_request}"),
                    (
                        "instruction",
                        "Create compelling content that matches the specified tone and audience. \
                         Use proper formatting and structure.",
                    ),
                ],
            ),
        ),
        (
            "data_analysis",
            template(
                "Data Analyst",
                "Analyze data, create visualizations, and provide insights",
                "Analysis",
                &[
                    (
                        "system",
                        "You are a data analyst expert. You analyze data, identify patterns, \
                         and provide actionable insights.",
                    ),
                    (
                        "context",
                        "Data Type: {data_type}\nAnalysis Goal: {goal}\nOutput Format: {output_format}",
                    ),
                    ("user", "{user_request}"),
                    (
                        "instruction",
                        "Provide clear analysis with supporting evidence. \
                         Include visualizations or code where appropriate.",
                    ),
                ],
            ),
        ),
        (
            "general_assistant",
            template(
                "General Assistant",
                "General-purpose AI assistant for various tasks",
                "General",
                &[
                    (
                        "system",
                        "You are a helpful AI assistant. You provide accurate, \
                         well-reasoned responses to user questions.",
                    ),
                    ("user", "{user_request}"),
                ],
            ),
        ),
        (
            "debugging",
            template(
                "Debug Helper",
                "Help debug code and fix errors",
                "Coding",
                &[
                    (
                        "system",
                        "You are a debugging expert. You analyze code, identify issues, \
                         and suggest fixes.",
                    ),
                    (
                        "context",
                        "Language: {language}\nError Message: {error_message}\nCode Context:\n{code_context}",
                    ),
                    (
                        "instruction",
                        "1. Identify the root cause of the error\n\
                         2. Explain why it's happening\n\
                         3. Provide a fix with explanation\n\
                         4. Suggest how to prevent similar issues",
                    ),
                ],
            ),
        ),
        (
            "documentation",
            template(
                "Documentation Writer",
                "Generate clear technical documentation",
                "Writing",
                &[
                    (
                        "system",
                        "You are a technical writer. You create clear, comprehensive \
                         documentation for {doc_type}.",
                    ),
                    (
                        "context",
                        "Documentation Type: {doc_type}\nTarget Readers: {readers}\nFormat: {format}",
                    ),
                    ("user", "{user_request}"),
                    (
                        "instruction",
                        "Create well-structured documentation with:\n\
                         - Clear headings and sections\n\
                         - Code examples where relevant\n\
                         - Usage instructions\n\
                         - Common pitfalls and tips",
                    ),
                ],
            ),
        ),
    ]
}

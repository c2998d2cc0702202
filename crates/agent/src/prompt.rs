use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::memory_tools::{SAVE_TEXT_TOOL, SAVE_USAGE_TOOL, SEARCH_USAGE_TOOL};
use crate::tools::ToolDescriptor;

/// Warehouse facts and house rules rendered as extra prompt sections.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DomainKnowledge {
    pub database_type: Option<String>,
    pub database_purpose: Option<String>,
    pub business_definitions: BTreeMap<String, String>,
    pub sql_patterns: Vec<String>,
    pub performance_hints: Vec<String>,
    pub data_quality_notes: Vec<String>,
    pub additional_context: Option<String>,
}

impl DomainKnowledge {
    fn sections(&self) -> Vec<String> {
        let mut sections = Vec::new();

        if self.database_type.is_some() || self.database_purpose.is_some() {
            let mut section = "DATABASE INFORMATION:".to_string();
            if let Some(kind) = &self.database_type {
                section.push_str(&format!("\n- Database Type: {kind}"));
            }
            if let Some(purpose) = &self.database_purpose {
                section.push_str(&format!("\n- Purpose: {purpose}"));
            }
            sections.push(section);
        }

        if !self.business_definitions.is_empty() {
            let items: Vec<String> = self
                .business_definitions
                .iter()
                .map(|(term, definition)| format!("- **{term}**: {definition}"))
                .collect();
            sections.push(list_section(
                "BUSINESS DEFINITIONS:",
                "When users ask about these business concepts, use these definitions:",
                &items,
                false,
            ));
        }
        if !self.sql_patterns.is_empty() {
            sections.push(list_section(
                "SQL BEST PRACTICES FOR THIS DATABASE:",
                "Always follow these patterns when generating SQL:",
                &self.sql_patterns,
                true,
            ));
        }
        if !self.performance_hints.is_empty() {
            sections.push(list_section(
                "PERFORMANCE CONSIDERATIONS:",
                "Be aware of these performance characteristics:",
                &self.performance_hints,
                true,
            ));
        }
        if !self.data_quality_notes.is_empty() {
            sections.push(list_section(
                "DATA QUALITY NOTES:",
                "Be aware of these data quality issues:",
                &self.data_quality_notes,
                true,
            ));
        }

        sections
    }
}

fn list_section(header: &str, intro: &str, items: &[String], numbered: bool) -> String {
    let mut section = format!("{header}\n{intro}\n");
    for (index, item) in items.iter().enumerate() {
        if numbered {
            section.push_str(&format!("\n{}. {item}", index + 1));
        } else {
            section.push_str(&format!("\n{item}"));
        }
    }
    section
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SystemPromptBuilder {
    assistant_name: String,
    override_prompt: Option<String>,
    domain: DomainKnowledge,
}

impl Default for SystemPromptBuilder {
    fn default() -> Self {
        Self {
            assistant_name: "Tollgate".to_string(),
            override_prompt: None,
            domain: DomainKnowledge::default(),
        }
    }
}

impl SystemPromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_assistant_name(mut self, name: impl Into<String>) -> Self {
        self.assistant_name = name.into();
        self
    }

    /// Used verbatim; nothing else is added.
    pub fn with_override(mut self, prompt: impl Into<String>) -> Self {
        self.override_prompt = Some(prompt.into());
        self
    }

    pub fn with_domain(mut self, domain: DomainKnowledge) -> Self {
        self.domain = domain;
        self
    }

    /// `tools` must already be filtered for the caller.
    pub fn build(&self, tools: &[ToolDescriptor], today: NaiveDate) -> String {
        if let Some(prompt) = &self.override_prompt {
            return prompt.clone();
        }

        let mut sections = vec![self.base(tools, today)];
        sections.extend(self.domain.sections());
        let memory = memory_workflow_instructions(tools);
        if !memory.is_empty() {
            sections.push(memory);
        }
        if let Some(extra) = &self.domain.additional_context {
            sections.push(extra.clone());
        }
        sections.join("\n\n")
    }

    fn base(&self, tools: &[ToolDescriptor], today: NaiveDate) -> String {
        let mut lines = vec![
            format!(
                "You are {}, a data analyst assistant that helps users explore and explain \
                 their data. Today's date is {}.",
                self.assistant_name,
                today.format("%Y-%m-%d")
            ),
            String::new(),
            "Response Guidelines:".to_string(),
            "- Finish with a short summary of what you did and what you observed.".to_string(),
            "- Use the available tools to get the user to their answer.".to_string(),
            "- Query results are shown to the user separately, so interpret them rather than \
             repeating them."
                .to_string(),
        ];
        if !tools.is_empty() {
            let names: Vec<&str> = tools.iter().map(|tool| tool.name.as_str()).collect();
            lines.push(format!("\nYou have access to the following tools: {}", names.join(", ")));
        }
        lines.join("\n")
    }
}

/// Guidance for the memory tools the caller can actually see; empty when
/// none are visible.
pub fn memory_workflow_instructions(tools: &[ToolDescriptor]) -> String {
    let visible = |name: &str| tools.iter().any(|tool| tool.name == name);
    let search = visible(SEARCH_USAGE_TOOL);
    let save = visible(SAVE_USAGE_TOOL);
    let text = visible(SAVE_TEXT_TOOL);
    if !(search || save || text) {
        return String::new();
    }

    let heavy = "=".repeat(60);
    let light = "-".repeat(50);
    let mut parts = vec![heavy.clone(), "MEMORY SYSTEM:".to_string(), heavy];

    if search || save {
        parts.push("\n1. TOOL USAGE MEMORY (Structured Workflow):".to_string());
        parts.push(light.clone());
        if search {
            parts.push(format!(
                "\n- BEFORE running a data tool, call {SEARCH_USAGE_TOOL} with the user's question \
                 to find saved patterns for similar questions, and use what it returns."
            ));
        }
        if save {
            parts.push(format!(
                "\n- AFTER a tool call produces a correct and useful result, call \
                 {SAVE_USAGE_TOOL} so the pattern can be reused."
            ));
        }
        parts.push("\nExample workflow:".to_string());
        parts.push("  - User asks a question".to_string());
        if search {
            parts.push(format!("  - First: {SEARCH_USAGE_TOOL}(question=\"user's question\")"));
        }
        parts.push("  - Then: run the appropriate tool(s)".to_string());
        if save {
            parts.push(format!(
                "  - Finally, if it worked: {SAVE_USAGE_TOOL}(question=\"user's question\", \
                 tool_name=\"tool_used\", args={{the args you used}})"
            ));
        }
        parts.push(
            "\nSkip the search only when the user asks about the tools themselves or is trying out \
             the save and search features."
                .to_string(),
        );
    }

    if text {
        parts.push("\n2. TEXT MEMORY (Domain Knowledge & Context):".to_string());
        parts.push(light);
        parts.push(format!(
            "\n- {SAVE_TEXT_TOOL}: keep schema details, company terminology, query conventions \
             and user preferences. Do not save one-off results or anything already in tool \
             usage memory."
        ));
        parts.push(format!(
            "  - {SAVE_TEXT_TOOL}(content=\"MRR means Monthly Recurring Revenue in our schema\")"
        ));
    }

    parts.join("\n")
}

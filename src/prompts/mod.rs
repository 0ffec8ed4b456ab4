//! Built-in default prompt templates for the loan and generic pipelines,
//! embedded directly into the binary via `include_str!` so a fresh install
//! can extract without supplying a custom prompt file.

use crate::llm::PromptTemplate;
use crate::prelude::*;

const DEFAULT_LOAN_PROMPT: &str = include_str!("loan_extraction.toml");
const DEFAULT_GENERIC_PROMPT: &str = include_str!("generic_extraction.toml");

/// The version tag stamped onto every [`crate::model::PageExtraction`]
/// produced from the built-in prompts. Bump this whenever either template's
/// wording changes in a way that could affect extraction quality.
pub const BUILTIN_PROMPT_VERSION: &str = "builtin-v1";

/// The default loan-pipeline prompt.
pub fn default_loan_prompt() -> Result<PromptTemplate> {
    PromptTemplate::from_toml_str(BUILTIN_PROMPT_VERSION, DEFAULT_LOAN_PROMPT)
}

/// The default generic-pipeline prompt.
pub fn default_generic_prompt() -> Result<PromptTemplate> {
    PromptTemplate::from_toml_str(BUILTIN_PROMPT_VERSION, DEFAULT_GENERIC_PROMPT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_prompts_parse() {
        default_loan_prompt().unwrap();
        default_generic_prompt().unwrap();
    }
}

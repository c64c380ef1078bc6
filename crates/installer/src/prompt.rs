//! Interactive prompts.
//!
//! Prompts may block indefinitely while waiting for the operator, so the
//! orchestrator never holds a lock or an open proxy while asking.

use anyhow::{Context, Result};
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Input, Select};

/// Validation hook for free-text answers: `Err` holds the message shown to the operator.
pub type Validator<'a> = &'a dyn Fn(&str) -> Result<(), String>;

/// Source of operator answers.
pub trait Prompter: Send + Sync {
    /// Pick one of `items`; returns its index.
    ///
    /// # Errors
    ///
    /// Returns an error if the terminal cannot be read.
    fn select(&self, prompt: &str, items: &[String], default: usize) -> Result<usize>;

    /// Ask for text until `validate` accepts it.
    ///
    /// # Errors
    ///
    /// Returns an error if the terminal cannot be read.
    fn input(&self, prompt: &str, default: Option<&str>, validate: Validator<'_>) -> Result<String>;

    /// Ask a yes/no question.
    ///
    /// # Errors
    ///
    /// Returns an error if the terminal cannot be read.
    fn confirm(&self, prompt: &str, default: bool) -> Result<bool>;
}

/// [`Prompter`] on the controlling terminal.
#[derive(Debug, Default)]
pub struct TerminalPrompter {
    /// Accept the default of every yes/no question.
    assume_yes: bool,
}

impl TerminalPrompter {
    #[must_use]
    pub fn new(assume_yes: bool) -> Self {
        Self { assume_yes }
    }
}

impl Prompter for TerminalPrompter {
    fn select(&self, prompt: &str, items: &[String], default: usize) -> Result<usize> {
        Select::with_theme(&ColorfulTheme::default())
            .with_prompt(prompt)
            .default(default)
            .items(items)
            .interact()
            .with_context(|| format!("Failed to read answer to '{prompt}'"))
    }

    fn input(&self, prompt: &str, default: Option<&str>, validate: Validator<'_>) -> Result<String> {
        let theme = ColorfulTheme::default();
        let mut input = Input::<String>::with_theme(&theme).with_prompt(prompt);
        if let Some(default) = default {
            input = input.default(default.to_string());
        }
        input
            .validate_with(|text: &String| validate(text.trim()))
            .interact_text()
            .map(|text| text.trim().to_string())
            .with_context(|| format!("Failed to read answer to '{prompt}'"))
    }

    fn confirm(&self, prompt: &str, default: bool) -> Result<bool> {
        if self.assume_yes {
            return Ok(default);
        }
        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(prompt)
            .default(default)
            .interact()
            .with_context(|| format!("Failed to read answer to '{prompt}'"))
    }
}

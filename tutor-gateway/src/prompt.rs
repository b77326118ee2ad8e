//! System prompt and subject settings.
//!
//! The active prompt and subject live in the shared store so every replica
//! sees the same values. Startup defaults come from configuration and may be
//! replaced at runtime; a replaced default is written to a small JSON file so
//! it survives restarts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tutor_common::config::{FrontendConfig, PromptConfig};
use tutor_common::{Error, Result, ResultExt};
use tutor_store::StoreHandle;

/// Store key of the active system prompt.
pub const CURRENT_PROMPT_KEY: &str = "current_prompt";
/// Store key of the active subject.
pub const CURRENT_SUBJECT_KEY: &str = "current_subject";
/// Store hash of named saved prompts.
pub const SAVED_PROMPTS_KEY: &str = "prompts";

/// Prompt and subject in effect at one moment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptSnapshot {
    pub prompt: String,
    pub subject: String,
}

/// On-disk form of the runtime defaults.
#[derive(Debug, Default, Serialize, Deserialize)]
struct DefaultsFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subject: Option<String>,
}

/// Reads and writes the active prompt, subject, and saved prompts.
pub struct PromptStore {
    store: StoreHandle,
    defaults: RwLock<PromptSnapshot>,
    defaults_file: PathBuf,
    rebuild_command: Option<Vec<String>>,
}

impl PromptStore {
    /// Build from configuration, applying any defaults persisted by an
    /// earlier process.
    pub fn new(store: StoreHandle, config: &PromptConfig, frontend: &FrontendConfig) -> Self {
        let mut defaults = PromptSnapshot {
            prompt: config.default_prompt.clone(),
            subject: config.default_subject.clone(),
        };

        match read_defaults_file(&config.defaults_file) {
            Ok(Some(saved)) => {
                if let Some(prompt) = saved.prompt.filter(|p| !p.trim().is_empty()) {
                    defaults.prompt = prompt;
                }
                if let Some(subject) = saved.subject.filter(|s| !s.trim().is_empty()) {
                    defaults.subject = subject;
                }
                tracing::info!(path = %config.defaults_file.display(), "Loaded persisted prompt defaults");
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    path = %config.defaults_file.display(),
                    error = %e,
                    "Ignoring unreadable prompt defaults file"
                );
            }
        }

        Self {
            store,
            defaults: RwLock::new(defaults),
            defaults_file: config.defaults_file.clone(),
            rebuild_command: frontend.rebuild_command.clone(),
        }
    }

    /// Startup defaults currently in effect.
    pub fn defaults(&self) -> PromptSnapshot {
        self.defaults
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Active system prompt; the default when none is stored.
    pub async fn get_prompt(&self) -> String {
        match self.store.get(CURRENT_PROMPT_KEY).await {
            Some(prompt) if !prompt.is_empty() => prompt,
            _ => self.defaults().prompt,
        }
    }

    /// Active subject; the default when none is stored.
    pub async fn get_subject(&self) -> String {
        match self.store.get(CURRENT_SUBJECT_KEY).await {
            Some(subject) if !subject.is_empty() => subject,
            _ => self.defaults().subject,
        }
    }

    /// Prompt and subject used to seed a new session.
    pub async fn snapshot(&self) -> PromptSnapshot {
        PromptSnapshot {
            prompt: self.get_prompt().await,
            subject: self.get_subject().await,
        }
    }

    /// Make `text` the active prompt, and optionally the startup default.
    pub async fn set_prompt(&self, text: &str, make_default: bool) -> Result<String> {
        if text.trim().is_empty() {
            return Err(Error::InvalidInput("No prompt provided".into()));
        }

        // Persist before touching the in-process or stored copy
        if make_default {
            let mut defaults = self.defaults();
            defaults.prompt = text.to_string();
            self.persist_defaults(&defaults)
                .await
                .context("saving default prompt")?;
            *self.defaults.write().unwrap_or_else(PoisonError::into_inner) = defaults;
        }

        self.store.set(CURRENT_PROMPT_KEY, text).await;

        tracing::info!(chars = text.len(), make_default, "System prompt updated");
        Ok(text.to_string())
    }

    /// Make `text` the active subject and kick off the frontend rebuild.
    pub async fn set_subject(&self, text: &str) -> Result<String> {
        let subject = text.trim();
        if subject.is_empty() {
            return Err(Error::InvalidInput("No subject provided".into()));
        }

        self.store.set(CURRENT_SUBJECT_KEY, subject).await;
        tracing::info!(subject = %subject, "Subject updated");

        self.spawn_rebuild(subject);
        Ok(subject.to_string())
    }

    /// Save `text` under `name`, replacing any prompt with that name.
    pub async fn save_prompt(&self, name: &str, text: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::InvalidInput("Prompt name must not be empty".into()));
        }
        if text.trim().is_empty() {
            return Err(Error::InvalidInput("No prompt provided".into()));
        }

        self.store.hash_set(SAVED_PROMPTS_KEY, name, text).await;
        tracing::info!(name = %name, "Saved prompt");
        Ok(())
    }

    pub async fn get_saved_prompt(&self, name: &str) -> Option<String> {
        self.store.hash_get(SAVED_PROMPTS_KEY, name).await
    }

    /// All saved prompts, ordered by name.
    pub async fn list_saved_prompts(&self) -> BTreeMap<String, String> {
        self.store
            .hash_get_all(SAVED_PROMPTS_KEY)
            .await
            .into_iter()
            .collect()
    }

    /// Remove a saved prompt.
    pub async fn delete_prompt(&self, name: &str) -> Result<()> {
        match self.store.try_hash_delete(SAVED_PROMPTS_KEY, name).await {
            Ok(true) => {
                tracing::info!(name = %name, "Deleted saved prompt");
                Ok(())
            }
            Ok(false) => Err(Error::NotFound(format!("Prompt '{name}' not found"))),
            Err(e) => Err(Error::Storage(format!("could not delete prompt '{name}': {e}"))),
        }
    }

    async fn persist_defaults(&self, defaults: &PromptSnapshot) -> Result<()> {
        let file = DefaultsFile {
            prompt: Some(defaults.prompt.clone()),
            subject: Some(defaults.subject.clone()),
        };
        let content = serde_json::to_string_pretty(&file)?;

        if let Some(parent) = self.defaults_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.defaults_file.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.defaults_file).await?;

        tracing::debug!(path = %self.defaults_file.display(), "Persisted prompt defaults");
        Ok(())
    }

    /// Run the configured frontend rebuild in the background.
    fn spawn_rebuild(&self, subject: &str) {
        let Some((program, args)) = self
            .rebuild_command
            .as_deref()
            .and_then(|cmd| cmd.split_first())
        else {
            return;
        };

        let mut command = tokio::process::Command::new(program);
        command.args(args).env("TUTOR_SUBJECT", subject);
        let program = program.clone();

        tokio::spawn(async move {
            match command.output().await {
                Ok(output) if output.status.success() => {
                    tracing::info!(program = %program, "Frontend rebuild finished");
                }
                Ok(output) => {
                    tracing::warn!(
                        program = %program,
                        status = %output.status,
                        stderr = %String::from_utf8_lossy(&output.stderr),
                        "Frontend rebuild failed"
                    );
                }
                Err(e) => {
                    tracing::warn!(program = %program, error = %e, "Could not start frontend rebuild");
                }
            }
        });
    }
}

fn read_defaults_file(path: &Path) -> Result<Option<DefaultsFile>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&content)?))
}

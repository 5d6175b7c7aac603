//! Interactive chat with a persisted conversation context.
//!
//! The endpoint's terminal frame carries an opaque `context` token
//! array; keeping it in a local file lets consecutive `chat`
//! invocations continue one conversation. Context blobs are
//! model-specific, so a saved blob for a different model is discarded.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::{GenerateOptions, GenerationResult, OllamaClient};
use crate::error::Result;

/// Context file name, resolved in the working directory.
pub const CONTEXT_FILE: &str = ".medir_context.json";

#[derive(Debug, Serialize, Deserialize)]
struct ContextBlob {
    model: String,
    context: Vec<i64>,
}

/// Handle to the persisted conversation context.
pub struct ChatSession {
    path: PathBuf,
}

impl ChatSession {
    /// Session stored under `dir`.
    #[must_use]
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(CONTEXT_FILE),
        }
    }

    /// Session in the current working directory.
    #[must_use]
    pub fn open() -> Self {
        Self {
            path: PathBuf::from(CONTEXT_FILE),
        }
    }

    /// Saved context for `model`, if any. A missing, corrupt, or
    /// other-model blob yields `None`.
    #[must_use]
    pub fn load(&self, model: &str) -> Option<Vec<i64>> {
        let text = fs::read_to_string(&self.path).ok()?;
        let blob: ContextBlob = serde_json::from_str(&text).ok()?;
        if blob.model == model {
            Some(blob.context)
        } else {
            debug!(
                "discarding context saved for {} (requested {model})",
                blob.model
            );
            None
        }
    }

    fn save(&self, model: &str, context: &[i64]) -> Result<()> {
        let blob = ContextBlob {
            model: model.to_string(),
            context: context.to_vec(),
        };
        fs::write(&self.path, serde_json::to_vec(&blob)?)?;
        Ok(())
    }

    /// Drop the saved context.
    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    /// Send one turn, threading the saved context through the request
    /// and persisting the returned one.
    pub fn send(
        &self,
        client: &OllamaClient,
        model: &str,
        prompt: &str,
        options: &GenerateOptions,
        keep_alive: &str,
    ) -> Result<GenerationResult> {
        let context = self.load(model);
        let result =
            client.generate_stream(model, prompt, options, keep_alive, context.as_deref())?;
        if let Some(context) = &result.context {
            self.save(model, context)?;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let session = ChatSession::in_dir(dir.path());
        assert!(session.load("llama3.2:3b").is_none());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let session = ChatSession::in_dir(dir.path());
        session.save("llama3.2:3b", &[1, 2, 3]).unwrap();
        assert_eq!(session.load("llama3.2:3b"), Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_other_model_context_discarded() {
        let dir = TempDir::new().unwrap();
        let session = ChatSession::in_dir(dir.path());
        session.save("llama3.2:3b", &[1, 2, 3]).unwrap();
        assert!(session.load("gemma2:9b").is_none());
    }

    #[test]
    fn test_corrupt_blob_is_none() {
        let dir = TempDir::new().unwrap();
        let session = ChatSession::in_dir(dir.path());
        fs::write(dir.path().join(CONTEXT_FILE), "not json").unwrap();
        assert!(session.load("llama3.2:3b").is_none());
    }

    #[test]
    fn test_clear_removes_file() {
        let dir = TempDir::new().unwrap();
        let session = ChatSession::in_dir(dir.path());
        session.save("m", &[9]).unwrap();
        session.clear().unwrap();
        assert!(session.load("m").is_none());
        // Clearing twice is harmless.
        session.clear().unwrap();
    }
}

use crate::config::RetrySettings;
use crate::error::ProviderError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounded exponential backoff for provider calls, with one deadline over all attempts.
///
/// Only errors for which [`ProviderError::is_transient`] holds are retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub deadline: Duration,
}

impl RetryPolicy {
    pub fn for_embedding(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            initial_backoff: settings.initial_backoff,
            max_backoff: settings.max_backoff,
            deadline: settings.embedding_deadline,
        }
    }

    pub fn for_generation(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            initial_backoff: settings.initial_backoff,
            max_backoff: settings.max_backoff,
            deadline: settings.generation_deadline,
        }
    }

    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let attempts = async {
            let mut backoff = self.initial_backoff;
            let mut attempt = 1;
            loop {
                match call().await {
                    Ok(value) => return Ok(value),
                    Err(error) if error.is_transient() && attempt < max_attempts => {
                        warn!(
                            operation,
                            attempt,
                            backoff_ms = backoff.as_millis() as u64,
                            %error,
                            "transient provider failure, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(self.max_backoff);
                        attempt += 1;
                    }
                    Err(error) => return Err(error),
                }
            }
        };

        match tokio::time::timeout(self.deadline, attempts).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(format!(
                "{operation} gave no result within {:?}",
                self.deadline
            ))),
        }
    }
}

//! Knowledge source trait and implementations
//!
//! A knowledge source answers natural-language research prompts, optionally
//! with open-ended web search. Pipeline stages only see this trait, so tests
//! can substitute a deterministic stand-in.

use crate::error::HedgeError;
use crate::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;

/// Trait for research calls (LLM controlled)
#[async_trait]
pub trait KnowledgeSource: Send + Sync {
    /// Answer `prompt` under `instructions`; transport failures propagate unchanged.
    async fn ask(
        &self,
        prompt: &str,
        instructions: &str,
        allow_open_search: bool,
        max_output_tokens: u32,
    ) -> Result<String>;
}

/// One recorded call to a knowledge source
#[derive(Debug, Clone, PartialEq)]
pub struct KnowledgeRequest {
    pub prompt: String,
    pub instructions: String,
    pub allow_open_search: bool,
    pub max_output_tokens: u32,
}

type Responder = Box<dyn Fn(&KnowledgeRequest) -> Result<String> + Send + Sync>;
type Delay = Box<dyn Fn(&KnowledgeRequest) -> Option<Duration> + Send + Sync>;

enum Script {
    Queue(Mutex<VecDeque<Result<String>>>),
    Responder(Responder),
}

/// Deterministic knowledge source for development & testing.
///
/// Either replays queued responses in call order or answers through a
/// closure that inspects the request. Every call is recorded.
pub struct ScriptedKnowledgeSource {
    script: Script,
    delay: Option<Delay>,
    calls: Mutex<Vec<KnowledgeRequest>>,
}

impl ScriptedKnowledgeSource {
    /// Replay `responses` in order; running out is an `LlmError`.
    pub fn from_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_results(responses.into_iter().map(|r| Ok(r.into())))
    }

    /// Replay responses or failures in order.
    pub fn from_results<I>(results: I) -> Self
    where
        I: IntoIterator<Item = Result<String>>,
    {
        Self {
            script: Script::Queue(Mutex::new(results.into_iter().collect())),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Answer every call through `responder`.
    pub fn from_fn<F>(responder: F) -> Self
    where
        F: Fn(&KnowledgeRequest) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            script: Script::Responder(Box::new(responder)),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Hold back answers for which `delay` returns a duration.
    pub fn with_delay<F>(mut self, delay: F) -> Self
    where
        F: Fn(&KnowledgeRequest) -> Option<Duration> + Send + Sync + 'static,
    {
        self.delay = Some(Box::new(delay));
        self
    }

    pub async fn calls(&self) -> Vec<KnowledgeRequest> {
        self.calls.lock().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }
}

#[async_trait]
impl KnowledgeSource for ScriptedKnowledgeSource {
    async fn ask(
        &self,
        prompt: &str,
        instructions: &str,
        allow_open_search: bool,
        max_output_tokens: u32,
    ) -> Result<String> {
        let request = KnowledgeRequest {
            prompt: prompt.to_string(),
            instructions: instructions.to_string(),
            allow_open_search,
            max_output_tokens,
        };

        self.calls.lock().await.push(request.clone());

        if let Some(delay) = self.delay.as_ref().and_then(|d| d(&request)) {
            tokio::time::sleep(delay).await;
        }

        match &self.script {
            Script::Queue(queue) => queue.lock().await.pop_front().unwrap_or_else(|| {
                Err(HedgeError::LlmError(
                    "Scripted knowledge source exhausted".to_string(),
                ))
            }),
            Script::Responder(responder) => responder(&request),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_replays_in_order_then_fails() {
        let source = ScriptedKnowledgeSource::from_responses(["one", "two"]);

        assert_eq!(source.ask("p1", "sys", false, 10).await.unwrap(), "one");
        assert_eq!(source.ask("p2", "sys", true, 20).await.unwrap(), "two");
        assert!(matches!(
            source.ask("p3", "sys", false, 10).await,
            Err(HedgeError::LlmError(_))
        ));

        let calls = source.calls().await;
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1].prompt, "p2");
        assert!(calls[1].allow_open_search);
        assert_eq!(calls[1].max_output_tokens, 20);
    }

    #[test]
    fn test_responder_sees_request() {
        let source = ScriptedKnowledgeSource::from_fn(|req| {
            Ok(format!("echo:{}:{}", req.prompt, req.allow_open_search))
        });

        let answer = tokio_test::block_on(source.ask("hello", "", true, 1)).unwrap();
        assert_eq!(answer, "echo:hello:true");
    }

    #[tokio::test]
    async fn test_delay_holds_back_matching_requests() {
        let source = ScriptedKnowledgeSource::from_fn(|req| Ok(req.prompt.clone()))
            .with_delay(|req| (req.prompt == "slow").then(|| Duration::from_millis(40)));

        let (slow, fast) = tokio::join!(
            async {
                let answer = source.ask("slow", "", false, 1).await.unwrap();
                (answer, std::time::Instant::now())
            },
            async {
                let answer = source.ask("fast", "", false, 1).await.unwrap();
                (answer, std::time::Instant::now())
            }
        );

        assert_eq!(slow.0, "slow");
        assert_eq!(fast.0, "fast");
        assert!(fast.1 < slow.1);
    }

    #[tokio::test]
    async fn test_transport_errors_pass_through() {
        let source = ScriptedKnowledgeSource::from_results([Err(HedgeError::TransportError(
            "429 rate limited".to_string(),
        ))]);

        let err = source.ask("p", "", false, 1).await.unwrap_err();
        assert!(err.is_transport());
    }
}

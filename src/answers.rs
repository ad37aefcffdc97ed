//! Answers for free-text application questions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::anthropic::{AnthropicError, MessageSender, MessagesRequest};
use crate::state_machine::{AnswerCategory, CandidateProfile};

pub const DEFAULT_MODEL: &str = "claude-haiku-4-5-20251001";

const SYSTEM_PROMPT: &str = "You fill in job application forms on behalf of a candidate. \
Answer the question in the candidate's voice, in one or two sentences, using only the \
facts in the candidate context. If the context does not support an answer, reply with \
exactly UNKNOWN.";

#[derive(Debug, Error)]
pub enum AnswerError {
    #[error("no answer for question: {0}")]
    NoAnswer(String),

    #[error("answer generation failed: {0}")]
    Anthropic(#[from] AnthropicError),
}

#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    /// A non-empty answer, or an error. Callers treat blank strings as no answer.
    async fn answer_question(&self, question: &str, context: &str) -> Result<String, AnswerError>;
}

/// Looks up pre-written answers by question category.
pub struct ProfileAnswerer {
    answers: HashMap<AnswerCategory, String>,
}

impl ProfileAnswerer {
    pub fn new(profile: &CandidateProfile) -> Self {
        Self {
            answers: profile.answers.clone(),
        }
    }
}

#[async_trait]
impl AnswerGenerator for ProfileAnswerer {
    async fn answer_question(&self, question: &str, _context: &str) -> Result<String, AnswerError> {
        let category = AnswerCategory::infer(question);
        self.answers
            .get(&category)
            .map(|a| a.trim())
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .ok_or_else(|| AnswerError::NoAnswer(question.to_string()))
    }
}

/// Asks the Messages API.
pub struct LlmAnswerer<S: MessageSender> {
    sender: S,
    model: String,
    max_tokens: u32,
}

impl<S: MessageSender> LlmAnswerer<S> {
    pub fn new(sender: S, model: impl Into<String>) -> Self {
        Self {
            sender,
            model: model.into(),
            max_tokens: 300,
        }
    }
}

#[async_trait]
impl<S: MessageSender> AnswerGenerator for LlmAnswerer<S> {
    async fn answer_question(&self, question: &str, context: &str) -> Result<String, AnswerError> {
        let req = MessagesRequest::single(
            self.model.clone(),
            self.max_tokens,
            SYSTEM_PROMPT,
            format!("Candidate context:\n{context}\n\nQuestion: {question}"),
        );
        let answer = self.sender.send_message(&req).await?.text();
        if answer.is_empty() || answer.eq_ignore_ascii_case("unknown") {
            return Err(AnswerError::NoAnswer(question.to_string()));
        }
        Ok(answer)
    }
}

/// Tries each generator in order and returns the first non-empty answer.
pub struct ChainAnswerer {
    links: Vec<Arc<dyn AnswerGenerator>>,
}

impl ChainAnswerer {
    pub fn new(links: Vec<Arc<dyn AnswerGenerator>>) -> Self {
        Self { links }
    }
}

#[async_trait]
impl AnswerGenerator for ChainAnswerer {
    async fn answer_question(&self, question: &str, context: &str) -> Result<String, AnswerError> {
        let mut last = AnswerError::NoAnswer(question.to_string());
        for link in &self.links {
            match link.answer_question(question, context).await {
                Ok(a) if !a.trim().is_empty() => return Ok(a),
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "answer source gave up");
                    last = e;
                }
            }
        }
        Err(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anthropic::{ContentBlock, MessagesResponse, Usage};
    use crate::testing::profile;
    use parking_lot::Mutex;

    struct CannedSender {
        reply: Result<String, u16>,
        seen: Mutex<Vec<MessagesRequest>>,
    }

    impl CannedSender {
        fn new(reply: Result<&str, u16>) -> Self {
            Self {
                reply: reply.map(str::to_string),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl MessageSender for CannedSender {
        async fn send_message(&self, req: &MessagesRequest) -> Result<MessagesResponse, AnthropicError> {
            self.seen.lock().push(req.clone());
            match &self.reply {
                Ok(text) => Ok(MessagesResponse {
                    id: "msg_1".into(),
                    content: vec![ContentBlock {
                        content_type: "text".into(),
                        text: text.clone(),
                    }],
                    model: req.model.clone(),
                    stop_reason: Some("end_turn".into()),
                    usage: Usage {
                        input_tokens: 1,
                        output_tokens: 1,
                    },
                }),
                Err(status) => Err(AnthropicError::ApiError {
                    status: *status,
                    message: "boom".into(),
                }),
            }
        }
    }

    #[tokio::test]
    async fn profile_answers_by_category() {
        let answerer = ProfileAnswerer::new(&profile());
        let a = answerer
            .answer_question("Are you legally authorized to work here?", "")
            .await
            .unwrap();
        assert_eq!(a, "Yes");
        assert!(matches!(
            answerer.answer_question("Do you need sponsorship?", "").await,
            Err(AnswerError::NoAnswer(_))
        ));
    }

    #[tokio::test]
    async fn llm_answer_is_used_and_prompt_has_context() {
        let answerer = LlmAnswerer::new(CannedSender::new(Ok("  Five years.  ")), DEFAULT_MODEL);
        let a = answerer
            .answer_question("How many years of Rust?", "Candidate: Ada Lovelace.")
            .await
            .unwrap();
        assert_eq!(a, "Five years.");
        let seen = answerer.sender.seen.lock();
        assert_eq!(seen[0].model, DEFAULT_MODEL);
        assert!(seen[0].messages[0].content.contains("Ada Lovelace"));
        assert!(seen[0].system.is_some());
    }

    #[tokio::test]
    async fn llm_unknown_is_no_answer() {
        let answerer = LlmAnswerer::new(CannedSender::new(Ok("UNKNOWN")), DEFAULT_MODEL);
        assert!(matches!(
            answerer.answer_question("Favourite colour?", "").await,
            Err(AnswerError::NoAnswer(_))
        ));
    }

    #[tokio::test]
    async fn chain_falls_through_to_next_source() {
        let chain = ChainAnswerer::new(vec![
            Arc::new(ProfileAnswerer::new(&profile())),
            Arc::new(LlmAnswerer::new(CannedSender::new(Ok("No.")), DEFAULT_MODEL)),
        ]);
        let a = chain.answer_question("Do you need sponsorship?", "").await.unwrap();
        assert_eq!(a, "No.");
        let a = chain.answer_question("Are you authorized to work?", "").await.unwrap();
        assert_eq!(a, "Yes");
    }

    #[tokio::test]
    async fn chain_reports_last_error() {
        let chain = ChainAnswerer::new(vec![
            Arc::new(ProfileAnswerer::new(&profile())),
            Arc::new(LlmAnswerer::new(CannedSender::new(Err(500)), DEFAULT_MODEL)),
        ]);
        let err = chain.answer_question("Favourite colour?", "").await.unwrap_err();
        assert!(matches!(err, AnswerError::Anthropic(_)));

        let empty = ChainAnswerer::new(Vec::new());
        assert!(matches!(
            empty.answer_question("x", "").await,
            Err(AnswerError::NoAnswer(_))
        ));
    }
}

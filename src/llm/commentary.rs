use crate::config::ModelConfig;
use crate::error::VarianceError;
use crate::llm::client::ModelEndpoint;
use crate::llm::extractor::extract_structured_block;
use crate::llm::prompts::{build_correction_prompt, build_user_prompt, system_prompt};
use crate::llm::types::*;
use crate::llm::validator::validate_reply;
use crate::schema::{CommentaryOutcome, CommentaryRecord, EvidenceFact, EvidenceLabel, VarianceRecord};
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::mpsc::Sender;
use tokio::time::{sleep, timeout};

pub const EXHAUSTED_NARRATIVE: &str =
    "No verifiable explanation could be obtained from the model for this deviation.";
pub const UNREACHABLE_NARRATIVE: &str =
    "No verifiable explanation could be obtained because the model endpoint was unreachable.";

/// What one model call produced.
#[derive(Debug)]
pub enum ReplyOutcome {
    /// A structured block was found in `raw`.
    Parsed { raw: String, value: Value },
    /// The call returned, but nothing usable: no block, a timeout or a reply-level error.
    Invalid { raw: Option<String>, reason: String },
    /// The endpoint could not be reached after all connectivity retries.
    Unreachable(String),
}

#[derive(Debug)]
enum ProtocolState {
    Pending,
    Prompted { attempt: u32 },
    Parsed { attempt: u32, raw: String, value: Value },
    Validated { attempt: u32, reply: CommentaryReply },
    Terminal(CommentaryRecord),
}

/// Drives prompt, call, extraction, validation and retry for one account at a time.
///
/// Never fails: every failure path ends in an OPEN [`CommentaryRecord`] whose
/// `outcome` says why.
pub struct CommentaryProtocol<E: ModelEndpoint> {
    endpoint: E,
    config: ModelConfig,
    progress: Option<Sender<CommentaryEvent>>,
}

impl<E: ModelEndpoint> CommentaryProtocol<E> {
    pub fn new(endpoint: E, config: ModelConfig) -> Self {
        Self {
            endpoint,
            config,
            progress: None,
        }
    }

    /// Progress events are best effort. When the channel is full or closed the
    /// event is dropped and generation carries on.
    pub fn with_progress(mut self, progress: Sender<CommentaryEvent>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn endpoint(&self) -> &E {
        &self.endpoint
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub async fn generate_commentary(
        &self,
        record: &VarianceRecord,
        facts: &[EvidenceFact],
        mode: PromptMode,
    ) -> CommentaryRecord {
        let account_id = record.account_id.as_str();
        let max_attempts = self.config.schema_retries + 1;
        let mut request = GenerationRequest::new(
            system_prompt(mode),
            build_user_prompt(record, facts),
            self.config.temperature,
        );

        let mut state = ProtocolState::Pending;
        loop {
            state = match state {
                ProtocolState::Pending => {
                    self.send_event(CommentaryEvent::Starting {
                        account_id: account_id.to_string(),
                    })
                    .await;
                    ProtocolState::Prompted { attempt: 1 }
                }

                ProtocolState::Prompted { attempt } => {
                    self.send_event(CommentaryEvent::Prompted {
                        account_id: account_id.to_string(),
                        attempt,
                    })
                    .await;

                    let outcome = self.call_model(account_id, &request).await;
                    match outcome {
                        ReplyOutcome::Parsed { raw, value } => {
                            ProtocolState::Parsed { attempt, raw, value }
                        }
                        ReplyOutcome::Invalid { raw, reason } => {
                            self.after_failure(
                                account_id,
                                attempt,
                                max_attempts,
                                raw,
                                reason,
                                &mut request,
                            )
                            .await
                        }
                        ReplyOutcome::Unreachable(details) => {
                            warn!(
                                "Account {}: model unreachable on attempt {}: {}",
                                account_id, attempt, details
                            );
                            ProtocolState::Terminal(fallback_record(
                                account_id,
                                CommentaryOutcome::ModelUnreachable,
                                attempt,
                                details,
                            ))
                        }
                    }
                }

                ProtocolState::Parsed { attempt, raw, value } => {
                    self.send_event(CommentaryEvent::Parsed {
                        account_id: account_id.to_string(),
                        attempt,
                    })
                    .await;

                    match validate_reply(&value, facts, mode) {
                        Ok(reply) => ProtocolState::Validated { attempt, reply },
                        Err(e) => {
                            self.after_failure(
                                account_id,
                                attempt,
                                max_attempts,
                                Some(raw),
                                e.to_string(),
                                &mut request,
                            )
                            .await
                        }
                    }
                }

                ProtocolState::Validated { attempt, reply } => {
                    self.send_event(CommentaryEvent::Validated {
                        account_id: account_id.to_string(),
                        attempt,
                    })
                    .await;
                    info!(
                        "Account {}: commentary validated as {} on attempt {}",
                        account_id, reply.evidence_label, attempt
                    );
                    ProtocolState::Terminal(CommentaryRecord {
                        account_id: account_id.to_string(),
                        narrative_text: reply.narrative,
                        evidence_label: reply.evidence_label,
                        source_facts: reply.source_facts,
                        generation_attempt_count: attempt,
                        headline: reply.headline,
                        open_questions: reply.questions,
                        outcome: CommentaryOutcome::Validated,
                        last_failure: None,
                    })
                }

                ProtocolState::Terminal(record) => return record,
            };
        }
    }

    /// Either schedules a corrected attempt or gives up once the schema budget is spent.
    async fn after_failure(
        &self,
        account_id: &str,
        attempt: u32,
        max_attempts: u32,
        raw: Option<String>,
        reason: String,
        request: &mut GenerationRequest,
    ) -> ProtocolState {
        debug!(
            "Account {}: attempt {} rejected: {}",
            account_id, attempt, reason
        );

        if attempt >= max_attempts {
            self.send_event(CommentaryEvent::Exhausted {
                account_id: account_id.to_string(),
                attempts: attempt,
            })
            .await;
            warn!(
                "Account {}: {}",
                account_id,
                VarianceError::RetryExhausted {
                    attempts: attempt,
                    last_failure: reason.clone(),
                }
            );
            return ProtocolState::Terminal(fallback_record(
                account_id,
                CommentaryOutcome::RetryExhausted,
                attempt,
                reason,
            ));
        }

        self.send_event(CommentaryEvent::CorrectionNeeded {
            account_id: account_id.to_string(),
            attempt,
            reason: reason.clone(),
        })
        .await;

        // The model sees its own rejected reply followed by the reason.
        if let Some(raw) = raw {
            request.push(ChatMessage::assistant(raw));
            request.push(ChatMessage::user(build_correction_prompt(&reason)));
        }

        ProtocolState::Prompted {
            attempt: attempt + 1,
        }
    }

    /// One schema attempt. Connectivity failures are retried here with
    /// exponential backoff and never reach the schema budget.
    async fn call_model(&self, account_id: &str, request: &GenerationRequest) -> ReplyOutcome {
        let mut backoff = self.config.connect_backoff();
        let mut retry = 0;

        loop {
            let reply = timeout(self.config.request_timeout(), self.endpoint.generate(request)).await;

            match reply {
                Err(_) => {
                    return ReplyOutcome::Invalid {
                        raw: None,
                        reason: format!(
                            "model call timed out after {}s",
                            self.config.request_timeout_secs
                        ),
                    }
                }
                Ok(Ok(raw)) => {
                    return match extract_structured_block(&raw) {
                        Ok(value) => ReplyOutcome::Parsed { raw, value },
                        Err(e) => ReplyOutcome::Invalid {
                            raw: Some(raw),
                            reason: e.to_string(),
                        },
                    }
                }
                Ok(Err(e @ VarianceError::ModelUnreachable { .. })) => {
                    if retry >= self.config.connect_retries {
                        return ReplyOutcome::Unreachable(e.to_string());
                    }
                    retry += 1;
                    self.send_event(CommentaryEvent::Unreachable {
                        account_id: account_id.to_string(),
                        retry,
                        error: e.to_string(),
                    })
                    .await;
                    debug!(
                        "Account {}: {} unreachable, retry {} in {:?}",
                        account_id,
                        self.endpoint.describe(),
                        retry,
                        backoff
                    );
                    sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Ok(Err(e)) => {
                    return ReplyOutcome::Invalid {
                        raw: None,
                        reason: e.to_string(),
                    }
                }
            }
        }
    }

    async fn send_event(&self, event: CommentaryEvent) {
        if let Some(tx) = &self.progress {
            if let Err(e) = tx.try_send(event) {
                debug!("Progress event dropped: {}", e);
            }
        }
    }
}

fn fallback_record(
    account_id: &str,
    outcome: CommentaryOutcome,
    attempts: u32,
    reason: String,
) -> CommentaryRecord {
    let narrative = match outcome {
        CommentaryOutcome::ModelUnreachable => UNREACHABLE_NARRATIVE,
        _ => EXHAUSTED_NARRATIVE,
    };
    CommentaryRecord {
        account_id: account_id.to_string(),
        narrative_text: narrative.to_string(),
        evidence_label: EvidenceLabel::Open,
        source_facts: Vec::new(),
        generation_attempt_count: attempts,
        headline: None,
        open_questions: Vec::new(),
        outcome,
        last_failure: Some(reason),
    }
}

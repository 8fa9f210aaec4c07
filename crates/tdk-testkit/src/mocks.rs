//! Scripted doubles for the three external collaborators.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use tdk_email::{Mailer, SendOutcome};
use tdk_fetcher::{OracleError, OracleObservation, OracleQuery, TranscriptOracle};
use tdk_llm::{GenerateRequest, Generation, LanguageModel, ModelError, ModelRef, ProviderKind};

// ---------------------------------------------------------------------------
// Oracle
// ---------------------------------------------------------------------------

type OracleScript = VecDeque<Result<OracleObservation, ScriptedOracleError>>;

/// Cloneable error script entry (OracleError itself is not Clone).
#[derive(Debug, Clone)]
pub enum ScriptedOracleError {
    Transport,
    Http(u16),
}

impl ScriptedOracleError {
    fn materialise(&self) -> OracleError {
        match self {
            ScriptedOracleError::Transport => {
                OracleError::Transport("scripted transport failure".to_string())
            }
            ScriptedOracleError::Http(status) => OracleError::Http {
                status: *status,
                message: "scripted".to_string(),
            },
        }
    }
}

/// Oracle double: per-identifier scripts consumed in order; an exhausted or
/// absent script answers `none`. Every call is counted.
#[derive(Default)]
pub struct ScriptedOracle {
    scripts: Mutex<HashMap<String, OracleScript>>,
    calls: Mutex<Vec<OracleQuery>>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, identifier: &str, step: Result<OracleObservation, ScriptedOracleError>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(identifier.to_string())
            .or_default()
            .push_back(step);
    }

    pub fn push_available(&self, identifier: &str, source_url: &str) {
        self.push(
            identifier,
            Ok(OracleObservation::Available {
                source_url: source_url.to_string(),
                event_date: None,
            }),
        );
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, identifier: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|q| q.identifier == identifier)
            .count()
    }
}

#[async_trait::async_trait]
impl TranscriptOracle for ScriptedOracle {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn check(&self, query: &OracleQuery) -> Result<OracleObservation, OracleError> {
        self.calls.lock().unwrap().push(query.clone());
        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&query.identifier)
            .and_then(|s| s.pop_front());
        match step {
            Some(Ok(obs)) => Ok(obs),
            Some(Err(e)) => Err(e.materialise()),
            None => Ok(OracleObservation::None),
        }
    }
}

// ---------------------------------------------------------------------------
// Language model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum ScriptedModelError {
    Transient,
    Permanent,
}

/// Model double: scripted failures consumed first, then canned generations.
pub struct ScriptedModel {
    model_ref: ModelRef,
    failures: Mutex<VecDeque<ScriptedModelError>>,
    prompts: Mutex<Vec<String>>,
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedModel {
    pub fn new() -> Self {
        ScriptedModel {
            model_ref: ModelRef {
                provider: ProviderKind::OpenAiCompatible,
                model_id: "scripted-model".to_string(),
                revision: Some("r1".to_string()),
            },
            failures: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn push_failure(&self, failure: ScriptedModelError) {
        self.failures.lock().unwrap().push_back(failure);
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl LanguageModel for ScriptedModel {
    fn model_ref(&self) -> &ModelRef {
        &self.model_ref
    }

    async fn generate(&self, req: &GenerateRequest) -> Result<Generation, ModelError> {
        self.prompts.lock().unwrap().push(req.prompt.clone());
        if let Some(failure) = self.failures.lock().unwrap().pop_front() {
            return Err(match failure {
                ScriptedModelError::Transient => ModelError::Http {
                    status: 503,
                    message: "scripted overload".to_string(),
                },
                ScriptedModelError::Permanent => {
                    ModelError::Config("scripted invalid prompt".to_string())
                }
            });
        }
        Ok(Generation {
            output_text: format!("Scripted summary ({} input chars).", req.input_text.len()),
            tokens_in: (req.input_text.len() / 4) as i64,
            tokens_out: 64,
            cost_microusd: 42,
        })
    }
}

// ---------------------------------------------------------------------------
// Mailer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SentEmail {
    pub to: String,
    pub subject: String,
}

/// Mailer double: scripted outcomes consumed first, then every send
/// succeeds. Successful sends are recorded.
#[derive(Default)]
pub struct RecordingMailer {
    outcomes: Mutex<VecDeque<SendOutcome>>,
    sent: Mutex<Vec<SentEmail>>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_outcome(&self, outcome: SendOutcome) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, to: &str, subject: &str, _body_html: &str) -> SendOutcome {
        if let Some(outcome) = self.outcomes.lock().unwrap().pop_front() {
            return outcome;
        }
        self.sent.lock().unwrap().push(SentEmail {
            to: to.to_string(),
            subject: subject.to_string(),
        });
        SendOutcome::Sent
    }
}

//! Post-message classifier
//!
//! One structured model call labels the message that just closed a routed
//! turn, followed by deterministic guards: an authorization verdict needs both
//! a link and an explicit request in the text, and a failure needs a reason.

use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::conversation::ConversationLog;
use crate::llm::{LanguageModel, ObjectRequest};
use crate::providers::ChatMessage;
use crate::team::{ModelArgs, Team};
use crate::types::{AnalysisFlag, MetaData};

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"'`)\]]+"#).expect("valid URL regex"));

static AUTH_TERM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b((re-?)?authori[sz](e|es|ed|ing|ation)|authenticat(e|es|ed|ing|ion)|sign(ed|ing)?[\s-]?in|log(ged|ging)?[\s-]?in|oauth|grant(ed|ing)?\s+access|connect(ed|ing)?\s+your\s+\w*\s*account)\b",
    )
    .expect("valid auth term regex")
});

// An auth verb that opens a sentence, or follows a directive like "please",
// "click here to" or "you need to".
static AUTH_DIRECTIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:(?:^|[.!?:;\n])\s*(?:please\s+|kindly\s+)?|\b(?:please|kindly|click|tap|follow|open|visit|use|need\s+you\s+to|you\s+(?:will\s+|'ll\s+)?(?:need|have|must)\s+to|you\s+must|required\s+to)\b[^.!?\n]{0,60}?)\b(?:(?:re-?)?authori[sz]e|authenticate|sign[\s-]?in|log[\s-]?in|grant\s+access|connect\s+your\s+\w*\s*account)\b",
    )
    .expect("valid auth directive regex")
});

/// Classifier outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Pass,
    Fail,
    Complete,
    Analysis,
    AuthUrl,
    InfoRequest,
}

impl Verdict {
    pub const ALL: [Verdict; 6] = [
        Self::Pass,
        Self::Fail,
        Self::Complete,
        Self::Analysis,
        Self::AuthUrl,
        Self::InfoRequest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Complete => "COMPLETE",
            Self::Analysis => "ANALYSIS",
            Self::AuthUrl => "AUTH_URL",
            Self::InfoRequest => "INFO_REQUEST",
        }
    }

    /// Lenient parse of model output; `None` for anything unrecognised
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_uppercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "AUTHURL" => Some(Self::AuthUrl),
            "INFOREQUEST" => Some(Self::InfoRequest),
            other => Self::ALL.into_iter().find(|v| v.as_str() == other),
        }
    }
}

impl From<Verdict> for AnalysisFlag {
    fn from(v: Verdict) -> Self {
        match v {
            Verdict::Pass => Self::Pass,
            Verdict::Fail => Self::Fail,
            Verdict::Complete => Self::Complete,
            Verdict::Analysis => Self::Analysis,
            Verdict::AuthUrl => Self::AuthUrl,
            Verdict::InfoRequest => Self::InfoRequest,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub result: Verdict,
    pub memory_worthy: bool,
    pub reason: String,
    #[serde(default)]
    pub meta_data: MetaData,
}

/// What the model sends back, before validation
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawClassification {
    #[serde(default)]
    result: String,
    #[serde(default, alias = "memory_worthy")]
    memory_worthy: bool,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default, alias = "meta_data")]
    meta_data: Option<RawMetaData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMetaData {
    #[serde(default, alias = "auth_url")]
    auth_url: Option<String>,
    #[serde(default)]
    platform: Option<String>,
}

const CLASSIFIER_PROMPT: &str = "\
You review the latest message produced by an AI agent team and decide what should happen next.

Choose exactly one result:
- PASS: ordinary conversation, acknowledgements, short exchanges, or anything that needs no action. This is the default.
- FAIL: the agent clearly failed its task. You must give the reason.
- COMPLETE: the requested work is finished.
- ANALYSIS: the work needs further multi-step reasoning or review before it is done.
- INFO_REQUEST: the agent is asking the user for discrete pieces of structured data (names, dates, amounts, choices).
- AUTH_URL: only when the message contains an explicit URL AND explicitly asks the user to authorize, sign in or grant access through it. Put that URL in metaData.authUrl.

Set memoryWorthy to true only when the exchange contains durable facts or decisions worth remembering.";

/// JSON Schema of the classifier's answer
pub fn classification_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "result": {
                "type": "string",
                "enum": Verdict::ALL.iter().map(|v| v.as_str()).collect::<Vec<_>>(),
            },
            "memoryWorthy": { "type": "boolean" },
            "reason": { "type": "string" },
            "metaData": {
                "type": "object",
                "properties": {
                    "authUrl": { "type": "string" },
                    "platform": { "type": "string" }
                }
            }
        },
        "required": ["result", "memoryWorthy", "reason"]
    })
}

pub struct PostMessageClassifier {
    llm: Arc<dyn LanguageModel>,
    model: ModelArgs,
}

impl PostMessageClassifier {
    pub fn new(llm: Arc<dyn LanguageModel>, model: ModelArgs) -> Self {
        Self { llm, model }
    }

    pub async fn classify(
        &self,
        message: &str,
        history: &ConversationLog,
        team: &Team,
    ) -> Result<Classification> {
        let mut prompt = String::new();
        prompt.push_str(&format!("TEAM: {}\n", team.name));
        if !team.objectives.is_empty() {
            prompt.push_str(&format!("OBJECTIVES: {}\n", team.objectives));
        }
        if !history.is_empty() {
            prompt.push_str("\nCONVERSATION:\n");
            prompt.push_str(&history.transcript());
        }
        prompt.push_str("\nMESSAGE TO CLASSIFY:\n");
        prompt.push_str(message);

        let schema = classification_schema();
        let messages = [ChatMessage::user(prompt)];
        let value = self
            .llm
            .complete_object(ObjectRequest {
                system: CLASSIFIER_PROMPT,
                messages: &messages,
                schema: &schema,
                model: &self.model,
            })
            .await?;

        let raw: RawClassification =
            serde_json::from_value(value).context("Classifier returned an unexpected shape")?;
        let classification = apply_guards(raw, message);
        info!(
            "Classified message as {} (memory_worthy={})",
            classification.result.as_str(),
            classification.memory_worthy
        );
        Ok(classification)
    }
}

fn apply_guards(raw: RawClassification, message: &str) -> Classification {
    let mut result = Verdict::parse(&raw.result).unwrap_or_else(|| {
        debug!("Unrecognised classifier result {:?}, treating as PASS", raw.result);
        Verdict::Pass
    });
    let reason = raw.reason.unwrap_or_default().trim().to_string();
    let raw_meta = raw.meta_data.unwrap_or_default();
    let mut meta_data = MetaData {
        auth_url: None,
        platform: raw_meta.platform.filter(|p| !p.trim().is_empty()),
    };

    // a link plus a directive to authenticate is always AUTH_URL; a login word
    // in passing never upgrades another verdict
    match find_url(message) {
        Some(url) if is_auth_request(message) => {
            if result != Verdict::AuthUrl {
                debug!(
                    "Message asks the user to authenticate; overriding {} with AUTH_URL",
                    result.as_str()
                );
                result = Verdict::AuthUrl;
            }
            meta_data.auth_url = Some(pick_auth_url(raw_meta.auth_url, url, message));
        }
        Some(url) if result == Verdict::AuthUrl && mentions_auth(message) => {
            meta_data.auth_url = Some(pick_auth_url(raw_meta.auth_url, url, message));
        }
        _ if result == Verdict::AuthUrl => {
            warn!("AUTH_URL without both a link and an auth request; downgrading to PASS");
            result = Verdict::Pass;
        }
        _ => {}
    }

    if result == Verdict::Fail && reason.is_empty() {
        warn!("FAIL without a reason; downgrading to PASS");
        result = Verdict::Pass;
    }
    if result != Verdict::AuthUrl {
        meta_data.platform = None;
    }

    Classification {
        result,
        memory_worthy: raw.memory_worthy,
        reason,
        meta_data,
    }
}

/// The model's URL is kept only when it actually appears in the message
fn pick_auth_url(from_model: Option<String>, found: String, message: &str) -> String {
    from_model
        .filter(|u| !u.is_empty() && message.contains(u.as_str()))
        .unwrap_or(found)
}

/// First well-formed http(s) URL in `text`
pub fn find_url(text: &str) -> Option<String> {
    URL_RE
        .find_iter(text)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?']))
        .find(|candidate| url::Url::parse(candidate).is_ok_and(|u| u.host().is_some()))
        .map(str::to_string)
}

/// Whether `text` talks about authentication at all. Words inside URLs do
/// not count.
pub fn mentions_auth(text: &str) -> bool {
    AUTH_TERM_RE.is_match(&URL_RE.replace_all(text, " "))
}

/// Whether `text` explicitly asks the reader to authenticate. Words inside
/// URLs do not count.
pub fn is_auth_request(text: &str) -> bool {
    AUTH_DIRECTIVE_RE.is_match(&URL_RE.replace_all(text, " "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedModel, model, sample_team};

    fn raw(result: &str) -> RawClassification {
        RawClassification {
            result: result.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_verdict_parse() {
        assert_eq!(Verdict::parse("pass"), Some(Verdict::Pass));
        assert_eq!(Verdict::parse(" AUTH_URL "), Some(Verdict::AuthUrl));
        assert_eq!(Verdict::parse("info-request"), Some(Verdict::InfoRequest));
        assert_eq!(Verdict::parse("AuthUrl"), Some(Verdict::AuthUrl));
        assert_eq!(Verdict::parse("CONTINUE"), None);
    }

    #[test]
    fn test_find_url() {
        assert_eq!(
            find_url("Click here to authorize: https://oauth.example.com/auth."),
            Some("https://oauth.example.com/auth".to_string())
        );
        assert_eq!(find_url("no links here"), None);
        assert_eq!(find_url("broken http:// link"), None);
    }

    #[test]
    fn test_is_auth_request() {
        assert!(is_auth_request("Please authorize your Google account"));
        assert!(is_auth_request("You need to sign in first"));
        assert!(is_auth_request("Log-in to continue"));
        assert!(is_auth_request("Done. Sign in with your work account"));
        assert!(!is_auth_request("Here is the report"));
        assert!(!is_auth_request("The new login page is deployed and sign-in now works"));
        assert!(!is_auth_request("I could not finish the OAuth integration"));
        // auth words inside a URL are not a request
        assert!(!is_auth_request("Docs: https://oauth.example.com/login"));
    }

    #[test]
    fn test_mentions_auth_accepts_inflections() {
        assert!(mentions_auth("Once you have authorized the app we can continue"));
        assert!(mentions_auth("Authenticating took a while"));
        assert!(mentions_auth("The token was re-authorised yesterday"));
        assert!(mentions_auth("We are still logging in"));
        assert!(!mentions_auth("The authors reviewed it"));
    }

    #[test]
    fn test_auth_request_without_url_is_never_auth_url() {
        let c = apply_guards(raw("AUTH_URL"), "Please authorize your Google account to continue.");
        assert_eq!(c.result, Verdict::Pass);
        assert!(c.meta_data.auth_url.is_none());
    }

    #[test]
    fn test_auth_url_kept_with_link_and_request() {
        let c = apply_guards(raw("AUTH_URL"), "Click here to authorize: https://oauth.example.com/auth");
        assert_eq!(c.result, Verdict::AuthUrl);
        assert_eq!(
            c.meta_data.auth_url.as_deref(),
            Some("https://oauth.example.com/auth")
        );
    }

    #[test]
    fn test_login_mention_with_link_keeps_model_verdict() {
        let mut done = raw("COMPLETE");
        done.reason = Some("task finished".to_string());
        let c = apply_guards(
            done,
            "Done: the new login page is deployed at https://app.example.com/account and sign-in now works.",
        );
        assert_eq!(c.result, Verdict::Complete);
        assert!(c.meta_data.auth_url.is_none());

        let mut failed = raw("FAIL");
        failed.reason = Some("integration unfinished".to_string());
        let c = apply_guards(
            failed,
            "I could not finish the OAuth integration; the docs at https://docs.example.com did not help.",
        );
        assert_eq!(c.result, Verdict::Fail);
        assert_eq!(c.reason, "integration unfinished");
    }

    #[test]
    fn test_link_with_explicit_request_is_always_auth_url() {
        let message = "Click here to authorize: https://oauth.example.com/auth";
        for model_said in ["PASS", "COMPLETE", "INFO_REQUEST", "garbage"] {
            let c = apply_guards(raw(model_said), message);
            assert_eq!(c.result, Verdict::AuthUrl, "model said {}", model_said);
            assert_eq!(
                c.meta_data.auth_url.as_deref(),
                Some("https://oauth.example.com/auth")
            );
        }
    }

    #[test]
    fn test_model_auth_url_kept_for_softer_phrasing() {
        let c = apply_guards(
            raw("AUTH_URL"),
            "Your Drive access expired, so the sheet needs re-authorization at https://accounts.example.com/drive",
        );
        assert_eq!(c.result, Verdict::AuthUrl);
        assert_eq!(
            c.meta_data.auth_url.as_deref(),
            Some("https://accounts.example.com/drive")
        );
    }

    #[test]
    fn test_model_url_not_in_message_is_replaced() {
        let mut r = raw("AUTH_URL");
        r.meta_data = Some(RawMetaData {
            auth_url: Some("https://evil.example.com".to_string()),
            platform: Some("google".to_string()),
        });
        let c = apply_guards(r, "Sign in at https://accounts.example.com/o/auth to continue");
        assert_eq!(
            c.meta_data.auth_url.as_deref(),
            Some("https://accounts.example.com/o/auth")
        );
        assert_eq!(c.meta_data.platform.as_deref(), Some("google"));
    }

    #[test]
    fn test_fail_requires_reason() {
        let c = apply_guards(raw("FAIL"), "I could not do it");
        assert_eq!(c.result, Verdict::Pass);

        let mut r = raw("FAIL");
        r.reason = Some("missing the customer list".to_string());
        let c = apply_guards(r, "I could not do it");
        assert_eq!(c.result, Verdict::Fail);
        assert_eq!(c.reason, "missing the customer list");
    }

    #[test]
    fn test_unknown_result_defaults_to_pass() {
        assert_eq!(apply_guards(raw("MAYBE"), "hi").result, Verdict::Pass);
        assert_eq!(apply_guards(raw(""), "hi").result, Verdict::Pass);
    }

    #[tokio::test]
    async fn test_classify_calls_model_with_schema() {
        let llm = Arc::new(ScriptedModel::new().object(json!({
            "result": "COMPLETE",
            "memory_worthy": true,
            "reason": "draft delivered"
        })));
        let classifier = PostMessageClassifier::new(llm.clone(), model());
        let mut log = ConversationLog::new();
        log.append_turn("Critic", "review", "approved");

        let c = classifier
            .classify("Here is the final draft.", &log, &sample_team())
            .await
            .unwrap();
        assert_eq!(c.result, Verdict::Complete);
        assert!(c.memory_worthy);

        let call = &llm.object_calls()[0];
        assert!(call.input.contains("MESSAGE TO CLASSIFY:\nHere is the final draft."));
        assert!(call.input.contains("[Critic] approved"));
        assert_eq!(call.schema.as_ref().unwrap()["required"][0], "result");
    }

    #[tokio::test]
    async fn test_classify_propagates_model_errors() {
        let llm = Arc::new(ScriptedModel::new().object_error("Overloaded"));
        let classifier = PostMessageClassifier::new(llm, model());
        let err = classifier
            .classify("hi", &ConversationLog::new(), &sample_team())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Overloaded"));
    }
}

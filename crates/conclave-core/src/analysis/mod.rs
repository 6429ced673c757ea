//! Post-message analysis: classification and the follow-up actions it drives

pub mod amend;
pub mod classifier;
pub mod forms;
pub mod memory;
pub mod notes;
pub mod orchestrator;
pub mod retry;

pub use amend::{AmendmentOutcome, AppliedAmendment, PromptAmender, PromptAmendment, apply_amendments};
pub use classifier::{Classification, PostMessageClassifier, Verdict, classification_schema};
pub use forms::{FieldType, FormCreator, FormField, FormSchema, LlmFormCreator};
pub use memory::{MemoryStore, NoteStore};
pub use notes::{NO_NOTES, NoteTaker};
pub use orchestrator::{
    AnalysisConfig, FormRequest, PENDING_FORM_CONTEXT, PostMessageAnalysis, PostMessageOrchestrator,
};
pub use retry::{RetryPolicy, RetryPrompter};

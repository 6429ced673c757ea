//! Form synthesis for INFO_REQUEST messages
//!
//! When an agent asks the user for structured data, a form creator turns the
//! request text into a named schema the front end can render.

use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::llm::{LanguageModel, ObjectRequest, complete_typed};
use crate::providers::ChatMessage;
use crate::team::ModelArgs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Null,
    Undefined,
    Date,
    Enum,
    File,
}

impl FieldType {
    pub const ALL: [FieldType; 10] = [
        Self::String,
        Self::Number,
        Self::Boolean,
        Self::Object,
        Self::Array,
        Self::Null,
        Self::Undefined,
        Self::Date,
        Self::Enum,
        Self::File,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Null => "null",
            Self::Undefined => "undefined",
            Self::Date => "date",
            Self::Enum => "enum",
            Self::File => "file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormField {
    pub key: String,
    pub value_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormSchema {
    pub form_name: String,
    #[serde(rename = "schema", alias = "fields")]
    pub fields: Vec<FormField>,
}

impl FormSchema {
    /// Reject forms the front end could not render
    pub fn validate(&self) -> Result<()> {
        if self.form_name.trim().is_empty() {
            bail!("form has no name");
        }
        if self.fields.is_empty() {
            bail!("form '{}' has no fields", self.form_name);
        }
        let mut keys: Vec<&str> = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            if field.key.trim().is_empty() {
                bail!("form '{}' has a field without a key", self.form_name);
            }
            if keys.contains(&field.key.as_str()) {
                bail!("form '{}' repeats field '{}'", self.form_name, field.key);
            }
            keys.push(&field.key);
            if field.value_type == FieldType::Enum
                && field.enum_values.as_ref().is_none_or(|v| v.is_empty())
            {
                bail!("enum field '{}' has no values", field.key);
            }
        }
        Ok(())
    }
}

/// Turns an agent's request text into a form
#[async_trait]
pub trait FormCreator: Send + Sync {
    async fn create_form(&self, request_message: &str) -> Result<FormSchema>;
}

const FORM_PROMPT: &str = "\
You design input forms. Read the message in which an AI agent asks the user for information \
and produce a form that collects exactly the requested items. Use short camelCase keys, pick \
the most specific valueType, list enumValues for enum fields, and group related fields.";

fn form_schema_json() -> Value {
    json!({
        "type": "object",
        "properties": {
            "formName": { "type": "string" },
            "schema": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "key": { "type": "string" },
                        "valueType": {
                            "type": "string",
                            "enum": FieldType::ALL.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
                        },
                        "enumValues": { "type": "array", "items": { "type": "string" } },
                        "description": { "type": "string" },
                        "group": { "type": "string" }
                    },
                    "required": ["key", "valueType"]
                }
            }
        },
        "required": ["formName", "schema"]
    })
}

/// Form creator backed by a structured model call
pub struct LlmFormCreator {
    llm: Arc<dyn LanguageModel>,
    model: ModelArgs,
}

impl LlmFormCreator {
    pub fn new(llm: Arc<dyn LanguageModel>, model: ModelArgs) -> Self {
        Self { llm, model }
    }
}

#[async_trait]
impl FormCreator for LlmFormCreator {
    async fn create_form(&self, request_message: &str) -> Result<FormSchema> {
        let schema = form_schema_json();
        let messages = [ChatMessage::user(request_message)];
        debug!("Synthesising form for {} char request", request_message.len());

        let form: FormSchema = complete_typed(
            self.llm.as_ref(),
            ObjectRequest {
                system: FORM_PROMPT,
                messages: &messages,
                schema: &schema,
                model: &self.model,
            },
        )
        .await?;
        form.validate()?;

        info!("Created form '{}' with {} fields", form.form_name, form.fields.len());
        Ok(form)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedModel, model};

    fn field(key: &str, value_type: FieldType) -> FormField {
        FormField {
            key: key.to_string(),
            value_type,
            enum_values: None,
            description: None,
            group: None,
        }
    }

    #[test]
    fn test_form_wire_format() {
        let form: FormSchema = serde_json::from_value(json!({
            "formName": "Launch details",
            "schema": [
                {"key": "launchDate", "valueType": "date", "group": "timing"},
                {"key": "tier", "valueType": "enum", "enumValues": ["free", "pro"]}
            ]
        }))
        .unwrap();
        assert_eq!(form.fields.len(), 2);
        assert_eq!(form.fields[0].value_type, FieldType::Date);
        assert!(form.validate().is_ok());

        let back = serde_json::to_value(&form).unwrap();
        assert_eq!(back["schema"][1]["enumValues"][1], "pro");
        assert!(back["schema"][0].get("enumValues").is_none());
    }

    #[test]
    fn test_validate_rejects_bad_forms() {
        let empty = FormSchema {
            form_name: "x".to_string(),
            fields: vec![],
        };
        assert!(empty.validate().is_err());

        let dup = FormSchema {
            form_name: "x".to_string(),
            fields: vec![field("a", FieldType::String), field("a", FieldType::Number)],
        };
        assert!(dup.validate().is_err());

        let bare_enum = FormSchema {
            form_name: "x".to_string(),
            fields: vec![field("tier", FieldType::Enum)],
        };
        assert!(bare_enum.validate().is_err());
    }

    #[tokio::test]
    async fn test_llm_form_creator() {
        let llm = Arc::new(ScriptedModel::new().object(json!({
            "formName": "Contact",
            "schema": [{"key": "email", "valueType": "string", "description": "Work email"}]
        })));
        let creator = LlmFormCreator::new(llm.clone(), model());
        let form = creator.create_form("What's your work email?").await.unwrap();
        assert_eq!(form.form_name, "Contact");
        assert_eq!(form.fields[0].description.as_deref(), Some("Work email"));
        assert_eq!(llm.object_calls()[0].input, "What's your work email?");
    }

    #[tokio::test]
    async fn test_llm_form_creator_rejects_invalid_output() {
        let llm = Arc::new(ScriptedModel::new().object(json!({"formName": "Empty", "schema": []})));
        let creator = LlmFormCreator::new(llm, model());
        assert!(creator.create_form("anything").await.is_err());
    }
}

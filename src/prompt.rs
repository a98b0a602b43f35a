//! Instruction prompt formatting
//!
//! Turns an instruction/context/response record into a single text blob:
//! intro blurb, instruction block, optional input block, response block and
//! end marker, joined by blank lines.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Separator placed between prompt sections
pub const SECTION_SEPARATOR: &str = "\n\n";

/// A single instruction-tuning record as it comes out of the dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Task instruction
    pub instruction: String,
    /// Optional supporting context, empty when absent
    #[serde(default)]
    pub context: String,
    /// Expected response
    pub response: String,
    /// Dataset category label, carried but unused
    #[serde(default)]
    pub category: String,
}

impl RawRecord {
    /// Create a record without a category
    pub fn new(
        instruction: impl Into<String>,
        context: impl Into<String>,
        response: impl Into<String>,
    ) -> Self {
        Self {
            instruction: instruction.into(),
            context: context.into(),
            response: response.into(),
            category: String::new(),
        }
    }

    /// Build a record from a JSON object.
    ///
    /// `instruction` and `response` are mandatory. A missing or null
    /// `context`/`category` is read as empty.
    pub fn from_value(index: usize, value: &Value) -> Result<Self> {
        let object = value.as_object().ok_or_else(|| {
            Error::invalid_input(format!("record {} is not a JSON object", index))
        })?;

        let required = |field: &'static str| -> Result<String> {
            match object.get(field) {
                None | Some(Value::Null) => Err(Error::MissingField { field, index }),
                Some(Value::String(s)) => Ok(s.clone()),
                Some(other) => Err(Error::invalid_input(format!(
                    "record {}: field '{}' must be text, got {}",
                    index, field, other
                ))),
            }
        };
        let optional = |field: &'static str| -> Result<String> {
            match object.get(field) {
                None | Some(Value::Null) => Ok(String::new()),
                Some(Value::String(s)) => Ok(s.clone()),
                Some(other) => Err(Error::invalid_input(format!(
                    "record {}: field '{}' must be text, got {}",
                    index, field, other
                ))),
            }
        };

        Ok(Self {
            instruction: required("instruction")?,
            context: optional("context")?,
            response: required("response")?,
            category: optional("category")?,
        })
    }

    /// Whether the record carries an input block
    pub fn has_context(&self) -> bool {
        !self.context.is_empty()
    }
}

/// A raw record together with its rendered prompt text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattedRecord {
    /// Source record
    #[serde(flatten)]
    pub record: RawRecord,
    /// Rendered prompt
    pub text: String,
}

/// Fixed section labels of the instruction prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    /// Task description placed first
    pub intro_blurb: &'static str,
    /// Label line of the instruction block
    pub instruction_key: &'static str,
    /// Label line of the optional input block
    pub input_key: &'static str,
    /// Label line of the response block
    pub response_key: &'static str,
    /// Sentinel closing the prompt
    pub end_key: &'static str,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self::DOLLY
    }
}

impl PromptTemplate {
    /// Template used for databricks-dolly style instruction data
    pub const DOLLY: PromptTemplate = PromptTemplate {
        intro_blurb: "Below is an instruction that describes a task. \
                      Write a response that appropriately completes the request.",
        instruction_key: "### Instruction:",
        input_key: "Input:",
        response_key: "### Response:",
        end_key: "### End",
    };

    /// Render the prompt sections for a record, in order
    pub fn sections(&self, record: &RawRecord) -> Vec<String> {
        let mut sections = Vec::with_capacity(5);
        sections.push(self.intro_blurb.to_string());
        sections.push(format!("{}\n{}", self.instruction_key, record.instruction));
        if record.has_context() {
            sections.push(format!("{}\n{}", self.input_key, record.context));
        }
        sections.push(format!("{}\n{}", self.response_key, record.response));
        sections.push(self.end_key.to_string());
        sections
    }

    /// Render a record into its full prompt text
    pub fn render(&self, record: &RawRecord) -> String {
        self.sections(record).join(SECTION_SEPARATOR)
    }

    /// Attach the rendered prompt to a record
    pub fn format(&self, record: RawRecord) -> FormattedRecord {
        let text = self.render(&record);
        FormattedRecord { record, text }
    }
}

/// Format a record with the default template
pub fn format_prompt(record: RawRecord) -> FormattedRecord {
    PromptTemplate::DOLLY.format(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_format_with_context() {
        let formatted = format_prompt(RawRecord::new(
            "Summarize the text.",
            "Rust is a systems language.",
            "Rust targets systems work.",
        ));

        let expected = "Below is an instruction that describes a task. Write a response that appropriately completes the request.\n\n\
                        ### Instruction:\nSummarize the text.\n\n\
                        Input:\nRust is a systems language.\n\n\
                        ### Response:\nRust targets systems work.\n\n\
                        ### End";
        assert_eq!(formatted.text, expected);
    }

    #[test]
    fn test_format_without_context_omits_input_block() {
        let formatted = format_prompt(RawRecord::new("Who wrote Dune?", "", "Frank Herbert."));

        assert!(!formatted.text.contains("Input:"));
        assert_eq!(formatted.text.split(SECTION_SEPARATOR).count(), 4);
        assert!(formatted.text.ends_with("### End"));
    }

    #[test]
    fn test_from_value_reads_dolly_record() {
        let value = json!({
            "instruction": "When did Virgin Australia start operating?",
            "context": "Virgin Australia commenced services on 31 August 2000.",
            "response": "31 August 2000.",
            "category": "closed_qa"
        });

        let record = RawRecord::from_value(0, &value).unwrap();
        assert_eq!(record.category, "closed_qa");
        assert!(record.has_context());
    }

    #[test]
    fn test_from_value_null_context_is_empty() {
        let value = json!({"instruction": "a", "context": null, "response": "b"});
        let record = RawRecord::from_value(3, &value).unwrap();
        assert!(!record.has_context());
        assert_eq!(record.category, "");
    }

    #[test]
    fn test_from_value_missing_response() {
        let value = json!({"instruction": "a", "context": ""});
        let err = RawRecord::from_value(7, &value).unwrap_err();
        match err {
            Error::MissingField { field, index } => {
                assert_eq!(field, "response");
                assert_eq!(index, 7);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_from_value_non_text_field() {
        let value = json!({"instruction": 12, "response": "b"});
        assert!(matches!(
            RawRecord::from_value(0, &value),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_formatted_record_serializes_flat() {
        let formatted = format_prompt(RawRecord::new("a", "", "b"));
        let value = serde_json::to_value(&formatted).unwrap();
        assert_eq!(value["instruction"], "a");
        assert!(value["text"].as_str().unwrap().starts_with("Below is"));
    }

    fn field() -> impl Strategy<Value = String> {
        "[A-Za-z0-9 ,.?]{1,40}"
    }

    proptest! {
        #[test]
        fn prop_section_count_follows_context(
            instruction in field(),
            context in proptest::option::of(field()),
            response in field(),
        ) {
            let has_context = context.is_some();
            let record = RawRecord::new(instruction, context.unwrap_or_default(), response);
            let text = format_prompt(record).text;
            let sections: Vec<&str> = text.split(SECTION_SEPARATOR).collect();

            if has_context {
                prop_assert_eq!(sections.len(), 5);
                prop_assert!(sections[2].starts_with("Input:\n"));
            } else {
                prop_assert_eq!(sections.len(), 4);
                prop_assert!(!text.contains("Input:"));
            }
            prop_assert_eq!(sections[0], PromptTemplate::DOLLY.intro_blurb);
            prop_assert!(sections[1].starts_with("### Instruction:\n"));
            prop_assert_eq!(*sections.last().unwrap(), "### End");
        }

        #[test]
        fn prop_reformatting_keeps_outer_sections(
            instruction in field(),
            response in field(),
        ) {
            let first = format_prompt(RawRecord::new(instruction, "", response.clone()));
            let second = format_prompt(RawRecord::new(first.text.clone(), "", response));
            let sections: Vec<&str> = second.text.split(SECTION_SEPARATOR).collect();

            prop_assert_eq!(sections[0], PromptTemplate::DOLLY.intro_blurb);
            prop_assert_eq!(
                sections[1],
                format!("### Instruction:\n{}", PromptTemplate::DOLLY.intro_blurb)
            );
            prop_assert_eq!(*sections.last().unwrap(), "### End");
            prop_assert!(sections[sections.len() - 2].starts_with("### Response:\n"));
        }
    }
}

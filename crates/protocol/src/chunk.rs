use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UiChunk {
    TextBlock(TextBlock),
    AggregatedCard(AggregatedCard),
    DataTable(DataTable),
    ListCard(ListCard),
    ActionCard(ActionCard),
    FormCard(FormCard),
    ErrorCard(ErrorCard),
}

impl UiChunk {
    pub const KNOWN_TYPES: [&'static str; 7] = [
        "TextBlock",
        "AggregatedCard",
        "DataTable",
        "ListCard",
        "ActionCard",
        "FormCard",
        "ErrorCard",
    ];

    pub fn is_known_type(type_name: &str) -> bool {
        Self::KNOWN_TYPES.contains(&type_name)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::TextBlock(_) => "TextBlock",
            Self::AggregatedCard(_) => "AggregatedCard",
            Self::DataTable(_) => "DataTable",
            Self::ListCard(_) => "ListCard",
            Self::ActionCard(_) => "ActionCard",
            Self::FormCard(_) => "FormCard",
            Self::ErrorCard(_) => "ErrorCard",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    #[default]
    Neutral,
    Advisory,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub content: String,
    #[serde(default)]
    pub tone: Tone,
    #[serde(default)]
    pub collapsible: bool,
    #[serde(default)]
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedItem {
    pub label: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedCard {
    pub title: String,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub items: Vec<AggregatedItem>,
    #[serde(default)]
    pub show_sources: bool,
    #[serde(default)]
    pub expandable: bool,
    #[serde(default)]
    pub highlighted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataTable {
    pub headers: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sortable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filterable: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListItem {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListCard {
    pub title: String,
    #[serde(default)]
    pub items: Vec<ListItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCard {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormCard {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub fields: Vec<FormField>,
    pub submit_action: Action,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    #[default]
    Error,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorCard {
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    #[default]
    Button,
    Link,
    Submit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    pub label: String,
    #[serde(rename = "type", alias = "kind", default)]
    pub kind: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Email,
    Password,
    Textarea,
    Select,
    Checkbox,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldOption {
    pub value: String,
    pub label: String,
}

/// A declarative check on a form field. `kind` is kept as the raw wire string
/// so rules this client does not understand are skipped rather than rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    #[serde(rename = "type", alias = "rule")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub id: String,
    #[serde(rename = "type", alias = "kind")]
    pub kind: FieldKind,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<FieldOption>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation: Vec<ValidationRule>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field_id: String,
    pub message: String,
}

impl FormCard {
    /// Identifier passed to `on_form_submit`: the explicit form id when the
    /// orchestrator sent one, otherwise the submit action's id.
    pub fn form_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.submit_action.id)
    }

    /// Checks a flat `field id -> value` submission. Errors come back in
    /// field order, at most one per field.
    pub fn validate_submission(&self, data: &Map<String, Value>) -> Vec<FieldError> {
        self.fields
            .iter()
            .filter_map(|field| {
                field.check(data.get(&field.id)).map(|message| FieldError {
                    field_id: field.id.clone(),
                    message,
                })
            })
            .collect()
    }
}

impl FormField {
    fn check(&self, value: Option<&Value>) -> Option<String> {
        let text = value.map(display_value).unwrap_or_default();
        let empty = match value {
            None | Some(Value::Null) => true,
            Some(Value::Bool(checked)) => !checked,
            Some(_) => text.trim().is_empty(),
        };

        let required = self.required || self.validation.iter().any(|rule| rule.kind == "required");
        if empty {
            if !required {
                return None;
            }
            let rule_message = self
                .validation
                .iter()
                .find(|rule| rule.kind == "required")
                .and_then(|rule| rule.message.clone());
            return Some(rule_message.unwrap_or_else(|| format!("{} is required", self.label)));
        }

        if self.kind == FieldKind::Select
            && !self.options.is_empty()
            && !self.options.iter().any(|option| option.value == text)
        {
            return Some(format!("{} must be one of the listed options", self.label));
        }

        if self.kind == FieldKind::Email && !looks_like_email(&text) {
            return Some(format!("{} must be a valid email address", self.label));
        }

        let length = text.chars().count();
        for rule in &self.validation {
            let limit = rule.value.as_ref().and_then(Value::as_u64).map(|n| n as usize);
            let failed = match (rule.kind.as_str(), limit) {
                ("min_length", Some(min)) => length < min,
                ("max_length", Some(max)) => length > max,
                ("email", _) => !looks_like_email(&text),
                _ => false,
            };
            if failed {
                return Some(rule.message.clone().unwrap_or_else(|| match rule.kind.as_str() {
                    "min_length" => format!(
                        "{} must be at least {} characters",
                        self.label,
                        limit.unwrap_or_default()
                    ),
                    "max_length" => format!(
                        "{} must be at most {} characters",
                        self.label,
                        limit.unwrap_or_default()
                    ),
                    _ => format!("{} must be a valid email address", self.label),
                }));
            }
        }

        None
    }
}

fn looks_like_email(text: &str) -> bool {
    let Some((local, domain)) = text.trim().split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && domain.contains('.')
        && !domain.contains('@')
}

/// Text form of a loosely typed protocol value (table cells, card values).
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

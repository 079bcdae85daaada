//! Contract templates.
//!
//! A template is the immutable legal text of a contract with `{{placeholder}}`
//! fields. Each template owns a derived, anchored regular expression with one
//! capture group per placeholder, used to reverse-parse signed contract text
//! back into its parameters.

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, TimeDelta, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::contract::time::format_contract_time;
use crate::contract::Contract;
use crate::error::Error;

/// Name of the template attribute holding the start of the validity period.
pub const VALID_FROM_ATTR: &str = "valid_from";

/// Name of the template attribute holding the end of the validity period.
pub const VALID_TO_ATTR: &str = "valid_to";

/// Name of the template attribute holding the acting party.
pub const ACTING_PARTY_ATTR: &str = "acting_party";

/// Name of the template attribute holding the legal entity.
pub const LEGAL_ENTITY_ATTR: &str = "legal_entity";

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{(\w+)\}\}").expect("placeholder pattern is valid"));

/// Type of contract, e.g. `BehandelaarLogin`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Type(pub String);

/// Language of the contract as an uppercase country code, e.g. `NL`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Language(pub String);

/// Version of the contract, e.g. `v1`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Version(pub String);

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Type {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<&str> for Language {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<&str> for Version {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An immutable contract template.
#[derive(Clone, Debug, Serialize)]
pub struct Template {
    /// Type of contract this template produces.
    #[serde(rename = "type")]
    pub type_: Type,

    /// Language of the contract text.
    pub language: Language,

    /// Version of the template.
    pub version: Version,

    /// The contract text with `{{placeholder}}` fields.
    pub template: String,

    /// Placeholder names in declaration order.
    pub template_attributes: Vec<String>,

    /// Attribute identifiers the signer must disclose. An entry starting with
    /// a `.` is qualified with the configured scheme manager at request time.
    pub signer_attributes: Vec<String>,

    #[serde(skip)]
    regex: Regex,
}

impl Template {
    /// Create a template, deriving the reverse-parse regex and the ordered
    /// placeholder list from the template text.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` when the derived expression does not
    /// compile.
    pub fn new(
        type_: impl Into<Type>, language: impl Into<Language>, version: impl Into<Version>,
        template: impl Into<String>, signer_attributes: &[&str],
    ) -> Result<Self, Error> {
        let template = template.into();

        let mut pattern = String::from("^");
        let mut attributes = vec![];
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(&template) {
            let m = caps.get(0).map_or(0..0, |m| m.range());
            pattern.push_str(&regex::escape(&template[last..m.start]));
            pattern.push_str("(.+)");
            attributes.push(caps[1].to_string());
            last = m.end;
        }
        pattern.push_str(&regex::escape(&template[last..]));
        pattern.push('$');

        let regex = Regex::new(&pattern)
            .map_err(|e| Error::InvalidInput(format!("invalid template expression: {e}")))?;

        Ok(Self {
            type_: type_.into(),
            language: language.into(),
            version: version.into(),
            template,
            template_attributes: attributes,
            signer_attributes: signer_attributes.iter().map(ToString::to_string).collect(),
            regex,
        })
    }

    /// Render the template with the given variables into a [`Contract`].
    ///
    /// The `valid_from` and `valid_to` attributes are computed from the given
    /// instant and duration, formatted in the template's civil zone and
    /// locale; caller-supplied values for them are overwritten.
    ///
    /// # Errors
    ///
    /// Returns an error when the rendered text does not reverse-parse against
    /// the template (for example when a placeholder variable is missing).
    pub fn render(
        &self, vars: &HashMap<String, String>, valid_from: DateTime<Utc>, valid_duration: TimeDelta,
    ) -> Result<Contract, Error> {
        let mut vars = vars.clone();
        vars.insert(VALID_FROM_ATTR.to_string(), format_contract_time(valid_from));
        vars.insert(VALID_TO_ATTR.to_string(), format_contract_time(valid_from + valid_duration));

        let raw_text = PLACEHOLDER
            .replace_all(&self.template, |caps: &regex::Captures<'_>| {
                vars.get(&caps[1]).cloned().unwrap_or_default()
            })
            .into_owned();

        Contract::from_template(self.clone(), raw_text)
            .map_err(|e| Error::ContractInvalid(format!("could not render contract template: {e}")))
    }

    /// Whether the template text contains the given placeholder.
    #[must_use]
    pub fn has_attribute(&self, name: &str) -> bool {
        self.template_attributes.iter().any(|a| a == name)
    }

    pub(crate) fn regex(&self) -> &Regex {
        &self.regex
    }
}

//! # Contract Engine
//!
//! Legally binding contract templates and the contracts rendered from them.
//!
//! A care professional proves identity by signing a human-readable contract.
//! This module owns the template catalog, placeholder rendering, the reverse
//! parse from signed text back into parameters, and the temporal validity
//! checks against the contract's civil zone.

pub mod store;
pub mod template;
pub mod time;

use std::collections::HashMap;

use chrono::{DateTime, Utc};

pub use self::store::TemplateStore;
pub use self::template::{
    Language, Template, Type, Version, ACTING_PARTY_ATTR, LEGAL_ENTITY_ATTR, VALID_FROM_ATTR,
    VALID_TO_ATTR,
};
use self::time::parse_contract_time;
use crate::error::Error;

/// A contract: the raw text, the template it was rendered from, and the
/// extracted parameters.
///
/// Invariant: applying the template's regular expression to `raw_text` yields
/// `params` verbatim.
#[derive(Clone, Debug)]
pub struct Contract {
    /// The full contract text as signed by the user.
    pub raw_text: String,

    /// The template the text was rendered from.
    pub template: Template,

    /// Placeholder values extracted from the text.
    pub params: HashMap<String, String>,
}

impl Contract {
    /// Parse a raw contract text: find its template in the store and extract
    /// the parameters. Does not verify the parameters.
    ///
    /// # Errors
    ///
    /// Returns `Error::ContractNotFound` when no template matches the text
    /// and `Error::ContractInvalid` when the text does not parse against the
    /// matched template.
    pub fn parse(raw_text: &str, templates: &TemplateStore) -> Result<Self, Error> {
        let template = templates.find_from_raw_contract_text(raw_text)?;
        Self::from_template(template.clone(), raw_text.to_string())
    }

    pub(crate) fn from_template(template: Template, raw_text: String) -> Result<Self, Error> {
        let Some(caps) = template.regex().captures(&raw_text) else {
            return Err(Error::ContractInvalid(
                "could not match the contract template regex".to_string(),
            ));
        };

        if caps.len() - 1 != template.template_attributes.len() {
            return Err(Error::ContractInvalid(format!(
                "amount of template attributes does not match the amount of params: found {}, \
                 expected {}",
                caps.len() - 1,
                template.template_attributes.len()
            )));
        }

        let params = template
            .template_attributes
            .iter()
            .zip(caps.iter().skip(1))
            .filter_map(|(name, m)| m.map(|m| (name.clone(), m.as_str().to_string())))
            .collect();

        Ok(Self { raw_text, template, params })
    }

    /// Verify the contract's validity period against the given instant.
    ///
    /// # Errors
    ///
    /// Returns `Error::ContractInvalid` when the period is absent, unparsable
    /// or inverted, `Error::ContractNotYetValid` before the period starts and
    /// `Error::ContractExpired` after it ends.
    pub fn verify_temporal(&self, now: DateTime<Utc>) -> Result<(), Error> {
        let valid_from_str = self.params.get(VALID_FROM_ATTR).ok_or_else(|| {
            Error::ContractInvalid(format!("value for [{VALID_FROM_ATTR}] is missing"))
        })?;
        let valid_from = parse_contract_time(valid_from_str)?;

        let valid_to_str = self.params.get(VALID_TO_ATTR).ok_or_else(|| {
            Error::ContractInvalid(format!("value for [{VALID_TO_ATTR}] is missing"))
        })?;
        let valid_to = parse_contract_time(valid_to_str)?;

        if valid_from > valid_to {
            return Err(Error::ContractInvalid(format!(
                "[{VALID_FROM_ATTR}] must come before [{VALID_TO_ATTR}]"
            )));
        }

        tracing::debug!("checking timeframe: now {now}, valid from {valid_from}, valid to {valid_to}");

        if now < valid_from {
            return Err(Error::ContractNotYetValid(valid_from_str.clone()));
        }
        if now > valid_to {
            return Err(Error::ContractExpired(valid_to_str.clone()));
        }

        Ok(())
    }

    /// The value of the `legal_entity` placeholder, when present.
    #[must_use]
    pub fn legal_entity(&self) -> Option<&str> {
        self.params.get(LEGAL_ENTITY_ATTR).map(String::as_str)
    }
}

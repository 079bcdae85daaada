//! Contract template catalog.

use crate::contract::template::{Language, Template, Type, Version};
use crate::error::Error;

/// Catalog of contract templates, keyed by `(type, language, version)`.
///
/// The catalog is populated once at startup and read-only thereafter.
#[derive(Clone, Debug, Default)]
pub struct TemplateStore {
    templates: Vec<Template>,
}

impl TemplateStore {
    /// The built-in catalog of legally reviewed templates.
    ///
    /// # Errors
    ///
    /// Returns an error when a built-in template fails to compile, which
    /// indicates a programming error in the catalog itself.
    pub fn standard() -> Result<Self, Error> {
        let templates = vec![
            Template::new(
                "BehandelaarLogin",
                "NL",
                "v1",
                "NL:BehandelaarLogin:v1 Ondergetekende geeft toestemming aan {{acting_party}} om \
                 namens {{legal_entity}} en ondergetekende het Nuts netwerk te bevragen. Deze \
                 toestemming is geldig van {{valid_from}} tot {{valid_to}}.",
                &[".gemeente.personalData.firstnames", ".pbdf.email.email"],
            )?,
            Template::new(
                "PractitionerLogin",
                "EN",
                "v1",
                "EN:PractitionerLogin:v1 Undersigned gives permission to {{acting_party}} to make \
                 request to the Nuts network on behalf of {{legal_entity}} and itself. This \
                 permission is valid from {{valid_from}} until {{valid_to}}.",
                &[".gemeente.personalData.firstnames", ".pbdf.email.email"],
            )?,
        ];

        Ok(Self { templates })
    }

    /// Build a catalog from the given templates.
    #[must_use]
    pub fn new(templates: Vec<Template>) -> Self {
        Self { templates }
    }

    /// Find a template by type, language and version.
    ///
    /// # Errors
    ///
    /// Returns `Error::ContractNotFound` when no template matches.
    pub fn find(
        &self, type_: &Type, language: &Language, version: &Version,
    ) -> Result<&Template, Error> {
        self.templates
            .iter()
            .find(|t| &t.type_ == type_ && &t.language == language && &t.version == version)
            .ok_or_else(|| {
                Error::ContractNotFound(format!(
                    "could not find contract template for {language}/{type_}/{version}"
                ))
            })
    }

    /// Find the template a signed contract text was rendered from.
    ///
    /// Scans the catalog linearly, matching each template's anchored regular
    /// expression against the full text. A text matching more than one
    /// template is rejected.
    ///
    /// # Errors
    ///
    /// Returns `Error::ContractNotFound` when no template matches and
    /// `Error::ContractInvalid` when the match is ambiguous.
    pub fn find_from_raw_contract_text(&self, raw_text: &str) -> Result<&Template, Error> {
        let mut matches =
            self.templates.iter().filter(|t| t.regex().is_match(raw_text));

        let Some(template) = matches.next() else {
            return Err(Error::ContractNotFound(
                "could not find contract template for the given text".to_string(),
            ));
        };
        if matches.next().is_some() {
            return Err(Error::ContractInvalid(
                "contract text matches multiple templates".to_string(),
            ));
        }
        Ok(template)
    }

    /// All templates in the catalog.
    #[must_use]
    pub fn templates(&self) -> &[Template] {
        &self.templates
    }
}

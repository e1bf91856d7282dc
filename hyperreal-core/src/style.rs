use std::collections::BTreeMap;

use crate::config::{StyleSpec, DEFAULT_STYLE, PROMPT_SLOT};
use crate::OrchestratorError;

/// Looks up `requested`, falling back to [`DEFAULT_STYLE`]. Fails only when
/// the default is missing as well.
pub fn resolve_style<'a>(
    styles: &'a BTreeMap<String, StyleSpec>,
    requested: &str,
) -> Result<&'a StyleSpec, OrchestratorError> {
    styles
        .get(requested)
        .or_else(|| styles.get(DEFAULT_STYLE))
        .ok_or_else(|| OrchestratorError::UnknownStyle {
            requested: requested.to_string(),
            default: DEFAULT_STYLE.to_string(),
        })
}

/// Puts the user prompt into the template's slot.
pub fn apply_style(template: &str, prompt: &str) -> String {
    template.replace(PROMPT_SLOT, prompt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn styles(entries: &[(&str, &str)]) -> BTreeMap<String, StyleSpec> {
        entries
            .iter()
            .map(|(name, prompt)| {
                (
                    name.to_string(),
                    StyleSpec {
                        prompt: prompt.to_string(),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn substitutes_prompt_into_slot() {
        assert_eq!(apply_style("cinematic, {prompt}", "a fox"), "cinematic, a fox");
        assert_eq!(apply_style("{prompt}", "a fox"), "a fox");
    }

    #[test]
    fn known_style_wins() {
        let styles = styles(&[("Style Zero", "{prompt}"), ("Cinematic", "cinematic, {prompt}")]);
        assert_eq!(resolve_style(&styles, "Cinematic").unwrap().prompt, "cinematic, {prompt}");
    }

    #[test]
    fn unknown_style_falls_back_to_default() {
        let styles = styles(&[("Style Zero", "plain {prompt}")]);
        assert_eq!(resolve_style(&styles, "Nope").unwrap().prompt, "plain {prompt}");
    }

    #[test]
    fn missing_default_is_an_error() {
        let styles = styles(&[("Cinematic", "cinematic, {prompt}")]);
        assert!(matches!(
            resolve_style(&styles, "Nope"),
            Err(OrchestratorError::UnknownStyle { .. })
        ));
    }
}

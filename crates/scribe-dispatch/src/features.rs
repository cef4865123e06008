//! Feature tags and the writing instructions they map to

use crate::types::EnhancementRequest;

const GENERIC_INSTRUCTION: &str = "You are a professional writing assistant. \
     Improve the user's text while preserving its meaning and voice. \
     Reply with the improved text only.";

const FEATURE_INSTRUCTIONS: &[(&str, &str)] = &[
    (
        "text_enhancement",
        "You are a professional writing assistant. Rewrite the user's text so it reads \
         more fluently and precisely, preserving meaning and voice. Reply with the rewritten text only.",
    ),
    (
        "grammar_check",
        "You are a professional copy editor. Analyze the user's text for grammatical errors \
         and return a corrected version followed by a short list of the changes made.",
    ),
    (
        "style",
        "You are a professional writing assistant. Analyze the writing style of the user's \
         text and provide concrete suggestions for improvement.",
    ),
    (
        "clarity",
        "You are a professional writing assistant. Analyze the clarity of the user's text \
         and suggest ways to make it clearer.",
    ),
    (
        "tone",
        "You are a professional writing assistant. Analyze the tone of the user's text and describe it.",
    ),
    (
        "summarize",
        "You are a professional writing assistant. Summarize the user's text in a few sentences.",
    ),
];

/// Feature tags with a dedicated instruction
pub fn known_features() -> impl Iterator<Item = &'static str> {
    FEATURE_INSTRUCTIONS.iter().map(|(name, _)| *name)
}

/// System instruction for a feature tag; unknown or missing tags get the generic one
pub fn instruction_for(feature: Option<&str>) -> &'static str {
    feature
        .and_then(|f| {
            FEATURE_INSTRUCTIONS
                .iter()
                .find(|(name, _)| *name == f)
                .map(|(_, instruction)| *instruction)
        })
        .unwrap_or(GENERIC_INSTRUCTION)
}

/// Build the (system, user) message pair every adapter sends
pub fn build_prompt(request: &EnhancementRequest) -> (String, String) {
    let system = instruction_for(request.feature.as_deref()).to_string();
    let user = match request.context.as_deref() {
        Some(ctx) if !ctx.trim().is_empty() => {
            format!("Context:\n{}\n\nText:\n{}", ctx.trim(), request.prompt)
        }
        _ => request.prompt.clone(),
    };
    (system, user)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_feature_instruction() {
        assert!(instruction_for(Some("grammar_check")).contains("grammatical errors"));
        assert!(instruction_for(Some("tone")).contains("tone"));
    }

    #[test]
    fn test_unknown_feature_falls_back_to_generic() {
        assert_eq!(instruction_for(Some("poetry")), GENERIC_INSTRUCTION);
        assert_eq!(instruction_for(None), GENERIC_INSTRUCTION);
    }

    #[test]
    fn test_build_prompt_includes_context() {
        let req = EnhancementRequest::new("their going home").with_context("A note to a friend");
        let (_, user) = build_prompt(&req);
        assert!(user.starts_with("Context:\nA note to a friend"));
        assert!(user.ends_with("Text:\ntheir going home"));
    }

    #[test]
    fn test_build_prompt_ignores_blank_context() {
        let req = EnhancementRequest::new("hello").with_context("  ");
        let (_, user) = build_prompt(&req);
        assert_eq!(user, "hello");
    }

    #[test]
    fn test_known_features_listed() {
        let names: Vec<_> = known_features().collect();
        assert!(names.contains(&"text_enhancement"));
        assert!(names.contains(&"grammar_check"));
    }
}

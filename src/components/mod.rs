//! Pipeline stages for turning a raw message into a verdict.
//!
//! Stages run leaves first: extraction, forwarding unwrap, canonicalization,
//! trust resolution, decision. Text stages are built from ordered lists of
//! pure [`TextRule`]s so each rule can be tested and reordered on its own.

pub mod canonicalizer;
pub mod decision_engine;
pub mod forward_unwrapper;
pub mod message_extractor;
pub mod pipeline;
pub mod trust_resolver;

/// A named, pure text transformation.
#[derive(Clone, Copy)]
pub struct TextRule {
    pub name: &'static str,
    pub apply: fn(&str) -> String,
}

impl TextRule {
    pub const fn new(name: &'static str, apply: fn(&str) -> String) -> Self {
        Self { name, apply }
    }
}

impl std::fmt::Debug for TextRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TextRule").field(&self.name).finish()
    }
}

/// Run `rules` over `text` in order.
pub fn apply_rules(rules: &[TextRule], text: &str) -> String {
    rules.iter().fold(text.to_string(), |current, rule| {
        let next = (rule.apply)(&current);
        if next != current {
            log::trace!("rule '{}' rewrote text", rule.name);
        }
        next
    })
}

//! Named-slot templates
//!
//! Generated scripts are executed directly in the browser under test, so a
//! partially-substituted template is worse than no output at all. Slots are
//! declared as `{{name}}` tokens; rendering fails if a provided value has
//! no matching slot or if any slot is left unfilled.

use std::collections::BTreeSet;

use crate::error::{HarnessError, HarnessResult};

#[derive(Debug, Clone)]
pub struct Template {
    source: String,
    slots: BTreeSet<String>,
}

impl Template {
    /// Scan a template source for `{{name}}` slots. Unterminated or
    /// empty slot tokens are rejected at parse time.
    pub fn parse(source: &str) -> HarnessResult<Self> {
        let mut slots = BTreeSet::new();
        let mut rest = source;

        while let Some(start) = rest.find("{{") {
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or_else(|| {
                HarnessError::Template(format!(
                    "unterminated slot token near: {:.40}",
                    &rest[start..]
                ))
            })?;
            let name = &after[..end];
            if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
                return Err(HarnessError::Template(format!(
                    "invalid slot name: {:?}",
                    name
                )));
            }
            slots.insert(name.to_string());
            rest = &after[end + 2..];
        }

        Ok(Self {
            source: source.to_string(),
            slots,
        })
    }

    pub fn slots(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(String::as_str)
    }

    /// Substitute every slot in a single pass over the source, so values
    /// are never re-scanned for tokens. Fails loudly on a value without a
    /// slot or a slot without a value.
    pub fn render(&self, values: &[(&str, &str)]) -> HarnessResult<String> {
        for (name, _) in values {
            if !self.slots.contains(*name) {
                return Err(HarnessError::Template(format!(
                    "no slot named {:?} in template (have: {:?})",
                    name, self.slots
                )));
            }
        }

        let provided: BTreeSet<&str> = values.iter().map(|(name, _)| *name).collect();
        let missing: Vec<&str> = self
            .slots
            .iter()
            .map(String::as_str)
            .filter(|slot| !provided.contains(slot))
            .collect();
        if !missing.is_empty() {
            return Err(HarnessError::Template(format!(
                "unfilled slots: {:?}",
                missing
            )));
        }

        let lookup = |name: &str| -> &str {
            values
                .iter()
                .rev()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| *v)
                .unwrap_or_default()
        };

        let mut out = String::with_capacity(self.source.len());
        let mut rest = self.source.as_str();
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            // parse() validated every token, so "}}" is present
            let end = after.find("}}").unwrap_or(after.len());
            out.push_str(lookup(&after[..end]));
            rest = &after[(end + 2).min(after.len())..];
        }
        out.push_str(rest);

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_all_slots() {
        let tpl = Template::parse("load {{url}} with {{options}} and {{url}} again").unwrap();
        let out = tpl
            .render(&[("url", "./bundle.js"), ("options", "{}")])
            .unwrap();
        assert_eq!(out, "load ./bundle.js with {} and ./bundle.js again");
    }

    #[test]
    fn unfilled_slot_fails_instead_of_emitting_partial_output() {
        let tpl = Template::parse("{{a}} {{b}}").unwrap();
        let err = tpl.render(&[("a", "1")]).unwrap_err();
        match err {
            HarnessError::Template(msg) => assert!(msg.contains("\"b\""), "{}", msg),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn value_without_slot_is_rejected() {
        let tpl = Template::parse("{{a}}").unwrap();
        assert!(tpl.render(&[("a", "1"), ("ghost", "2")]).is_err());
    }

    #[test]
    fn malformed_slot_tokens_fail_at_parse_time() {
        assert!(Template::parse("{{open").is_err());
        assert!(Template::parse("{{}}").is_err());
        assert!(Template::parse("{{bad name}}").is_err());
    }
}

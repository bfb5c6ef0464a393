//! `${name}` parameter substitution in seed and restriction predicates.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::BTreeMap;

static PARAMETER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{(\w+)\}").unwrap());

/// Replace every `${name}` with its configured value.
///
/// Values are inserted verbatim. An unknown name is an error naming it.
pub fn substitute_parameters(
    predicate: &str,
    parameters: &BTreeMap<String, String>,
) -> Result<String, String> {
    let mut missing: Option<String> = None;
    let replaced = PARAMETER_RE.replace_all(predicate, |caps: &Captures| {
        let name = &caps[1];
        match parameters.get(name) {
            Some(v) => v.clone(),
            None => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(name) => Err(format!("unknown parameter '{}'", name)),
        None => Ok(replaced.into_owned()),
    }
}

/// Parameter names referenced by a predicate, in order of appearance
pub fn referenced_parameters(predicate: &str) -> Vec<String> {
    PARAMETER_RE
        .captures_iter(predicate)
        .map(|c| c[1].to_string())
        .collect()
}

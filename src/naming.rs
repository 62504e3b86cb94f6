// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Name Generation
//!
//! Consumer tags and connection names have the form `base@suffix`, where the
//! suffix is random and the base names the logical worker. Regenerating a name
//! keeps the base, so a consumer restarted after a reconnect is still
//! attributable to the same worker instead of collecting suffixes.

use std::{collections::HashMap, sync::Mutex};
use uuid::Uuid;

/// Separates the base from the random suffix.
pub const NAME_SEPARATOR: char = '@';

const SUFFIX_LEN: usize = 12;

/// Returns the base of a generated name, or the whole name when it has no suffix.
pub fn base_name(name: &str) -> &str {
    match name.rsplit_once(NAME_SEPARATOR) {
        Some((base, _)) if !base.is_empty() => base,
        _ => name,
    }
}

/// Generates a new `base@suffix` name.
///
/// When `previous` is set, its base wins over `base_hint`.
pub fn generate_tag(previous: Option<&str>, base_hint: &str) -> String {
    let base = match previous {
        Some(prev) if !prev.is_empty() => base_name(prev),
        _ => base_name(base_hint),
    };

    format!("{}{}{}", base, NAME_SEPARATOR, short_suffix())
}

fn short_suffix() -> String {
    let mut suffix = Uuid::new_v4().simple().to_string();
    suffix.truncate(SUFFIX_LEN);
    suffix
}

/// Remembers the last name issued for each base.
///
/// Each supervisor owns its own generator, so two supervisors in one process
/// never share lineages.
#[derive(Debug)]
pub struct NameGenerator {
    fallback: String,
    issued: Mutex<HashMap<String, String>>,
}

impl NameGenerator {
    /// `fallback` is the base used when a caller passes an empty hint.
    pub fn new(fallback: &str) -> NameGenerator {
        NameGenerator {
            fallback: fallback.to_owned(),
            issued: Mutex::new(HashMap::default()),
        }
    }

    /// Issues the next name for `hint`.
    pub fn next(&self, hint: &str) -> String {
        let base = if hint.is_empty() {
            base_name(&self.fallback)
        } else {
            base_name(hint)
        };

        let mut issued = match self.issued.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let name = generate_tag(issued.get(base).map(String::as_str), base);
        issued.insert(base.to_owned(), name.clone());

        name
    }
}

//! Tenant table routing.
//!
//! Every tenant owns three tables named `{prefix}_{suffix}`. Table names cannot
//! be bound as query arguments, so the prefix is only ever constructed through
//! [`TenantPrefix::parse`] and the identifiers handed to SQL are always quoted.

use std::fmt;

use regex::Regex;
use serde::Serialize;

pub const CUSTOMERS_SUFFIX: &str = "customers";
pub const MESSAGES_SUFFIX: &str = "messages";
pub const TEMPLATES_SUFFIX: &str = "templates";

const MAX_PREFIX_LEN: usize = 32;

/// A tenant prefix that matched `^[a-z][a-z0-9]{0,31}$`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TenantPrefix(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid tenant prefix '{0}'")]
pub struct InvalidPrefix(pub String);

impl TenantPrefix {
    pub fn parse(raw: &str) -> Result<Self, InvalidPrefix> {
        let valid = raw.len() <= MAX_PREFIX_LEN
            && Regex::new(r"^[a-z][a-z0-9]*$")
                .map(|re| re.is_match(raw))
                .unwrap_or(false);
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(InvalidPrefix(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn tables(&self) -> TenantTables {
        TenantTables::for_prefix(self)
    }
}

impl fmt::Display for TenantPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Quoted identifiers of one tenant's tables, ready to splice into SQL text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantTables {
    pub customers: String,
    pub messages: String,
    pub templates: String,
}

impl TenantTables {
    pub fn for_prefix(prefix: &TenantPrefix) -> Self {
        Self {
            customers: quoted_table(prefix, CUSTOMERS_SUFFIX),
            messages: quoted_table(prefix, MESSAGES_SUFFIX),
            templates: quoted_table(prefix, TEMPLATES_SUFFIX),
        }
    }
}

fn quoted_table(prefix: &TenantPrefix, suffix: &str) -> String {
    format!("\"{}_{}\"", prefix.as_str(), suffix)
}

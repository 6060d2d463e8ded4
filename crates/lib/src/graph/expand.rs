//! `${NAME}` expansion for instruction fields.
//!
//! Expansion turns an instruction into its normalized form before its cache
//! key is computed, so two instructions that expand to the same text share a
//! key regardless of how the values were supplied.
//!
//! # Syntax
//!
//! - `${NAME}` - value of `NAME`, or empty when unset
//! - `${NAME:-fallback}` - value of `NAME`, or `fallback` when unset or empty
//! - `$${` - a literal `${`
//!
//! Single `$` characters pass through unchanged, so text like `$HOME` reaches
//! the consumer as written.
//!
//! # Example
//!
//! ```
//! use std::collections::HashMap;
//! use strata_lib::graph::expand::expand;
//!
//! let vars = HashMap::from([("RAILS_ENV".to_string(), "production".to_string())]);
//! assert_eq!(expand("/opt/${RAILS_ENV}/$HOME", &vars).unwrap(), "/opt/production/$HOME");
//! ```

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpandError {
  #[error("unclosed variable reference at position {0}")]
  Unclosed(usize),

  #[error("invalid variable name: '{0}'")]
  InvalidName(String),
}

/// Source of variable values during expansion.
pub trait Lookup {
  fn lookup(&self, name: &str) -> Option<&str>;
}

impl Lookup for HashMap<String, String> {
  fn lookup(&self, name: &str) -> Option<&str> {
    self.get(name).map(String::as_str)
  }
}

impl Lookup for BTreeMap<String, String> {
  fn lookup(&self, name: &str) -> Option<&str> {
    self.get(name).map(String::as_str)
  }
}

/// Two lookups consulted in order; the first hit wins.
pub struct Layered<'a, A: Lookup, B: Lookup> {
  pub first: &'a A,
  pub second: &'a B,
}

impl<A: Lookup, B: Lookup> Lookup for Layered<'_, A, B> {
  fn lookup(&self, name: &str) -> Option<&str> {
    self.first.lookup(name).or_else(|| self.second.lookup(name))
  }
}

/// Expand every `${...}` reference in `input`.
///
/// # Errors
///
/// Returns an error if a reference is unclosed or names an invalid variable.
pub fn expand(input: &str, vars: &impl Lookup) -> Result<String, ExpandError> {
  let mut out = String::with_capacity(input.len());
  let mut chars = input.char_indices().peekable();

  while let Some((pos, ch)) = chars.next() {
    if ch != '$' {
      out.push(ch);
      continue;
    }

    match chars.peek() {
      Some((_, '$')) => {
        chars.next();
        if let Some((_, '{')) = chars.peek() {
          // Escaped: $${ -> ${
          chars.next();
          out.push_str("${");
        } else {
          out.push_str("$$");
        }
      }
      Some((_, '{')) => {
        chars.next();

        let mut body = String::new();
        let mut closed = false;
        for (_, c) in chars.by_ref() {
          if c == '}' {
            closed = true;
            break;
          }
          body.push(c);
        }
        if !closed {
          return Err(ExpandError::Unclosed(pos));
        }

        out.push_str(&resolve_reference(&body, vars)?);
      }
      _ => out.push('$'),
    }
  }

  Ok(out)
}

fn resolve_reference(body: &str, vars: &impl Lookup) -> Result<String, ExpandError> {
  let (name, fallback) = match body.split_once(":-") {
    Some((name, fallback)) => (name, Some(fallback)),
    None => (body, None),
  };

  if !is_valid_name(name) {
    return Err(ExpandError::InvalidName(name.to_string()));
  }

  let value = vars.lookup(name).unwrap_or("");
  match fallback {
    Some(fallback) if value.is_empty() => Ok(fallback.to_string()),
    _ => Ok(value.to_string()),
  }
}

fn is_valid_name(name: &str) -> bool {
  let mut chars = name.chars();
  match chars.next() {
    Some(c) if c.is_ascii_alphabetic() || c == '_' => chars.all(|c| c.is_ascii_alphanumeric() || c == '_'),
    _ => false,
  }
}

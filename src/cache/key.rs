//! Structured cache keys.

use std::fmt;

/// Identifies one cached value: a resource type tag plus ordered parameters.
///
/// Two keys are equal iff the resource and every parameter (in order) match.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
  resource: String,
  params: Vec<(String, String)>,
}

impl CacheKey {
  pub fn new(resource: impl Into<String>) -> Self {
    Self {
      resource: resource.into(),
      params: Vec::new(),
    }
  }

  /// Append a parameter.
  pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
    self.params.push((name.into(), value.to_string()));
    self
  }

  pub fn resource(&self) -> &str {
    &self.resource
  }

  pub fn params(&self) -> &[(String, String)] {
    &self.params
  }

  pub fn get(&self, name: &str) -> Option<&str> {
    self
      .params
      .iter()
      .find(|(k, _)| k == name)
      .map(|(_, v)| v.as_str())
  }

  /// True if this key belongs to the given resource type (push table name).
  pub fn is_resource(&self, resource: &str) -> bool {
    self.resource == resource
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.resource)?;
    for (i, (name, value)) in self.params.iter().enumerate() {
      let sep = if i == 0 { '?' } else { '&' };
      write!(f, "{}{}={}", sep, name, value)?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_structural_equality() {
    let a = CacheKey::new("campaigns").param("clientId", 7).param("page", 1);
    let b = CacheKey::new("campaigns").param("clientId", "7").param("page", "1");
    assert_eq!(a, b);

    let other_page = CacheKey::new("campaigns").param("clientId", 7).param("page", 2);
    assert_ne!(a, other_page);

    let other_resource = CacheKey::new("leads").param("clientId", 7).param("page", 1);
    assert_ne!(a, other_resource);
  }

  #[test]
  fn test_param_order_matters() {
    let a = CacheKey::new("leads").param("a", 1).param("b", 2);
    let b = CacheKey::new("leads").param("b", 2).param("a", 1);
    assert_ne!(a, b);
  }

  #[test]
  fn test_display() {
    let key = CacheKey::new("campaigns").param("clientId", 7).param("page", 1);
    assert_eq!(key.to_string(), "campaigns?clientId=7&page=1");
    assert_eq!(CacheKey::new("jobs").to_string(), "jobs");
  }
}

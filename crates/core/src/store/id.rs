use std::fmt;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};

use super::StoreError;

const DELIMITER: char = ':';

/// Globally unique entity identifier.
///
/// The wire form is the unpadded URL-safe base64 of `Kind:key1:key2...`.
/// The first decoded component is the entity kind and is checked whenever
/// an entity is loaded through a typed accessor.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(String);

impl Id {
  pub fn new<I, S>(kind: &str, keys: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let mut raw = kind.to_string();
    for key in keys {
      raw.push(DELIMITER);
      raw.push_str(key.as_ref());
    }
    Id(URL_SAFE_NO_PAD.encode(raw.as_bytes()))
  }

  /// Wrap an already encoded identifier, validating that it decodes.
  pub fn parse(encoded: &str) -> Result<Self, StoreError> {
    let id = Id(encoded.to_string());
    id.decode()?;
    Ok(id)
  }

  /// Ordered components; the first one is the kind.
  pub fn decode(&self) -> Result<Vec<String>, StoreError> {
    let bytes = URL_SAFE_NO_PAD
      .decode(self.0.as_bytes())
      .map_err(|_| StoreError::InvalidId(self.0.clone()))?;
    let raw = String::from_utf8(bytes).map_err(|_| StoreError::InvalidId(self.0.clone()))?;
    Ok(raw.split(DELIMITER).map(str::to_string).collect())
  }

  pub fn kind(&self) -> Result<String, StoreError> {
    let mut parts = self.decode()?;
    if parts.is_empty() || parts[0].is_empty() {
      return Err(StoreError::InvalidId(self.0.clone()));
    }
    Ok(parts.swap_remove(0))
  }

  /// Components after the kind.
  pub fn keys(&self) -> Result<Vec<String>, StoreError> {
    let mut parts = self.decode()?;
    parts.remove(0);
    Ok(parts)
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for Id {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;

  #[test]
  fn decodes_kind_and_keys() {
    let id = Id::new("Service", ["web", "api"]);
    assert_eq!(id.kind().unwrap(), "Service");
    assert_eq!(id.keys().unwrap(), vec!["web".to_string(), "api".to_string()]);
    assert_eq!(
      id.decode().unwrap(),
      vec!["Service".to_string(), "web".to_string(), "api".to_string()]
    );
  }

  #[test]
  fn encoding_is_url_safe() {
    let id = Id::new("Project", ["ws", "a/b?c"]);
    assert!(!id.as_str().contains('/'));
    assert!(!id.as_str().contains('='));
    assert_eq!(Id::parse(id.as_str()).unwrap(), id);
  }

  #[test]
  fn rejects_garbage() {
    assert!(matches!(Id::parse("@@@"), Err(StoreError::InvalidId(_))));
  }

  proptest! {
    #[test]
    fn kind_survives_any_keys(kind in "[A-Z][a-zA-Z]{0,12}", keys in prop::collection::vec("[a-z0-9_./-]{0,16}", 0..4)) {
      let id = Id::new(&kind, &keys);
      prop_assert_eq!(id.kind().unwrap(), kind);
      prop_assert_eq!(id.keys().unwrap(), keys);
    }
  }
}

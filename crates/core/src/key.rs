//! Composite keys: several identifier fields packed into one delimited string.
//!
//! A key addresses a resource owned by one specific peer (a window or a tab)
//! without any lookup table: the owning peer id is the first field.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Separator shared by the window and tab key families.
pub const KEY_SEPARATOR: &str = ":";

const NULL_SENTINEL: &str = "null";
const UNDEFINED_SENTINEL: &str = "undefined";

#[derive(Debug, Clone, PartialEq)]
pub enum KeyField {
    Str(String),
    Int(i64),
    Float(f64),
    Null,
    Undefined,
}

impl KeyField {
    /// Re-type a raw segment: integers, then decimals, then sentinels, else text.
    pub fn infer(segment: &str) -> Self {
        if let Ok(n) = segment.parse::<i64>() {
            return KeyField::Int(n);
        }
        if let Ok(f) = segment.parse::<f64>() {
            if f.is_finite() {
                return KeyField::Float(f);
            }
        }
        match segment {
            NULL_SENTINEL => KeyField::Null,
            UNDEFINED_SENTINEL => KeyField::Undefined,
            other => KeyField::Str(other.to_string()),
        }
    }

    fn encode(&self, separator: &str) -> Result<String> {
        let text = match self {
            KeyField::Str(s) => {
                if s.contains(separator) {
                    return Err(Error::InvalidKey(format!(
                        "field '{}' contains the separator '{}'",
                        s, separator
                    )));
                }
                if KeyField::infer(s) != *self {
                    return Err(Error::InvalidKey(format!(
                        "text field '{}' would decode as a different type",
                        s
                    )));
                }
                s.clone()
            }
            KeyField::Int(n) => n.to_string(),
            KeyField::Float(f) => {
                if !f.is_finite() {
                    return Err(Error::InvalidKey(format!("non-finite field {}", f)));
                }
                // Debug keeps the fraction ("2.0"), so it never decodes as Int.
                format!("{:?}", f)
            }
            KeyField::Null => NULL_SENTINEL.to_string(),
            KeyField::Undefined => UNDEFINED_SENTINEL.to_string(),
        };
        Ok(text)
    }
}

impl From<&str> for KeyField {
    fn from(s: &str) -> Self {
        KeyField::Str(s.to_string())
    }
}

impl From<String> for KeyField {
    fn from(s: String) -> Self {
        KeyField::Str(s)
    }
}

impl From<i64> for KeyField {
    fn from(n: i64) -> Self {
        KeyField::Int(n)
    }
}

impl From<Option<i64>> for KeyField {
    fn from(n: Option<i64>) -> Self {
        n.map(KeyField::Int).unwrap_or(KeyField::Null)
    }
}

/// Untyped composite key. Field order and count are fixed by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeKey {
    fields: Vec<KeyField>,
    encoded: String,
}

impl CompositeKey {
    pub fn from_fields(fields: Vec<KeyField>) -> Result<Self> {
        Self::with_separator(fields, KEY_SEPARATOR)
    }

    pub fn with_separator(fields: Vec<KeyField>, separator: &str) -> Result<Self> {
        if separator.is_empty() {
            return Err(Error::InvalidKey("empty separator".to_string()));
        }
        if fields.is_empty() {
            return Err(Error::InvalidKey("a key needs at least one field".to_string()));
        }
        let encoded = fields
            .iter()
            .map(|f| f.encode(separator))
            .collect::<Result<Vec<_>>>()?
            .join(separator);
        if encoded.is_empty() {
            return Err(Error::InvalidKey("key encodes to an empty string".to_string()));
        }
        Ok(Self { fields, encoded })
    }

    pub fn parse(key: &str, separator: &str) -> Result<Self> {
        if separator.is_empty() {
            return Err(Error::InvalidKey("empty separator".to_string()));
        }
        if key.is_empty() {
            return Err(Error::InvalidKey("empty key".to_string()));
        }
        let fields = key.split(separator).map(KeyField::infer).collect();
        Ok(Self {
            fields,
            encoded: key.to_string(),
        })
    }

    pub fn fields(&self) -> &[KeyField] {
        &self.fields
    }

    pub fn into_fields(self) -> Vec<KeyField> {
        self.fields
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

fn check_peer_id(peer_id: &str) -> Result<()> {
    if peer_id.is_empty() {
        return Err(Error::InvalidKey("empty peer id".to_string()));
    }
    if peer_id.contains(KEY_SEPARATOR) {
        return Err(Error::InvalidKey(format!(
            "peer id '{}' contains the separator '{}'",
            peer_id, KEY_SEPARATOR
        )));
    }
    Ok(())
}

fn split_exact<'a>(key: &'a str, count: usize, family: &str) -> Result<Vec<&'a str>> {
    let parts: Vec<&str> = key.split(KEY_SEPARATOR).collect();
    if parts.len() != count {
        return Err(Error::InvalidKey(format!(
            "{} key '{}' has {} segments, expected {}",
            family,
            key,
            parts.len(),
            count
        )));
    }
    Ok(parts)
}

fn parse_optional_id(segment: &str, key: &str) -> Result<Option<i64>> {
    match segment {
        NULL_SENTINEL | UNDEFINED_SENTINEL => Ok(None),
        other => parse_id(other, key).map(Some),
    }
}

fn parse_id(segment: &str, key: &str) -> Result<i64> {
    segment
        .parse::<i64>()
        .map_err(|_| Error::InvalidKey(format!("'{}' in key '{}' is not an integer id", segment, key)))
}

fn encode_optional_id(id: Option<i64>) -> String {
    id.map(|n| n.to_string())
        .unwrap_or_else(|| NULL_SENTINEL.to_string())
}

/// `peerId:windowId`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub peer_id: String,
    pub window_id: Option<i64>,
}

impl WindowKey {
    pub fn new(peer_id: impl Into<String>, window_id: Option<i64>) -> Result<Self> {
        let peer_id = peer_id.into();
        check_peer_id(&peer_id)?;
        Ok(Self { peer_id, window_id })
    }

    pub fn parse(key: &str) -> Result<Self> {
        let parts = split_exact(key, 2, "window")?;
        check_peer_id(parts[0])?;
        Ok(Self {
            peer_id: parts[0].to_string(),
            window_id: parse_optional_id(parts[1], key)?,
        })
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.peer_id, KEY_SEPARATOR, encode_optional_id(self.window_id))
    }
}

impl FromStr for WindowKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// `peerId:windowId:tabId`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TabKey {
    pub peer_id: String,
    pub window_id: Option<i64>,
    pub tab_id: i64,
}

impl TabKey {
    pub fn new(peer_id: impl Into<String>, window_id: Option<i64>, tab_id: i64) -> Result<Self> {
        let peer_id = peer_id.into();
        check_peer_id(&peer_id)?;
        Ok(Self {
            peer_id,
            window_id,
            tab_id,
        })
    }

    pub fn parse(key: &str) -> Result<Self> {
        let parts = split_exact(key, 3, "tab")?;
        check_peer_id(parts[0])?;
        Ok(Self {
            peer_id: parts[0].to_string(),
            window_id: parse_optional_id(parts[1], key)?,
            tab_id: parse_id(parts[2], key)?,
        })
    }

    /// The window that owns this tab.
    pub fn window(&self) -> WindowKey {
        WindowKey {
            peer_id: self.peer_id.clone(),
            window_id: self.window_id,
        }
    }
}

impl fmt::Display for TabKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}",
            self.peer_id,
            encode_optional_id(self.window_id),
            self.tab_id,
            sep = KEY_SEPARATOR
        )
    }
}

impl FromStr for TabKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_round_trip_keeps_types() {
        let fields = vec![
            KeyField::from("peer-a"),
            KeyField::Int(42),
            KeyField::Float(2.0),
            KeyField::Float(-0.25),
            KeyField::Null,
            KeyField::Undefined,
            KeyField::Int(-7),
        ];
        let key = CompositeKey::from_fields(fields.clone()).unwrap();
        assert_eq!(key.to_string(), "peer-a:42:2.0:-0.25:null:undefined:-7");

        let parsed = CompositeKey::parse(&key.to_string(), KEY_SEPARATOR).unwrap();
        assert_eq!(parsed.fields(), fields.as_slice());
    }

    #[test]
    fn test_generic_custom_separator() {
        let key = CompositeKey::with_separator(vec!["a:b".into(), KeyField::Int(1)], "|").unwrap();
        assert_eq!(key.to_string(), "a:b|1");
        let parsed = CompositeKey::parse("a:b|1", "|").unwrap();
        assert_eq!(parsed.into_fields(), vec![KeyField::from("a:b"), KeyField::Int(1)]);
    }

    #[test]
    fn test_generic_rejects_ambiguous_or_delimited_text() {
        assert!(CompositeKey::from_fields(vec!["a:b".into()]).is_err());
        assert!(CompositeKey::from_fields(vec!["123".into()]).is_err());
        assert!(CompositeKey::from_fields(vec!["null".into()]).is_err());
        assert!(CompositeKey::from_fields(vec![KeyField::Float(f64::NAN)]).is_err());
        assert!(CompositeKey::from_fields(vec![]).is_err());
    }

    #[test]
    fn test_empty_text_fields() {
        let lone = CompositeKey::from_fields(vec![KeyField::from("")]);
        assert!(matches!(lone, Err(Error::InvalidKey(_))));
        assert!(CompositeKey::parse("", KEY_SEPARATOR).is_err());

        let fields = vec![KeyField::from(""), KeyField::from("")];
        let key = CompositeKey::from_fields(fields.clone()).unwrap();
        assert_eq!(key.to_string(), ":");
        assert_eq!(CompositeKey::parse(":", KEY_SEPARATOR).unwrap().into_fields(), fields);
    }

    #[test]
    fn test_window_key_round_trip() {
        let key = WindowKey::new("peer1", Some(3)).unwrap();
        assert_eq!(key.to_string(), "peer1:3");
        assert_eq!(WindowKey::parse("peer1:3").unwrap(), key);

        let no_window = WindowKey::new("peer1", None).unwrap();
        assert_eq!(no_window.to_string(), "peer1:null");
        assert_eq!(WindowKey::parse("peer1:null").unwrap(), no_window);
        assert_eq!(WindowKey::parse("peer1:undefined").unwrap(), no_window);
    }

    #[test]
    fn test_tab_key_round_trip_with_numeric_peer_id() {
        let key = TabKey::new("1234", Some(1), 99).unwrap();
        let text = key.to_string();
        assert_eq!(text, "1234:1:99");
        let parsed: TabKey = text.parse().unwrap();
        assert_eq!(parsed, key);
        assert_eq!(parsed.peer_id, "1234");
        assert_eq!(parsed.window(), WindowKey::new("1234", Some(1)).unwrap());
    }

    #[test]
    fn test_malformed_keys_fail_fast() {
        assert!(matches!(TabKey::parse("peer:1"), Err(Error::InvalidKey(_))));
        assert!(TabKey::parse("peer:1:2:3").is_err());
        assert!(TabKey::parse("peer:1:abc").is_err());
        assert!(TabKey::parse(":1:2").is_err());
        assert!(WindowKey::parse("peer").is_err());
        assert!(WindowKey::parse("peer:x").is_err());
        assert!(WindowKey::new("a:b", None).is_err());
    }
}

//! Identifiers for logical channels and physical links.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

const CHANNEL_PREFIX: &str = "ch_";
const LINK_PREFIX: &str = "lnk_";
const MIN_SUFFIX_LEN: usize = 8;
const MAX_SUFFIX_LEN: usize = 64;

fn validate_suffix(raw: &str, prefix: &str, what: &str) -> Result<()> {
    let suffix = raw
        .strip_prefix(prefix)
        .ok_or_else(|| Error::Validation(format!("{} id '{}' must start with '{}'", what, raw, prefix)))?;
    if suffix.len() < MIN_SUFFIX_LEN || suffix.len() > MAX_SUFFIX_LEN {
        return Err(Error::Validation(format!(
            "{} id '{}' must have {}-{} characters after the prefix",
            what, raw, MIN_SUFFIX_LEN, MAX_SUFFIX_LEN
        )));
    }
    if !suffix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::Validation(format!(
            "{} id '{}' contains invalid characters",
            what, raw
        )));
    }
    Ok(())
}

/// Globally unique id of one logical channel to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn generate() -> Self {
        Self(format!("{}{}", CHANNEL_PREFIX, uuid::Uuid::new_v4().simple()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        validate_suffix(raw, CHANNEL_PREFIX, "channel")?;
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Id of one physical announce link between a dialer and a listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinkId(String);

impl LinkId {
    pub fn generate() -> Self {
        Self(format!("{}{}", LINK_PREFIX, uuid::Uuid::new_v4().simple()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        validate_suffix(raw, LINK_PREFIX, "link")?;
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_parse() {
        let id = ChannelId::generate();
        assert!(id.as_str().starts_with("ch_"));
        assert_eq!(ChannelId::parse(id.as_str()).unwrap(), id);

        let link = LinkId::generate();
        assert_eq!(LinkId::parse(link.as_str()).unwrap(), link);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(ChannelId::generate(), ChannelId::generate());
    }

    #[test]
    fn test_rejects_bad_channel_ids() {
        assert!(ChannelId::parse("abc").is_err());
        assert!(ChannelId::parse("ch_abcdefgh").is_ok());
        assert!(ChannelId::parse("ch_abcdefg").is_err());
        assert!(ChannelId::parse("ch_has space!").is_err());
        assert!(ChannelId::parse(&format!("ch_{}", "a".repeat(65))).is_err());
        assert!(matches!(ChannelId::parse("lnk_0123456789"), Err(Error::Validation(_))));
    }
}

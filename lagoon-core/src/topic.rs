//! Topic naming scheme.
//!
//! Every store-version owns a version topic `<store>_v<n>`; streaming writes
//! for all versions of a store share the real-time topic `<store>_rt`; stream
//! reprocessing jobs write to `<store>_v<n>_sr`. The suffix is the contract:
//! whether a topic is real-time is decided purely by its name.

use std::fmt;

use crate::types::StoreVersionNumber;

/// Suffix of real-time topics.
const REAL_TIME_SUFFIX: &str = "_rt";

/// Suffix of stream-reprocessing topics.
const STREAM_REPROCESSING_SUFFIX: &str = "_sr";

/// Infix separating a store name from its version number.
const VERSION_INFIX: &str = "_v";

/// Name of a partitioned log topic.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopicName(String);

impl TopicName {
    /// Creates a topic name from a raw string.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the version topic name for a store-version: `<store>_v<n>`.
    #[must_use]
    pub fn version_topic(store: &str, version: StoreVersionNumber) -> Self {
        Self(format!("{store}{VERSION_INFIX}{}", version.get()))
    }

    /// Returns the real-time topic name for a store: `<store>_rt`.
    #[must_use]
    pub fn real_time_topic(store: &str) -> Self {
        Self(format!("{store}{REAL_TIME_SUFFIX}"))
    }

    /// Returns the stream-reprocessing topic name: `<store>_v<n>_sr`.
    #[must_use]
    pub fn stream_reprocessing_topic(store: &str, version: StoreVersionNumber) -> Self {
        Self(format!(
            "{store}{VERSION_INFIX}{}{STREAM_REPROCESSING_SUFFIX}",
            version.get()
        ))
    }

    /// Returns the raw topic name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if this is a real-time topic (`_rt` suffix).
    #[must_use]
    pub fn is_real_time(&self) -> bool {
        self.0.ends_with(REAL_TIME_SUFFIX)
    }

    /// Returns true if this is a stream-reprocessing topic (`_sr` suffix).
    #[must_use]
    pub fn is_stream_reprocessing(&self) -> bool {
        self.0.ends_with(STREAM_REPROCESSING_SUFFIX)
    }

    /// Returns true if this is a version topic (`_v<n>` suffix).
    #[must_use]
    pub fn is_version_topic(&self) -> bool {
        self.version_number().is_some() && !self.is_stream_reprocessing()
    }

    /// Parses the version number out of a version topic name.
    ///
    /// Returns `None` for real-time and malformed names.
    #[must_use]
    pub fn version_number(&self) -> Option<StoreVersionNumber> {
        let base = self
            .0
            .strip_suffix(STREAM_REPROCESSING_SUFFIX)
            .unwrap_or(&self.0);
        let idx = base.rfind(VERSION_INFIX)?;
        let digits = &base[idx + VERSION_INFIX.len()..];
        if digits.is_empty() {
            return None;
        }
        digits.parse::<u64>().ok().map(StoreVersionNumber::new)
    }

    /// Parses the store name out of a topic name.
    ///
    /// Returns `None` when the name carries no recognized suffix.
    #[must_use]
    pub fn store_name(&self) -> Option<&str> {
        if let Some(base) = self.0.strip_suffix(REAL_TIME_SUFFIX) {
            return Some(base);
        }
        let base = self
            .0
            .strip_suffix(STREAM_REPROCESSING_SUFFIX)
            .unwrap_or(&self.0);
        if self.version_number().is_some() {
            let idx = base.rfind(VERSION_INFIX)?;
            return Some(&base[..idx]);
        }
        None
    }
}

impl fmt::Debug for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "topic({})", self.0)
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TopicName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_topic_name() {
        let topic = TopicName::version_topic("user_profiles", StoreVersionNumber::new(3));
        assert_eq!(topic.as_str(), "user_profiles_v3");
        assert!(topic.is_version_topic());
        assert!(!topic.is_real_time());
        assert_eq!(topic.version_number(), Some(StoreVersionNumber::new(3)));
        assert_eq!(topic.store_name(), Some("user_profiles"));
    }

    #[test]
    fn test_real_time_topic_name() {
        let topic = TopicName::real_time_topic("user_profiles");
        assert_eq!(topic.as_str(), "user_profiles_rt");
        assert!(topic.is_real_time());
        assert!(!topic.is_version_topic());
        assert_eq!(topic.version_number(), None);
        assert_eq!(topic.store_name(), Some("user_profiles"));
    }

    #[test]
    fn test_stream_reprocessing_topic_name() {
        let topic = TopicName::stream_reprocessing_topic("s", StoreVersionNumber::new(7));
        assert_eq!(topic.as_str(), "s_v7_sr");
        assert!(topic.is_stream_reprocessing());
        assert!(!topic.is_version_topic());
        assert_eq!(topic.version_number(), Some(StoreVersionNumber::new(7)));
        assert_eq!(topic.store_name(), Some("s"));
    }

    #[test]
    fn test_store_name_with_version_infix_inside() {
        // Store names may themselves contain "_v": the last occurrence wins.
        let topic = TopicName::version_topic("store_v2_data", StoreVersionNumber::new(5));
        assert_eq!(topic.as_str(), "store_v2_data_v5");
        assert_eq!(topic.version_number(), Some(StoreVersionNumber::new(5)));
        assert_eq!(topic.store_name(), Some("store_v2_data"));
    }

    #[test]
    fn test_malformed_names() {
        let topic = TopicName::new("plain");
        assert!(!topic.is_version_topic());
        assert!(!topic.is_real_time());
        assert_eq!(topic.store_name(), None);
        assert_eq!(TopicName::new("store_v").version_number(), None);
        assert_eq!(TopicName::new("store_vx").version_number(), None);
    }
}

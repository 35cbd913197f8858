// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Typed attribute value, replacing the original scheduler's hand-rolled
// union-typed `ipp_attribute_t` with an explicit sum type. Collections are
// recursive, matching the `1setOf collection` IPP construct.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Integer(i32),
    Boolean(bool),
    Keyword(String),
    Enum(i32),
    RangeOfInteger(i32, i32),
    Resolution {
        cross_feed: i32,
        feed: i32,
        units: ResolutionUnit,
    },
    DateTime(DateTime<Utc>),
    TextWithLanguage {
        text: String,
        language: Option<String>,
    },
    NameWithLanguage {
        name: String,
        language: Option<String>,
    },
    OctetString(Vec<u8>),
    Collection(Vec<(String, AttributeValue)>),
    /// A `1setOf` sequence of any single variant above.
    Set(Vec<AttributeValue>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionUnit {
    DotsPerInch,
    DotsPerCentimeter,
}

impl AttributeValue {
    pub fn as_integer(&self) -> Option<i32> {
        match self {
            AttributeValue::Integer(v) | AttributeValue::Enum(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_keyword(&self) -> Option<&str> {
        match self {
            AttributeValue::Keyword(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            AttributeValue::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttributeValue::TextWithLanguage { text, .. } => Some(text),
            AttributeValue::NameWithLanguage { name, .. } => Some(name),
            AttributeValue::Keyword(v) => Some(v),
            _ => None,
        }
    }
}

/// A named, typed attribute within a group, as produced by the (external)
/// wire-protocol decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: AttributeValue,
}

/// Which delimiter tag an attribute group belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupTag {
    Operation,
    Job,
    Printer,
    Subscription,
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeGroup {
    pub tag: GroupTag,
    pub attributes: Vec<Attribute>,
}

impl AttributeGroup {
    pub fn new(tag: GroupTag) -> Self {
        Self {
            tag,
            attributes: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| &a.value)
    }

    pub fn set(&mut self, name: impl Into<String>, value: AttributeValue) {
        self.attributes.push(Attribute {
            name: name.into(),
            value,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_get_returns_set_value() {
        let mut group = AttributeGroup::new(GroupTag::Job);
        group.set("job-priority", AttributeValue::Integer(50));
        assert_eq!(group.get("job-priority").and_then(|v| v.as_integer()), Some(50));
        assert!(group.get("missing").is_none());
    }

    #[test]
    fn collection_round_trips_through_serde() {
        let value = AttributeValue::Collection(vec![(
            "media-size".into(),
            AttributeValue::Collection(vec![
                ("x-dimension".into(), AttributeValue::Integer(21000)),
                ("y-dimension".into(), AttributeValue::Integer(29700)),
            ]),
        )]);
        let json = serde_json::to_string(&value).unwrap();
        let back: AttributeValue = serde_json::from_str(&json).unwrap();
        assert_eq!(value, back);
    }
}

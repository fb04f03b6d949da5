//! Subscription filters: a conjunction of optional constraints, grouped
//! into an OR-of-ANDs per subscription.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::Reject;
use crate::event::Event;

/// One conjunction of constraints over event fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// Event id hex strings; prefixes allowed.
    pub ids: Option<Vec<String>>,
    /// Author pubkey hex strings; prefixes allowed.
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u16>>,
    /// Per-letter tag value sets, e.g. `#e`, `#p`.
    pub tags: BTreeMap<u8, Vec<String>>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    /// Initial-scan result cap; ignored for live matching.
    pub limit: Option<usize>,
}

impl Filter {
    /// Parse a filter from its wire JSON object, rejecting unknown or
    /// ill-typed fields.
    pub fn from_value(val: &Value) -> Result<Filter, Reject> {
        let obj = val
            .as_object()
            .ok_or_else(|| Reject::invalid("filter must be an object"))?;
        let mut filter = Filter::default();
        for (key, value) in obj {
            match key.as_str() {
                "ids" => filter.ids = Some(hex_list(value, "ids")?),
                "authors" => filter.authors = Some(hex_list(value, "authors")?),
                "kinds" => {
                    let arr = value
                        .as_array()
                        .ok_or_else(|| Reject::invalid("kinds must be an array"))?;
                    let mut kinds = Vec::with_capacity(arr.len());
                    for v in arr {
                        let k = v
                            .as_u64()
                            .filter(|k| *k <= u16::MAX as u64)
                            .ok_or_else(|| Reject::invalid("kind out of range"))?;
                        kinds.push(k as u16);
                    }
                    filter.kinds = Some(kinds);
                }
                "since" => {
                    filter.since = Some(
                        value
                            .as_i64()
                            .ok_or_else(|| Reject::invalid("since must be an integer"))?,
                    )
                }
                "until" => {
                    filter.until = Some(
                        value
                            .as_i64()
                            .ok_or_else(|| Reject::invalid("until must be an integer"))?,
                    )
                }
                "limit" => {
                    filter.limit = Some(
                        value
                            .as_u64()
                            .ok_or_else(|| Reject::invalid("limit must be a non-negative integer"))?
                            as usize,
                    )
                }
                tag if tag.len() == 2 && tag.starts_with('#') => {
                    let letter = tag.as_bytes()[1];
                    if !letter.is_ascii_alphanumeric() {
                        return Err(Reject::invalid(format!("unrecognized filter item: {tag}")));
                    }
                    let arr = value
                        .as_array()
                        .ok_or_else(|| Reject::invalid("tag filter must be an array"))?;
                    let mut values = Vec::with_capacity(arr.len());
                    for v in arr {
                        values.push(
                            v.as_str()
                                .ok_or_else(|| Reject::invalid("tag value must be a string"))?
                                .to_string(),
                        );
                    }
                    filter.tags.insert(letter, values);
                }
                other => {
                    return Err(Reject::invalid(format!("unrecognized filter item: {other}")))
                }
            }
        }
        Ok(filter)
    }

    /// Structural match of the conjunction against an event.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|p| event.id.starts_with(p.as_str())) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|p| event.pubkey.starts_with(p.as_str())) {
                return false;
            }
        }
        for (letter, values) in &self.tags {
            let hit = event
                .single_letter_tags()
                .any(|(l, v)| l == *letter && values.iter().any(|w| w == v));
            if !hit {
                return false;
            }
        }
        true
    }
}

/// Disjunction of filters owned by one subscription.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterGroup(pub Vec<Filter>);

impl FilterGroup {
    /// Parse the filter objects of a `REQ` frame.
    pub fn from_values(values: &[Value]) -> Result<FilterGroup, Reject> {
        if values.is_empty() {
            return Err(Reject::invalid("at least one filter is required"));
        }
        let filters = values
            .iter()
            .map(Filter::from_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FilterGroup(filters))
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.0.iter().any(|f| f.matches(event))
    }
}

fn hex_list(value: &Value, what: &str) -> Result<Vec<String>, Reject> {
    let arr = value
        .as_array()
        .ok_or_else(|| Reject::invalid(format!("{what} must be an array")))?;
    let mut out = Vec::with_capacity(arr.len());
    for v in arr {
        let s = v
            .as_str()
            .ok_or_else(|| Reject::invalid(format!("{what} entries must be strings")))?;
        let ok = !s.is_empty()
            && s.len() <= 64
            && s.bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !ok {
            return Err(Reject::invalid(format!(
                "{what} entries must be lowercase hex of at most 64 characters"
            )));
        }
        out.push(s.to_string());
    }
    Ok(out)
}

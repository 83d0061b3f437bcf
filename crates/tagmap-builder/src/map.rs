//! Serializable map output.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tagmap_core::{MapKind, Se3, TagId, TagPose};

use crate::graph::ViewpointId;

/// Key of the fallback side length in `tag_side_lengths`.
pub const DEFAULT_SIZE_KEY: &str = "default";

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TagSizeError {
    #[error("tag side lengths have no `default` entry")]
    MissingDefault,
    #[error("`{0}` is not a tag id")]
    InvalidTagId(String),
    #[error("`{0}` is reserved for the default side length")]
    ReservedKey(String),
    #[error("side length for `{key}` must be positive and finite, got {value}")]
    InvalidLength { key: String, value: f64 },
}

/// Metric side length per tag: a default plus per-id overrides.
///
/// Serialized as `{"default": s, "<id>": s_id, ...}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, f64>", into = "BTreeMap<String, f64>")]
pub struct TagSizes {
    default: f64,
    overrides: BTreeMap<TagId, f64>,
}

fn check_length(key: &str, value: f64) -> Result<f64, TagSizeError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(TagSizeError::InvalidLength {
            key: key.to_string(),
            value,
        })
    }
}

impl TagSizes {
    pub fn uniform(side_length: f64) -> Result<Self, TagSizeError> {
        Ok(Self {
            default: check_length(DEFAULT_SIZE_KEY, side_length)?,
            overrides: BTreeMap::new(),
        })
    }

    pub fn with_override(mut self, tag: TagId, side_length: f64) -> Result<Self, TagSizeError> {
        let value = check_length(&tag.to_string(), side_length)?;
        self.overrides.insert(tag, value);
        Ok(self)
    }

    #[inline]
    pub fn default_length(&self) -> f64 {
        self.default
    }

    pub fn overrides(&self) -> &BTreeMap<TagId, f64> {
        &self.overrides
    }

    pub fn side_length(&self, tag: TagId) -> f64 {
        self.overrides.get(&tag).copied().unwrap_or(self.default)
    }
}

impl TryFrom<BTreeMap<String, f64>> for TagSizes {
    type Error = TagSizeError;

    fn try_from(mut raw: BTreeMap<String, f64>) -> Result<Self, Self::Error> {
        let default = raw
            .remove(DEFAULT_SIZE_KEY)
            .ok_or(TagSizeError::MissingDefault)?;
        let mut sizes = TagSizes::uniform(default)?;
        for (key, value) in raw {
            let tag: TagId = key
                .trim()
                .parse()
                .map_err(|_| TagSizeError::InvalidTagId(key.clone()))?;
            sizes.overrides.insert(tag, check_length(&key, value)?);
        }
        Ok(sizes)
    }
}

impl From<TagSizes> for BTreeMap<String, f64> {
    fn from(sizes: TagSizes) -> Self {
        let mut out: BTreeMap<String, f64> = sizes
            .overrides
            .into_iter()
            .map(|(id, s)| (id.to_string(), s))
            .collect();
        out.insert(DEFAULT_SIZE_KEY.to_string(), sizes.default);
        out
    }
}

/// A finished tag map, as written to `map.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TagMap<P> {
    pub map_type: MapKind,
    pub tag_side_lengths: TagSizes,
    pub tag_locations: BTreeMap<TagId, P>,
}

impl<P: TagPose> TagMap<P> {
    pub fn new(tag_side_lengths: TagSizes, tag_locations: BTreeMap<TagId, P>) -> Self {
        Self {
            map_type: P::KIND,
            tag_side_lengths,
            tag_locations,
        }
    }

    pub fn tag_pose(&self, tag: TagId) -> Option<&P> {
        self.tag_locations.get(&tag)
    }

    pub fn len(&self) -> usize {
        self.tag_locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tag_locations.is_empty()
    }
}

/// `world_from_viewpoint` per viewpoint, as written to `viewpoints.json`.
pub type ViewpointPoses = BTreeMap<ViewpointId, Se3>;

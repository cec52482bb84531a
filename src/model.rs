use std::collections::HashMap;
use std::fmt;

use derive_builder::Builder;
use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

pub type Attributes = Value;
pub type Condition = Value;
pub type FeatureMap = HashMap<String, Feature>;
pub type SavedGroupsMap = HashMap<String, Vec<Value>>;
pub type ForcedVariationsMap = HashMap<String, i32>;

/// A single bucket range `[min, max)`. Serializes on the wire as a 2-element
/// array (`[min, max]`), matching the GrowthBook feature-catalog format,
/// rather than as an object.
#[derive(Builder, Debug, Clone, Default)]
#[builder(default)]
pub struct BucketRange {
    pub range_start: f32,
    pub range_end: f32,
}

impl PartialEq for BucketRange {
    fn eq(&self, other: &Self) -> bool {
        let tolerance = 0.001f32;
        (self.range_start - other.range_start).abs() < tolerance && (self.range_end - other.range_end).abs() < tolerance
    }
}

impl Serialize for BucketRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(2))?;
        seq.serialize_element(&self.range_start)?;
        seq.serialize_element(&self.range_end)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for BucketRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BucketRangeVisitor;
        impl<'de> Visitor<'de> for BucketRangeVisitor {
            type Value = BucketRange;
            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a 2-element [min, max] array")
            }
            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let range_start: f32 = seq.next_element()?.ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let range_end: f32 = seq.next_element()?.ok_or_else(|| de::Error::invalid_length(1, &self))?;
                Ok(BucketRange { range_start, range_end })
            }
        }
        deserializer.deserialize_seq(BucketRangeVisitor)
    }
}

/// A mutually-exclusive namespace partition. Serializes on the wire as the
/// 3-element array `[id, start, end]`.
#[derive(Builder, Debug, Clone, Default, PartialEq)]
#[builder(default)]
pub struct Namespace {
    pub id: String,
    pub range_start: f32,
    pub range_end: f32,
}

impl Serialize for Namespace {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(3))?;
        seq.serialize_element(&self.id)?;
        seq.serialize_element(&self.range_start)?;
        seq.serialize_element(&self.range_end)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Namespace {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct NamespaceVisitor;
        impl<'de> Visitor<'de> for NamespaceVisitor {
            type Value = Namespace;
            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a 3-element [id, start, end] array")
            }
            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let id: String = seq.next_element()?.ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let range_start: f32 = seq.next_element()?.ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let range_end: f32 = seq.next_element()?.ok_or_else(|| de::Error::invalid_length(2, &self))?;
                Ok(Namespace { id, range_start, range_end })
            }
        }
        deserializer.deserialize_seq(NamespaceVisitor)
    }
}

#[derive(Builder, Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
#[builder(default)]
pub struct VariationMeta {
    pub key: Option<String>,
    pub name: Option<String>,
    pub passthrough: Option<bool>,
}

#[derive(Builder, Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
#[builder(default)]
pub struct Filter {
    pub seed: String,
    pub ranges: Vec<BucketRange>,
    #[serde(default)]
    pub hash_version: i32,
    pub attribute: String,
}

/// A prerequisite on another feature. `gate = true` means a failing
/// condition aborts the whole evaluation (`source = prerequisite`);
/// `gate = false` means it merely skips the current rule.
#[derive(Builder, Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
#[builder(default)]
pub struct ParentCondition {
    pub id: String,
    pub condition: Condition,
    #[serde(default)]
    pub gate: bool,
}

#[derive(Builder, Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
#[builder(default)]
pub struct Experiment {
    pub key: String,
    pub variations: Vec<Value>,
    #[serde(default)]
    pub weights: Vec<f32>,
    pub active: Option<bool>,
    pub coverage: Option<f32>,
    #[serde(default)]
    pub ranges: Vec<BucketRange>,
    pub condition: Option<Condition>,
    #[serde(default)]
    pub parent_conditions: Vec<ParentCondition>,
    pub namespace: Option<Namespace>,
    pub force: Option<i32>,
    pub hash_attribute: Option<String>,
    pub fallback_attribute: Option<String>,
    pub hash_version: Option<i32>,
    #[serde(default)]
    pub meta: Vec<VariationMeta>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    pub seed: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub phase: String,
}

#[derive(Builder, Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
#[builder(default)]
pub struct ExperimentResult {
    pub in_experiment: bool,
    pub variation_id: i32,
    pub value: Value,
    pub hash_used: bool,
    pub hash_attribute: String,
    pub hash_value: String,
    pub feature_id: Option<String>,
    pub key: String,
    pub bucket: Option<f32>,
    pub name: Option<String>,
    pub passthrough: bool,
    #[serde(default)]
    pub sticky_bucket_used: bool,
}

#[derive(Builder, Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
#[builder(default)]
pub struct FeatureRule {
    pub id: Option<String>,
    pub condition: Option<Condition>,
    #[serde(default)]
    pub parent_conditions: Vec<ParentCondition>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    pub force: Option<Value>,
    #[serde(default)]
    pub variations: Vec<Value>,
    #[serde(default)]
    pub weights: Vec<f32>,
    pub key: Option<String>,
    pub hash_attribute: Option<String>,
    pub fallback_attribute: Option<String>,
    pub hash_version: Option<i32>,
    pub range: Option<BucketRange>,
    pub coverage: Option<f32>,
    pub namespace: Option<Namespace>,
    #[serde(default)]
    pub ranges: Vec<BucketRange>,
    #[serde(default)]
    pub meta: Vec<VariationMeta>,
    pub seed: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub tracks: Vec<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Source {
    #[serde(rename = "unknown")]
    UnknownFeature,
    #[serde(rename = "default")]
    DefaultValue,
    #[serde(rename = "force")]
    Force,
    #[serde(rename = "experiment")]
    Experiment,
    #[serde(rename = "override")]
    Override,
    #[serde(rename = "prerequisite")]
    Prerequisite,
    #[serde(rename = "cyclicPrerequisite")]
    CyclicPrerequisite,
}

#[derive(Builder, Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct FeatureResult {
    pub value: Value,
    pub on: bool,
    pub off: bool,
    pub source: Source,
    pub rule_id: Option<String>,
    pub experiment: Option<Experiment>,
    pub experiment_result: Option<ExperimentResult>,
}

impl PartialEq for FeatureResult {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value && self.on == other.on && self.off == other.off && self.source == other.source
    }
}

#[derive(Builder, Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
#[builder(default)]
pub struct Feature {
    pub default_value: Option<Value>,
    #[serde(default)]
    pub rules: Vec<FeatureRule>,
}

/// A persisted sticky-bucket assignment document. Keys in `assignments` are
/// `"<experimentKey>__<bucketVersion>"`, values are variation keys.
#[derive(Builder, Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
#[builder(default)]
pub struct StickyBucketAssignmentDoc {
    pub attribute_name: String,
    pub attribute_value: String,
    #[serde(default)]
    pub assignments: HashMap<String, String>,
}

/// Full feature-catalog wire payload, as returned by the feature API or an SSE event.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct FeaturesApiResponse {
    #[serde(default)]
    pub features: FeatureMap,
    #[serde(default)]
    pub saved_groups: SavedGroupsMap,
    pub date_updated: Option<String>,
    pub encrypted_features: Option<String>,
    pub encrypted_saved_groups: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_range_round_trips_as_array() {
        let br = BucketRange { range_start: 0.0, range_end: 0.5 };
        let json = serde_json::to_value(&br).unwrap();
        assert_eq!(json, serde_json::json!([0.0, 0.5]));
        let back: BucketRange = serde_json::from_value(json).unwrap();
        assert_eq!(back, br);
    }

    #[test]
    fn namespace_round_trips_as_array() {
        let ns = Namespace { id: "ns1".to_string(), range_start: 0.0, range_end: 0.5 };
        let json = serde_json::to_value(&ns).unwrap();
        assert_eq!(json, serde_json::json!(["ns1", 0.0, 0.5]));
        let back: Namespace = serde_json::from_value(json).unwrap();
        assert_eq!(back, ns);
    }
}

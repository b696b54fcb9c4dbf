use kube::{core::ObjectMeta, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::resources::labels::get_pool_labels;

/// Durable usage snapshot of a single address pool.
///
/// There is exactly one of these per pool, `metadata.resourceVersion` is the
/// version token used for compare-and-swap writes.
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "svc-ipam.dev",
    version = "v1alpha1",
    kind = "RangeAllocation",
    namespaced,
    derive = "Default",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Range", "type":"string", "jsonPath":".spec.range"}"#
)]
pub struct RangeAllocationSpec {
    /// CIDR of the pool this snapshot belongs to, never changes for a pool
    #[serde(default)]
    pub range: String,
    /// allocator specific usage data, stored verbatim
    #[serde(default, with = "base64_data")]
    #[schemars(with = "String")]
    pub data: Vec<u8>,
}

impl RangeAllocation {
    /// A record for a pool that never had anything allocated.
    pub fn empty(name: &str, namespace: &str) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some(namespace.to_owned()),
                labels: Some(get_pool_labels()),
                ..Default::default()
            },
            spec: RangeAllocationSpec::default(),
        }
    }

    /// Whether this is the placeholder of a never used pool. A stored record or one
    /// carrying usage data is never empty, even without a range.
    pub fn is_empty(&self) -> bool {
        self.spec.range.is_empty()
            && self.spec.data.is_empty()
            && self.metadata.resource_version.is_none()
    }
}

mod base64_data {
    use data_encoding::BASE64;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;

        BASE64.decode(encoded.as_bytes()).map_err(Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{RangeAllocation, RangeAllocationSpec};

    #[test]
    fn range_allocation_persists_range_text_and_base64_data() {
        let mut allocation = RangeAllocation::empty("service-cidr", "svc-ipam");
        allocation.spec = RangeAllocationSpec {
            range: "10.0.0.0/24".to_owned(),
            data: vec![0b0000_0101, 0, 0xff],
        };

        let serialized = serde_json::to_value(&allocation).unwrap();

        assert_eq!(serialized["spec"], json!({ "range": "10.0.0.0/24", "data": "BQD/" }));

        let deserialized: RangeAllocation = serde_json::from_value(serialized).unwrap();

        assert_eq!(deserialized, allocation);
    }

    #[test]
    fn range_allocation_without_spec_fields_is_empty() {
        let deserialized: RangeAllocation = serde_json::from_value(json!({
            "apiVersion": "svc-ipam.dev/v1alpha1",
            "kind": "RangeAllocation",
            "metadata": { "name": "service-cidr" },
            "spec": {}
        }))
        .unwrap();

        assert!(deserialized.is_empty());
        assert!(deserialized.spec.data.is_empty());
    }

    #[test]
    fn range_allocation_with_data_or_version_is_not_empty() {
        let mut with_data = RangeAllocation::empty("service-cidr", "svc-ipam");
        with_data.spec.data = vec![0xff];

        let mut stored = RangeAllocation::empty("service-cidr", "svc-ipam");
        stored.metadata.resource_version = Some("7".to_owned());

        assert!(!with_data.is_empty());
        assert!(!stored.is_empty());
    }
}

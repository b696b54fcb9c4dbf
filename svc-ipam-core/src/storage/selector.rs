use std::{collections::BTreeMap, str::FromStr};

use kube::Resource;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static LABEL_KEY_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^([a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*/)?[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$",
    )
    .expect("label key regex is valid")
});

static LABEL_VALUE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?)?$")
        .expect("label value regex is valid")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("'{}' is not a valid label key!", .0)]
    InvalidKey(String),
    #[error("'{}' is not a valid label value!", .0)]
    InvalidValue(String),
    #[error("Unsupported field '{}', only metadata.name and metadata.namespace can be selected!", .0)]
    UnsupportedField(String),
    #[error("Couldn't parse selector requirement '{}'!", .0)]
    InvalidRequirement(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Operator {
    Equals(String),
    NotEquals(String),
    Exists,
    DoesNotExist,
}

impl Operator {
    fn matches(&self, value: Option<&str>) -> bool {
        match self {
            Operator::Equals(expected) => value == Some(expected.as_str()),
            Operator::NotEquals(expected) => value != Some(expected.as_str()),
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
        }
    }
}

/// Splits `a=b,c!=d,e,!f` into its requirements, the empty string selects everything.
fn parse_requirements(raw: &str) -> Result<Vec<(String, Operator)>, SelectorError> {
    raw.split(',')
        .map(str::trim)
        .filter(|requirement| !requirement.is_empty())
        .map(|requirement| {
            if let Some((key, value)) = requirement.split_once("!=") {
                return Ok((key.trim().to_owned(), Operator::NotEquals(value.trim().to_owned())));
            }

            if let Some((key, value)) = requirement
                .split_once("==")
                .or_else(|| requirement.split_once('='))
            {
                return Ok((key.trim().to_owned(), Operator::Equals(value.trim().to_owned())));
            }

            if let Some(key) = requirement.strip_prefix('!') {
                return Ok((key.trim().to_owned(), Operator::DoesNotExist));
            }

            if requirement.contains(char::is_whitespace) {
                return Err(SelectorError::InvalidRequirement(requirement.to_owned()));
            }

            Ok((requirement.to_owned(), Operator::Exists))
        })
        .collect()
}

/// Equality based label selector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<(String, Operator)>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements
            .iter()
            .all(|(key, operator)| operator.matches(labels.get(key).map(String::as_str)))
    }
}

impl FromStr for LabelSelector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let requirements = parse_requirements(s)?;

        for (key, operator) in &requirements {
            if !LABEL_KEY_REGEX.is_match(key) {
                return Err(SelectorError::InvalidKey(key.to_owned()));
            }

            if let Operator::Equals(value) | Operator::NotEquals(value) = operator {
                if !LABEL_VALUE_REGEX.is_match(value) {
                    return Err(SelectorError::InvalidValue(value.to_owned()));
                }
            }
        }

        Ok(Self { requirements })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Name,
    Namespace,
}

/// Field selector over object metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSelector {
    requirements: Vec<(Field, Operator)>,
}

impl FieldSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn matches<K: Resource>(&self, object: &K) -> bool {
        let meta = object.meta();

        self.requirements.iter().all(|(field, operator)| {
            let value = match field {
                Field::Name => meta.name.as_deref(),
                Field::Namespace => meta.namespace.as_deref(),
            };

            operator.matches(value)
        })
    }
}

impl FromStr for FieldSelector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let requirements = parse_requirements(s)?
            .into_iter()
            .map(|(key, operator)| {
                let field = match key.as_str() {
                    "metadata.name" => Field::Name,
                    "metadata.namespace" => Field::Namespace,
                    _ => return Err(SelectorError::UnsupportedField(key)),
                };

                match operator {
                    Operator::Equals(_) | Operator::NotEquals(_) => Ok((field, operator)),
                    _ => Err(SelectorError::InvalidRequirement(key)),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { requirements })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::resources::crd::v1alpha1::virtualservice::{VirtualService, VirtualServiceSpec};

    use super::{FieldSelector, LabelSelector, SelectorError};

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn label_selector_combines_requirements() {
        let selector: LabelSelector = "app=web, tier!=db,team,!legacy".parse().unwrap();

        assert!(selector.matches(&labels(&[("app", "web"), ("team", "a")])));
        assert!(selector.matches(&labels(&[("app", "web"), ("team", "a"), ("tier", "front")])));
        assert!(!selector.matches(&labels(&[("app", "web"), ("team", "a"), ("tier", "db")])));
        assert!(!selector.matches(&labels(&[("app", "web")])));
        assert!(!selector.matches(&labels(&[("app", "web"), ("team", "a"), ("legacy", "")])));
        assert!(LabelSelector::everything().matches(&labels(&[])));
        assert_eq!("".parse::<LabelSelector>().unwrap(), LabelSelector::everything());
    }

    #[test]
    fn label_selector_rejects_malformed_input() {
        assert_eq!(
            "app=we b".parse::<LabelSelector>(),
            Err(SelectorError::InvalidValue("we b".to_owned()))
        );
        assert_eq!(
            "-app=web".parse::<LabelSelector>(),
            Err(SelectorError::InvalidKey("-app".to_owned()))
        );
    }

    #[test]
    fn field_selector_matches_name_and_namespace() {
        let mut service = VirtualService::new("web", VirtualServiceSpec::default());
        service.metadata.namespace = Some("prod".to_owned());

        let by_name: FieldSelector = "metadata.name=web".parse().unwrap();
        let by_namespace: FieldSelector = "metadata.namespace!=prod".parse().unwrap();

        assert!(by_name.matches(&service));
        assert!(!by_namespace.matches(&service));
        assert!(FieldSelector::everything().matches(&service));
        assert_eq!(
            "spec.clusterIp=10.0.0.1".parse::<FieldSelector>(),
            Err(SelectorError::UnsupportedField("spec.clusterIp".to_owned()))
        );
    }
}

use std::{
    collections::BTreeMap,
    net::{AddrParseError, IpAddr},
};

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// `spec.clusterIp` value of services that don't want an address
pub const CLUSTER_IP_NONE: &str = "None";

#[skip_serializing_none]
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "svc-ipam.dev",
    version = "v1alpha1",
    kind = "VirtualService",
    namespaced,
    derive = "Default",
    derive = "PartialEq",
    shortname = "vsvc",
    printcolumn = r#"{"name":"Cluster-IP", "type":"string", "jsonPath":".spec.clusterIp"}"#
)]
pub struct VirtualServiceSpec {
    /// virtual address of the service, left empty the registry picks a free one,
    /// "None" makes the service headless, an address literal requests that exact address
    pub cluster_ip: Option<String>,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
    /// pods backing this service
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    pub name: Option<String>,
    pub port: u16,
    pub protocol: ServiceProtocol,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ServiceProtocol {
    #[default]
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
    #[serde(rename = "SCTP")]
    Sctp,
}

/// What a service asks of the address pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    /// any free address will do
    Allocate,
    /// no address at all
    Headless,
    /// exactly this address
    Static(IpAddr),
}

impl VirtualServiceSpec {
    pub fn addressing(&self) -> Result<Addressing, AddrParseError> {
        match self.cluster_ip.as_deref().map(str::trim) {
            None | Some("") => Ok(Addressing::Allocate),
            Some(CLUSTER_IP_NONE) => Ok(Addressing::Headless),
            Some(raw) => Ok(Addressing::Static(raw.parse()?)),
        }
    }

    pub fn set_address(&mut self, address: Option<IpAddr>) {
        self.cluster_ip = Some(match address {
            Some(address) => address.to_string(),
            None => CLUSTER_IP_NONE.to_owned(),
        });
    }
}

impl VirtualService {
    /// The address this service holds, if it is a persisted, addressed service.
    pub fn held_address(&self) -> Option<IpAddr> {
        match self.spec.addressing() {
            Ok(Addressing::Static(address)) => Some(address),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::{Addressing, VirtualService, VirtualServiceSpec};

    fn spec(cluster_ip: Option<&str>) -> VirtualServiceSpec {
        VirtualServiceSpec {
            cluster_ip: cluster_ip.map(str::to_owned),
            ..Default::default()
        }
    }

    #[test]
    fn cluster_ip_maps_to_addressing_mode() {
        let address: IpAddr = "10.0.0.12".parse().unwrap();

        assert_eq!(spec(None).addressing().unwrap(), Addressing::Allocate);
        assert_eq!(spec(Some("")).addressing().unwrap(), Addressing::Allocate);
        assert_eq!(spec(Some("None")).addressing().unwrap(), Addressing::Headless);
        assert_eq!(spec(Some("10.0.0.12")).addressing().unwrap(), Addressing::Static(address));
        assert!(spec(Some("10.0.0.256")).addressing().is_err());
    }

    #[test]
    fn only_addressed_services_hold_an_address() {
        let mut service = VirtualService::new("web", spec(None));
        assert_eq!(service.held_address(), None);

        service.spec.set_address(None);
        assert_eq!(service.spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(service.held_address(), None);

        service.spec.set_address(Some("fd00::10".parse().unwrap()));
        assert_eq!(service.held_address(), Some("fd00::10".parse().unwrap()));
    }
}

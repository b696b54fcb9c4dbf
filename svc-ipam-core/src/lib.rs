pub mod allocation;
pub mod helpers;
pub mod ip;
pub mod kubernetes;
pub mod registry;
pub mod resources;
pub mod storage;

pub const RESOURCE_GROUP: &str = "svc-ipam.dev";

pub const FIELD_MANAGER: &str = "svc-ipam";

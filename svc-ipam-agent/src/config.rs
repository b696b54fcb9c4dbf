use std::{env::VarError, num::ParseIntError, time::Duration};

use ipnet::{AddrParseError, IpNet};
use svc_ipam_core::{
    allocation::{
        Pool, PoolBuilder, PoolBuilderError, PoolValidationError, DEFAULT_MAX_RETRIES,
        DEFAULT_POOL_NAME,
    },
    ip::{AllocationStrategy, InvalidAllocationStrategy},
};
use thiserror::Error;

pub const NAMESPACE_ENV: &str = "SVC_IPAM_NAMESPACE";
pub const SERVICE_CIDR_ENV: &str = "SVC_IPAM_SERVICE_CIDR";
pub const POOL_NAME_ENV: &str = "SVC_IPAM_POOL_NAME";
pub const REPAIR_INTERVAL_ENV: &str = "SVC_IPAM_REPAIR_INTERVAL_SECS";
pub const ALLOCATION_RETRIES_ENV: &str = "SVC_IPAM_ALLOCATION_RETRIES";
pub const ALLOCATION_STRATEGY_ENV: &str = "SVC_IPAM_ALLOCATION_STRATEGY";

pub const DEFAULT_REPAIR_INTERVAL_SECS: u64 = 180;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub namespace: String,
    pub service_cidr: IpNet,
    pub pool_name: String,
    pub repair_interval: Duration,
    pub allocation_retries: usize,
    pub allocation_strategy: AllocationStrategy,
}

#[derive(Debug, Error)]
pub enum FromError {
    #[error("Env var {} unavailable: {}", .0, .1)]
    VarUnset(&'static str, VarError),
    #[error("IP CIDR couldn't be parsed: {}", .0)]
    IpNetParse(AddrParseError),
    #[error("{} must be a non-negative number: {}", .0, .1)]
    NumberParse(&'static str, ParseIntError),
    #[error("{}", .0)]
    StrategyParse(InvalidAllocationStrategy),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Couldn't build the pool! Reason: {}", .0)]
    Builder(PoolBuilderError),
    #[error("The pool is invalid! Details: {}", .0)]
    Validation(PoolValidationError),
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, FromError> {
        Self::from_lookup(|key| std::env::var(key))
    }

    fn from_lookup(var: impl Fn(&'static str) -> Result<String, VarError>) -> Result<Self, FromError> {
        let required = |key: &'static str| var(key).map_err(|error| FromError::VarUnset(key, error));

        Ok(Self {
            namespace: required(NAMESPACE_ENV)?,
            service_cidr: required(SERVICE_CIDR_ENV)?
                .parse()
                .map_err(FromError::IpNetParse)?,
            pool_name: var(POOL_NAME_ENV).unwrap_or_else(|_| DEFAULT_POOL_NAME.to_owned()),
            repair_interval: Duration::from_secs(match var(REPAIR_INTERVAL_ENV) {
                Ok(secs) => secs
                    .parse()
                    .map_err(|error| FromError::NumberParse(REPAIR_INTERVAL_ENV, error))?,
                Err(_) => DEFAULT_REPAIR_INTERVAL_SECS,
            }),
            allocation_retries: match var(ALLOCATION_RETRIES_ENV) {
                Ok(retries) => retries
                    .parse()
                    .map_err(|error| FromError::NumberParse(ALLOCATION_RETRIES_ENV, error))?,
                Err(_) => DEFAULT_MAX_RETRIES,
            },
            allocation_strategy: match var(ALLOCATION_STRATEGY_ENV) {
                Ok(strategy) => strategy.parse().map_err(FromError::StrategyParse)?,
                Err(_) => AllocationStrategy::default(),
            },
        })
    }

    pub fn pool(&self) -> Result<Pool, PoolError> {
        PoolBuilder::default()
            .name(self.pool_name.to_owned())
            .namespace(self.namespace.to_owned())
            .network(self.service_cidr)
            .strategy(self.allocation_strategy)
            .max_retries(self.allocation_retries)
            .build()
            .map_err(PoolError::Builder)?
            .validated()
            .map_err(PoolError::Validation)
    }
}

use std::process::exit;

use anyhow::Context;
use kube::{api::PatchParams, Client};
use log::{error, info};
use svc_ipam_core::{
    allocation::{persisted::PersistedAllocator, repair::Repair, Pool},
    kubernetes::operations::create_namespace_if_not_exists,
    registry::ServiceRegistry,
    resources::crd::v1alpha1::{
        create_v1alpha1_crds, rangeallocation::RangeAllocation, virtualservice::VirtualService,
    },
    storage::kube_store::KubeStore,
    FIELD_MANAGER,
};

use crate::config::AgentConfig;

mod config;
mod repair;
mod services;

#[tokio::main()]
async fn main() -> anyhow::Result<()> {
    configure_logger();

    let config = get_config();
    let pool = get_pool(&config);
    let client = create_client().await;

    install_resources(&client, &pool).await;

    let services = KubeStore::<VirtualService>::new(client.clone());
    let ranges = pool.range_store(KubeStore::<RangeAllocation>::new(client));

    let allocator = PersistedAllocator::new(pool.allocator(), ranges.clone(), pool.max_retries);
    if let Err(error) = allocator.refresh().await {
        error!("Couldn't restore the {} pool! {error}", pool.name);
        exit(9)
    }

    let registry = ServiceRegistry::new(services.clone(), allocator);
    let repair_pass = Repair::new(services, ranges, pool.allocator(), pool.max_retries);

    tokio::select! {
        _ = repair::run_repair_loop(&repair_pass, config.repair_interval) => {},
        _ = services::log_service_changes(&registry) => {},
        signal = tokio::signal::ctrl_c() => {
            signal.context("Couldn't listen for the shutdown signal!")?;
            info!("Shutting down...");
        },
    }

    Ok(())
}

async fn create_client() -> Client {
    match Client::try_default().await {
        Ok(client) => client,
        Err(error) => {
            error!("Couldn't create client! {error:?}");
            exit(6)
        }
    }
}

fn get_config() -> AgentConfig {
    match AgentConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            error!("Couldn't retrieve agent configuration! {error:?}");
            exit(7)
        }
    }
}

fn get_pool(config: &AgentConfig) -> Pool {
    match config.pool() {
        Ok(pool) => pool,
        Err(error) => {
            error!("Invalid pool configuration! {error}");
            exit(7)
        }
    }
}

async fn install_resources(client: &Client, pool: &Pool) {
    let apply_params = PatchParams::apply(FIELD_MANAGER).force();

    if let Err(error) = create_namespace_if_not_exists(client, &apply_params, &pool.namespace).await {
        error!("Couldn't create the {} namespace! {error:?}", pool.namespace);
        exit(8)
    }

    if let Err(error) = create_v1alpha1_crds(client, &apply_params).await {
        error!("Couldn't install CRDs! {error:?}");
        exit(8)
    }
}

fn configure_logger() {
    env_logger::builder()
        .default_format()
        .format_module_path(false)
        .filter_level(log::LevelFilter::Info)
        .init()
}

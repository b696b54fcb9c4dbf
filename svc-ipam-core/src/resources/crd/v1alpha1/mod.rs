use kube::{api::PatchParams, Client, CustomResourceExt};

use crate::kubernetes::operations::apply_crd;

use self::{rangeallocation::RangeAllocation, virtualservice::VirtualService};

pub mod rangeallocation;
pub mod virtualservice;

pub async fn create_v1alpha1_crds(
    client: &Client,
    apply_params: &PatchParams,
) -> anyhow::Result<()> {
    let range_allocation_spec = RangeAllocation::crd();
    let virtual_service_spec = VirtualService::crd();

    apply_crd(client, &range_allocation_spec, apply_params).await?;
    apply_crd(client, &virtual_service_spec, apply_params).await?;

    Ok(())
}

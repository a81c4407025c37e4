use std::sync::Arc;

use tracing::info;

use crate::error::{CaptureError, ServiceError};
use crate::model::{Disk, DiskRole, VirtualMachine};
use crate::services::InventoryService;

/// Identifies the VM to capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureTarget {
    pub subscription_id: String,
    pub resource_group: String,
    pub vm_name: String,
}

/// Enumerates the target VM's disks with role tags.
#[derive(Clone)]
pub struct DiskInventory {
    service: Arc<dyn InventoryService>,
}

impl DiskInventory {
    pub fn new(service: Arc<dyn InventoryService>) -> Self {
        Self { service }
    }

    /// Loads the VM and returns it with disks in capture order: OS disk first,
    /// then data disks by LUN.
    pub async fn load(&self, target: &CaptureTarget) -> Result<VirtualMachine, CaptureError> {
        let mut vm = self
            .service
            .get_virtual_machine(&target.subscription_id, &target.resource_group, &target.vm_name)
            .await
            .map_err(|e| match e {
                ServiceError::Unauthorized(_) => CaptureError::Authorization {
                    resource: format!("{}/{}", target.resource_group, target.vm_name),
                    source: e,
                },
                other => CaptureError::service(format!("load vm {}", target.vm_name), other),
            })?;

        let os_disks = vm.disks.iter().filter(|d| d.role == DiskRole::Os).count();
        if os_disks != 1 {
            return Err(CaptureError::service(
                format!("load vm {}", target.vm_name),
                ServiceError::Protocol(format!("expected exactly one OS disk, found {os_disks}")),
            ));
        }

        order_disks(&mut vm.disks);
        info!(
            vm = %vm.name,
            data_disks = vm.disks.len() - 1,
            "disk inventory loaded"
        );
        Ok(vm)
    }
}

fn order_disks(disks: &mut [Disk]) {
    disks.sort_by_key(|d| match d.role {
        DiskRole::Os => (0, 0),
        DiskRole::Data => (1, d.lun.map(u64::from).unwrap_or(u64::MAX)),
    });
}

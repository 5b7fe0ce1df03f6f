use std::future::Future;

use futures_util::future::join_all;
use tracing::{error, info, warn};

use crate::events::{EventPublisher, names};
use crate::types::{MachineDetails, MachineId};
use crate::{Error, Result};

/// Start `count` management machines concurrently.
///
/// `create` is called once per machine with its 1-based index and must
/// enforce its own deadline (and clean up a half-created server when it
/// gives up). If any creation fails, every machine that did come up is
/// destroyed with `destroy` and the first error is returned, so a partial
/// management tier never leaks.
pub(crate) async fn start_management_machines<C, CFut, D, DFut>(
    count: usize,
    events: &EventPublisher,
    create: C,
    destroy: D,
) -> Result<Vec<MachineDetails>>
where
    C: Fn(usize) -> CFut,
    CFut: Future<Output = Result<MachineDetails>>,
    D: Fn(MachineId) -> DFut,
    DFut: Future<Output = Result<bool>>,
{
    if count == 0 {
        return Err(Error::Provisioning(
            "number of management machines must be at least 1".into(),
        ));
    }

    events.publish(names::ATTEMPT_START_MGMT_VMS, &[count.to_string()]);

    let results = join_all((1..=count).map(&create)).await;

    let mut created = Vec::with_capacity(count);
    let mut first_error = None;
    let mut failures = 0;
    for result in results {
        match result {
            Ok(machine) => created.push(machine),
            Err(e) => {
                failures += 1;
                error!(error = %e, "failed to start a management machine");
                events.publish(names::FAILED_TO_CREATE_MGMT_VM, &[e.to_string()]);
                first_error.get_or_insert(e);
            }
        }
    }

    if let Some(err) = first_error {
        warn!(
            failures,
            started = created.len(),
            "management machines failed to start, shutting down the ones that did"
        );
        for machine in &created {
            let Some(id) = &machine.machine_id else {
                continue;
            };
            if let Err(e) = destroy(id.clone()).await {
                warn!(machine_id = %id, error = %e, "failed to shut down management machine after provisioning failure");
            }
        }
        return Err(err);
    }

    info!(count, "management machines started");
    events.publish(names::MGMT_VMS_STARTED, &[count.to_string()]);
    Ok(created)
}

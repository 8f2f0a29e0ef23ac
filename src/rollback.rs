use crate::docker::ContainerRuntime;
use crate::zfs::FilesystemDriver;

/// One compensating action for a resource acquired mid-operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackAction {
    DestroySnapshot(String),
    /// Recursive: clones hanging off the dataset go with it.
    DestroyDataset(String),
    RemoveContainer(String),
}

/// LIFO registry of compensating actions. The controller pushes an action
/// as each resource is acquired; on success the registry is cleared, on
/// failure it is executed in reverse order. Each action swallows its own
/// error so unwinding always runs to completion.
#[derive(Debug, Default)]
pub struct RollbackRegistry {
    actions: Vec<RollbackAction>,
}

impl RollbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, action: RollbackAction) {
        self.actions.push(action);
    }

    pub fn clear(&mut self) {
        self.actions.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub async fn execute(&mut self, fs: &dyn FilesystemDriver, runtime: &dyn ContainerRuntime) {
        while let Some(action) = self.actions.pop() {
            log::warn!("rolling back: {action:?}");
            let result = match &action {
                RollbackAction::DestroySnapshot(name) => fs.destroy_snapshot(name).await,
                RollbackAction::DestroyDataset(name) => fs.destroy_dataset(name, true).await,
                RollbackAction::RemoveContainer(name) => runtime.remove_container(name).await,
            };
            if let Err(err) = result {
                log::warn!("rollback of {action:?} failed (continuing): {err:#}");
            }
        }
    }
}

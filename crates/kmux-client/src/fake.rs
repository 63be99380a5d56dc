//! In-memory lifecycle API for tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kmux_protocol::{ClientError, ClientResult, KernelId, KernelRecord, KernelSpec, LifecycleApi};
use parking_lot::Mutex;

#[derive(Default)]
struct State {
    specs: Vec<KernelSpec>,
    kernels: BTreeMap<KernelId, KernelRecord>,
    calls: Vec<String>,
    next_id: u32,
    new_id_on_restart: bool,
    probe_fails: bool,
}

#[derive(Default)]
pub(crate) struct FakeLifecycle {
    state: Mutex<State>,
}

impl FakeLifecycle {
    pub(crate) fn with_specs(specs: Vec<KernelSpec>) -> Self {
        let fake = Self::default();
        fake.state.lock().specs = specs;
        fake
    }

    pub(crate) fn add_kernel(&self, id: &str, name: &str) -> KernelId {
        let id = KernelId::from(id);
        self.state.lock().kernels.insert(id.clone(), record(&id, name));
        id
    }

    pub(crate) fn new_id_on_restart(&self) {
        self.state.lock().new_id_on_restart = true;
    }

    pub(crate) fn fail_probes(&self) {
        self.state.lock().probe_fails = true;
    }

    pub(crate) fn has_kernel(&self, id: &KernelId) -> bool {
        self.state.lock().kernels.contains_key(id)
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }
}

fn record(id: &KernelId, name: &str) -> KernelRecord {
    KernelRecord {
        id: id.clone(),
        name: name.to_owned(),
        execution_state: Some("idle".to_owned()),
        last_activity: None,
        connections: 0,
    }
}

#[async_trait]
impl LifecycleApi for FakeLifecycle {
    async fn kernelspecs(&self) -> ClientResult<Vec<KernelSpec>> {
        let mut state = self.state.lock();
        state.calls.push("kernelspecs".to_owned());
        Ok(state.specs.clone())
    }

    async fn kernels(&self) -> ClientResult<Vec<KernelRecord>> {
        Ok(self.state.lock().kernels.values().cloned().collect())
    }

    async fn get_kernel(&self, id: &KernelId) -> ClientResult<Option<KernelRecord>> {
        let state = self.state.lock();
        if state.probe_fails {
            return Err(ClientError::Lifecycle("probe refused".to_owned()));
        }
        Ok(state.kernels.get(id).cloned())
    }

    async fn create_kernel(&self, spec: &KernelSpec) -> ClientResult<KernelRecord> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = KernelId::from(format!("kernel-{:04}-0000-0000", state.next_id));
        let created = record(&id, &spec.name);
        state.kernels.insert(id, created.clone());
        state.calls.push(format!("create {}", spec.name));
        Ok(created)
    }

    async fn interrupt_kernel(&self, id: &KernelId) -> ClientResult<()> {
        self.state.lock().calls.push(format!("interrupt {id}"));
        Ok(())
    }

    async fn restart_kernel(&self, id: &KernelId) -> ClientResult<KernelRecord> {
        let mut state = self.state.lock();
        state.calls.push(format!("restart {id}"));
        let previous = state
            .kernels
            .remove(id)
            .ok_or_else(|| ClientError::KernelNotFound(id.clone()))?;
        let id = if state.new_id_on_restart {
            KernelId::from(format!("{id}-restarted"))
        } else {
            id.clone()
        };
        let restarted = record(&id, &previous.name);
        state.kernels.insert(id, restarted.clone());
        Ok(restarted)
    }

    async fn shutdown_kernel(&self, id: &KernelId) -> ClientResult<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("shutdown {id}"));
        state.kernels.remove(id);
        Ok(())
    }
}

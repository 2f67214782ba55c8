//! In-memory southbound shared by the scheduler tests

#![allow(dead_code)]

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use reconcile_api::*;
use reconcile_kernel::{Scheduler, SchedulerConfig};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn scheduler() -> Scheduler {
    scheduler_with(SchedulerConfig::testing())
}

pub fn scheduler_with(config: SchedulerConfig) -> Scheduler {
    init_logger();
    Scheduler::new(config).expect("scheduler")
}

/// Poll until the predicate holds, panicking after two seconds
pub fn wait_for(what: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !predicate() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(2));
    }
}

struct Failure {
    remaining: u32,
    retriable: bool,
}

/// Holds `add` until released
struct Gate {
    entered: Sender<()>,
    release: Receiver<()>,
}

/// Southbound state plus a journal of the operations applied to it
#[derive(Default)]
pub struct Southbound {
    values: Mutex<BTreeMap<String, (Value, u32)>>,
    journal: Mutex<Vec<String>>,
    failures: Mutex<BTreeMap<String, Failure>>,
    gate: Mutex<Option<Gate>>,
    next_index: Mutex<u32>,
}

impl Southbound {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `times` operations on the key
    pub fn fail(&self, key: &str, times: u32, retriable: bool) {
        self.failures.lock().insert(
            key.to_string(),
            Failure {
                remaining: times,
                retriable,
            },
        );
    }

    /// Fail the next `times` operations `op` ("ADD", "DELETE", "MODIFY")
    /// on the key, other operations on it succeed
    pub fn fail_op(&self, op: &str, key: &str, times: u32, retriable: bool) {
        self.fail(&format!("{} {}", op, key), times, retriable);
    }

    /// Block the next `add` until the returned sender is dropped or used.
    /// The receiver fires once `add` was entered.
    pub fn hold_next_add(&self) -> (Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = bounded(1);
        let (release_tx, release_rx) = bounded(1);
        *self.gate.lock() = Some(Gate {
            entered: entered_tx,
            release: release_rx,
        });
        (entered_rx, release_tx)
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().clone()
    }

    pub fn clear_journal(&self) {
        self.journal.lock().clear();
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().get(key).map(|(v, _)| v.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.values.lock().keys().cloned().collect()
    }

    /// Change SB behind the scheduler's back
    pub fn put(&self, key: &str, value: impl Into<Value>) -> u32 {
        let index = self.allocate_index();
        self.values
            .lock()
            .insert(key.to_string(), (value.into(), index));
        index
    }

    pub fn remove(&self, key: &str) {
        self.values.lock().remove(key);
    }

    fn allocate_index(&self) -> u32 {
        let mut next = self.next_index.lock();
        *next += 1;
        *next
    }

    fn record(&self, op: &str, key: &str) -> Result<(), DescriptorError> {
        let entry = format!("{} {}", op, key);
        self.journal.lock().push(entry.clone());
        let mut failures = self.failures.lock();
        let failing = if failures.get(&entry).map_or(false, |f| f.remaining > 0) {
            entry.as_str()
        } else {
            key
        };
        if let Some(failure) = failures.get_mut(failing) {
            if failure.remaining > 0 {
                failure.remaining -= 1;
                let err = if failure.retriable {
                    DescriptorError::msg(format!("{} busy", key))
                } else {
                    DescriptorError::msg(format!("{} rejected", key))
                };
                return Err(err);
            }
        }
        Ok(())
    }

    fn is_retriable(&self, err: &DescriptorError) -> bool {
        !err.to_string().ends_with("rejected")
    }

    fn wait_at_gate(&self) {
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.entered.send(());
            let _ = gate.release.recv();
        }
    }
}

type DependencyFn = Box<dyn Fn(&str, &Value) -> Vec<Dependency> + Send + Sync>;
type DerivedFn = Box<dyn Fn(&str, &Value) -> Vec<KeyValuePair> + Send + Sync>;

/// Descriptor applying values of one key prefix to the [`Southbound`]
pub struct MockDescriptor {
    name: String,
    prefix: String,
    sb: Arc<Southbound>,
    dependencies: Option<DependencyFn>,
    derived: Option<DerivedFn>,
    with_metadata: bool,
    recreate_on: Option<String>,
    dump: bool,
    dump_after: Vec<String>,
}

impl MockDescriptor {
    pub fn new(name: &str, prefix: &str, sb: &Arc<Southbound>) -> Self {
        Self {
            name: name.to_string(),
            prefix: prefix.to_string(),
            sb: Arc::clone(sb),
            dependencies: None,
            derived: None,
            with_metadata: false,
            recreate_on: None,
            dump: true,
            dump_after: Vec::new(),
        }
    }

    pub fn dependencies(
        mut self,
        f: impl Fn(&str, &Value) -> Vec<Dependency> + Send + Sync + 'static,
    ) -> Self {
        self.dependencies = Some(Box::new(f));
        self
    }

    pub fn derived(
        mut self,
        f: impl Fn(&str, &Value) -> Vec<KeyValuePair> + Send + Sync + 'static,
    ) -> Self {
        self.derived = Some(Box::new(f));
        self
    }

    /// Metadata is the SB index (`u32`) of the value
    pub fn with_metadata(mut self) -> Self {
        self.with_metadata = true;
        self
    }

    /// Changing this field requires delete + add
    pub fn recreate_on(mut self, field: &str) -> Self {
        self.recreate_on = Some(field.to_string());
        self
    }

    pub fn without_dump(mut self) -> Self {
        self.dump = false;
        self
    }

    pub fn dump_after(mut self, descriptor: &str) -> Self {
        self.dump_after.push(descriptor.to_string());
        self
    }

    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn metadata(&self, index: u32) -> Option<Metadata> {
        if self.with_metadata {
            Some(Arc::new(index))
        } else {
            None
        }
    }
}

impl Descriptor for MockDescriptor {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_selector(&self, key: &str) -> bool {
        key.starts_with(&self.prefix)
    }

    fn key_label(&self, key: &str) -> String {
        key.trim_start_matches(&self.prefix).to_string()
    }

    fn nb_key_prefix(&self) -> Option<&str> {
        Some(&self.prefix)
    }

    fn with_metadata(&self) -> bool {
        self.with_metadata
    }

    fn validate(&self, _key: &str, value: &Value) -> Result<(), DescriptorError> {
        match value.get("mtu").and_then(Value::as_int) {
            Some(mtu) if mtu < 0 => Err(InvalidValueError::new("negative mtu", ["mtu"]).into()),
            _ => Ok(()),
        }
    }

    fn add(&self, key: &str, value: &Value) -> Result<Option<Metadata>, DescriptorError> {
        self.sb.wait_at_gate();
        self.sb.record("ADD", key)?;
        let index = self.sb.put(key, value.clone());
        Ok(self.metadata(index))
    }

    fn delete(
        &self,
        key: &str,
        _value: &Value,
        _metadata: Option<&Metadata>,
    ) -> Result<(), DescriptorError> {
        self.sb.record("DELETE", key)?;
        self.sb.remove(key);
        Ok(())
    }

    fn modify(
        &self,
        key: &str,
        _old: &Value,
        new: &Value,
        metadata: Option<&Metadata>,
    ) -> Result<Option<Metadata>, DescriptorError> {
        self.sb.record("MODIFY", key)?;
        let index = self.sb.put(key, new.clone());
        match metadata {
            Some(metadata) => Ok(Some(Arc::clone(metadata))),
            None => Ok(self.metadata(index)),
        }
    }

    fn modify_with_recreate(
        &self,
        _key: &str,
        old: &Value,
        new: &Value,
        _metadata: Option<&Metadata>,
    ) -> bool {
        match &self.recreate_on {
            Some(field) => old.get(field) != new.get(field),
            None => false,
        }
    }

    fn is_retriable_failure(&self, err: &DescriptorError) -> bool {
        self.sb.is_retriable(err)
    }

    fn dependencies(&self, key: &str, value: &Value) -> Vec<Dependency> {
        self.dependencies
            .as_ref()
            .map(|f| f(key, value))
            .unwrap_or_default()
    }

    fn derived_values(&self, key: &str, value: &Value) -> Vec<KeyValuePair> {
        self.derived
            .as_ref()
            .map(|f| f(key, value))
            .unwrap_or_default()
    }

    fn dump(&self, _correlate: &[KvWithMetadata]) -> DumpResult {
        if !self.dump {
            return Err(DescriptorError::DumpUnimplemented);
        }
        let values = self.sb.values.lock();
        Ok(values
            .iter()
            .filter(|(key, _)| self.key_selector(key))
            .map(|(key, (value, index))| KvWithMetadata {
                key: key.clone(),
                value: Some(value.clone()),
                metadata: self.metadata(*index),
                origin: ValueOrigin::Unknown,
            })
            .collect())
    }

    fn dump_dependencies(&self) -> Vec<String> {
        self.dump_after.clone()
    }
}

/// `{"name": name}` object with extra fields
pub fn iface(name: &str) -> Value {
    Value::object().with("name", name)
}

/// Rule depending on the interface named in its `iface` field
pub fn rule_on(iface_name: &str) -> Value {
    Value::object().with("iface", iface_name)
}

/// Descriptor of rules `rule/*`, each depending on `iface/<iface field>`
pub fn rule_descriptor(sb: &Arc<Southbound>) -> Arc<MockDescriptor> {
    MockDescriptor::new("rule", "rule/", sb)
        .dependencies(|_key, value| {
            value
                .get("iface")
                .and_then(Value::as_str)
                .map(|name| vec![Dependency::on_key("interface", format!("iface/{}", name))])
                .unwrap_or_default()
        })
        .build()
}

// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Runtime profile tree with named counters and info strings.
//!
//! Operators register counters under their profile node and update them as
//! they run; the tree is read back for reporting after execution.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterUnit {
    Unit,
    Bytes,
    TimeMs,
}

#[derive(Debug)]
pub struct Counter {
    name: String,
    unit: CounterUnit,
    value: AtomicI64,
}

pub type CounterRef = Arc<Counter>;

impl Counter {
    pub fn new(name: impl Into<String>, unit: CounterUnit) -> CounterRef {
        Arc::new(Self {
            name: name.into(),
            unit,
            value: AtomicI64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> CounterUnit {
        self.unit
    }

    pub fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::AcqRel);
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Release);
    }

    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct ProfileState {
    counters: Vec<CounterRef>,
    info_strings: Vec<(String, String)>,
    children: Vec<RuntimeProfile>,
}

/// A named node in the profile tree.
#[derive(Clone, Debug)]
pub struct RuntimeProfile {
    name: Arc<Mutex<String>>,
    state: Arc<Mutex<ProfileState>>,
}

impl RuntimeProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Arc::new(Mutex::new(name.into())),
            state: Arc::new(Mutex::new(ProfileState::default())),
        }
    }

    pub fn name(&self) -> String {
        self.name.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Get or create a child profile with the given name.
    pub fn child(&self, name: impl Into<String>) -> RuntimeProfile {
        let name = name.into();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = state.children.iter().find(|c| c.name() == name) {
            return existing.clone();
        }
        let child = RuntimeProfile::new(name);
        state.children.push(child.clone());
        child
    }

    pub fn children(&self) -> Vec<RuntimeProfile> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .children
            .clone()
    }

    pub fn add_counter(&self, name: impl Into<String>, unit: CounterUnit) -> CounterRef {
        let name = name.into();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = state.counters.iter().find(|c| c.name() == name) {
            return Arc::clone(existing);
        }
        let counter = Counter::new(name, unit);
        state.counters.push(Arc::clone(&counter));
        counter
    }

    pub fn counter(&self, name: &str) -> Option<CounterRef> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .counters
            .iter()
            .find(|c| c.name() == name)
            .map(Arc::clone)
    }

    pub fn counter_add(&self, name: &str, unit: CounterUnit, delta: i64) {
        self.add_counter(name, unit).add(delta);
    }

    pub fn counter_set(&self, name: &str, unit: CounterUnit, value: i64) {
        self.add_counter(name, unit).set(value);
    }

    pub fn add_timer(&self, name: impl Into<String>) -> CounterRef {
        self.add_counter(name, CounterUnit::TimeMs)
    }

    pub fn scoped_timer(&self, name: impl Into<String>) -> ScopedTimer {
        ScopedTimer::new(self.add_timer(name))
    }

    pub fn add_info_string(&self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = state.info_strings.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
            return;
        }
        state.info_strings.push((key, value));
    }

    pub fn get_info_string(&self, key: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .info_strings
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }
}

/// Adds the elapsed wall time to a timer counter when dropped.
pub struct ScopedTimer {
    counter: CounterRef,
    start: Instant,
}

impl ScopedTimer {
    pub fn new(counter: CounterRef) -> Self {
        Self {
            counter,
            start: Instant::now(),
        }
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        self.counter.add(self.start.elapsed().as_millis() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_named_and_cumulative() {
        let profile = RuntimeProfile::new("op");
        profile.counter_add("Rows", CounterUnit::Unit, 5);
        profile.counter_add("Rows", CounterUnit::Unit, 7);
        assert_eq!(profile.counter("Rows").unwrap().value(), 12);
        profile.counter_set("Rows", CounterUnit::Unit, 3);
        assert_eq!(profile.counter("Rows").unwrap().value(), 3);
    }

    #[test]
    fn child_profiles_are_deduplicated() {
        let profile = RuntimeProfile::new("op");
        let a = profile.child("Spill");
        a.add_info_string("Dir", "/tmp/x");
        let b = profile.child("Spill");
        assert_eq!(b.get_info_string("Dir").as_deref(), Some("/tmp/x"));
        assert_eq!(profile.children().len(), 1);
    }
}

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
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Tracks logical memory usage for a component and its ancestors.
///
/// This is a lightweight accounting utility that only records bytes explicitly
/// reported by the caller. It does NOT reflect real process RSS or allocator
/// statistics. A tracker may carry a byte limit; `check_limit` walks the
/// ancestor chain and reports the first tracker whose limit would be exceeded.
#[derive(Debug)]
pub struct MemTracker {
    label: String,
    limit: AtomicI64,
    parent: Option<Arc<MemTracker>>,
    current: AtomicI64,
    peak: AtomicI64,
    allocated: AtomicI64,
    deallocated: AtomicI64,
    children: Mutex<Vec<Weak<MemTracker>>>,
}

impl MemTracker {
    /// Create a root tracker with no parent and no limit.
    pub fn new_root(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            limit: AtomicI64::new(-1),
            parent: None,
            current: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            allocated: AtomicI64::new(0),
            deallocated: AtomicI64::new(0),
            children: Mutex::new(Vec::new()),
        })
    }

    /// Create a child tracker with the provided parent.
    pub fn new_child(label: impl Into<String>, parent: &Arc<MemTracker>) -> Arc<Self> {
        let child = Arc::new(Self {
            label: label.into(),
            limit: AtomicI64::new(-1),
            parent: Some(Arc::clone(parent)),
            current: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            allocated: AtomicI64::new(0),
            deallocated: AtomicI64::new(0),
            children: Mutex::new(Vec::new()),
        });
        parent
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::downgrade(&child));
        child
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Byte limit for this tracker; negative means unlimited.
    pub fn limit(&self) -> i64 {
        self.limit.load(Ordering::Relaxed)
    }

    pub fn set_limit(&self, limit: i64) {
        self.limit.store(limit, Ordering::Relaxed);
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }

    pub fn allocated(&self) -> i64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn deallocated(&self) -> i64 {
        self.deallocated.load(Ordering::Relaxed)
    }

    pub fn children(&self) -> Vec<Arc<MemTracker>> {
        let mut out = Vec::new();
        let guard = self.children.lock().unwrap_or_else(|e| e.into_inner());
        for weak in guard.iter() {
            if let Some(child) = weak.upgrade() {
                out.push(child);
            }
        }
        out
    }

    /// Increase consumption for this tracker and all ancestors.
    pub fn consume(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            let new_value = current.current.fetch_add(bytes, Ordering::AcqRel) + bytes;
            current.allocated.fetch_add(bytes, Ordering::AcqRel);
            current.update_peak(new_value);
            tracker = current.parent.as_deref();
        }
    }

    /// Decrease consumption for this tracker and all ancestors.
    pub fn release(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            current.current.fetch_sub(bytes, Ordering::AcqRel);
            current.deallocated.fetch_add(bytes, Ordering::AcqRel);
            tracker = current.parent.as_deref();
        }
    }

    /// Check whether consuming `extra` more bytes would exceed any limit on
    /// this tracker or its ancestors.
    pub fn check_limit(&self, extra: i64) -> Result<(), String> {
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(current) = tracker {
            let limit = current.limit();
            if limit >= 0 {
                let would_be = current.current().saturating_add(extra.max(0));
                if would_be > limit {
                    return Err(format!(
                        "memory limit exceeded on tracker {}: current={} extra={} limit={}",
                        current.label,
                        current.current(),
                        extra,
                        limit
                    ));
                }
            }
            tracker = current.parent.as_deref();
        }
        Ok(())
    }

    fn update_peak(&self, value: i64) {
        let mut prev = self.peak.load(Ordering::Relaxed);
        while value > prev {
            match self
                .peak
                .compare_exchange(prev, value, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_rolls_up_to_parent() {
        let root = MemTracker::new_root("root");
        let child = MemTracker::new_child("child", &root);
        child.consume(100);
        assert_eq!(child.current(), 100);
        assert_eq!(root.current(), 100);
        child.release(40);
        assert_eq!(child.current(), 60);
        assert_eq!(root.current(), 60);
        assert_eq!(root.peak(), 100);
    }

    #[test]
    fn check_limit_walks_ancestors() {
        let root = MemTracker::new_root("root");
        root.set_limit(100);
        let child = MemTracker::new_child("child", &root);
        child.consume(80);
        assert!(child.check_limit(10).is_ok());
        let err = child.check_limit(30).unwrap_err();
        assert!(err.contains("memory limit exceeded"), "{err}");
        root.set_limit(-1);
        assert!(child.check_limit(1 << 40).is_ok());
    }
}

// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Prometheus monitoring metrics.

use std::time::Instant;

use prometheus::{CounterVec, IntCounter, IntCounterVec, Opts, Registry};

use crate::error::StoreError;

/// Metrics for identifier allocation.
///
/// Prometheus metrics can be cloned cheaply; every clone reports into the
/// same underlying series.
#[derive(Debug, Clone)]
pub struct AllocMetrics {
    ids_allocated: IntCounterVec,
    refills: IntCounterVec,
    refill_failures: IntCounterVec,
    refill_seconds: CounterVec,
}

impl AllocMetrics {
    /// Returns a new [`AllocMetrics`] instance connected to the given
    /// registry.
    pub fn register_into(registry: &Registry) -> Result<AllocMetrics, prometheus::Error> {
        let metrics = AllocMetrics::unregistered()?;
        registry.register(Box::new(metrics.ids_allocated.clone()))?;
        registry.register(Box::new(metrics.refills.clone()))?;
        registry.register(Box::new(metrics.refill_failures.clone()))?;
        registry.register(Box::new(metrics.refill_seconds.clone()))?;
        Ok(metrics)
    }

    /// Metrics that are recorded but not exported anywhere.
    pub fn noop() -> AllocMetrics {
        AllocMetrics::unregistered().expect("metric definitions are valid")
    }

    fn unregistered() -> Result<AllocMetrics, prometheus::Error> {
        Ok(AllocMetrics {
            ids_allocated: IntCounterVec::new(
                Opts::new(
                    "idalloc_ids_allocated_total",
                    "count of identifiers handed out",
                ),
                &["namespace"],
            )?,
            refills: IntCounterVec::new(
                Opts::new(
                    "idalloc_refills_total",
                    "count of blocks reserved from the counter store",
                ),
                &["namespace"],
            )?,
            refill_failures: IntCounterVec::new(
                Opts::new(
                    "idalloc_refill_failures_total",
                    "count of failed attempts to reserve a block",
                ),
                &["namespace"],
            )?,
            refill_seconds: CounterVec::new(
                Opts::new(
                    "idalloc_refill_seconds",
                    "time spent reserving blocks from the counter store",
                ),
                &["namespace"],
            )?,
        })
    }

    pub(crate) fn namespace(&self, namespace: &'static str) -> NamespaceMetrics {
        NamespaceMetrics {
            ids_allocated: self.ids_allocated.with_label_values(&[namespace]),
            refills: self.refills.with_label_values(&[namespace]),
            refill_failures: self.refill_failures.with_label_values(&[namespace]),
            refill_seconds: self.refill_seconds.with_label_values(&[namespace]),
        }
    }
}

/// [`AllocMetrics`] resolved for one counter namespace.
#[derive(Debug, Clone)]
pub(crate) struct NamespaceMetrics {
    pub ids_allocated: IntCounter,
    refills: IntCounter,
    refill_failures: IntCounter,
    refill_seconds: prometheus::Counter,
}

impl NamespaceMetrics {
    /// Runs `f`, recording it as one refill.
    pub fn refill<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce() -> Result<T, StoreError>,
    {
        let start = Instant::now();
        let res = f();
        self.refill_seconds.inc_by(start.elapsed().as_secs_f64());
        match &res {
            Ok(_) => self.refills.inc(),
            Err(_) => self.refill_failures.inc(),
        }
        res
    }
}

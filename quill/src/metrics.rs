// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of quill.
//
// quill is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// quill is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even
// the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General
// Public License for more details.
//
// You should have received a copy of the GNU General Public License along with quill.  If not, see
// <http://www.gnu.org/licenses/>.

//! # quill metrics
//!
//! # Introduction
//!
//! quill counts things (pages served, logins, cache hits & so on) & exports them in the
//! [Prometheus] text format from its private router. Two problems present themselves: where to keep
//! the instruments (I'd prefer not to litter the application state with dozens of `Counter`
//! fields), and how to avoid two call sites accidentally sharing a metric name without keeping an
//! inconvenient centralized list.
//!
//! [Prometheus]: https://prometheus.io/docs/instrumenting/exposition_formats/
//!
//! # metrics
//!
//! This module uses David Tolnay's [inventory] crate to work around the need for a centralized
//! list. At the metric collection site:
//!
//! ```ignore
//! inventory::submit!(metrics::Registration::new("posts.index.served", Sort::IntegralCounter));
//! // ...
//! async fn do_thing() {
//!     // ...
//!     counter_add!(state.instruments, "posts.index.served", 1);
//! }
//! ```
//!
//! The `submit!` invocation "registers" the metric name & the macro `counter_add!` handles the
//! lookup at runtime. The [Instruments] constructor checks for name clashes & "pre-builds" all the
//! instruments, so that recording a value never needs `&mut self`.
//!
//! Looking up a name that was never registered is a logic error, and panics.

use std::collections::{hash_map::Entry, HashMap, HashSet};

use prometheus_client::{
    encoding::text::encode,
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Instrument type
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Sort {
    /// A monotonically increasing `u64`
    IntegralCounter,
    /// An `i64` that can go up & down
    IntegralGauge,
}

/// The type of thing being inventoried
///
/// Register a metric by name & type using
///
/// ```ignore
/// inventory::submit!{metrics::Registration::new("users.logins.successful", Sort::IntegralCounter)}
/// ```
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Registration {
    name: &'static str,
    sort: Sort,
}

impl Registration {
    pub const fn new(name: &'static str, sort: Sort) -> Registration {
        Registration { name, sort }
    }
    pub fn name(&self) -> &'static str {
        self.name
    }
    pub fn sort(&self) -> Sort {
        self.sort
    }
}

inventory::collect!(Registration);

/// Panic if any metric name has been registered twice
pub fn check_metric_registrations() {
    let mut names: HashSet<&'static str> = HashSet::new();
    IntoIterator::into_iter(inventory::iter::<Registration>).for_each(|reg| {
        if !names.insert(reg.name()) {
            panic!("The metric name {} was used twice", reg.name());
        }
    });
}

enum Instrument {
    Counter(Counter),
    Gauge(Gauge),
}

/// Container for all of quill's instruments
pub struct Instruments {
    registry: Registry,
    map: HashMap<&'static str, Instrument>,
}

impl std::fmt::Debug for Instruments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instruments")
            .field("instruments", &self.map.len())
            .finish()
    }
}

impl Instruments {
    pub fn new(prefix: &'static str) -> Instruments {
        let mut registry = Registry::with_prefix(prefix);
        let mut map: HashMap<&'static str, Instrument> = HashMap::new();
        IntoIterator::into_iter(inventory::iter::<Registration>).for_each(|reg| {
            // Prometheus names may not contain '.'
            let prom_name = reg.name().replace(['.', '-'], "_");
            match map.entry(reg.name()) {
                Entry::Occupied(_) => {
                    panic!("The metric name {} was used twice", reg.name())
                }
                Entry::Vacant(vacant_entry) => {
                    vacant_entry.insert(match reg.sort() {
                        Sort::IntegralCounter => {
                            let counter = Counter::default();
                            registry.register(prom_name, reg.name(), counter.clone());
                            Instrument::Counter(counter)
                        }
                        Sort::IntegralGauge => {
                            let gauge = Gauge::default();
                            registry.register(prom_name, reg.name(), gauge.clone());
                            Instrument::Gauge(gauge)
                        }
                    });
                }
            }
        });
        Instruments { registry, map }
    }
    // panics if `name` doesn't name a counter
    pub fn add(&self, name: &str, count: u64) {
        if let Some(Instrument::Counter(c)) = self.map.get(name) {
            c.inc_by(count);
        } else {
            panic!("{} does not name a counter", name);
        }
    }
    // panics if `name` doesn't name a gauge
    pub fn set(&self, name: &str, value: i64) {
        if let Some(Instrument::Gauge(g)) = self.map.get(name) {
            g.set(value);
        } else {
            panic!("{} does not name a gauge", name);
        }
    }
    /// Current value of a counter; `None` if `name` doesn't name a counter
    pub fn counter_value(&self, name: &str) -> Option<u64> {
        match self.map.get(name) {
            Some(Instrument::Counter(c)) => Some(c.get()),
            _ => None,
        }
    }
    /// Render every instrument in the Prometheus text exposition format
    pub fn export(&self) -> std::result::Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

#[macro_export]
macro_rules! counter_add {
    ($instr:expr, $name:expr, $count:expr) => {
        $instr.add($name, $count);
    };
}

#[macro_export]
macro_rules! gauge_set {
    ($instr:expr, $name:expr, $value:expr) => {
        $instr.set($name, $value);
    };
}

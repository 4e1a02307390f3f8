//! Worker report options
//!
//! Selects which workers and which fields a capacity report covers. The
//! store always computes the full report; these options are applied by the
//! reporting layer. Each enum carries one table mapping variants to their
//! wire names, and parsing goes through that table only.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Fields of a worker report
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkerInfoField {
    Address,
    CapacityBytes,
    CapacityBytesOnTiers,
    Id,
    LastContactSec,
    StartTimeMs,
    State,
    UsedBytes,
    UsedBytesOnTiers,
}

const WORKER_INFO_FIELDS: &[(WorkerInfoField, &str)] = &[
    (WorkerInfoField::Address, "ADDRESS"),
    (WorkerInfoField::CapacityBytes, "CAPACITY_BYTES"),
    (WorkerInfoField::CapacityBytesOnTiers, "CAPACITY_BYTES_ON_TIERS"),
    (WorkerInfoField::Id, "ID"),
    (WorkerInfoField::LastContactSec, "LAST_CONTACT_SEC"),
    (WorkerInfoField::StartTimeMs, "START_TIME_MS"),
    (WorkerInfoField::State, "STATE"),
    (WorkerInfoField::UsedBytes, "USED_BYTES"),
    (WorkerInfoField::UsedBytesOnTiers, "USED_BYTES_ON_TIERS"),
];

impl WorkerInfoField {
    /// All fields, in wire order
    pub fn all() -> impl Iterator<Item = WorkerInfoField> {
        WORKER_INFO_FIELDS.iter().map(|(field, _)| *field)
    }

    /// Wire name of this field
    #[must_use]
    pub fn wire_name(&self) -> &'static str {
        WORKER_INFO_FIELDS
            .iter()
            .find(|(field, _)| field == self)
            .map_or("", |(_, name)| name)
    }

    /// Parse a wire name
    pub fn from_wire(name: &str) -> Result<Self> {
        WORKER_INFO_FIELDS
            .iter()
            .find(|(_, wire)| *wire == name)
            .map(|(field, _)| *field)
            .ok_or_else(|| Error::invalid_argument(format!("unknown worker info field: {name}")))
    }
}

/// Range of workers a report covers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum WorkerRange {
    #[default]
    All,
    Live,
    Lost,
    /// Only the workers listed in `WorkerReportOptions::addresses`
    Specified,
}

const WORKER_RANGES: &[(WorkerRange, &str)] = &[
    (WorkerRange::All, "ALL"),
    (WorkerRange::Live, "LIVE"),
    (WorkerRange::Lost, "LOST"),
    (WorkerRange::Specified, "SPECIFIED"),
];

impl WorkerRange {
    #[must_use]
    pub fn wire_name(&self) -> &'static str {
        WORKER_RANGES
            .iter()
            .find(|(range, _)| range == self)
            .map_or("", |(_, name)| name)
    }

    pub fn from_wire(name: &str) -> Result<Self> {
        WORKER_RANGES
            .iter()
            .find(|(_, wire)| *wire == name)
            .map(|(range, _)| *range)
            .ok_or_else(|| Error::invalid_argument(format!("unknown worker range: {name}")))
    }
}

macro_rules! wire_enum_impls {
    ($ty:ty) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.wire_name())
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::from_wire(s)
            }
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(self.wire_name())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let name = String::deserialize(deserializer)?;
                Self::from_wire(&name).map_err(serde::de::Error::custom)
            }
        }
    };
}

wire_enum_impls!(WorkerInfoField);
wire_enum_impls!(WorkerRange);

/// Options of a worker report request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReportOptions {
    /// Worker addresses, used with `WorkerRange::Specified`
    pub addresses: BTreeSet<String>,
    /// Fields to include
    pub field_range: BTreeSet<WorkerInfoField>,
    /// Workers to include
    pub worker_range: WorkerRange,
}

impl Default for WorkerReportOptions {
    fn default() -> Self {
        Self {
            addresses: BTreeSet::new(),
            field_range: WorkerInfoField::all().collect(),
            worker_range: WorkerRange::All,
        }
    }
}

impl WorkerReportOptions {
    #[must_use]
    pub fn with_addresses(mut self, addresses: impl IntoIterator<Item = String>) -> Self {
        self.addresses = addresses.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_field_range(mut self, fields: impl IntoIterator<Item = WorkerInfoField>) -> Self {
        self.field_range = fields.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_worker_range(mut self, range: WorkerRange) -> Self {
        self.worker_range = range;
        self
    }

    /// Reject option combinations that cannot be served
    pub fn validate(&self) -> Result<()> {
        if self.worker_range == WorkerRange::Specified && self.addresses.is_empty() {
            return Err(Error::invalid_argument(
                "worker range SPECIFIED requires at least one address",
            ));
        }
        if self.field_range.is_empty() {
            return Err(Error::invalid_argument("field range must not be empty"));
        }
        Ok(())
    }

    /// Whether a worker at `address`, live or not, falls in the range
    #[must_use]
    pub fn includes_worker(&self, address: &str, live: bool) -> bool {
        match self.worker_range {
            WorkerRange::All => true,
            WorkerRange::Live => live,
            WorkerRange::Lost => !live,
            WorkerRange::Specified => self.addresses.contains(address),
        }
    }

    /// Parse wire names from a comma separated list, e.g. "CAPACITY_BYTES,USED_BYTES"
    pub fn parse_field_range(list: &str) -> Result<BTreeSet<WorkerInfoField>> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(WorkerInfoField::from_wire)
            .collect()
    }
}

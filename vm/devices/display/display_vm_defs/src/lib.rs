// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Definitions shared between the display VM arbitration layer and the KMS
//! code that embeds it.
//!
//! These types describe the hardware resources that move between the primary
//! and trusted VMs (interrupt lines and I/O memory ranges), the opaque tokens
//! handed out by the hypervisor resource manager, and the configuration that
//! describes which resources belong to which role.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;

use serde::Deserialize;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::ops::Range;
use thiserror::Error;

const PAGE_SIZE: u64 = 4096;

/// A VM identifier assigned by the hypervisor resource manager.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmId(pub u16);

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vm{}", self.0)
    }
}

/// The label the hypervisor resource manager uses to name an interrupt line
/// in lend and reclaim calls.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IrqLabel(pub u32);

impl fmt::Display for IrqLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An interrupt line that can be handed between VMs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrqEntry {
    /// The resource manager label.
    pub label: IrqLabel,
    /// The locally mapped interrupt number.
    pub irq: u32,
}

impl IrqEntry {
    /// Returns a new entry.
    pub const fn new(label: u32, irq: u32) -> Self {
        Self {
            label: IrqLabel(label),
            irq,
        }
    }
}

/// Error returned when building an [`IrqDesc`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidIrqDesc {
    /// The same label appears more than once.
    #[error("irq label {0} appears more than once")]
    DuplicateLabel(IrqLabel),
}

/// An ordered list of interrupt lines.
///
/// The order is the order in which the lines are requested from the resource
/// manager, and the order in which they are handed back.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<IrqEntry>", into = "Vec<IrqEntry>")]
pub struct IrqDesc(Vec<IrqEntry>);

impl IrqDesc {
    /// Builds a descriptor, rejecting duplicate labels.
    pub fn new(entries: Vec<IrqEntry>) -> Result<Self, InvalidIrqDesc> {
        let mut seen = HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.label) {
                return Err(InvalidIrqDesc::DuplicateLabel(entry.label));
            }
        }
        Ok(Self(entries))
    }

    /// The entries, in request order.
    pub fn entries(&self) -> &[IrqEntry] {
        &self.0
    }

    /// The number of interrupt lines.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no interrupt lines.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The labels, in request order.
    pub fn labels(&self) -> Vec<IrqLabel> {
        self.0.iter().map(|entry| entry.label).collect()
    }

    /// Returns true if `labels` names exactly the lines in this descriptor,
    /// regardless of order.
    pub fn matches_labels(&self, labels: &[IrqLabel]) -> bool {
        if labels.len() != self.0.len() {
            return false;
        }
        let mut expected = self.labels();
        let mut actual = labels.to_vec();
        expected.sort_unstable();
        actual.sort_unstable();
        expected == actual
    }
}

impl TryFrom<Vec<IrqEntry>> for IrqDesc {
    type Error = InvalidIrqDesc;

    fn try_from(entries: Vec<IrqEntry>) -> Result<Self, Self::Error> {
        Self::new(entries)
    }
}

impl From<IrqDesc> for Vec<IrqEntry> {
    fn from(desc: IrqDesc) -> Self {
        desc.0
    }
}

/// Error returned by [`IoRange::try_new`].
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unaligned or empty io range: {start:#x}-{end:#x}")]
pub struct InvalidIoRange {
    start: u64,
    end: u64,
}

/// A non-empty, 4KB-page-aligned physical address range of display I/O
/// memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "IoRangeSpec", into = "IoRangeSpec")]
pub struct IoRange {
    start: u64,
    end: u64,
}

impl fmt::Display for IoRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}-{:#x}", self.start, self.end)
    }
}

impl IoRange {
    /// Returns a new range, or an error if either end is not 4KB aligned or
    /// the range is empty.
    pub const fn try_new(range: Range<u64>) -> Result<Self, InvalidIoRange> {
        if range.start & (PAGE_SIZE - 1) != 0
            || range.end & (PAGE_SIZE - 1) != 0
            || range.start >= range.end
        {
            return Err(InvalidIoRange {
                start: range.start,
                end: range.end,
            });
        }
        Ok(Self {
            start: range.start,
            end: range.end,
        })
    }

    /// The start address.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// The end address (exclusive).
    pub fn end(&self) -> u64 {
        self.end
    }

    /// The length of the range in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Always false; ranges are never empty.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Returns true if the two ranges share any bytes.
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// The device tree style `(base, size)` form of an [`IoRange`].
#[derive(Serialize, Deserialize)]
struct IoRangeSpec {
    base: u64,
    size: u64,
}

impl TryFrom<IoRangeSpec> for IoRange {
    type Error = InvalidIoRange;

    fn try_from(spec: IoRangeSpec) -> Result<Self, Self::Error> {
        let end = spec.base.checked_add(spec.size).ok_or(InvalidIoRange {
            start: spec.base,
            end: u64::MAX,
        })?;
        Self::try_new(spec.base..end)
    }
}

impl From<IoRange> for IoRangeSpec {
    fn from(range: IoRange) -> Self {
        Self {
            base: range.start,
            size: range.len(),
        }
    }
}

/// Error returned when building a [`SglDesc`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidSglDesc {
    /// The descriptor has no ranges.
    #[error("scatter list has no io ranges")]
    Empty,
    /// Two ranges share bytes.
    #[error("io ranges {0} and {1} overlap")]
    Overlap(IoRange, IoRange),
}

/// A scatter list of the I/O memory ranges lent to the trusted VM as a single
/// resource manager handle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<IoRange>", into = "Vec<IoRange>")]
pub struct SglDesc(Vec<IoRange>);

impl SglDesc {
    /// Builds a scatter list, rejecting empty lists and overlapping ranges.
    pub fn new(mut ranges: Vec<IoRange>) -> Result<Self, InvalidSglDesc> {
        if ranges.is_empty() {
            return Err(InvalidSglDesc::Empty);
        }
        ranges.sort();
        for pair in ranges.windows(2) {
            if pair[0].overlaps(&pair[1]) {
                return Err(InvalidSglDesc::Overlap(pair[0], pair[1]));
            }
        }
        Ok(Self(ranges))
    }

    /// The ranges, sorted by address.
    pub fn ranges(&self) -> &[IoRange] {
        &self.0
    }

    /// The total number of bytes described.
    pub fn total_len(&self) -> u64 {
        self.0.iter().map(IoRange::len).sum()
    }
}

impl TryFrom<Vec<IoRange>> for SglDesc {
    type Error = InvalidSglDesc;

    fn try_from(ranges: Vec<IoRange>) -> Result<Self, Self::Error> {
        Self::new(ranges)
    }
}

impl From<SglDesc> for Vec<IoRange> {
    fn from(desc: SglDesc) -> Self {
        desc.0
    }
}

/// The resource manager's identifier for a lent I/O memory region.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MemHandle(pub u32);

impl fmt::Display for MemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Token correlating an asynchronous resource manager notification with the
/// local operation waiting on it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct NotificationCookie(pub u64);

impl fmt::Display for NotificationCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A VM ownership request state, as defined by the display subsystem.
///
/// The arbitration layer never interprets the value; it only matches pairs of
/// states against the configured transition table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestState(pub u32);

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The part of an atomic commit that the VM layer looks at.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CommitState {
    /// Monotonic commit sequence number.
    pub sequence: u64,
}

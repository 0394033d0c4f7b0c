// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! GTID sets and their ordering.
//!
//! A GTID set (the value of `gtid_executed` on an instance) records, per
//! source, which transactions the instance has applied. Failover picks the
//! replica whose set is furthest ahead, so the interesting operation here is
//! comparing two sets: ahead, behind, equal, or incomparable when each side
//! has seen transactions the other lacks.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GtidError {
    /// A range that is not `N` or `N-M` with `N <= M`.
    #[error("invalid gtid interval: '{0}'")]
    InvalidInterval(String),
    /// An entry without a source id or without any interval.
    #[error("invalid gtid: '{0}'")]
    InvalidGtid(String),
}

/// Represents either a GTID interval or a single GTID point.
/// If this is a single GTID point, start == end.
#[derive(Debug, Clone, Deserialize, Serialize, Hash, PartialEq, Eq)]
pub struct GtidInterval {
    pub start: u64,
    pub end: u64,
}

impl fmt::Display for GtidInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // A singular GTID interval is represented as a single point
        if self.start != self.end {
            write!(f, "{}-{}", self.start, self.end)
        } else {
            write!(f, "{}", self.start)
        }
    }
}

impl FromStr for GtidInterval {
    type Err = GtidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let vals: Vec<u64> = s
            .split('-')
            .map(|num| num.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| GtidError::InvalidInterval(s.to_string()))?;
        match vals[..] {
            [point] => Ok(Self {
                start: point,
                end: point,
            }),
            [start, end] if start <= end => Ok(Self { start, end }),
            _ => Err(GtidError::InvalidInterval(s.to_string())),
        }
    }
}

/// The transactions recorded for a single source, e.g.
/// `3E11FA47-71CA-11E1-9E33-C80AA9429562:1-3:4:5-9`. Source ids are kept as
/// opaque strings; nothing here depends on them being UUIDs.
///
/// Intervals are stored as received. MySQL emits them sorted and
/// non-overlapping, but nothing below requires that: ordering questions are
/// answered from the highest interval end alone.
#[derive(Debug, Clone, Deserialize, Serialize, Hash, PartialEq, Eq)]
pub struct Gtid {
    pub source_id: String,
    intervals: Vec<GtidInterval>,
}

impl Gtid {
    pub fn new(source_id: String) -> Self {
        Self {
            source_id,
            intervals: vec![],
        }
    }

    /// The highest transaction id recorded for this source, or 0 if no
    /// intervals have been added.
    pub fn latest_transaction_id(&self) -> u64 {
        self.intervals
            .iter()
            .map(|interval| interval.end)
            .max()
            .unwrap_or(0)
    }

    pub fn add_interval(&mut self, new: GtidInterval) -> &mut Self {
        if let Some(last) = self.intervals.last_mut() {
            // checked: the last interval may already end at u64::MAX
            if last.end.checked_add(1) == Some(new.start) {
                // If the interval starts right after the last interval ends,
                // just extend the last interval
                last.end = new.end;
                return self;
            }
        }
        self.intervals.push(new);
        self
    }

    pub fn intervals(&self) -> impl Iterator<Item = &GtidInterval> {
        self.intervals.iter()
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source_id)?;
        for interval in &self.intervals {
            write!(f, ":")?;
            interval.fmt(f)?;
        }
        fmt::Result::Ok(())
    }
}

impl FromStr for Gtid {
    type Err = GtidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (source_id, intervals) = s
            .split_once(':')
            .ok_or_else(|| GtidError::InvalidGtid(s.to_string()))?;
        if source_id.is_empty() {
            return Err(GtidError::InvalidGtid(s.to_string()));
        }

        let mut new = Self::new(source_id.to_string());
        for interval_str in intervals.split(':') {
            new.add_interval(GtidInterval::from_str(interval_str)?);
        }
        Ok(new)
    }
}

/// How one GTID set stands relative to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GtidSetRelation {
    /// Every source vote says the other set is further along.
    Behind,
    /// No source has progressed past the other.
    Equal,
    /// Every source vote says this set is further along.
    Ahead,
    /// Each side has transactions the other lacks. This is a normal
    /// outcome, not an error: such replicas have diverged and neither is a
    /// safe failover source for the other.
    Incomparable,
}

impl GtidSetRelation {
    /// The relation as seen from the other operand.
    pub fn reverse(self) -> Self {
        match self {
            Self::Behind => Self::Ahead,
            Self::Ahead => Self::Behind,
            other => other,
        }
    }
}

/// A representation of a MySQL GTID set (returned from the `gtid_executed` &
/// `gtid_purged` system variables), e.g.
/// `2174B383-5441-11E8-B90A-C80AA9429562:1-3, 24DA167-0C0C-11E8-8442-00059A3C7B00:1-19`.
#[derive(Debug, Clone, Deserialize, Serialize, Hash, PartialEq, Eq)]
pub struct GtidSet {
    gtids: BTreeMap<String, Gtid>,
}

impl GtidSet {
    pub fn new() -> Self {
        Self {
            gtids: BTreeMap::new(),
        }
    }

    pub fn add_gtid(&mut self, new: Gtid) -> &Self {
        if let Some(existing) = self.gtids.get_mut(&new.source_id) {
            for interval in new.intervals {
                existing.add_interval(interval);
            }
        } else {
            self.gtids.insert(new.source_id.clone(), new);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.gtids.is_empty()
    }

    /// Returns an iterator over all GTIDs in the set, ordered by source id.
    pub fn gtids(&self) -> impl Iterator<Item = &Gtid> {
        self.gtids.values()
    }

    /// Orders `self` against `other` by walking the union of their sources.
    /// Per source: a source only `self` knows votes ahead, a source only
    /// `other` knows votes behind, and a shared source votes by its highest
    /// recorded transaction id (a tie casts no vote). Unanimous votes decide
    /// the relation; no votes at all means the sets are equal; split votes
    /// mean the sets have diverged and are incomparable.
    pub fn compare(&self, other: &GtidSet) -> GtidSetRelation {
        let mut ahead = false;
        let mut behind = false;
        let sources: std::collections::BTreeSet<&String> =
            self.gtids.keys().chain(other.gtids.keys()).collect();
        for source in sources {
            let ours = self.gtids.get(source).map(Gtid::latest_transaction_id);
            let theirs = other.gtids.get(source).map(Gtid::latest_transaction_id);
            match (ours, theirs) {
                (Some(ours), Some(theirs)) if ours > theirs => ahead = true,
                (Some(ours), Some(theirs)) if ours < theirs => behind = true,
                (Some(_), Some(_)) => {}
                (Some(_), None) => ahead = true,
                (None, Some(_)) => behind = true,
                (None, None) => {}
            }
        }
        match (ahead, behind) {
            (false, false) => GtidSetRelation::Equal,
            (true, false) => GtidSetRelation::Ahead,
            (false, true) => GtidSetRelation::Behind,
            (true, true) => GtidSetRelation::Incomparable,
        }
    }
}

impl Default for GtidSet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, gtid) in self.gtids.values().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            gtid.fmt(f)?;
        }
        fmt::Result::Ok(())
    }
}

impl FromStr for GtidSet {
    type Err = GtidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut new = Self::new();
        // An instance that has executed no transactions reports an empty
        // gtid_executed.
        if s.trim().is_empty() {
            return Ok(new);
        }

        for gtid_str in s.split(',') {
            // add_gtid() will consolidate gtids to save representation space
            new.add_gtid(Gtid::from_str(gtid_str.trim())?);
        }

        Ok(new)
    }
}

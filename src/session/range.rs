//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Crymap.
//
// Crymap is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Crymap is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Crymap. If not, see <http://www.gnu.org/licenses/>.

//! Pure operations over sets of sequence numbers or UIDs.
//!
//! Sets are held as a minimal sorted list of disjoint, non-adjacent, inclusive
//! intervals. Sequence sets sent by clients are usually a handful of
//! intervals, so insertion simply walks the list.

use std::fmt;
use std::iter;

/// The value that out-of-range or unparseable numbers clamp to.
pub const MAX_ID: u32 = u32::MAX;

/// A set of IDs represented as sorted, merged, inclusive intervals.
///
/// The `Display` format is the minimal IMAP sequence-set form, e.g.
/// `1:5,8,10:12`. The empty set displays as the empty string, which is not
/// valid on the wire; callers must check `is_empty()` where that matters.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RangeList {
    ranges: Vec<(u32, u32)>,
}

impl RangeList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a comma-separated list of `n` and `n:m` tokens.
    ///
    /// `*` resolves to `star`. Pairs may be given in either order. Numbers
    /// too large to represent, and anything else that does not parse as a
    /// number, become `MAX_ID` instead of failing. Empty tokens are ignored,
    /// so the empty string is the empty set.
    pub fn parse(text: &str, star: u32) -> Self {
        let mut this = Self::new();
        for part in text.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let mut subs = part.splitn(2, ':');
            match (subs.next(), subs.next()) {
                (Some(low), Some(high)) => {
                    this.insert(parse_id(low, star), parse_id(high, star))
                }
                (Some(only), None) => {
                    let only = parse_id(only, star);
                    this.insert(only, only);
                }
                (None, _) => (),
            }
        }

        this
    }

    /// Add the inclusive interval `[a, b]` (in either order), merging with
    /// any intervals it overlaps or touches.
    pub fn insert(&mut self, a: u32, b: u32) {
        let (mut low, mut high) = (a.min(b), a.max(b));

        let start = self
            .ranges
            .iter()
            .position(|&(_, h)| h.saturating_add(1) >= low)
            .unwrap_or(self.ranges.len());
        let mut end = start;
        while let Some(&(l, h)) = self.ranges.get(end) {
            if l > high.saturating_add(1) {
                break;
            }

            low = low.min(l);
            high = high.max(h);
            end += 1;
        }

        self.ranges.splice(start..end, iter::once((low, high)));
    }

    /// Add `[low, high]` where `low` is expected to be beyond everything
    /// already present. Falls back to `insert()` otherwise.
    fn append(&mut self, low: u32, high: u32) {
        match self.ranges.last().map(|&(_, h)| h) {
            Some(last_high) if last_high >= low => self.insert(low, high),
            Some(last_high) if last_high.saturating_add(1) == low => {
                if let Some(last) = self.ranges.last_mut() {
                    last.1 = high;
                }
            }
            _ => self.ranges.push((low, high)),
        }
    }

    /// Return the intervals making up this set, in ascending order.
    pub fn ranges(&self) -> &[(u32, u32)] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Return the number of IDs in the set.
    pub fn len(&self) -> u64 {
        self.ranges
            .iter()
            .map(|&(l, h)| (h - l) as u64 + 1)
            .sum()
    }

    pub fn min(&self) -> Option<u32> {
        self.ranges.first().map(|&(l, _)| l)
    }

    pub fn max(&self) -> Option<u32> {
        self.ranges.last().map(|&(_, h)| h)
    }

    pub fn contains(&self, v: u32) -> bool {
        match self.ranges.binary_search_by(|&(l, _)| l.cmp(&v)) {
            Ok(_) => true,
            Err(0) => false,
            Err(ix) => self.ranges[ix - 1].1 >= v,
        }
    }

    /// Iterate every ID in the set in ascending order.
    pub fn items(&self) -> impl Iterator<Item = u32> + '_ {
        self.ranges.iter().flat_map(|&(l, h)| l..=h)
    }

    /// Return the part of this set within `[low, high]`.
    pub fn crop(&self, low: u32, high: u32) -> Self {
        if low > high {
            return Self::new();
        }

        Self {
            ranges: self
                .ranges
                .iter()
                .filter(|&&(l, h)| h >= low && l <= high)
                .map(|&(l, h)| (l.max(low), h.min(high)))
                .collect(),
        }
    }

    /// Return the IDs in this set which do not appear in `present`.
    ///
    /// `present` must be strictly ascending. It may contain IDs outside this
    /// set; those are skipped. This is a single pass over both inputs.
    pub fn invert(&self, present: impl IntoIterator<Item = u32>) -> Self {
        let mut out = Self::new();
        let mut present = present.into_iter().peekable();

        for &(low, high) in &self.ranges {
            // u64 so that high == MAX_ID does not overflow
            let mut next = u64::from(low);
            while let Some(&id) = present.peek() {
                let id64 = u64::from(id);
                if id64 < next {
                    present.next();
                    continue;
                }
                if id > high {
                    break;
                }

                if id64 > next {
                    out.append(next as u32, id - 1);
                }
                next = id64 + 1;
                present.next();
            }

            if next <= u64::from(high) {
                out.append(next as u32, high);
            }
        }

        out
    }
}

impl iter::FromIterator<u32> for RangeList {
    fn from_iter<I: IntoIterator<Item = u32>>(ids: I) -> Self {
        let mut this = Self::new();
        for id in ids {
            this.append(id, id);
        }
        this
    }
}

impl fmt::Display for RangeList {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (ix, &(low, high)) in self.ranges.iter().enumerate() {
            let delim = if 0 == ix { "" } else { "," };

            if low == high {
                write!(f, "{}{}", delim, low)?;
            } else {
                write!(f, "{}{}:{}", delim, low, high)?;
            }
        }

        Ok(())
    }
}

impl fmt::Debug for RangeList {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}]", self)
    }
}

/// Run-length encode an ascending sequence of IDs into `n` / `n:m` tokens.
pub fn encode(ids: impl IntoIterator<Item = u32>) -> String {
    ids.into_iter().collect::<RangeList>().to_string()
}

fn parse_id(token: &str, star: u32) -> u32 {
    let token = token.trim();
    if "*" == token {
        return star;
    }

    match token.parse::<u64>() {
        Ok(v) if v <= u64::from(MAX_ID) => v as u32,
        _ => MAX_ID,
    }
}

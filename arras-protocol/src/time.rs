// Copyright 2024 Arras Core Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::ops::{Add, Sub};

use chrono::{DateTime, TimeZone, Utc};

/// A normalized `(seconds, microseconds)` pair, usable as either an
/// absolute instant or an interval. Always canonicalized so that for
/// non-negative values `0 <= micros < 1_000_000`, and for negative
/// values `-1_000_000 < micros <= 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, serde::Serialize, serde::Deserialize)]
pub struct ArrasTime {
    pub seconds: i32,
    pub micros: i32,
}

const MICROS_PER_SEC: i64 = 1_000_000;

impl ArrasTime {
    pub fn new(seconds: i32, micros: i32) -> Self {
        ArrasTime { seconds, micros }.normalize()
    }

    pub fn now() -> Self {
        let now = Utc::now();
        ArrasTime::new(now.timestamp() as i32, now.timestamp_subsec_micros() as i32)
    }

    /// Re-establishes the canonical form after arithmetic that may
    /// have carried microseconds out of range. Idempotent. Uses
    /// truncating division, so a negative instant keeps a negative
    /// (or zero) `micros` rather than borrowing a second to make it
    /// positive.
    pub fn normalize(self) -> Self {
        let total_micros = (self.seconds as i64) * MICROS_PER_SEC + self.micros as i64;
        let seconds = total_micros / MICROS_PER_SEC;
        let micros = total_micros % MICROS_PER_SEC;
        ArrasTime { seconds: seconds as i32, micros: micros as i32 }
    }

    /// Renders the time as it would appear embedded in a filename:
    /// `<seconds>_<micros>`, zero-padded to six digits.
    pub fn filename_str(&self) -> String {
        format!("{}_{:06}", self.seconds, self.micros)
    }

    pub fn from_filename(s: &str) -> Option<Self> {
        let (sec_part, micro_part) = s.split_once('_')?;
        let seconds: i32 = sec_part.parse().ok()?;
        let micros: i32 = micro_part.parse().ok()?;
        Some(ArrasTime::new(seconds, micros))
    }

    pub fn to_chrono(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.seconds as i64, (self.micros as u32) * 1000).single()
    }
}

impl Add for ArrasTime {
    type Output = ArrasTime;
    fn add(self, rhs: ArrasTime) -> ArrasTime {
        ArrasTime { seconds: self.seconds + rhs.seconds, micros: self.micros + rhs.micros }.normalize()
    }
}

impl Sub for ArrasTime {
    type Output = ArrasTime;
    fn sub(self, rhs: ArrasTime) -> ArrasTime {
        ArrasTime { seconds: self.seconds - rhs.seconds, micros: self.micros - rhs.micros }.normalize()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn normalize_is_idempotent() {
        let t = ArrasTime::new(3, 1_500_000);
        assert_eq!(t, t.normalize());
        assert_eq!(t.seconds, 4);
        assert_eq!(t.micros, 500_000);
    }

    #[test]
    fn normalize_handles_negative_micros() {
        let t = ArrasTime::new(0, -200_000);
        assert_eq!(t.seconds, 0);
        assert_eq!(t.micros, -200_000);
    }

    #[test]
    fn add_then_subtract_is_identity() {
        let a = ArrasTime::new(100, 250_000);
        let b = ArrasTime::new(7, 900_000);
        assert_eq!((a + b) - b, a);
    }

    #[test]
    fn filename_round_trip_for_positive_times() {
        let a = ArrasTime::new(1_700_000_000, 123_456);
        let s = a.filename_str();
        assert_eq!(ArrasTime::from_filename(&s), Some(a));
    }
}

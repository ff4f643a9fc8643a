// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Live-update surface and program persistence helpers.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// A new program image posted by a tenant.
#[derive(Clone, Debug)]
pub struct LiveUpdateParams {
    pub binary: Vec<u8>,
    /// Optional dedicated storage image; the request image doubles as the
    /// storage image when absent.
    pub storage_binary: Option<Vec<u8>>,
    pub is_debug: bool,
}

/// Human-readable outcome passed back to the updating client.
#[derive(Clone, Debug, PartialEq)]
pub struct LiveUpdateResult {
    pub text: String,
    pub success: bool,
}

impl LiveUpdateResult {
    pub fn ok(text: impl Into<String>) -> Self {
        Self { text: text.into(), success: true }
    }

    pub fn fail(text: impl Into<String>) -> Self {
        Self { text: text.into(), success: false }
    }
}

/// Best-effort persistence of a program image; reports success without
/// throwing, the cached binary is only an optimization.
pub fn file_writer(path: impl AsRef<Path>, data: &[u8]) -> bool {
    std::fs::write(path, data).is_ok()
}

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct",
    "Nov", "Dec",
];

/// Formats a timestamp as an IMF-fixdate (`Tue, 23 Jul 2022 10:00:00 GMT`)
/// for `If-Modified-Since` headers.
pub fn http_date(time: SystemTime) -> String {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let days = secs.div_euclid(86_400);
    let rem = secs.rem_euclid(86_400);
    let (hh, mm, ss) = (rem / 3600, (rem / 60) % 60, rem % 60);
    let weekday = (days + 4).rem_euclid(7) as usize; // epoch was a Thursday

    // Civil-from-days, days since 1970-01-01.
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if month <= 2 { year + 1 } else { year };

    format!(
        "{}, {:02} {} {} {:02}:{:02}:{:02} GMT",
        WEEKDAYS[weekday],
        day,
        MONTHS[(month - 1) as usize],
        year,
        hh,
        mm,
        ss
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn http_date_formats_known_instants() {
        assert_eq!(http_date(UNIX_EPOCH), "Thu, 01 Jan 1970 00:00:00 GMT");
        // 2022-07-23 10:20:30 UTC, a Saturday.
        let t = UNIX_EPOCH + Duration::from_secs(1_658_571_630);
        assert_eq!(http_date(t), "Sat, 23 Jul 2022 10:20:30 GMT");
        // Leap-day handling: 2024-02-29 12:00:00 UTC, a Thursday.
        let leap = UNIX_EPOCH + Duration::from_secs(1_709_208_000);
        assert_eq!(http_date(leap), "Thu, 29 Feb 2024 12:00:00 GMT");
    }

    #[test]
    fn update_result_helpers() {
        assert!(LiveUpdateResult::ok("stored").success);
        assert!(!LiveUpdateResult::fail("nope").success);
    }
}

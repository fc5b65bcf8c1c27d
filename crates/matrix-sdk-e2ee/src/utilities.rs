// Copyright 2023 The Matrix.org Foundation C.I.C.
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

use std::{fmt::Debug, time::Duration};

use ruma::{MilliSecondsSinceUnixEpoch, UInt};

/// A source of wall-clock time.
///
/// Every timestamp the crate records (session creation, the last time an Olm
/// message was received, key request timestamps) comes from a `Clock`, which
/// lets the embedding application and the tests control time.
pub trait Clock: Debug + Send + Sync {
    /// The current time.
    fn now(&self) -> MilliSecondsSinceUnixEpoch;
}

/// The [`Clock`] backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> MilliSecondsSinceUnixEpoch {
        MilliSecondsSinceUnixEpoch::now()
    }
}

/// How much time passed between `since` and `now`, zero if `now` is earlier.
pub(crate) fn elapsed(
    since: MilliSecondsSinceUnixEpoch,
    now: MilliSecondsSinceUnixEpoch,
) -> Duration {
    let since = u64::from(since.get());
    let now = u64::from(now.get());

    Duration::from_millis(now.saturating_sub(since))
}

pub(crate) fn millis(ms: u64) -> MilliSecondsSinceUnixEpoch {
    MilliSecondsSinceUnixEpoch(UInt::new_saturating(ms))
}

#[cfg(test)]
pub(crate) use mock::MockClock;


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{elapsed, millis};

    #[test]
    fn test_elapsed_never_goes_negative() {
        assert_eq!(elapsed(millis(2_000), millis(5_000)), Duration::from_secs(3));
        assert_eq!(elapsed(millis(5_000), millis(2_000)), Duration::ZERO);
    }
}

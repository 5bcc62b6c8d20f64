/*
 *
 *    Copyright (c) 2020-2022 Project CHIP Authors
 *
 *    Licensed under the Apache License, Version 2.0 (the "License");
 *    you may not use this file except in compliance with the License.
 *    You may obtain a copy of the License at
 *
 *        http://www.apache.org/licenses/LICENSE-2.0
 *
 *    Unless required by applicable law or agreed to in writing, software
 *    distributed under the License is distributed on an "AS IS" BASIS,
 *    WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *    See the License for the specific language governing permissions and
 *    limitations under the License.
 */

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error};

use crate::error::*;
use crate::persist::KvStore;
use crate::utils::rand::Rand;

/// Initial counters are random but leave plenty of room before wrapping
pub const MATTER_MSG_CTR_RANGE: u32 = 0x0fff_ffff;

/// How many counter values the persisted counter reserves with a single store write
pub const MSG_CTR_RESERVE_EPOCH: u32 = 0x1000;

/// Key-value store key of the persisted unsecured message counter
pub const UNSECURED_CTR_KEY: &str = "unsec-ctr";

fn random_ctr(rand: Rand) -> u32 {
    let mut buf = [0; 4];
    rand(&mut buf);

    LittleEndian::read_u32(&buf) & MATTER_MSG_CTR_RANGE
}

/// The outgoing message counter of one session.
///
/// Strictly increasing; refuses to wrap around.
#[derive(Debug, Clone)]
pub struct MessageCounter {
    current: u32,
}

impl MessageCounter {
    pub fn new(rand: Rand) -> Self {
        Self {
            current: random_ctr(rand),
        }
    }

    /// The last counter value handed out
    pub fn current(&self) -> u32 {
        self.current
    }

    /// Force the counter so that the next value handed out is `last + 1`
    pub fn set(&mut self, last: u32) {
        self.current = last;
    }

    pub fn next(&mut self) -> Result<u32, Error> {
        self.current = self
            .current
            .checked_add(1)
            .ok_or(ErrorCode::CounterExhausted)?;

        Ok(self.current)
    }
}

/// The global counter used for unsecured (session establishment) messages.
///
/// Values are reserved in blocks of [`MSG_CTR_RESERVE_EPOCH`]; the upper end
/// of the current block is persisted before any value of it is used, so the
/// counter never goes back after a restart.
#[derive(Debug)]
pub struct PersistedCounter {
    current: u32,
    reserved_until: u32,
}

impl PersistedCounter {
    pub fn load(store: &mut dyn KvStore, rand: Rand) -> Result<Self, Error> {
        let mut buf = [0; 4];

        let start = match store.load(UNSECURED_CTR_KEY, &mut buf)? {
            Some(data) if data.len() == 4 => LittleEndian::read_u32(data),
            Some(_) => {
                // Starting over could hand out counters already used before the restart
                error!("Persisted message counter is corrupted");
                Err(ErrorCode::InvalidData)?
            }
            None => random_ctr(rand),
        };

        let mut ctr = Self {
            current: start,
            reserved_until: start,
        };

        ctr.reserve(store, start)?;

        debug!(
            "Unsecured message counter starts at {}, reserved until {}",
            ctr.current, ctr.reserved_until
        );

        Ok(ctr)
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn next(&mut self, store: &mut dyn KvStore) -> Result<u32, Error> {
        let next = self
            .current
            .checked_add(1)
            .ok_or(ErrorCode::CounterExhausted)?;

        if next > self.reserved_until {
            self.reserve(store, next)?;
        }

        self.current = next;

        Ok(next)
    }

    fn reserve(&mut self, store: &mut dyn KvStore, from: u32) -> Result<(), Error> {
        let until = from.saturating_add(MSG_CTR_RESERVE_EPOCH);

        let mut buf = [0; 4];
        LittleEndian::write_u32(&mut buf, until);
        store.store(UNSECURED_CTR_KEY, &buf)?;

        self.reserved_until = until;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::persist::MemKvStore;
    use crate::utils::rand::dummy_rand;

    #[test]
    fn initial_value_in_range() {
        let ctr = MessageCounter::new(dummy_rand);
        assert!(ctr.current() <= MATTER_MSG_CTR_RANGE);
    }

    #[test]
    fn strictly_increasing() {
        let mut ctr = MessageCounter::new(dummy_rand);
        let first = ctr.next().unwrap();
        let second = ctr.next().unwrap();

        assert_eq!(second, first + 1);
    }

    #[test]
    fn refuses_to_wrap() {
        let mut ctr = MessageCounter::new(dummy_rand);
        ctr.set(u32::MAX - 1);

        assert_eq!(ctr.next().unwrap(), u32::MAX);
        assert_eq!(ctr.next().unwrap_err().code(), ErrorCode::CounterExhausted);
        assert_eq!(ctr.next().unwrap_err().code(), ErrorCode::CounterExhausted);
    }

    #[test]
    fn persisted_never_goes_back() {
        let mut store = MemKvStore::new();

        let mut ctr = PersistedCounter::load(&mut store, dummy_rand).unwrap();
        let mut last = 0;
        for _ in 0..(MSG_CTR_RESERVE_EPOCH + 10) {
            last = ctr.next(&mut store).unwrap();
        }

        // Simulated reboot
        let mut ctr = PersistedCounter::load(&mut store, dummy_rand).unwrap();
        assert!(ctr.next(&mut store).unwrap() > last);
    }

    #[test]
    fn corrupted_record_is_not_reseeded() {
        let mut store = MemKvStore::new();
        store.store(UNSECURED_CTR_KEY, &[0x01, 0x00, 0x00]).unwrap();

        assert_eq!(
            PersistedCounter::load(&mut store, dummy_rand).unwrap_err().code(),
            ErrorCode::InvalidData
        );

        // The record is left for someone to look at
        let mut buf = [0; 4];
        assert_eq!(
            store.load(UNSECURED_CTR_KEY, &mut buf).unwrap(),
            Some(&[0x01, 0x00, 0x00][..])
        );

        store.store(UNSECURED_CTR_KEY, &[0; 8]).unwrap();
        assert!(PersistedCounter::load(&mut store, dummy_rand).is_err());
    }

    #[test]
    fn persisted_reserves_in_epochs() {
        let mut store = MemKvStore::new();

        let mut ctr = PersistedCounter::load(&mut store, dummy_rand).unwrap();
        let start = ctr.current();

        let mut buf = [0; 4];
        let stored = LittleEndian::read_u32(store.load(UNSECURED_CTR_KEY, &mut buf).unwrap().unwrap());
        assert_eq!(stored, start + MSG_CTR_RESERVE_EPOCH);

        for _ in 0..MSG_CTR_RESERVE_EPOCH {
            ctr.next(&mut store).unwrap();
        }
        let stored = LittleEndian::read_u32(store.load(UNSECURED_CTR_KEY, &mut buf).unwrap().unwrap());
        assert_eq!(stored, start + MSG_CTR_RESERVE_EPOCH);

        ctr.next(&mut store).unwrap();
        let stored = LittleEndian::read_u32(store.load(UNSECURED_CTR_KEY, &mut buf).unwrap().unwrap());
        assert_eq!(stored, start + 2 * MSG_CTR_RESERVE_EPOCH + 1);
    }
}

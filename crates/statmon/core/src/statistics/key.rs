// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Identity of one statistics entry
///
/// Equality is plain field-wise equality. Two keys that differ only in
/// `bucket_id` describe the same statement in different time windows and are
/// independent entries.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EntryKey {
    pub bucket_id: u64,
    pub query_id: u64,
    pub user_id: u64,
    pub database_id: u64,
    pub client_ip: u64,
    pub plan_id: u64,
    pub application_id: u64,
    pub top_level: bool,
}

impl EntryKey {
    /// Deterministic hash used to place the key in the shared index
    ///
    /// The index is shared between processes, so this must not depend on any
    /// per-process random state.
    pub fn slot_hash(&self) -> u64 {
        let fields = [
            self.bucket_id,
            self.query_id,
            self.user_id,
            self.database_id,
            self.client_ip,
            self.plan_id,
            self.application_id,
            self.top_level as u64,
        ];
        fields.iter().fold(0x9e37_79b9_7f4a_7c15u64, |acc, &field| mix64(acc ^ field))
    }
}

/// Key fields supplied by the ingest path, everything but the bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeyFields {
    pub query_id: u64,
    pub user_id: u64,
    pub database_id: u64,
    pub client_ip: u64,
    pub plan_id: u64,
    pub application_id: u64,
    pub top_level: bool,
}

impl KeyFields {
    pub fn in_bucket(&self, bucket_id: u64) -> EntryKey {
        EntryKey {
            bucket_id,
            query_id: self.query_id,
            user_id: self.user_id,
            database_id: self.database_id,
            client_ip: self.client_ip,
            plan_id: self.plan_id,
            application_id: self.application_id,
            top_level: self.top_level,
        }
    }
}

/// Stable 64-bit id of an application name
pub fn application_id(name: &str) -> u64 {
    let digest = blake3::hash(name.as_bytes());
    let mut id = [0u8; 8];
    id.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(id)
}

/// Folds a client address into the 64-bit key field
pub fn client_ip_key(addr: IpAddr) -> u64 {
    match addr {
        IpAddr::V4(v4) => u32::from(v4) as u64,
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return u32::from(v4) as u64;
            }
            let bits = u128::from(v6);
            (bits >> 64) as u64 ^ bits as u64
        }
    }
}

/// splitmix64 finalizer
#[inline]
fn mix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn key() -> EntryKey {
        EntryKey {
            bucket_id: 0,
            query_id: 42,
            user_id: 10,
            database_id: 5,
            client_ip: 0x7f00_0001,
            plan_id: 0,
            application_id: application_id("psql"),
            top_level: true,
        }
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(key().slot_hash(), key().slot_hash());
    }

    #[test]
    fn test_hash_covers_every_field() {
        let base = key().slot_hash();
        assert_ne!(EntryKey { bucket_id: 1, ..key() }.slot_hash(), base);
        assert_ne!(EntryKey { application_id: 7, ..key() }.slot_hash(), base);
        assert_ne!(EntryKey { top_level: false, ..key() }.slot_hash(), base);
    }

    #[test]
    fn test_keys_differing_in_bucket_are_distinct() {
        let fields = KeyFields {
            query_id: 1,
            ..Default::default()
        };
        assert_ne!(fields.in_bucket(0), fields.in_bucket(1));
        assert_eq!(fields.in_bucket(3).query_id, 1);
    }

    #[test]
    fn test_application_id_is_stable() {
        assert_eq!(application_id("psql"), application_id("psql"));
        assert_ne!(application_id("psql"), application_id("pgbench"));
    }

    #[test]
    fn test_client_ip_key() {
        let v4 = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(client_ip_key(v4), 0x7f00_0001);

        let mapped = IpAddr::V6(Ipv4Addr::new(127, 0, 0, 1).to_ipv6_mapped());
        assert_eq!(client_ip_key(mapped), 0x7f00_0001);

        let v6 = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1));
        assert_ne!(client_ip_key(v6), 0);
    }
}

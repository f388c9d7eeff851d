/// The onion service directory hash ring
///
/// HSDirs are placed on the ring by their ed25519 identity and the shared
/// random value of the period; a descriptor is stored at the next few
/// positions after each of its replica indices.
use crate::crypto::hash::sha3_256;
use minitor_common::config::onion::{HSDIR_N_REPLICAS, HSDIR_SPREAD_FETCH, TIME_PERIOD_LENGTH};
use minitor_common::{Fingerprint, Timestamp};

/// Shared random value clients use for the ring
///
/// The current value applies from noon UTC of the consensus day, the
/// previous one before that; with neither, the disaster value.
pub fn shared_random_value(
    current: Option<[u8; 32]>,
    previous: Option<[u8; 32]>,
    valid_after: Timestamp,
    period: u64,
) -> [u8; 32] {
    let preferred = if valid_after.hour_of_day() >= 12 {
        current
    } else {
        previous
    };
    preferred.unwrap_or_else(|| disaster_srv(period))
}

pub fn disaster_srv(period: u64) -> [u8; 32] {
    sha3_256(&[
        b"shared-random-disaster",
        &TIME_PERIOD_LENGTH.to_be_bytes(),
        &period.to_be_bytes(),
    ])
}

/// Ring position of a descriptor replica
pub fn hs_index(blinded_key: &[u8; 32], replica: u8, period: u64) -> [u8; 32] {
    sha3_256(&[
        b"store-at-idx",
        blinded_key,
        &u64::from(replica).to_be_bytes(),
        &TIME_PERIOD_LENGTH.to_be_bytes(),
        &period.to_be_bytes(),
    ])
}

/// Ring position of an HSDir
pub fn hsdir_index(ed25519_identity: &[u8; 32], srv: &[u8; 32], period: u64) -> [u8; 32] {
    sha3_256(&[
        b"node-idx",
        ed25519_identity,
        srv,
        &period.to_be_bytes(),
        &TIME_PERIOD_LENGTH.to_be_bytes(),
    ])
}

pub struct HsDirRing {
    /// Sorted by ring position
    entries: Vec<([u8; 32], Fingerprint)>,
}

impl HsDirRing {
    pub fn new(hsdirs: &[(Fingerprint, [u8; 32])], srv: &[u8; 32], period: u64) -> Self {
        let mut entries: Vec<([u8; 32], Fingerprint)> = hsdirs
            .iter()
            .map(|(fingerprint, ed)| (hsdir_index(ed, srv, period), *fingerprint))
            .collect();
        entries.sort();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// HSDirs responsible for the descriptor, replica by replica, without repeats
    pub fn responsible(&self, blinded_key: &[u8; 32], period: u64) -> Vec<Fingerprint> {
        let mut chosen: Vec<Fingerprint> = Vec::new();
        if self.entries.is_empty() {
            return chosen;
        }

        for replica in 1..=HSDIR_N_REPLICAS {
            let index = hs_index(blinded_key, replica, period);
            let start = self.entries.partition_point(|(position, _)| *position < index);
            let mut taken = 0;
            for offset in 0..self.entries.len() {
                if taken == HSDIR_SPREAD_FETCH {
                    break;
                }
                let (_, fingerprint) = self.entries[(start + offset) % self.entries.len()];
                if !chosen.contains(&fingerprint) {
                    chosen.push(fingerprint);
                    taken += 1;
                }
            }
        }
        chosen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hsdirs(count: u8) -> Vec<(Fingerprint, [u8; 32])> {
        (1..=count)
            .map(|i| (Fingerprint::from_bytes([i; 20]), [i; 32]))
            .collect()
    }

    #[test]
    fn srv_follows_the_consensus_hour() {
        let morning = Timestamp::from_secs(1_704_067_200 + 3600);
        let evening = Timestamp::from_secs(1_704_067_200 + 13 * 3600);
        let (current, previous) = (Some([2; 32]), Some([1; 32]));

        assert_eq!(shared_random_value(current, previous, morning, 5), [1; 32]);
        assert_eq!(shared_random_value(current, previous, evening, 5), [2; 32]);
        assert_eq!(shared_random_value(current, None, morning, 5), disaster_srv(5));
        assert_ne!(disaster_srv(5), disaster_srv(6));
    }

    #[test]
    fn spread_covers_both_replicas() {
        let ring = HsDirRing::new(&hsdirs(20), &[9; 32], 100);
        let chosen = ring.responsible(&[4; 32], 100);
        assert_eq!(chosen.len(), 2 * HSDIR_SPREAD_FETCH);

        let unique: std::collections::HashSet<_> = chosen.iter().collect();
        assert_eq!(unique.len(), chosen.len());
    }

    #[test]
    fn first_pick_follows_replica_index() {
        let dirs = hsdirs(10);
        let srv = [3; 32];
        let ring = HsDirRing::new(&dirs, &srv, 42);
        let blinded = [8; 32];

        let target = hs_index(&blinded, 1, 42);
        let mut positions: Vec<([u8; 32], Fingerprint)> = dirs
            .iter()
            .map(|(fp, ed)| (hsdir_index(ed, &srv, 42), *fp))
            .collect();
        positions.sort();
        let expected = positions
            .iter()
            .find(|(position, _)| *position >= target)
            .unwrap_or(&positions[0])
            .1;

        assert_eq!(ring.responsible(&blinded, 42)[0], expected);
    }

    #[test]
    fn small_ring_returns_everyone_once() {
        let ring = HsDirRing::new(&hsdirs(4), &[0; 32], 1);
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.responsible(&[1; 32], 1).len(), 4);
        assert!(HsDirRing::new(&[], &[0; 32], 1).responsible(&[1; 32], 1).is_empty());
    }
}

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Durable snapshot of sampling progress.
///
/// The serialised form is a stable, human-readable JSON blob; unknown fields
/// are tolerated so the format can grow without breaking older nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The smallest height not yet proven sampled. Everything below it has
    /// either been sampled or is recorded in `failed`.
    #[serde(rename = "SampleFrom")]
    pub sample_from: u64,

    /// The greatest height known at the time of the snapshot.
    #[serde(rename = "NetworkHead")]
    pub network_head: u64,

    /// Heights that failed sampling, with the number of times each failed.
    #[serde(
        rename = "Failed",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub failed: BTreeMap<u64, u16>,

    /// Ranges that were being sampled when the snapshot was taken.
    #[serde(rename = "Workers", default, skip_serializing_if = "Vec::is_empty")]
    pub workers: Vec<WorkerCheckpoint>,
}

/// A job that was in progress when the checkpoint was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCheckpoint {
    /// First height of the interrupted range.
    #[serde(rename = "From")]
    pub from: u64,

    /// Last height of the interrupted range.
    #[serde(rename = "To")]
    pub to: u64,

    /// The next height within the range that has not been attempted yet.
    #[serde(rename = "Current")]
    pub current: u64,
}

impl Checkpoint {
    /// Checkpoint of a fresh node that has not sampled anything yet.
    pub fn initial(genesis_height: u64) -> Checkpoint {
        Checkpoint {
            sample_from: genesis_height,
            network_head: genesis_height,
            failed: BTreeMap::new(),
            workers: Vec::new(),
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SampleFrom: {}, NetworkHead: {}, Failed: {}, Workers: {}",
            self.sample_from,
            self.network_head,
            self.failed.len(),
            self.workers.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::collection::{btree_map, vec};
    use proptest::prelude::*;

    #[test]
    fn blob_format() {
        let cp = Checkpoint {
            sample_from: 50,
            network_head: 500,
            failed: BTreeMap::from([(4, 1), (16, 2)]),
            workers: vec![WorkerCheckpoint {
                from: 100,
                to: 110,
                current: 105,
            }],
        };

        let json = serde_json::to_value(&cp).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "SampleFrom": 50,
                "NetworkHead": 500,
                "Failed": { "4": 1, "16": 2 },
                "Workers": [ { "From": 100, "To": 110, "Current": 105 } ],
            })
        );
    }

    #[test]
    fn empty_fields_are_omitted() {
        let cp = Checkpoint::initial(1);
        let json = serde_json::to_string(&cp).unwrap();

        assert_eq!(json, r#"{"SampleFrom":1,"NetworkHead":1}"#);
    }

    #[test]
    fn absent_fields_and_unknown_fields_are_tolerated() {
        let cp: Checkpoint = serde_json::from_str(
            r#"{"SampleFrom":7,"NetworkHead":9,"FutureField":{"a":1}}"#,
        )
        .unwrap();

        assert_eq!(cp.sample_from, 7);
        assert_eq!(cp.network_head, 9);
        assert!(cp.failed.is_empty());
        assert!(cp.workers.is_empty());
    }

    fn checkpoint_strategy() -> impl Strategy<Value = Checkpoint> {
        (
            1u64..=1_000_000,
            1u64..=1_000_000,
            btree_map(1u64..=1_000_000, 1u16..=100, 0..32),
            vec(
                (1u64..=1_000_000, 0u64..=1000, 0u64..=1000).prop_map(|(from, len, at)| {
                    WorkerCheckpoint {
                        from,
                        to: from + len,
                        current: from + at.min(len),
                    }
                }),
                0..8,
            ),
        )
            .prop_map(|(sample_from, network_head, failed, workers)| Checkpoint {
                sample_from,
                network_head,
                failed,
                workers,
            })
    }

    proptest! {
        #[test]
        fn blob_round_trip(cp in checkpoint_strategy()) {
            let bytes = serde_json::to_vec(&cp).unwrap();
            let parsed: Checkpoint = serde_json::from_slice(&bytes).unwrap();
            prop_assert_eq!(parsed, cp);
        }
    }
}

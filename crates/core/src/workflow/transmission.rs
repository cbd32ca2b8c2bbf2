//! Leaderless staggering of identical side effects across a DON.
//!
//! Every replica derives the same 16-byte key from a shared secret and the
//! run's identifiers, expands it into the same permutation of the DON's
//! members, and reads its own transmission delay off an agreed schedule.

use crate::error::StrategyError;
use crate::types::{Value, ValueMap};
use sha3::{Digest, Keccak256};
use std::time::Duration;

pub const SCHEDULE_ALL_AT_ONCE: &str = "allAtOnce";
pub const SCHEDULE_ONE_AT_A_TIME: &str = "oneAtATime";

/// Key size of the permutation generator
pub const KEY_LEN: usize = 16;

/// How and when replicas transmit, parsed from a step's config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransmissionConfig {
    pub schedule: String,
    pub delta_stage: Duration,
}

impl TransmissionConfig {
    /// Read `schedule` and `deltaStage` from a step config
    pub fn from_config(config: &ValueMap) -> Result<Self, StrategyError> {
        let schedule = match config.get("schedule") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => {
                return Err(StrategyError::InvalidConfig(format!(
                    "schedule must be a string, got {}",
                    other
                )))
            }
            None => return Err(StrategyError::InvalidConfig("missing schedule".to_string())),
        };

        let delta_stage = match config.get("deltaStage") {
            Some(Value::String(s)) => parse_duration(s)?,
            Some(other) => {
                return Err(StrategyError::InvalidConfig(format!(
                    "deltaStage must be a duration string, got {}",
                    other
                )))
            }
            None => return Err(StrategyError::InvalidConfig("missing deltaStage".to_string())),
        };

        // fail on unknown schedules before any delay is computed
        schedule_for(&schedule, 1)?;

        Ok(Self {
            schedule,
            delta_stage,
        })
    }
}

/// Parse durations such as `500ms`, `5s`, `1m30s`, `2h`
pub fn parse_duration(input: &str) -> Result<Duration, StrategyError> {
    let invalid = || StrategyError::InvalidConfig(format!("invalid duration `{}`", input));

    let s = input.trim();
    if s.is_empty() {
        return Err(invalid());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let amount: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ns" => Duration::from_nanos(amount),
            "us" | "µs" => Duration::from_micros(amount),
            "ms" => Duration::from_millis(amount),
            "s" => Duration::from_secs(amount),
            "m" => Duration::from_secs(amount.checked_mul(60).ok_or_else(invalid)?),
            "h" => Duration::from_secs(amount.checked_mul(3600).ok_or_else(invalid)?),
            _ => return Err(invalid()),
        };
        total = total.checked_add(part).ok_or_else(invalid)?;
        rest = &rest[unit_len..];
    }
    Ok(total)
}

/// keccak256(secret ‖ workflow_id ‖ execution_id), first 16 bytes
pub fn schedule_key(secret: &[u8; KEY_LEN], workflow_id: &str, execution_id: &str) -> [u8; KEY_LEN] {
    let mut hasher = Keccak256::new();
    hasher.update(secret);
    hasher.update(workflow_id.as_bytes());
    hasher.update(execution_id.as_bytes());
    let digest = hasher.finalize();

    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&digest[..KEY_LEN]);
    key
}

/// Keyed byte stream: keccak256(key ‖ counter) blocks
struct KeyStream {
    key: [u8; KEY_LEN],
    counter: u64,
    block: [u8; 32],
    offset: usize,
}

impl KeyStream {
    fn new(key: [u8; KEY_LEN]) -> Self {
        Self {
            key,
            counter: 0,
            block: [0u8; 32],
            offset: 32,
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut bytes = [0u8; 8];
        for byte in bytes.iter_mut() {
            if self.offset == self.block.len() {
                let mut hasher = Keccak256::new();
                hasher.update(self.key);
                hasher.update(self.counter.to_le_bytes());
                self.block.copy_from_slice(&hasher.finalize());
                self.counter += 1;
                self.offset = 0;
            }
            *byte = self.block[self.offset];
            self.offset += 1;
        }
        u64::from_le_bytes(bytes)
    }

    /// Uniform value in `[0, bound)`, by rejection sampling
    fn below(&mut self, bound: u64) -> u64 {
        let zone = u64::MAX - (u64::MAX % bound);
        loop {
            let v = self.next_u64();
            if v < zone {
                return v % bound;
            }
        }
    }
}

/// Pseudo-random permutation of `[0, n)` determined entirely by `key`
pub fn permutation(n: usize, key: [u8; KEY_LEN]) -> Vec<usize> {
    let mut stream = KeyStream::new(key);
    let mut result: Vec<usize> = (0..n).collect();
    for i in (1..n).rev() {
        let j = stream.below(i as u64 + 1) as usize;
        result.swap(i, j);
    }
    result
}

/// Bucket sizes of a schedule over `n` replicas
pub fn schedule_for(name: &str, n: usize) -> Result<Vec<usize>, StrategyError> {
    match name {
        SCHEDULE_ALL_AT_ONCE => Ok(vec![n]),
        SCHEDULE_ONE_AT_A_TIME => Ok(vec![1; n]),
        other => Err(StrategyError::UnknownSchedule(other.to_string())),
    }
}

/// `delta_stage * bucket`, failing instead of overflowing
fn stage_delay(delta_stage: Duration, bucket: usize) -> Result<Duration, StrategyError> {
    u32::try_from(bucket)
        .ok()
        .and_then(|bucket| delta_stage.checked_mul(bucket))
        .ok_or_else(|| {
            StrategyError::InvalidConfig(format!(
                "deltaStage {:?} overflows at stage {}",
                delta_stage, bucket
            ))
        })
}

/// Delay of the replica at `position`, or `None` when it falls past every bucket
pub fn delay_for(
    position: usize,
    schedule: &[usize],
    permutation: &[usize],
    delta_stage: Duration,
) -> Result<Option<Duration>, StrategyError> {
    let Some(&slot) = permutation.get(position) else {
        return Ok(None);
    };
    let mut sum = 0usize;
    for (bucket, size) in schedule.iter().enumerate() {
        sum = sum.saturating_add(*size);
        if slot < sum {
            return stage_delay(delta_stage, bucket).map(Some);
        }
    }
    Ok(None)
}

/// Delay of every member position of a DON of size `n` for one run.
///
/// Fails when any stage of the schedule overflows, so every replica rejects
/// the same config.
pub fn delays(
    n: usize,
    key: [u8; KEY_LEN],
    config: &TransmissionConfig,
) -> Result<Vec<Option<Duration>>, StrategyError> {
    let schedule = schedule_for(&config.schedule, n)?;
    stage_delay(config.delta_stage, schedule.len().saturating_sub(1))?;

    let picked = permutation(n, key);
    (0..n)
        .map(|position| delay_for(position, &schedule, &picked, config.delta_stage))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: serde_json::Value) -> ValueMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5").is_err());
        assert!(parse_duration("s5").is_err());
        assert!(parse_duration("5 days").is_err());
    }

    #[test]
    fn test_parse_duration_rejects_overflow() {
        for input in ["9999999999999999999h", "9999999999999999999m", "18446744073709551615s1s"] {
            let err = parse_duration(input).unwrap_err();
            assert!(matches!(err, StrategyError::InvalidConfig(_)), "{}", input);
        }
    }

    #[test]
    fn test_oversized_delta_stage_is_rejected() {
        let tc = TransmissionConfig {
            schedule: SCHEDULE_ONE_AT_A_TIME.to_string(),
            delta_stage: Duration::from_secs(u64::MAX / 2),
        };
        let err = delays(4, [0u8; KEY_LEN], &tc).unwrap_err();
        assert!(matches!(err, StrategyError::InvalidConfig(_)));

        // a single stage never multiplies
        let tc = TransmissionConfig {
            schedule: SCHEDULE_ALL_AT_ONCE.to_string(),
            delta_stage: Duration::from_secs(u64::MAX / 2),
        };
        assert_eq!(delays(4, [0u8; KEY_LEN], &tc).unwrap(), vec![Some(Duration::ZERO); 4]);
    }

    #[test]
    fn test_config_parsing() {
        let tc = TransmissionConfig::from_config(&config(json!({
            "schedule": "oneAtATime",
            "deltaStage": "2s",
        })))
        .unwrap();
        assert_eq!(tc.schedule, SCHEDULE_ONE_AT_A_TIME);
        assert_eq!(tc.delta_stage, Duration::from_secs(2));

        let err = TransmissionConfig::from_config(&config(json!({
            "schedule": "whenever",
            "deltaStage": "2s",
        })))
        .unwrap_err();
        assert!(matches!(err, StrategyError::UnknownSchedule(_)));

        let err = TransmissionConfig::from_config(&config(json!({
            "schedule": "allAtOnce",
            "deltaStage": "soon",
        })))
        .unwrap_err();
        assert!(matches!(err, StrategyError::InvalidConfig(_)));

        assert!(TransmissionConfig::from_config(&config(json!({"schedule": "allAtOnce"}))).is_err());
    }

    #[test]
    fn test_key_is_deterministic_and_input_sensitive() {
        let secret = [7u8; KEY_LEN];
        let a = schedule_key(&secret, "wf", "exec-1");
        assert_eq!(a, schedule_key(&secret, "wf", "exec-1"));
        assert_ne!(a, schedule_key(&secret, "wf", "exec-2"));
        assert_ne!(a, schedule_key(&[8u8; KEY_LEN], "wf", "exec-1"));
    }

    #[test]
    fn test_permutation_is_a_permutation() {
        for n in [0usize, 1, 2, 4, 7, 31] {
            let p = permutation(n, [3u8; KEY_LEN]);
            let mut sorted = p.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, (0..n).collect::<Vec<_>>());
            assert_eq!(p, permutation(n, [3u8; KEY_LEN]));
        }
    }

    #[test]
    fn test_permutation_depends_on_key() {
        let keys: Vec<[u8; KEY_LEN]> = (0u8..8).map(|b| [b; KEY_LEN]).collect();
        let perms: std::collections::HashSet<Vec<usize>> =
            keys.into_iter().map(|k| permutation(10, k)).collect();
        assert!(perms.len() > 1);
    }

    #[test]
    fn test_schedules() {
        assert_eq!(schedule_for(SCHEDULE_ALL_AT_ONCE, 4).unwrap(), vec![4]);
        assert_eq!(schedule_for(SCHEDULE_ONE_AT_A_TIME, 3).unwrap(), vec![1, 1, 1]);
        assert!(schedule_for("sometimes", 3).is_err());
    }

    #[test]
    fn test_delay_for() {
        let delta = Duration::from_secs(1);
        let perm = [2, 0, 1];

        // one at a time: bucket index equals permuted slot
        let schedule = [1, 1, 1];
        assert_eq!(delay_for(0, &schedule, &perm, delta).unwrap(), Some(Duration::from_secs(2)));
        assert_eq!(delay_for(1, &schedule, &perm, delta).unwrap(), Some(Duration::ZERO));
        assert_eq!(delay_for(2, &schedule, &perm, delta).unwrap(), Some(Duration::from_secs(1)));

        // all at once: everyone in bucket zero
        let schedule = [3];
        for position in 0..3 {
            assert_eq!(delay_for(position, &schedule, &perm, delta).unwrap(), Some(Duration::ZERO));
        }

        // undersized schedule skips the replica
        assert_eq!(delay_for(0, &[1], &perm, delta).unwrap(), None);
        assert_eq!(delay_for(5, &[3], &perm, delta).unwrap(), None);
    }

    #[test]
    fn test_one_at_a_time_assigns_distinct_delays() {
        let tc = TransmissionConfig {
            schedule: SCHEDULE_ONE_AT_A_TIME.to_string(),
            delta_stage: Duration::from_millis(100),
        };
        let key = schedule_key(&[0u8; KEY_LEN], "wf", "exec");
        let delays = delays(5, key, &tc).unwrap();

        let mut millis: Vec<u128> = delays.iter().map(|d| d.unwrap().as_millis()).collect();
        millis.sort_unstable();
        assert_eq!(millis, vec![0, 100, 200, 300, 400]);
    }
}

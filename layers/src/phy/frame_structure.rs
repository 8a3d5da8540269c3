//! TDD/FDD Frame Structure
//!
//! Parsing of slot patterns such as `"DL|S|UL|UL|F|"` and the slot timing
//! tables derived from a pattern and the N0/N1/N2 processing delays.
//!
//! All tables are indexed by the position of a slot inside the pattern:
//!
//! - `to_send_*[pos]` lists the k0/k2 values of the DCIs transmitted in the
//!   slot at `pos`;
//! - `generate_*[pos]` lists how many slots ahead of `pos` the MAC must be
//!   asked to schedule (k plus the L1/L2 control latency);
//! - `dl_harq_fb_position[pos]` is the k1 of DL data received at `pos`.

use crate::LayerError;
use common::types::TddSlotType;
use nom::{
    bytes::complete::take_till,
    character::complete::char,
    combinator::all_consuming,
    multi::separated_list1,
    IResult,
};
use std::collections::BTreeMap;

fn split_tokens(input: &str) -> IResult<&str, Vec<&str>> {
    all_consuming(separated_list1(char('|'), take_till(|c| c == '|')))(input)
}

fn slot_type_from_token(token: &str) -> Result<TddSlotType, LayerError> {
    match token {
        "DL" => Ok(TddSlotType::Dl),
        "UL" => Ok(TddSlotType::Ul),
        "S" => Ok(TddSlotType::S),
        "F" => Ok(TddSlotType::F),
        other => Err(LayerError::InvalidPattern(format!(
            "Pattern type {} not valid. Valid values are: DL UL F S",
            other
        ))),
    }
}

/// Parse a `|`-separated pattern. A single trailing `|` is accepted.
pub fn parse_pattern(pattern: &str) -> Result<Vec<TddSlotType>, LayerError> {
    let body = pattern.strip_suffix('|').unwrap_or(pattern);
    if body.is_empty() {
        return Err(LayerError::InvalidPattern("empty pattern".to_string()));
    }

    let (_, tokens) = split_tokens(body)
        .map_err(|e| LayerError::InvalidPattern(format!("cannot split '{}': {}", pattern, e)))?;

    tokens.into_iter().map(slot_type_from_token).collect()
}

/// Inverse of [`parse_pattern`], always with a trailing `|`
pub fn pattern_to_string(pattern: &[TddSlotType]) -> String {
    pattern.iter().map(|t| format!("{}|", t)).collect()
}

/// A pattern is TDD if it has a flexible slot, or if it does not carry
/// exactly one of the two directions.
pub fn is_tdd(pattern: &[TddSlotType]) -> bool {
    if pattern.contains(&TddSlotType::F) {
        return true;
    }
    let any_ul = pattern.contains(&TddSlotType::Ul);
    let any_dl = pattern.contains(&TddSlotType::Dl);
    !(any_ul ^ any_dl)
}

pub fn has_ul_slot(pattern: &[TddSlotType]) -> bool {
    pattern
        .iter()
        .any(|t| matches!(t, TddSlotType::F | TddSlotType::Ul))
}

pub fn has_dl_slot(pattern: &[TddSlotType]) -> bool {
    pattern
        .iter()
        .any(|t| matches!(t, TddSlotType::F | TddSlotType::Dl))
}

fn modulo(n: i64, m: usize) -> usize {
    n.rem_euclid(m as i64) as usize
}

/// k1: slots from DL data at `pos` to the first slot at or after `pos + n1`
/// able to carry uplink control
fn return_harq_slot(pattern: &[TddSlotType], pos: usize, n1: u32) -> u32 {
    let mut k1 = n1;
    while pattern[modulo(pos as i64 + k1 as i64, pattern.len())] < TddSlotType::F {
        k1 += 1;
    }
    k1
}

/// Position of the DCI for data at `pos`, and its k (k0 or k2): the first
/// slot at or before `pos - n` able to carry downlink control
fn return_dci_slot(pattern: &[TddSlotType], pos: usize, n: u32) -> (usize, u32) {
    let mut k = n;
    let mut index = modulo(pos as i64 - k as i64, pattern.len());
    while pattern[index] > TddSlotType::F {
        k += 1;
        index = modulo(pos as i64 - k as i64, pattern.len());
    }
    (index, k)
}

fn generate_dci_maps(
    pattern: &[TddSlotType],
    to_send: &mut BTreeMap<usize, Vec<u32>>,
    generate: &mut BTreeMap<usize, Vec<u32>>,
    pos: usize,
    n: u32,
    l1l2_ctrl_latency: u32,
) {
    let (index_dci, k) = return_dci_slot(pattern, pos, n);
    let index_gen = modulo(index_dci as i64 - l1l2_ctrl_latency as i64, pattern.len());

    to_send.entry(index_dci).or_default().push(k);
    generate.entry(index_gen).or_default().push(k + l1l2_ctrl_latency);
}

/// Slot timing tables of a pattern. Always rebuilt as a whole.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotTables {
    pub to_send_dl: BTreeMap<usize, Vec<u32>>,
    pub to_send_ul: BTreeMap<usize, Vec<u32>>,
    pub generate_dl: BTreeMap<usize, Vec<u32>>,
    pub generate_ul: BTreeMap<usize, Vec<u32>>,
    pub dl_harq_fb_position: BTreeMap<usize, u32>,
}

impl SlotTables {
    /// Build the tables for `pattern`.
    ///
    /// FDD patterns are processed as if every slot were flexible, then the
    /// generate table of the direction the band does not carry is emptied.
    pub fn build(
        pattern: &[TddSlotType],
        n0: u32,
        n1: u32,
        n2: u32,
        l1l2_ctrl_latency: u32,
    ) -> Result<Self, LayerError> {
        if pattern.is_empty() {
            return Err(LayerError::InvalidPattern("empty pattern".to_string()));
        }

        let tdd = is_tdd(pattern);
        if tdd && !pattern.iter().any(|t| *t >= TddSlotType::F) {
            return Err(LayerError::InvalidPattern(format!(
                "{} has no slot able to carry uplink control",
                pattern_to_string(pattern)
            )));
        }

        let fdd_generation = vec![TddSlotType::F; pattern.len()];
        let generation: &[TddSlotType] = if tdd { pattern } else { &fdd_generation };

        let mut tables = SlotTables::default();
        for i in 0..pattern.len() {
            if generation[i] == TddSlotType::Ul {
                generate_dci_maps(
                    generation,
                    &mut tables.to_send_ul,
                    &mut tables.generate_ul,
                    i,
                    n2,
                    l1l2_ctrl_latency,
                );
            } else if generation[i] == TddSlotType::Dl || pattern[i] == TddSlotType::S {
                generate_dci_maps(
                    generation,
                    &mut tables.to_send_dl,
                    &mut tables.generate_dl,
                    i,
                    n0,
                    l1l2_ctrl_latency,
                );
                tables
                    .dl_harq_fb_position
                    .insert(i, return_harq_slot(generation, i, n1));
            } else if generation[i] == TddSlotType::F {
                generate_dci_maps(
                    generation,
                    &mut tables.to_send_dl,
                    &mut tables.generate_dl,
                    i,
                    n0,
                    l1l2_ctrl_latency,
                );
                generate_dci_maps(
                    generation,
                    &mut tables.to_send_ul,
                    &mut tables.generate_ul,
                    i,
                    n2,
                    l1l2_ctrl_latency,
                );
                tables
                    .dl_harq_fb_position
                    .insert(i, return_harq_slot(generation, i, n1));
            }
        }

        // The send tables stay: DCIs and feedback still follow them in FDD
        if !tdd {
            if has_ul_slot(pattern) {
                tables.generate_dl.clear();
            } else {
                tables.generate_ul.clear();
            }
        }

        for list in tables.generate_dl.values_mut() {
            list.sort_unstable();
        }
        for list in tables.generate_ul.values_mut() {
            list.sort_unstable();
        }

        Ok(tables)
    }

    /// k1 for DL data received at pattern position `pos`
    pub fn harq_k1(&self, pos: usize) -> Option<u32> {
        self.dl_harq_fb_position.get(&pos).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TddSlotType::*;

    #[test]
    fn test_parse_pattern() {
        let p = parse_pattern("DL|S|UL|F|").unwrap();
        assert_eq!(p, vec![Dl, S, Ul, F]);
        assert_eq!(parse_pattern("DL|UL").unwrap(), vec![Dl, Ul]);
        assert_eq!(pattern_to_string(&p), "DL|S|UL|F|");
    }

    #[test]
    fn test_parse_pattern_rejects_bad_tokens() {
        let err = parse_pattern("DL|XX|UL|").unwrap_err();
        assert_eq!(
            err,
            LayerError::InvalidPattern(
                "Pattern type XX not valid. Valid values are: DL UL F S".to_string()
            )
        );
        assert!(parse_pattern("").is_err());
        assert!(parse_pattern("DL||UL|").is_err());
    }

    #[test]
    fn test_tdd_detection() {
        assert!(is_tdd(&[Dl, Ul]));
        assert!(is_tdd(&[Dl, F]));
        assert!(!is_tdd(&[Dl, Dl]));
        assert!(!is_tdd(&[Ul, Ul, Ul]));
        assert!(has_dl_slot(&[Ul, F]));
        assert!(!has_dl_slot(&[Ul, S]));
        assert!(has_ul_slot(&[Dl, Ul]));
        assert!(!has_ul_slot(&[Dl, S]));
    }

    #[test]
    fn test_dl_grant_timing_with_latency() {
        let pattern = parse_pattern("DL|UL|F|F|F|F|F|F|F|F|").unwrap();
        let tables = SlotTables::build(&pattern, 0, 2, 2, 2).unwrap();

        assert_eq!(tables.to_send_dl[&0], vec![0]);
        assert!(tables.generate_dl[&8].contains(&2));
        assert_eq!(tables.harq_k1(0), Some(2));

        // UL slot 1: DCI two slots earlier, at position 9
        assert!(tables.to_send_ul[&9].contains(&2));
        assert!(tables.generate_ul[&7].contains(&4));
        assert!(!tables.dl_harq_fb_position.contains_key(&1));
    }

    #[test]
    fn test_harq_skips_downlink_slots() {
        let pattern = parse_pattern("DL|DL|DL|UL|").unwrap();
        let tables = SlotTables::build(&pattern, 0, 1, 1, 0).unwrap();
        assert_eq!(tables.harq_k1(0), Some(3));
        assert_eq!(tables.harq_k1(1), Some(2));
        assert_eq!(tables.harq_k1(2), Some(1));
        // UL slot 3 with n2=1: DCI in slot 2
        assert_eq!(tables.to_send_ul[&2], vec![1]);
    }

    #[test]
    fn test_generated_slots_have_the_right_direction() {
        for pattern in ["DL|S|UL|UL|DL|", "F|F|UL|DL|", "DL|UL|F|F|F|F|F|F|F|F|", "DL|DL|S|UL|"] {
            let parsed = parse_pattern(pattern).unwrap();
            let n = parsed.len();
            for (n0, n1, n2, l1l2) in [(0, 2, 2, 2), (1, 1, 3, 0), (0, 4, 2, 1)] {
                let tables = SlotTables::build(&parsed, n0, n1, n2, l1l2).unwrap();
                for (pos, ks) in &tables.generate_dl {
                    for k in ks {
                        assert_ne!(parsed[(pos + *k as usize) % n], Ul, "{} dl {} {}", pattern, pos, k);
                    }
                }
                for (pos, ks) in &tables.generate_ul {
                    for k in ks {
                        assert!(parsed[(pos + *k as usize) % n] >= F, "{} ul {} {}", pattern, pos, k);
                    }
                }
                for (pos, k1) in &tables.dl_harq_fb_position {
                    assert!(*k1 >= n1);
                    assert!(parsed[(pos + *k1 as usize) % n] >= F);
                }
            }
        }
    }

    #[test]
    fn test_fdd_keeps_one_direction() {
        let dl = parse_pattern("DL|DL|DL|DL|").unwrap();
        let tables = SlotTables::build(&dl, 0, 2, 2, 2).unwrap();
        assert!(tables.generate_ul.is_empty());
        assert_eq!(tables.generate_dl.len(), 4);
        assert!(!tables.to_send_ul.is_empty());

        let ul = parse_pattern("UL|UL|").unwrap();
        let tables = SlotTables::build(&ul, 0, 2, 2, 2).unwrap();
        assert!(tables.generate_dl.is_empty());
        assert!(!tables.generate_ul.is_empty());
    }

    #[test]
    fn test_pattern_without_uplink_capacity_is_rejected() {
        let pattern = parse_pattern("S|S|").unwrap();
        assert!(matches!(
            SlotTables::build(&pattern, 0, 2, 2, 2),
            Err(LayerError::InvalidPattern(_))
        ));
    }
}

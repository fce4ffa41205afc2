//! Pure pattern matching over full blocks
//!
//! The matcher holds no channels, no locks and no storage handles. Subchain
//! tasks parse their pattern set once per scan pass and run each downloaded
//! block through it; everything here is deterministic over its inputs.

use std::collections::HashMap;

use rayon::prelude::*;

use bitcoin::{Block, OutPoint};

use crate::error::MatchError;
use crate::primitives::{ElementId, Match, Pattern, PatternId};

/// A pattern set preprocessed for window lookup.
///
/// Patterns are bucketed by byte length; matching a script slides a window of
/// each distinct length across it and looks the window up in the bucket, so
/// cost scales with the number of distinct lengths rather than the number of
/// patterns.
pub(crate) struct ParsedPatterns {
    buckets: HashMap<usize, HashMap<Vec<u8>, Vec<(ElementId, PatternId)>>>,
    lengths: Vec<usize>,
}

impl ParsedPatterns {
    /// Returns `true` if no patterns are indexed.
    pub(crate) fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// All distinct pattern byte strings, for probabilistic filter queries.
    pub(crate) fn queries(&self) -> impl Iterator<Item = &[u8]> {
        self.buckets
            .values()
            .flat_map(|bucket| bucket.keys().map(Vec::as_slice))
    }

    // collects every (element, pattern) hit in `script`, deduplicated.
    fn match_script(&self, script: &[u8]) -> Vec<(ElementId, PatternId)> {
        let mut hits = Vec::new();

        for &length in &self.lengths {
            if length > script.len() {
                break;
            }
            let bucket = &self.buckets[&length];
            for window in script.windows(length) {
                if let Some(owners) = bucket.get(window) {
                    hits.extend_from_slice(owners);
                }
            }
        }

        hits.sort_unstable();
        hits.dedup();
        hits
    }
}

/// Builds a [`ParsedPatterns`] from the watched pattern set.
///
/// An empty byte string would match every script, so it is rejected as a
/// corruption signal rather than silently indexed.
pub(crate) fn parse_patterns(patterns: &[Pattern]) -> Result<ParsedPatterns, MatchError> {
    let mut buckets: HashMap<usize, HashMap<Vec<u8>, Vec<(ElementId, PatternId)>>> =
        HashMap::new();

    for pattern in patterns {
        if pattern.bytes().is_empty() {
            return Err(MatchError::EmptyPattern(pattern.id()));
        }
        buckets
            .entry(pattern.bytes().len())
            .or_default()
            .entry(pattern.bytes().clone())
            .or_default()
            .push((pattern.element(), pattern.id()));
    }

    let mut lengths: Vec<usize> = buckets.keys().copied().collect();
    lengths.sort_unstable();

    Ok(ParsedPatterns { buckets, lengths })
}

/// Everything found while matching one block.
pub(crate) struct BlockMatches {
    /// All output and input hits, in transaction order.
    pub(crate) matches: Vec<Match>,
    /// Scripts of the outputs that were hit, keyed by outpoint. Persisted so
    /// later blocks can detect the spend of these outputs.
    pub(crate) output_scripts: Vec<(OutPoint, Vec<u8>)>,
}

/// Matches one full block against the pattern set.
///
/// Output matching runs first so that a spend of an output created earlier in
/// the same block is still detected; `spent_scripts` supplies the indexed
/// scripts of outputs matched in earlier blocks.
pub(crate) fn match_block(
    block: &Block,
    patterns: &ParsedPatterns,
    spent_scripts: &HashMap<OutPoint, Vec<u8>>,
) -> BlockMatches {
    // outputs first, transactions in parallel
    let per_transaction: Vec<(Vec<Match>, Vec<(OutPoint, Vec<u8>)>)> = block
        .txdata
        .par_iter()
        .map(|transaction| {
            let txid = transaction.compute_txid();
            let mut matches = Vec::new();
            let mut scripts = Vec::new();

            for (vout, output) in transaction.output.iter().enumerate() {
                let hits = patterns.match_script(output.script_pubkey.as_bytes());
                if hits.is_empty() {
                    continue;
                }
                scripts.push((
                    OutPoint::new(txid, vout as u32),
                    output.script_pubkey.to_bytes(),
                ));
                for (element, pattern) in hits {
                    matches.push(Match::Output {
                        txid,
                        vout: vout as u32,
                        element,
                        pattern,
                    });
                }
            }

            (matches, scripts)
        })
        .collect();

    let mut matches = Vec::new();
    let mut output_scripts = Vec::new();
    for (transaction_matches, scripts) in per_transaction {
        matches.extend(transaction_matches);
        output_scripts.extend(scripts);
    }

    // inputs second, serially, so same-block output hits are visible
    let same_block: HashMap<OutPoint, &Vec<u8>> = output_scripts
        .iter()
        .map(|(outpoint, script)| (*outpoint, script))
        .collect();

    for transaction in &block.txdata {
        let txid = transaction.compute_txid();
        for input in &transaction.input {
            if input.previous_output.is_null() {
                continue;
            }
            let script = same_block
                .get(&input.previous_output)
                .map(|script| script.as_slice())
                .or_else(|| {
                    spent_scripts
                        .get(&input.previous_output)
                        .map(Vec::as_slice)
                });
            let Some(script) = script else {
                continue;
            };
            for (element, pattern) in patterns.match_script(script) {
                matches.push(Match::Input {
                    txid,
                    outpoint: input.previous_output,
                    element,
                    pattern,
                });
            }
        }
    }

    BlockMatches {
        matches,
        output_scripts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::block::{Header, Version as BlockVersion};
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{
        Amount, BlockHash, CompactTarget, ScriptBuf, Sequence, Transaction, TxIn, TxMerkleNode,
        TxOut, Txid, Witness,
    };

    use crate::primitives::SubchainId;

    fn pattern(subchain: u32, index: u32, bytes: Vec<u8>) -> Pattern {
        let subchain = SubchainId::from_index(subchain);
        Pattern::from_parts(
            ElementId::from_parts(subchain, index),
            PatternId::from_parts(subchain, index),
            bytes,
        )
    }

    fn transaction(inputs: Vec<OutPoint>, output_scripts: Vec<Vec<u8>>) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: inputs
                .into_iter()
                .map(|previous_output| TxIn {
                    previous_output,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                })
                .collect(),
            output: output_scripts
                .into_iter()
                .map(|script| TxOut {
                    value: Amount::from_sat(50_000),
                    script_pubkey: ScriptBuf::from_bytes(script),
                })
                .collect(),
        }
    }

    fn block(txdata: Vec<Transaction>) -> Block {
        Block {
            header: Header {
                version: BlockVersion::TWO,
                prev_blockhash: BlockHash::all_zeros(),
                merkle_root: TxMerkleNode::all_zeros(),
                time: 0,
                bits: CompactTarget::from_consensus(0x1d00_ffff),
                nonce: 0,
            },
            txdata,
        }
    }

    #[test]
    fn empty_pattern_is_rejected() {
        let patterns = vec![pattern(0, 0, Vec::new())];
        assert!(matches!(
            parse_patterns(&patterns),
            Err(MatchError::EmptyPattern(_))
        ));
    }

    #[test]
    fn substring_in_one_output_matches_that_output_only() {
        let parsed = parse_patterns(&[pattern(0, 0, vec![0xAA, 0xBB, 0xCC])]).unwrap();
        let transaction = transaction(
            Vec::new(),
            vec![
                vec![0x00, 0x14, 0x01, 0x02],
                vec![0x00, 0xAA, 0xBB, 0xCC, 0xFF],
                vec![0xAA, 0xBB],
            ],
        );

        let found = match_block(&block(vec![transaction]), &parsed, &HashMap::new());
        assert_eq!(found.matches.len(), 1);
        assert!(matches!(found.matches[0], Match::Output { vout: 1, .. }));
        assert_eq!(found.output_scripts.len(), 1);
    }

    #[test]
    fn repeated_occurrence_yields_one_match() {
        let parsed = parse_patterns(&[pattern(0, 0, vec![0xAA, 0xBB])]).unwrap();
        let transaction = transaction(
            Vec::new(),
            vec![vec![0xAA, 0xBB, 0x00, 0xAA, 0xBB]],
        );

        let found = match_block(&block(vec![transaction]), &parsed, &HashMap::new());
        assert_eq!(found.matches.len(), 1);
    }

    #[test]
    fn shared_byte_string_hits_every_owner() {
        // two elements in different subchains watch the same byte string
        let parsed = parse_patterns(&[
            pattern(0, 0, vec![0xAA, 0xBB]),
            pattern(1, 7, vec![0xAA, 0xBB]),
        ])
        .unwrap();
        let transaction = transaction(Vec::new(), vec![vec![0xAA, 0xBB]]);

        let found = match_block(&block(vec![transaction]), &parsed, &HashMap::new());
        assert_eq!(found.matches.len(), 2);
        let mut subchains: Vec<u32> = found
            .matches
            .iter()
            .map(|hit| hit.element().subchain().index())
            .collect();
        subchains.sort_unstable();
        assert_eq!(subchains, vec![0, 1]);
    }

    #[test]
    fn disjoint_scripts_do_not_match() {
        let parsed = parse_patterns(&[pattern(0, 0, vec![0xAA, 0xBB, 0xCC])]).unwrap();
        let transaction = transaction(Vec::new(), vec![vec![0x01, 0x02, 0x03, 0x04]]);

        let found = match_block(&block(vec![transaction]), &parsed, &HashMap::new());
        assert!(found.matches.is_empty());
        assert!(found.output_scripts.is_empty());
    }

    #[test]
    fn spend_of_previously_matched_output_yields_input_match() {
        let parsed = parse_patterns(&[pattern(0, 0, vec![0xAA, 0xBB])]).unwrap();

        let funding = OutPoint::new(Txid::all_zeros(), 3);
        let mut spent_scripts = HashMap::new();
        spent_scripts.insert(funding, vec![0x00, 0xAA, 0xBB]);

        let spend = transaction(vec![funding], vec![vec![0x01, 0x02]]);
        let found = match_block(&block(vec![spend]), &parsed, &spent_scripts);

        assert_eq!(found.matches.len(), 1);
        assert!(matches!(
            found.matches[0],
            Match::Input { outpoint, .. } if outpoint == funding
        ));
        assert!(found.output_scripts.is_empty());
    }

    #[test]
    fn same_block_spend_is_detected() {
        let parsed = parse_patterns(&[pattern(0, 0, vec![0xAA, 0xBB])]).unwrap();

        let funding = transaction(Vec::new(), vec![vec![0xAA, 0xBB]]);
        let funding_outpoint = OutPoint::new(funding.compute_txid(), 0);
        let spend = transaction(vec![funding_outpoint], vec![vec![0x01]]);

        let found = match_block(&block(vec![funding, spend]), &parsed, &HashMap::new());

        assert_eq!(found.matches.len(), 2);
        assert!(matches!(found.matches[0], Match::Output { vout: 0, .. }));
        assert!(matches!(
            found.matches[1],
            Match::Input { outpoint, .. } if outpoint == funding_outpoint
        ));
        assert_eq!(found.output_scripts.len(), 1);
        assert_eq!(found.output_scripts[0].0, funding_outpoint);
    }

    #[test]
    fn coinbase_input_is_skipped() {
        let parsed = parse_patterns(&[pattern(0, 0, vec![0xAA, 0xBB])]).unwrap();
        let coinbase = transaction(vec![OutPoint::null()], vec![vec![0x51]]);

        let found = match_block(&block(vec![coinbase]), &parsed, &HashMap::new());
        assert!(found.matches.is_empty());
    }
}

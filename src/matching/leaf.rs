// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Fine, argument-aware correspondence between the children of two sections.

use crate::matching::{LeafMatch, LeafPair, MatchScratch, MatchVal};
use crate::record::command::Command;
use crate::record::{CommandId, CommandRecord};

/**
Similarity of two commands of the same kind, in `[0,1]`, looking through record-local
arguments: label names, bound descriptor sets and descriptor snapshots.
*/
pub(crate) fn command_similarity(
    record_a: &CommandRecord,
    a: CommandId,
    record_b: &CommandRecord,
    b: CommandId,
) -> f32 {
    let (command_a, command_b) = (record_a.command(a), record_b.command(b));
    if command_a.kind() != command_b.kind() {
        return 0.0;
    }
    let words = command_a.argument_similarity(command_b);
    match command_a {
        Command::BeginLabel(_) | Command::InsertLabel(_) => {
            let names = (record_a.label_name(a) == record_b.label_name(b)) as u8 as f32;
            (words + names) / 2.0
        }
        Command::BindDescriptorSets(_) => {
            let sets = (record_a.bound_sets(a) == record_b.bound_sets(b)) as u8 as f32;
            (words + sets) / 2.0
        }
        _ if command_a.kind().uses_descriptors() => {
            let state = match (record_a.snapshot(a), record_b.snapshot(b)) {
                (Some(x), Some(y)) => x.similarity(y),
                (None, None) => 1.0,
                _ => 0.0,
            };
            (words + state) / 2.0
        }
        _ => words,
    }
}

/// Order-preserving alignment maximising summed pair score over the children of two sections.
pub(crate) fn match_children(
    record_a: &CommandRecord,
    section_a: CommandId,
    record_b: &CommandRecord,
    section_b: CommandId,
    scratch: &mut MatchScratch,
) -> LeafMatch {
    let children_a: Vec<CommandId> = record_a.children(section_a).collect();
    let children_b: Vec<CommandId> = record_b.children(section_b).collect();
    let (n, m) = (children_a.len(), children_b.len());
    let pair_score = |i: usize, j: usize| -> Option<f32> {
        let (x, y) = (children_a[i], children_b[j]);
        (record_a.kind(x) == record_b.kind(y))
            .then(|| 0.5 + 0.5 * command_similarity(record_a, x, record_b, y))
    };

    let mut table = scratch.floats.scope();
    table.alloc_n((n + 1) * (m + 1), 0.0);
    let at = |i: usize, j: usize| i * (m + 1) + j;
    for i in 1..=n {
        for j in 1..=m {
            let mut best = table.get(at(i - 1, j)).max(*table.get(at(i, j - 1)));
            if let Some(p) = pair_score(i - 1, j - 1) {
                best = best.max(table.get(at(i - 1, j - 1)) + p);
            }
            *table.get_mut(at(i, j)) = best;
        }
    }

    let mut pairs = Vec::new();
    let mut matched = 0.0;
    let (mut i, mut j) = (n, m);
    while i > 0 && j > 0 {
        let here = *table.get(at(i, j));
        if let Some(p) = pair_score(i - 1, j - 1) {
            if here == table.get(at(i - 1, j - 1)) + p {
                pairs.push(LeafPair {
                    a: children_a[i - 1],
                    b: children_b[j - 1],
                    similarity: (p - 0.5) * 2.0,
                });
                matched += 2.0 * p;
                i -= 1;
                j -= 1;
                continue;
            }
        }
        if here == *table.get(at(i - 1, j)) {
            i -= 1;
        } else {
            j -= 1;
        }
    }
    pairs.reverse();
    LeafMatch {
        score: MatchVal {
            matched,
            total: (n + m) as f32,
        },
        unmatched_a: n - pairs.len(),
        unmatched_b: m - pairs.len(),
        pairs,
    }
}

// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Coarse, bottom-up section matching.

At each pair of sections the children are split into nested sections and plain
commands.  Nested sections are paired first (hard key filter, then score, then sibling
proximity, never crossing).  The accepted pairs cut both child lists into segments,
and plain commands inside corresponding segments agree by counted type.

Scoring at a section pair, with `w(s)` the number of nodes below `s`:

```text
total   = plain(A) + plain(B) + Σ_nested (1 + w(s))
matched = 2·agreeing_plain + Σ_paired (2 + matched(child pair))
```

so unmatched sections cost their whole subtree and identical trees score exactly 1.
Arguments are never inspected here.
*/

use std::collections::{HashMap, HashSet};

use crate::matching::align::{self, Candidate};
use crate::matching::{MatchResult, MatchScratch, MatchVal, SectionMatch};
use crate::record::command::{Command, CommandKind, SectionKind};
use crate::record::{CommandId, CommandRecord};

/// What two sections must share to be paired at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SectionKey<'r> {
    Label(&'r str),
    Subpass(u32),
    Other(SectionKind),
}

fn section_key(record: &CommandRecord, id: CommandId) -> SectionKey<'_> {
    match record.command(id) {
        Command::BeginLabel(_) => SectionKey::Label(record.label_name(id).unwrap_or_default()),
        Command::Subpass(args) => SectionKey::Subpass(args.index),
        _ => SectionKey::Other(record.section_kind(id).unwrap_or(SectionKind::Root)),
    }
}

fn weight(record: &CommandRecord, id: CommandId) -> u32 {
    record
        .section_stats(id)
        .map_or(0, |stats| stats.match_weight())
}

fn is_counted_plain(record: &CommandRecord, id: CommandId) -> bool {
    !record.is_section(id) && record.kind(id) != CommandKind::EndLabel
}

/// A nested section of a pair, in recording order.
#[derive(Debug, Clone, Copy)]
enum Slot {
    Paired(CommandId, CommandId),
    OnlyA(CommandId),
    OnlyB(CommandId),
}

#[derive(Debug)]
struct PairNode {
    score: MatchVal,
    slots: Vec<Slot>,
    plain: Vec<(CommandId, CommandId)>,
    unmatched_a: Vec<CommandId>,
    unmatched_b: Vec<CommandId>,
}

pub(crate) struct SectionMatcher<'r, 's> {
    a: &'r CommandRecord,
    b: &'r CommandRecord,
    window: usize,
    scratch: &'s mut MatchScratch,
    memo: HashMap<(CommandId, CommandId), PairNode>,
}

impl<'r, 's> SectionMatcher<'r, 's> {
    pub(crate) fn new(
        a: &'r CommandRecord,
        b: &'r CommandRecord,
        window: usize,
        scratch: &'s mut MatchScratch,
    ) -> Self {
        SectionMatcher {
            a,
            b,
            window,
            scratch,
            memo: HashMap::new(),
        }
    }

    /// Matches the two roots and assembles the chosen pairs into a [`MatchResult`].
    pub(crate) fn run(mut self) -> MatchResult {
        let (root_a, root_b) = (self.a.root(), self.b.root());
        let score = self.pair(root_a, root_b);
        let evaluated = self.memo.len();
        let root = self.tree(root_a, root_b);
        let result = MatchResult::new(self.a.id(), self.b.id(), root);
        logwise::debuginternal_sync!(
            "section match {score} over {pairs} pairs ({evaluated} evaluated)",
            score = logwise::privacy::LogIt(&score.eval()),
            pairs = result.len(),
            evaluated = evaluated
        );
        result
    }

    /// Moves the memoized pair `(a, b)` and its accepted descendants into a tree.
    fn tree(&mut self, a: CommandId, b: CommandId) -> SectionMatch {
        let mut node = SectionMatch::new(Some(a), Some(b), MatchVal::default());
        let Some(pair) = self.memo.remove(&(a, b)) else {
            return node;
        };
        let unmatched = |record: &CommandRecord, id: CommandId| MatchVal {
            matched: 0.0,
            total: 1.0 + weight(record, id) as f32,
        };
        node.score = pair.score;
        for slot in pair.slots {
            let child = match slot {
                Slot::Paired(x, y) => self.tree(x, y),
                Slot::OnlyA(x) => SectionMatch::new(Some(x), None, unmatched(self.a, x)),
                Slot::OnlyB(y) => SectionMatch::new(None, Some(y), unmatched(self.b, y)),
            };
            node.children.push(child);
        }
        node.plain = pair.plain;
        node.unmatched_a = pair.unmatched_a;
        node.unmatched_b = pair.unmatched_b;
        node
    }

    fn pair(&mut self, section_a: CommandId, section_b: CommandId) -> MatchVal {
        if let Some(node) = self.memo.get(&(section_a, section_b)) {
            return node.score;
        }
        let (a, b) = (self.a, self.b);
        let children_a: Vec<CommandId> = a.children(section_a).collect();
        let children_b: Vec<CommandId> = b.children(section_b).collect();
        let nested_a: Vec<usize> = (0..children_a.len())
            .filter(|&i| a.is_section(children_a[i]))
            .collect();
        let nested_b: Vec<usize> = (0..children_b.len())
            .filter(|&i| b.is_section(children_b[i]))
            .collect();
        let keys_a: Vec<SectionKey<'r>> = nested_a.iter().map(|&i| section_key(a, children_a[i])).collect();
        let keys_b: Vec<SectionKey<'r>> = nested_b.iter().map(|&i| section_key(b, children_b[i])).collect();

        let mut candidates = Vec::new();
        for (x, y, proximity) in align::keyed_pairs(&keys_a, &keys_b, self.window) {
            let child = self.pair(children_a[nested_a[x as usize]], children_b[nested_b[y as usize]]);
            candidates.push(Candidate {
                a: x,
                b: y,
                proximity,
                score: child.eval(),
            });
        }
        let accepted = align::accept(&mut self.scratch.candidates, candidates);

        let mut score = MatchVal::default();
        for &i in &nested_a {
            score.total += 1.0 + weight(a, children_a[i]) as f32;
        }
        for &i in &nested_b {
            score.total += 1.0 + weight(b, children_b[i]) as f32;
        }
        let mut slots = Vec::with_capacity(nested_a.len().max(nested_b.len()));
        let (mut next_a, mut next_b) = (0, 0);
        for &(x, y) in &accepted {
            let (x, y) = (x as usize, y as usize);
            slots.extend(nested_a[next_a..x].iter().map(|&i| Slot::OnlyA(children_a[i])));
            slots.extend(nested_b[next_b..y].iter().map(|&i| Slot::OnlyB(children_b[i])));
            let pair = (children_a[nested_a[x]], children_b[nested_b[y]]);
            let child = self.memo.get(&pair).map(|n| n.score).unwrap_or_default();
            score.matched += 2.0 + child.matched;
            slots.push(Slot::Paired(pair.0, pair.1));
            (next_a, next_b) = (x + 1, y + 1);
        }
        slots.extend(nested_a[next_a..].iter().map(|&i| Slot::OnlyA(children_a[i])));
        slots.extend(nested_b[next_b..].iter().map(|&i| Slot::OnlyB(children_b[i])));

        //segments between consecutive accepted pairs
        let mut plain = Vec::new();
        let (mut start_a, mut start_b) = (0, 0);
        let bounds = accepted
            .iter()
            .map(|&(x, y)| (nested_a[x as usize], nested_b[y as usize]))
            .chain(std::iter::once((children_a.len(), children_b.len())));
        for (end_a, end_b) in bounds {
            let agree = self.match_segment(
                &children_a[start_a..end_a],
                &children_b[start_b..end_b],
                &mut plain,
            );
            score.matched += 2.0 * agree as f32;
            start_a = end_a + 1;
            start_b = end_b + 1;
        }
        score.total += children_a.iter().filter(|&&c| is_counted_plain(a, c)).count() as f32;
        score.total += children_b.iter().filter(|&&c| is_counted_plain(b, c)).count() as f32;
        let paired_a: HashSet<CommandId> = plain.iter().map(|p| p.0).collect();
        let paired_b: HashSet<CommandId> = plain.iter().map(|p| p.1).collect();
        let unmatched_a = children_a
            .iter()
            .copied()
            .filter(|&c| is_counted_plain(a, c) && !paired_a.contains(&c))
            .collect();
        let unmatched_b = children_b
            .iter()
            .copied()
            .filter(|&c| is_counted_plain(b, c) && !paired_b.contains(&c))
            .collect();

        logwise::trace_sync!(
            "sections {a} ~ {b}: {matched}/{total}",
            a = logwise::privacy::LogIt(&section_a),
            b = logwise::privacy::LogIt(&section_b),
            matched = logwise::privacy::LogIt(&score.matched),
            total = logwise::privacy::LogIt(&score.total)
        );
        self.memo.insert(
            (section_a, section_b),
            PairNode {
                score,
                slots,
                plain,
                unmatched_a,
                unmatched_b,
            },
        );
        score
    }

    /**
    Pairs plain commands of one segment by counted type.

    Each side is reduced to its commands sorted (stably) by kind; equal kinds pair up
    in recording order.  Returns the number of pairs.
    */
    fn match_segment(
        &mut self,
        segment_a: &[CommandId],
        segment_b: &[CommandId],
        pairs: &mut Vec<(CommandId, CommandId)>,
    ) -> usize {
        let (a, b) = (self.a, self.b);
        let mut scope = self.scratch.plain.scope();
        for &c in segment_a.iter().filter(|&&c| is_counted_plain(a, c)) {
            scope.alloc((a.kind(c), c));
        }
        let split = scope.len();
        for &c in segment_b.iter().filter(|&&c| is_counted_plain(b, c)) {
            scope.alloc((b.kind(c), c));
        }
        let (left, right) = scope.allocated_mut().split_at_mut(split);
        left.sort_by_key(|(kind, _)| *kind);
        right.sort_by_key(|(kind, _)| *kind);
        let (mut i, mut j, mut agree) = (0, 0, 0);
        while i < left.len() && j < right.len() {
            match left[i].0.cmp(&right[j].0) {
                std::cmp::Ordering::Equal => {
                    pairs.push((left[i].1, right[j].1));
                    agree += 1;
                    i += 1;
                    j += 1;
                }
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
            }
        }
        agree
    }
}

// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Structural matching of command records.

Successive recordings of the same frame are new objects with new ids, so "the same
draw call" has to be rediscovered structurally.  This module scores and aligns two
command trees ([`match_records`]), aligns whole submissions and frames
([`match_batch`], [`match_submissions`]), compares the children of one target section
argument by argument ([`match_leaves`]), and combines both to re-find a selected
command in a new record ([`resolve_target`]).

Matching never fails.  A weak correspondence is a low score, and it is up to the caller
to compare it against a threshold.

# Scratch memory

Every entry point takes a [`MatchScratch`].  It owns the bump allocators used for
per-call temporaries and is reset (by scope) before each call returns, so one scratch
can be reused across calls and frames, and tests can supply their own.
*/

mod align;
mod leaf;
mod sections;

use std::collections::HashMap;

use crate::arena::{AllocStats, LinAllocator};
use crate::error::ResolveError;
use crate::record::command::CommandKind;
use crate::record::{CommandId, CommandPath, CommandRecord, RecordHandle, RecordId};
use align::Candidate;

/// A score as `matched / total` mass.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MatchVal {
    pub matched: f32,
    pub total: f32,
}

impl MatchVal {
    /// `matched / total`, or 1 when there was nothing to compare.
    pub fn eval(self) -> f32 {
        if self.total <= 0.0 {
            1.0
        } else {
            (self.matched / self.total).clamp(0.0, 1.0)
        }
    }
}

/// Tunables of the matcher.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchOptions {
    /// Below this, a correspondence is reported as no match.
    pub threshold: f32,
    /// How far (in same-key rank) a sibling may move and still be paired.
    pub sibling_window: usize,
}

impl Default for MatchOptions {
    fn default() -> Self {
        MatchOptions {
            threshold: 0.6,
            sibling_window: 4,
        }
    }
}

/// Reusable temporaries for matching calls.
#[derive(Debug, Default)]
pub struct MatchScratch {
    pub(crate) candidates: LinAllocator<Candidate>,
    pub(crate) plain: LinAllocator<(CommandKind, CommandId)>,
    pub(crate) floats: LinAllocator<f32>,
}

impl MatchScratch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocation counters of the scratch arenas, summed.
    pub fn stats(&self) -> AllocStats {
        let all = [
            self.candidates.stats(),
            self.plain.stats(),
            self.floats.stats(),
        ];
        all.iter().fold(AllocStats::default(), |acc, s| AllocStats {
            allocated: acc.allocated + s.allocated,
            released: acc.released + s.released,
            high_water: acc.high_water.max(s.high_water),
        })
    }

    /// Elements currently held; zero between calls.
    pub fn in_use(&self) -> usize {
        self.candidates.len() + self.plain.len() + self.floats.len()
    }
}

/**
One node of a match tree: a section of either record and what became of its children.

Paired sections have both `a` and `b`.  A nested section without a counterpart appears
with one side `None`, scoring nothing out of its own size, and is not descended into.
*/
#[derive(Debug, Clone, PartialEq)]
pub struct SectionMatch {
    pub a: Option<CommandId>,
    pub b: Option<CommandId>,
    pub score: MatchVal,
    /// Nested sections in recording order, paired or not.
    pub children: Vec<SectionMatch>,
    /// Plain commands paired by counted type.
    pub plain: Vec<(CommandId, CommandId)>,
    /// Plain commands of the first record's section left without a counterpart.
    pub unmatched_a: Vec<CommandId>,
    pub unmatched_b: Vec<CommandId>,
}

impl SectionMatch {
    pub(crate) fn new(a: Option<CommandId>, b: Option<CommandId>, score: MatchVal) -> Self {
        SectionMatch {
            a,
            b,
            score,
            children: Vec::new(),
            plain: Vec::new(),
            unmatched_a: Vec::new(),
            unmatched_b: Vec::new(),
        }
    }

    pub fn is_paired(&self) -> bool {
        self.a.is_some() && self.b.is_some()
    }

    /// Score of this subtree in `[0,1]`.
    pub fn value(&self) -> f32 {
        self.score.eval()
    }

    /// The node for section `a` of the first record, searched depth first.
    pub fn find(&self, a: CommandId) -> Option<&SectionMatch> {
        if self.a == Some(a) {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(a))
    }

    /// Nested sections left without a counterpart.
    pub fn unmatched_sections(&self) -> impl Iterator<Item = &SectionMatch> + '_ {
        self.children.iter().filter(|child| !child.is_paired())
    }
}

/// Correspondence between two records.
#[derive(Debug, Clone)]
pub struct MatchResult {
    a: RecordId,
    b: RecordId,
    root: SectionMatch,
    /// Every pair of the tree, sections and plain commands alike.
    pairs: HashMap<CommandId, CommandId>,
}

impl MatchResult {
    pub(crate) fn new(a: RecordId, b: RecordId, root: SectionMatch) -> Self {
        let mut pairs = HashMap::new();
        let mut pending = vec![&root];
        while let Some(node) = pending.pop() {
            if let (Some(x), Some(y)) = (node.a, node.b) {
                pairs.insert(x, y);
                pairs.extend(node.plain.iter().copied());
                pending.extend(node.children.iter());
            }
        }
        MatchResult { a, b, root, pairs }
    }

    pub fn records(&self) -> (RecordId, RecordId) {
        (self.a, self.b)
    }

    /// The match tree, rooted at the two records' roots.
    pub fn tree(&self) -> &SectionMatch {
        &self.root
    }

    pub fn score(&self) -> MatchVal {
        self.root.score
    }

    /// The match in `[0,1]`.
    pub fn value(&self) -> f32 {
        self.score().eval()
    }

    pub fn is_match(&self, threshold: f32) -> bool {
        self.value() >= threshold
    }

    /// The command in the second record corresponding to `a` in the first.
    pub fn counterpart(&self, a: CommandId) -> Option<CommandId> {
        self.pairs.get(&a).copied()
    }

    /// Score of the subtree under a paired section of the first record.
    pub fn section_score(&self, a: CommandId) -> Option<MatchVal> {
        self.root
            .find(a)
            .filter(|node| node.is_paired())
            .map(|node| node.score)
    }

    /// Number of corresponding commands, roots included.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Every correspondence, ordered by the first record's command.
    pub fn pairs(&self) -> Vec<(CommandId, CommandId)> {
        let mut pairs: Vec<_> = self.pairs.iter().map(|(a, b)| (*a, *b)).collect();
        pairs.sort();
        pairs
    }
}

/// One argument-aware correspondence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeafPair {
    pub a: CommandId,
    pub b: CommandId,
    /// Argument similarity in `[0,1]`.
    pub similarity: f32,
}

/// Argument-aware correspondence between the children of two sections.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafMatch {
    pub score: MatchVal,
    pub pairs: Vec<LeafPair>,
    /// Children of the first section without a counterpart.
    pub unmatched_a: usize,
    pub unmatched_b: usize,
}

impl LeafMatch {
    pub fn counterpart(&self, a: CommandId) -> Option<&LeafPair> {
        self.pairs.iter().find(|p| p.a == a)
    }

    /// Children of either section left unpaired.
    pub fn unmatched(&self) -> usize {
        self.unmatched_a + self.unmatched_b
    }
}

/**
Scores and aligns two records structurally.

```
use std::sync::Arc;
use records_and_hooks::matching::{match_records, MatchOptions, MatchScratch};
use records_and_hooks::record::builder::RecordBuilder;
use records_and_hooks::record::command::{Command, DrawArgs};
use records_and_hooks::record::resources::ResourceRegistry;

let registry = Arc::new(ResourceRegistry::new());
let record = |vertices| {
    let mut builder = RecordBuilder::new(registry.clone());
    builder.begin_label("A", [0; 4]);
    builder.record(Command::Draw(DrawArgs { vertex_count: vertices, instance_count: 1, ..Default::default() }));
    builder.end_label();
    builder.finish()
};
let (a, b) = (record(3), record(6));
let mut scratch = MatchScratch::new();
let result = match_records(&a, &b, &MatchOptions::default(), &mut scratch);
// structure only: arguments do not affect the coarse score
assert_eq!(result.value(), 1.0);
```
*/
pub fn match_records(
    a: &CommandRecord,
    b: &CommandRecord,
    options: &MatchOptions,
    scratch: &mut MatchScratch,
) -> MatchResult {
    sections::SectionMatcher::new(a, b, options.sibling_window, scratch).run()
}

/// Argument-aware, order-preserving correspondence of the children of two sections.
pub fn match_leaves(
    a: &CommandRecord,
    section_a: CommandId,
    b: &CommandRecord,
    section_b: CommandId,
    scratch: &mut MatchScratch,
) -> LeafMatch {
    leaf::match_children(a, section_a, b, section_b, scratch)
}

/// A command re-found in another record.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub command: CommandId,
    pub path: CommandPath,
    /// Structural score of the records times the argument-aware score of the
    /// enclosing section.
    pub score: f32,
}

/**
Re-finds `selected` (a command of `previous`) inside `new`.

Every section enclosing the selection must have a counterpart; the selection is then
located among its section's children by [`match_leaves`].  Below `options.threshold`
the result is [`ResolveError::BelowThreshold`] rather than a guess.
*/
pub fn resolve_target(
    previous: &CommandRecord,
    selected: CommandId,
    new: &CommandRecord,
    options: &MatchOptions,
    scratch: &mut MatchScratch,
) -> Result<Resolved, ResolveError> {
    if !previous.contains(selected) {
        return Err(ResolveError::InvalidPath);
    }
    let coarse = match_records(previous, new, options, scratch);
    let ancestors = previous.ancestors(selected);
    let mut section_b = new.root();
    for (depth, &section_a) in ancestors.iter().enumerate() {
        section_b = coarse
            .counterpart(section_a)
            .ok_or(ResolveError::TargetUnmatched)?;
        let (expected, found) = (previous.section_kind(section_a), new.section_kind(section_b));
        if let (Some(expected), Some(found)) = (expected, found) {
            if expected != found {
                return Err(crate::error::StructuralError::SectionMismatch {
                    depth,
                    expected,
                    found,
                }
                .into());
            }
        }
    }
    let section_a = ancestors.last().copied().unwrap_or(previous.root());
    let leaves = match_leaves(previous, section_a, new, section_b, scratch);
    let pair = leaves
        .counterpart(selected)
        .ok_or(ResolveError::TargetUnmatched)?;
    let score = coarse.value() * leaves.score.eval();
    logwise::trace_sync!(
        "resolved selection with score {score}",
        score = logwise::privacy::LogIt(&score)
    );
    if score < options.threshold {
        return Err(ResolveError::BelowThreshold {
            score,
            threshold: options.threshold,
        });
    }
    Ok(Resolved {
        command: pair.b,
        path: new.path_of(pair.b),
        score,
    })
}

/// [`resolve_target`] for a selection held as a path.
pub fn resolve_path(
    previous: &CommandRecord,
    path: &CommandPath,
    new: &CommandRecord,
    options: &MatchOptions,
    scratch: &mut MatchScratch,
) -> Result<Resolved, ResolveError> {
    let selected = previous
        .command_at(path)
        .ok_or(ResolveError::InvalidPath)?;
    resolve_target(previous, selected, new, options, scratch)
}

/// The records of one queue submission, in submission order.
#[derive(Debug, Clone, Default)]
pub struct RecordBatch {
    pub records: Vec<RecordHandle>,
}

impl RecordBatch {
    pub fn new(records: Vec<RecordHandle>) -> Self {
        RecordBatch { records }
    }

    fn weight(&self) -> u32 {
        self.records
            .iter()
            .map(|r| 1 + r.stats().match_weight())
            .sum()
    }
}

/// Correspondence between the records of two batches.
#[derive(Debug, Clone)]
pub struct BatchMatch {
    pub score: MatchVal,
    /// `(index in first batch, index in second batch, record match)`, in order.
    pub pairs: Vec<(usize, usize, MatchResult)>,
}

impl BatchMatch {
    pub fn value(&self) -> f32 {
        self.score.eval()
    }

    pub fn counterpart(&self, a: usize) -> Option<(usize, &MatchResult)> {
        self.pairs
            .iter()
            .find(|(x, _, _)| *x == a)
            .map(|(_, b, m)| (*b, m))
    }
}

/**
Aligns the records of two submissions.

Each record is paired with at most one record of the other batch, within
`options.sibling_window` positions, without crossing.  Records without any structural
overlap stay unpaired.
*/
pub fn match_batch(
    a: &RecordBatch,
    b: &RecordBatch,
    options: &MatchOptions,
    scratch: &mut MatchScratch,
) -> BatchMatch {
    let _interval = logwise::perfwarn_begin!("match_batch");
    let mut results = HashMap::new();
    let mut candidates = Vec::new();
    for (x, y, proximity) in align::window_pairs(a.records.len(), b.records.len(), options.sibling_window) {
        let result = match_records(&a.records[x as usize], &b.records[y as usize], options, scratch);
        if result.score().matched > 0.0 {
            candidates.push(Candidate {
                a: x,
                b: y,
                proximity,
                score: result.value(),
            });
            results.insert((x, y), result);
        }
    }
    let accepted = align::accept(&mut scratch.candidates, candidates);
    let mut score = MatchVal {
        matched: 0.0,
        total: (a.weight() + b.weight()) as f32,
    };
    let mut pairs = Vec::with_capacity(accepted.len());
    for (x, y) in accepted {
        if let Some(result) = results.remove(&(x, y)) {
            score.matched += 2.0 + result.score().matched;
            pairs.push((x as usize, y as usize, result));
        }
    }
    BatchMatch { score, pairs }
}

/// Correspondence between two frames' worth of submissions.
#[derive(Debug, Clone)]
pub struct SubmissionMatch {
    pub score: MatchVal,
    pub pairs: Vec<(usize, usize, BatchMatch)>,
}

impl SubmissionMatch {
    pub fn value(&self) -> f32 {
        self.score.eval()
    }
}

/// Aligns two ordered lists of submissions, pairing batches with [`match_batch`].
pub fn match_submissions(
    a: &[RecordBatch],
    b: &[RecordBatch],
    options: &MatchOptions,
    scratch: &mut MatchScratch,
) -> SubmissionMatch {
    let _interval = logwise::perfwarn_begin!("match_submissions");
    let mut results = HashMap::new();
    let mut candidates = Vec::new();
    for (x, y, proximity) in align::window_pairs(a.len(), b.len(), options.sibling_window) {
        let result = match_batch(&a[x as usize], &b[y as usize], options, scratch);
        if !result.pairs.is_empty() {
            candidates.push(Candidate {
                a: x,
                b: y,
                proximity,
                score: result.value(),
            });
            results.insert((x, y), result);
        }
    }
    let accepted = align::accept(&mut scratch.candidates, candidates);
    let total: u32 = a.iter().chain(b).map(|batch| 1 + batch.weight()).sum();
    let mut score = MatchVal {
        matched: 0.0,
        total: total as f32,
    };
    let mut pairs = Vec::with_capacity(accepted.len());
    for (x, y) in accepted {
        if let Some(result) = results.remove(&(x, y)) {
            score.matched += 2.0 + result.score.matched;
            pairs.push((x as usize, y as usize, result));
        }
    }
    logwise::debuginternal_sync!(
        "matched {pairs} of {a} submissions",
        pairs = pairs.len(),
        a = a.len()
    );
    SubmissionMatch { score, pairs }
}

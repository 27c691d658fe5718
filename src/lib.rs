use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader};

use thiserror::Error;

pub type Literal = i32;
pub type ClauseId = usize;
pub type Epoch = u64;

// Fatal conditions: the run stops with no verdict line.
#[derive(Debug, Error)]
pub enum VerifierError {
    #[error("ERROR: using DELETED clause {0}")]
    DeletedClause(ClauseId),
    #[error("parsing error: {0}")]
    Parse(String),
    #[error("too many clauses in formula")]
    TooManyClauses,
    #[error("ERROR: {0}")]
    Io(#[from] io::Error),
}

impl VerifierError {
    pub fn exit_code(&self) -> i32 {
        match self {
            VerifierError::DeletedClause(_) => 2,
            _ => 255,
        }
    }
}

// A rejected proof step: reported by the driver, followed by `s NOT VERIFIED`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckFailure {
    MissingHint(ClauseId),
    NotReduced,
    MultipleUnassigned(ClauseId),
    NoHints(Vec<Literal>),
    Unrefuted(ClauseId),
}

impl fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CheckFailure::MissingHint(id) => write!(f, "hint {id} is missing"),
            CheckFailure::NotReduced => write!(f, "hint is not reduced by witness"),
            CheckFailure::MultipleUnassigned(id) => {
                write!(f, "hint {id} has multiple unassigned literals")
            }
            CheckFailure::NoHints(lits) => {
                write!(f, "clause")?;
                for lit in lits {
                    write!(f, " {lit}")?;
                }
                write!(f, " has no hints")
            }
            CheckFailure::Unrefuted(id) => write!(f, "hints do not falsify clause {id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check {
    Success,
    Failure(CheckFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Verified,
    NotVerified,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HintGroup {
    pub claimant: ClauseId,
    pub antecedents: Vec<ClauseId>,
}

// `lits` is the whole first zero-terminated segment of the record: the clause
// body with the witness embedded after the second occurrence of the pivot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdditionStep {
    pub id: ClauseId,
    pub lits: Vec<Literal>,
    pub antecedents: Vec<ClauseId>,
    pub groups: Vec<HintGroup>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProofStep {
    Add(AdditionStep),
    Delete(Vec<ClauseId>),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum WitnessStatus {
    Satisfied,
    Reduced,
}

enum Propagation {
    Conflict,
    Extended,
    Failed(CheckFailure),
}

pub struct Verifier {
    pub arena: Vec<Literal>,
    // clause id to arena offset; None is the tombstone
    pub directory: Vec<Option<usize>>,
    pub cls_last: ClauseId,
    // alpha[i] >= e: the literal encoded as i is falsified at epoch e.
    // omega[i] == e: the witness of epoch e makes that literal true.
    // Marks are never cleared; advancing `now` retires them.
    pub alpha: Vec<Epoch>,
    pub omega: Vec<Epoch>,
    pub now: Epoch,
    pub num_vars: usize,
    pub num_clauses: usize,
}

impl Verifier {
    pub fn from_dimacs(path: &str) -> Result<Self, VerifierError> {
        let reader = BufReader::new(File::open(path)?);
        let mut verifier = Verifier {
            arena: Vec::new(),
            directory: vec![None],
            cls_last: 0,
            alpha: Vec::new(),
            omega: Vec::new(),
            now: 0,
            num_vars: 0,
            num_clauses: 0,
        };

        let mut seen_header = false;
        let mut current: Vec<Literal> = Vec::new();
        let mut index: ClauseId = 0;
        for line in reader.lines() {
            let line = line?;
            let trimmed = line.trim_start();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.starts_with('c') {
                // comments are legal before the header and between clauses only
                if !current.is_empty() {
                    return Err(VerifierError::Parse(line.clone()));
                }
                continue;
            }
            if !seen_header {
                let mut words = trimmed.split_whitespace();
                if words.next() != Some("p") || words.next() != Some("cnf") {
                    return Err(VerifierError::Parse(line.clone()));
                }
                let num_vars = words.next().and_then(|w| w.parse::<usize>().ok());
                let num_clauses = words.next().and_then(|w| w.parse::<usize>().ok());
                match (num_vars, num_clauses, words.next()) {
                    (Some(nv), Some(nc), None) => {
                        verifier.num_vars = nv;
                        verifier.num_clauses = nc;
                        verifier.alpha = vec![0; 2 * nv + 2];
                        verifier.omega = vec![0; 2 * nv + 2];
                    }
                    _ => return Err(VerifierError::Parse(line.clone())),
                }
                seen_header = true;
                continue;
            }
            for word in trimmed.split_whitespace() {
                let lit: Literal = word
                    .parse()
                    .map_err(|_| VerifierError::Parse(line.clone()))?;
                if lit == 0 {
                    index += 1;
                    if index > verifier.num_clauses {
                        return Err(VerifierError::TooManyClauses);
                    }
                    verifier.add_clause(index, &current);
                    current.clear();
                } else {
                    current.push(lit);
                }
            }
        }
        if !seen_header {
            return Err(VerifierError::Parse("missing 'p cnf' header".to_string()));
        }
        if !current.is_empty() {
            return Err(VerifierError::Parse("unterminated clause".to_string()));
        }

        println!(
            "c parsed a formula with {} variables and {} clauses",
            verifier.num_vars, verifier.num_clauses
        );
        Ok(verifier)
    }

    #[inline]
    pub fn lit_to_idx(lit: Literal) -> usize {
        (lit.unsigned_abs() as usize * 2) + (lit < 0) as usize
    }

    #[inline]
    pub fn idx_to_lit(idx: usize) -> Literal {
        let var = (idx / 2) as Literal;
        if idx & 1 == 1 { -var } else { var }
    }

    pub fn add_clause(&mut self, index: ClauseId, literals: &[Literal]) {
        if index >= self.directory.len() {
            self.directory.resize(index + 1, None);
        }
        self.ensure_lit_capacity(literals);
        let offset = self.arena.len();
        if let Some(&pivot) = literals.first() {
            self.arena.push(pivot);
            for &lit in &literals[1..] {
                if lit == pivot {
                    break; // start of the witness: not stored
                }
                self.arena.push(lit);
            }
        }
        self.arena.push(0);
        self.directory[index] = Some(offset);
        self.cls_last = self.cls_last.max(index);
    }

    pub fn delete_clauses(&mut self, ids: &[ClauseId]) {
        for &id in ids {
            match self.directory.get_mut(id) {
                Some(slot) if slot.is_some() => *slot = None,
                _ => println!("c WARNING: clause {id} has already been deleted"),
            }
        }
    }

    #[inline]
    pub fn live_offset(&self, id: ClauseId) -> Option<usize> {
        self.directory.get(id).copied().flatten()
    }

    fn clause_start(&self, id: ClauseId) -> Result<usize, VerifierError> {
        self.live_offset(id).ok_or(VerifierError::DeletedClause(id))
    }

    fn ensure_lit_capacity(&mut self, literals: &[Literal]) {
        if let Some(max) = literals.iter().map(|&l| Self::lit_to_idx(l)).max() {
            if max >= self.alpha.len() {
                self.alpha.resize(max + 1, 0);
                self.omega.resize(max + 1, 0);
            }
        }
    }

    // A clause the witness does not touch at all counts as satisfied.
    fn witness_status(&self, offset: usize, mask: Epoch) -> WitnessStatus {
        let mut status = WitnessStatus::Satisfied;
        let mut p = offset;
        while self.arena[p] != 0 {
            let idx = Self::lit_to_idx(self.arena[p]);
            p += 1;
            if self.omega[idx ^ 1] == mask {
                status = WitnessStatus::Reduced;
            }
            if self.omega[idx] == mask {
                return WitnessStatus::Satisfied;
            }
        }
        status
    }

    fn propagate_hints(
        &mut self,
        hints: &[ClauseId],
        this_mask: Epoch,
    ) -> Result<Propagation, VerifierError> {
        for &hint in hints {
            let mut p = self.clause_start(hint)?;
            let mut unit: Option<usize> = None;
            loop {
                let lit = self.arena[p];
                if lit == 0 {
                    break;
                }
                p += 1;
                let idx = Self::lit_to_idx(lit);
                if self.alpha[idx] >= this_mask {
                    continue; // falsified
                }
                if unit.is_some() {
                    return Ok(Propagation::Failed(CheckFailure::MultipleUnassigned(hint)));
                }
                unit = Some(idx);
            }
            match unit {
                None => return Ok(Propagation::Conflict), // hint clause is falsified
                Some(idx) => self.alpha[idx ^ 1] = this_mask,
            }
        }
        Ok(Propagation::Extended)
    }

    fn check_group(
        &mut self,
        group: &HintGroup,
        start: ClauseId,
        this_mask: Epoch,
        w_mask: Epoch,
    ) -> Result<Option<CheckFailure>, VerifierError> {
        // the proof must name every reduced-but-unsatisfied clause in
        // increasing id order
        for id in start..group.claimant {
            if let Some(offset) = self.live_offset(id) {
                if self.witness_status(offset, w_mask) == WitnessStatus::Reduced {
                    return Ok(Some(CheckFailure::MissingHint(id)));
                }
            }
        }
        let offset = self.clause_start(group.claimant)?;
        if self.witness_status(offset, w_mask) != WitnessStatus::Reduced {
            return Ok(Some(CheckFailure::NotReduced));
        }

        let mut p = offset;
        while self.arena[p] != 0 {
            let idx = Self::lit_to_idx(self.arena[p]);
            p += 1;
            if self.alpha[idx] >= this_mask {
                continue;
            }
            if self.alpha[idx ^ 1] >= this_mask && self.omega[idx ^ 1] != w_mask {
                return Ok(None); // blocked
            }
            self.alpha[idx] = this_mask;
        }

        match self.propagate_hints(&group.antecedents, this_mask)? {
            Propagation::Conflict => Ok(None),
            Propagation::Extended => Ok(Some(CheckFailure::Unrefuted(group.claimant))),
            Propagation::Failed(failure) => Ok(Some(failure)),
        }
    }

    pub fn check_clause(&mut self, step: &AdditionStep) -> Result<Check, VerifierError> {
        self.now += 1;
        let final_mask = self.now + step.groups.len() as Epoch;
        self.ensure_lit_capacity(&step.lits);

        // falsify the body at final_mask; each hint group then gets a fresh
        // epoch, so marks from one refutation are invisible to the next
        let split = witness_split(&step.lits);
        for &lit in &step.lits[..split] {
            self.alpha[Self::lit_to_idx(lit)] = final_mask;
        }

        match self.propagate_hints(&step.antecedents, final_mask)? {
            Propagation::Conflict => return Ok(Check::Success),
            Propagation::Failed(failure) => return Ok(Check::Failure(failure)),
            Propagation::Extended => {}
        }
        if step.groups.is_empty() {
            return Ok(Check::Failure(CheckFailure::NoHints(step.lits.clone())));
        }

        if let Some(&pivot) = step.lits.first() {
            self.omega[Self::lit_to_idx(pivot)] = final_mask;
            for &lit in &step.lits[split..] {
                self.omega[Self::lit_to_idx(lit)] = final_mask;
            }
        }

        let mut start = 1;
        for group in &step.groups {
            self.now += 1;
            if let Some(failure) = self.check_group(group, start, self.now, final_mask)? {
                return Ok(Check::Failure(failure));
            }
            start = group.claimant + 1;
        }

        // nothing above the last claimant may be reduced but unsatisfied either
        for id in start..=self.cls_last {
            if let Some(offset) = self.live_offset(id) {
                if self.witness_status(offset, final_mask) == WitnessStatus::Reduced {
                    return Ok(Check::Failure(CheckFailure::MissingHint(id)));
                }
            }
        }
        Ok(Check::Success)
    }

    pub fn check_proof(&mut self, path: &str) -> Result<Verdict, VerifierError> {
        let reader = BufReader::new(File::open(path)?);
        let mut parser = ProofParser::default();
        for line in reader.lines() {
            let line = line?;
            for word in line.split_whitespace() {
                let Some(step) = parser.feed(word)? else {
                    continue;
                };
                match step {
                    ProofStep::Delete(ids) => self.delete_clauses(&ids),
                    ProofStep::Add(step) => match self.check_clause(&step)? {
                        Check::Success => {
                            self.add_clause(step.id, &step.lits);
                            if step.lits.is_empty() {
                                return Ok(Verdict::Verified);
                            }
                        }
                        Check::Failure(failure) => {
                            println!("c ERROR: {failure}");
                            print!("c failed to check clause: ");
                            for lit in &step.lits {
                                print!("{lit} ");
                            }
                            println!("0");
                            return Ok(Verdict::NotVerified);
                        }
                    },
                }
            }
        }
        parser.finish()?;
        println!("c ERROR: proof ended without the empty clause");
        Ok(Verdict::NotVerified)
    }
}

fn witness_split(lits: &[Literal]) -> usize {
    match lits.first() {
        Some(&pivot) => lits
            .iter()
            .skip(1)
            .position(|&lit| lit == pivot)
            .map_or(lits.len(), |i| i + 1),
        None => 0,
    }
}

#[derive(Default)]
enum ParseState {
    #[default]
    Index,
    Kind {
        id: ClauseId,
    },
    Deleting {
        ids: Vec<ClauseId>,
    },
    Body {
        id: ClauseId,
        lits: Vec<Literal>,
    },
    Hints {
        id: ClauseId,
        lits: Vec<Literal>,
        antecedents: Vec<ClauseId>,
        groups: Vec<HintGroup>,
    },
}

// A deletion record ends after one zero, an addition after two. Records may
// span lines.
#[derive(Default)]
pub struct ProofParser {
    state: ParseState,
}

impl ProofParser {
    pub fn feed(&mut self, word: &str) -> Result<Option<ProofStep>, VerifierError> {
        let mut done = None;
        self.state = match std::mem::take(&mut self.state) {
            ParseState::Index => ParseState::Kind {
                id: parse_id(word)?,
            },
            ParseState::Kind { id } => {
                if word == "d" {
                    ParseState::Deleting { ids: Vec::new() }
                } else {
                    match parse_lit(word)? {
                        0 => ParseState::Hints {
                            id,
                            lits: Vec::new(),
                            antecedents: Vec::new(),
                            groups: Vec::new(),
                        },
                        lit => ParseState::Body {
                            id,
                            lits: vec![lit],
                        },
                    }
                }
            }
            ParseState::Deleting { mut ids } => match parse_lit(word)? {
                0 => {
                    done = Some(ProofStep::Delete(ids));
                    ParseState::Index
                }
                n if n < 0 => return Err(VerifierError::Parse(word.to_string())),
                n => {
                    ids.push(n as ClauseId);
                    ParseState::Deleting { ids }
                }
            },
            ParseState::Body { id, mut lits } => match parse_lit(word)? {
                0 => ParseState::Hints {
                    id,
                    lits,
                    antecedents: Vec::new(),
                    groups: Vec::new(),
                },
                lit => {
                    lits.push(lit);
                    ParseState::Body { id, lits }
                }
            },
            ParseState::Hints {
                id,
                lits,
                mut antecedents,
                mut groups,
            } => match parse_lit(word)? {
                0 => {
                    done = Some(ProofStep::Add(AdditionStep {
                        id,
                        lits,
                        antecedents,
                        groups,
                    }));
                    ParseState::Index
                }
                hint if hint < 0 => {
                    // a negative hint opens the group for the clause it names
                    groups.push(HintGroup {
                        claimant: hint.unsigned_abs() as ClauseId,
                        antecedents: Vec::new(),
                    });
                    ParseState::Hints {
                        id,
                        lits,
                        antecedents,
                        groups,
                    }
                }
                hint => {
                    match groups.last_mut() {
                        Some(group) => group.antecedents.push(hint as ClauseId),
                        None => antecedents.push(hint as ClauseId),
                    }
                    ParseState::Hints {
                        id,
                        lits,
                        antecedents,
                        groups,
                    }
                }
            },
        };
        Ok(done)
    }

    pub fn finish(&self) -> Result<(), VerifierError> {
        match self.state {
            ParseState::Index => Ok(()),
            _ => Err(VerifierError::Parse("truncated proof record".to_string())),
        }
    }
}

fn parse_lit(word: &str) -> Result<i32, VerifierError> {
    word.parse()
        .map_err(|_| VerifierError::Parse(word.to_string()))
}

fn parse_id(word: &str) -> Result<ClauseId, VerifierError> {
    match parse_lit(word)? {
        n if n > 0 => Ok(n as ClauseId),
        _ => Err(VerifierError::Parse(word.to_string())),
    }
}

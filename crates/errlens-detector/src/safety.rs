//! ReDoS safety screen for regex rules
//!
//! A structural scan over the pattern source that flags the shapes known to
//! cause catastrophic backtracking in backtracking engines:
//!
//! - nested repetition, where a repeated group contains another repetition
//!   and at least one of the two is unbounded (`(a+)+`, `(\w+\s?)*`)
//! - repeated alternation whose branches overlap (`(a|a)*`, `(a|ab)+`, `(|a)+`)
//! - more repetition operators than a configured limit
//!
//! This is a heuristic risk filter. It neither proves an accepted pattern
//! safe nor guarantees a rejected pattern is actually exploitable.

/// Default maximum number of repetition operators per pattern
pub const DEFAULT_MAX_REPETITIONS: usize = 25;

/// Why a pattern was rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnsafePattern {
    /// A repeated group contains a repetition, one of them unbounded
    #[error("nested quantifier in group at offset {offset}")]
    NestedQuantifier { offset: usize },

    /// A repeated group has ambiguous alternation branches
    #[error("repeated alternation with overlapping branches at offset {offset}")]
    OverlappingAlternation { offset: usize },

    /// Too many repetition operators
    #[error("{count} repetitions exceed the limit of {limit}")]
    TooManyRepetitions { count: usize, limit: usize },
}

impl UnsafePattern {
    /// Short reason label for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NestedQuantifier { .. } => "nested_quantifier",
            Self::OverlappingAlternation { .. } => "overlapping_alternation",
            Self::TooManyRepetitions { .. } => "too_many_repetitions",
        }
    }
}

/// Static ReDoS screen
#[derive(Debug, Clone, Copy)]
pub struct SafetyScreen {
    max_repetitions: usize,
}

impl SafetyScreen {
    /// Create a screen with the given repetition limit
    pub fn new(max_repetitions: usize) -> Self {
        Self { max_repetitions }
    }

    /// Repetition limit
    pub fn max_repetitions(&self) -> usize {
        self.max_repetitions
    }

    /// Screen a pattern, returning the first risk found
    ///
    /// Syntax errors are not reported here; a malformed pattern passes the
    /// screen and fails compilation instead.
    pub fn check(&self, pattern: &str) -> Result<(), UnsafePattern> {
        let mut scanner = Scanner::new(pattern);
        scanner.run()?;

        if scanner.repetitions > self.max_repetitions {
            return Err(UnsafePattern::TooManyRepetitions {
                count: scanner.repetitions,
                limit: self.max_repetitions,
            });
        }
        Ok(())
    }

    /// Convenience wrapper returning a bool
    pub fn is_safe(&self, pattern: &str) -> bool {
        self.check(pattern).is_ok()
    }
}

impl Default for SafetyScreen {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REPETITIONS)
    }
}

#[derive(Debug, Clone, Copy)]
struct Quantifier {
    /// Allows more than one repetition
    repeating: bool,
    /// Has no upper bound
    unbounded: bool,
}

impl Quantifier {
    const OPTIONAL: Self = Self {
        repeating: false,
        unbounded: false,
    };
}

/// Per-group scan state
#[derive(Debug, Default)]
struct Frame {
    /// Char offset of the opening parenthesis
    start: usize,
    repeats: bool,
    unbounded: bool,
    branches: Vec<String>,
    branch: String,
    /// Verbose mode in effect outside this group
    verbose: bool,
}

impl Frame {
    fn at(start: usize, verbose: bool) -> Self {
        Self {
            start,
            verbose,
            ..Self::default()
        }
    }
}

struct Scanner {
    chars: Vec<char>,
    pos: usize,
    stack: Vec<Frame>,
    repetitions: usize,
    /// `x` flag: whitespace and `#` comments are not part of the pattern
    verbose: bool,
}

impl Scanner {
    fn new(pattern: &str) -> Self {
        Self {
            chars: pattern.chars().collect(),
            pos: 0,
            stack: vec![Frame::at(0, false)],
            repetitions: 0,
            verbose: false,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn text(&self, from: usize, to: usize) -> String {
        self.chars[from..to.min(self.chars.len())].iter().collect()
    }

    fn top(&mut self) -> &mut Frame {
        // The root frame is never popped
        let last = self.stack.len() - 1;
        &mut self.stack[last]
    }

    fn run(&mut self) -> Result<(), UnsafePattern> {
        loop {
            self.skip_ignored();
            let Some(c) = self.peek() else { break };
            match c {
                '\\' => {
                    let start = self.pos;
                    self.skip_escape();
                    self.finish_atom(start);
                }
                '[' => {
                    let start = self.pos;
                    self.skip_class();
                    self.finish_atom(start);
                }
                '(' => self.open_group(),
                ')' if self.stack.len() > 1 => self.close_group()?,
                '|' => {
                    self.pos += 1;
                    let frame = self.top();
                    let branch = std::mem::take(&mut frame.branch);
                    frame.branches.push(branch);
                }
                _ => {
                    let start = self.pos;
                    self.pos += 1;
                    self.finish_atom(start);
                }
            }
        }
        Ok(())
    }

    fn skip_ignored(&mut self) {
        if !self.verbose {
            return;
        }
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.pos += 1;
            } else if c == '#' {
                while let Some(c) = self.peek() {
                    self.pos += 1;
                    if c == '\n' {
                        break;
                    }
                }
            } else {
                break;
            }
        }
    }

    fn push_group(&mut self, start: usize) {
        let frame = Frame::at(start, self.verbose);
        self.stack.push(frame);
    }

    /// Record the atom spanning `start..pos` plus any trailing quantifier
    fn finish_atom(&mut self, start: usize) {
        let atom_end = self.pos;
        let quantifier = self.parse_quantifier();
        let text = self.text(start, atom_end);

        if let Some(q) = quantifier {
            if q.repeating {
                self.repetitions += 1;
            }
            let frame = self.top();
            frame.repeats |= q.repeating;
            frame.unbounded |= q.unbounded;
        }
        self.top().branch.push_str(&text);
    }

    fn skip_escape(&mut self) {
        self.pos += 1;
        let Some(kind) = self.peek() else { return };
        self.pos += 1;

        // \p{..}, \x{..}, \u{..}, \U{..}
        if matches!(kind, 'p' | 'P' | 'x' | 'u' | 'U') && self.peek() == Some('{') {
            while let Some(c) = self.peek() {
                self.pos += 1;
                if c == '}' {
                    break;
                }
            }
        }
    }

    fn skip_class(&mut self) {
        self.pos += 1;
        if self.peek() == Some('^') {
            self.pos += 1;
        }
        // A leading ']' is literal
        if self.peek() == Some(']') {
            self.pos += 1;
        }

        let mut depth = 1usize;
        while let Some(c) = self.peek() {
            match c {
                '\\' => {
                    self.pos += 2;
                    continue;
                }
                '[' => depth += 1,
                ']' => {
                    depth -= 1;
                    if depth == 0 {
                        self.pos += 1;
                        return;
                    }
                }
                _ => {}
            }
            self.pos += 1;
        }
        self.pos = self.pos.min(self.chars.len());
    }

    fn open_group(&mut self) {
        let start = self.pos;
        self.pos += 1;

        if self.peek() != Some('?') {
            self.push_group(start);
            return;
        }
        self.pos += 1;

        // Named groups: (?P<name>..) and (?<name>..)
        if self.peek() == Some('<') || (self.peek() == Some('P') && self.peek_at(1) == Some('<')) {
            while let Some(c) = self.peek() {
                self.pos += 1;
                if c == '>' {
                    break;
                }
            }
            self.push_group(start);
            return;
        }

        // Flags: (?x) applies until the enclosing group closes, (?x:..)
        // only inside the group it opens
        let mut negated = false;
        let mut verbose = None;
        while let Some(c) = self.peek() {
            match c {
                '-' => negated = true,
                'x' => verbose = Some(!negated),
                c if c.is_ascii_alphabetic() => {}
                _ => break,
            }
            self.pos += 1;
        }
        match self.peek() {
            Some(')') => self.pos += 1,
            Some(':') => {
                self.pos += 1;
                self.push_group(start);
            }
            _ => {
                self.push_group(start);
                return;
            }
        }
        if let Some(verbose) = verbose {
            self.verbose = verbose;
        }
    }

    fn close_group(&mut self) -> Result<(), UnsafePattern> {
        let close = self.pos;
        self.pos += 1;

        let mut frame = self.stack.pop().unwrap_or_default();
        let last = std::mem::take(&mut frame.branch);
        frame.branches.push(last);
        self.verbose = frame.verbose;

        let quantifier = self.parse_quantifier().unwrap_or(Quantifier::OPTIONAL);
        let group_text = self.text(frame.start, close + 1);

        if quantifier.repeating {
            self.repetitions += 1;

            if frame.repeats && (frame.unbounded || quantifier.unbounded) {
                return Err(UnsafePattern::NestedQuantifier {
                    offset: frame.start,
                });
            }
            if frame.branches.len() > 1 && branches_overlap(&frame.branches) {
                return Err(UnsafePattern::OverlappingAlternation {
                    offset: frame.start,
                });
            }
        }

        let parent = self.top();
        parent.repeats |= frame.repeats || quantifier.repeating;
        parent.unbounded |= frame.unbounded || quantifier.unbounded;
        parent.branch.push_str(&group_text);
        Ok(())
    }

    /// Parse `*`, `+`, `?` or `{m}`, `{m,}`, `{m,n}`, with an optional lazy `?`
    fn parse_quantifier(&mut self) -> Option<Quantifier> {
        self.skip_ignored();
        let quantifier = match self.peek()? {
            '*' | '+' => {
                self.pos += 1;
                Quantifier {
                    repeating: true,
                    unbounded: true,
                }
            }
            '?' => {
                self.pos += 1;
                Quantifier::OPTIONAL
            }
            '{' => self.parse_counted()?,
            _ => return None,
        };

        self.skip_ignored();
        if self.peek() == Some('?') {
            self.pos += 1;
        }
        Some(quantifier)
    }

    fn parse_counted(&mut self) -> Option<Quantifier> {
        let mut cursor = self.pos + 1;
        let read_number = |cursor: &mut usize, chars: &[char]| -> Option<u64> {
            let begin = *cursor;
            while chars.get(*cursor).is_some_and(|c| c.is_ascii_digit()) {
                *cursor += 1;
            }
            if *cursor == begin {
                return None;
            }
            chars[begin..*cursor].iter().collect::<String>().parse().ok()
        };

        let min = read_number(&mut cursor, &self.chars)?;
        let (unbounded, max) = if self.chars.get(cursor) == Some(&',') {
            cursor += 1;
            match read_number(&mut cursor, &self.chars) {
                Some(max) => (false, max),
                None => (true, min),
            }
        } else {
            (false, min)
        };

        if self.chars.get(cursor) != Some(&'}') {
            // Not a counted repetition, `{` is a literal
            return None;
        }
        self.pos = cursor + 1;

        Some(Quantifier {
            repeating: unbounded || max > 1,
            unbounded,
        })
    }
}

/// Branches overlap if any is empty, or one is a prefix of another
fn branches_overlap(branches: &[String]) -> bool {
    if branches.iter().any(|b| b.is_empty()) {
        return true;
    }
    for (i, a) in branches.iter().enumerate() {
        for b in &branches[i + 1..] {
            if a.starts_with(b.as_str()) || b.starts_with(a.as_str()) {
                return true;
            }
        }
    }
    false
}
